//! Lowering context: maps graph tensor names to program values while translators emit
//! instructions.

use std::collections::HashMap;

use crate::backend::ir::{
    BroadcastToSpec, DType, ElementwiseBinaryOp, ElementwiseUnaryOp, Function, Operation,
    ProgramBuilder, ReduceKind, ReduceSpec, ReshapeSpec, Shape, TensorLiteral, TensorSpec,
    ValueId,
};
use crate::backend::shape_helpers::broadcast_shapes;
use crate::error::{OnnxXlaError, Result};
use crate::graph::{Graph, Node};
use crate::tensor::Tensor;

use super::deadline::Deadline;
use super::shape_inference::InferredGraph;
use super::translate::{constant_slot, dtype, shape_error, translator_for, unsupported, ValueType};

pub(crate) struct LowerCx<'a> {
    builder: ProgramBuilder,
    values: HashMap<String, ValueId>,
    types: &'a HashMap<String, ValueType>,
    constants: &'a HashMap<String, Tensor>,
    pub opset: i64,
}

impl<'a> LowerCx<'a> {
    fn new(inferred: &'a InferredGraph, opset: i64) -> Self {
        Self {
            builder: ProgramBuilder::new(),
            values: HashMap::new(),
            types: &inferred.types,
            constants: &inferred.constants,
            opset,
        }
    }

    /// Program value for a tensor name. Constants are emitted on first use, so constants
    /// consumed only as shapes or axes never reach the program.
    pub fn value(&mut self, name: &str) -> Result<ValueId> {
        if let Some(id) = self.values.get(name) {
            return Ok(*id);
        }
        let tensor = self.constants.get(name).ok_or_else(|| {
            OnnxXlaError::Compilation(format!("tensor `{name}` is read before it is lowered"))
        })?;
        let literal = tensor.to_literal().map_err(|_| {
            OnnxXlaError::unsupported(
                "Constant",
                format!("{} constant `{name}` cannot be lowered", tensor.elem_type()),
            )
        })?;
        let id = self.literal(literal);
        self.values.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn input(&mut self, node: &Node, index: usize) -> Result<ValueId> {
        let name = node
            .input(index)
            .ok_or_else(|| shape_error(node, format!("input {index} is required")))?;
        self.value(name)
    }

    pub fn optional_input(&mut self, node: &Node, index: usize) -> Result<Option<ValueId>> {
        node.input(index).map(|name| self.value(name)).transpose()
    }

    pub fn input_type(&self, node: &Node, index: usize) -> Result<&'a ValueType> {
        self.type_of(node, node.input(index))
    }

    pub fn output_type(&self, node: &Node, index: usize) -> Result<&'a ValueType> {
        self.type_of(node, node.output(index))
    }

    fn type_of(&self, node: &Node, name: Option<&str>) -> Result<&'a ValueType> {
        let types = self.types;
        name.and_then(|name| types.get(name))
            .ok_or_else(|| shape_error(node, "tensor has no inferred type"))
    }

    pub fn constant_input(&self, node: &Node, index: usize) -> Result<Option<&'a Tensor>> {
        constant_slot(node, index, self.constants)
    }

    /// Binds node output `index` to `id`. Omitted outputs are ignored.
    pub fn bind(&mut self, node: &Node, index: usize, id: ValueId) {
        if let Some(name) = node.output(index) {
            self.values.insert(name.to_string(), id);
        }
    }

    pub fn dtype_for(&self, node: &Node, ty: &ValueType) -> Result<DType> {
        dtype(node, ty.elem_type)
    }

    pub fn emit(&mut self, op: Operation, operands: &[ValueId], dtype: DType, dims: &[usize]) -> ValueId {
        let operands = operands
            .iter()
            .map(|id| crate::backend::ir::Operand::Value(*id))
            .collect();
        self.builder
            .emit_single(op, operands, TensorSpec::from_dims(dtype, dims))
    }

    pub fn literal(&mut self, literal: TensorLiteral) -> ValueId {
        let spec = literal.spec.clone();
        self.builder
            .emit_single(Operation::Constant(literal), Vec::new(), spec)
    }

    pub fn dims(&self, id: ValueId) -> Vec<usize> {
        self.builder
            .value_type(id)
            .and_then(TensorSpec::static_dims)
            .unwrap_or_default()
    }

    pub fn dtype_of(&self, id: ValueId) -> DType {
        self.builder
            .value_type(id)
            .map_or(DType::F32, |spec| spec.dtype)
    }

    /// `value` broadcast to `dims` in the given dtype.
    pub fn splat(&mut self, dtype: DType, value: f64, dims: &[usize]) -> ValueId {
        let literal = match dtype {
            DType::F32 => TensorLiteral::scalar_f32(value as f32),
            DType::Si64 => TensorLiteral::scalar_i64(value as i64),
        };
        let scalar = self.literal(literal);
        self.broadcast(scalar, dims)
    }

    pub fn broadcast(&mut self, id: ValueId, dims: &[usize]) -> ValueId {
        if self.dims(id) == dims {
            return id;
        }
        let dtype = self.dtype_of(id);
        self.emit(
            Operation::BroadcastTo(BroadcastToSpec {
                result_shape: Shape::from_static(dims),
            }),
            &[id],
            dtype,
            dims,
        )
    }

    pub fn reshape(&mut self, id: ValueId, dims: &[usize]) -> ValueId {
        if self.dims(id) == dims {
            return id;
        }
        let dtype = self.dtype_of(id);
        self.emit(
            Operation::Reshape(ReshapeSpec {
                new_shape: dims.to_vec(),
            }),
            &[id],
            dtype,
            dims,
        )
    }

    /// Elementwise binary op with multidirectional broadcasting of both operands.
    pub fn binary(&mut self, op: ElementwiseBinaryOp, lhs: ValueId, rhs: ValueId) -> Result<ValueId> {
        let (lhs_dims, rhs_dims) = (self.dims(lhs), self.dims(rhs));
        let dims = broadcast_shapes(&lhs_dims, &rhs_dims).ok_or_else(|| {
            OnnxXlaError::Compilation(format!(
                "operands {lhs_dims:?} and {rhs_dims:?} do not broadcast"
            ))
        })?;
        let lhs = self.broadcast(lhs, &dims);
        let rhs = self.broadcast(rhs, &dims);
        let dtype = self.dtype_of(lhs);
        Ok(self.emit(Operation::ElementwiseBinary(op), &[lhs, rhs], dtype, &dims))
    }

    pub fn unary(&mut self, op: ElementwiseUnaryOp, x: ValueId) -> ValueId {
        let (dtype, dims) = (self.dtype_of(x), self.dims(x));
        self.emit(Operation::ElementwiseUnary(op), &[x], dtype, &dims)
    }

    pub fn reduce(&mut self, x: ValueId, kind: ReduceKind, axes: &[usize], keepdims: bool) -> ValueId {
        let dims = self.dims(x);
        let out = dims
            .iter()
            .enumerate()
            .filter_map(|(axis, &dim)| match (axes.contains(&axis), keepdims) {
                (false, _) => Some(dim),
                (true, true) => Some(1),
                (true, false) => None,
            })
            .collect::<Vec<_>>();
        let dtype = self.dtype_of(x);
        self.emit(
            Operation::Reduce(ReduceSpec {
                kind,
                axes: axes.to_vec(),
                keepdims,
            }),
            &[x],
            dtype,
            &out,
        )
    }
}

/// Lowers every node of `graph` into a single entry function whose parameters are the
/// runtime inputs in declaration order.
pub(crate) fn lower_graph(
    graph: &Graph,
    inferred: &InferredGraph,
    deadline: &Deadline,
) -> Result<Function> {
    let mut cx = LowerCx::new(inferred, graph.opset_version);

    for input in graph.runtime_inputs() {
        let ty = inferred.types.get(&input.name).ok_or_else(|| {
            OnnxXlaError::shape(&input.name, "graph input has no inferred type")
        })?;
        let dtype = ty.elem_type.to_dtype().ok_or_else(|| {
            OnnxXlaError::unsupported(
                "graph input",
                format!("`{}` has element type {}", input.name, ty.elem_type),
            )
        })?;
        let id = cx
            .builder
            .add_parameter(TensorSpec::from_dims(dtype, &ty.dims));
        cx.values.insert(input.name.clone(), id);
    }

    for node in &graph.nodes {
        deadline.check()?;
        let translator =
            translator_for(&node.op_type).ok_or_else(|| unsupported(node, "no lowering exists"))?;
        let before = cx.builder.instruction_count();
        translator.lower(node, &mut cx)?;
        tracing::trace!(
            node = %node.display_name(),
            op = %node.op_type,
            emitted = cx.builder.instruction_count() - before,
            "lowered node"
        );
    }

    let results = graph
        .outputs
        .iter()
        .map(|output| cx.value(&output.name))
        .collect::<Result<Vec<_>>>()?;
    let name = if graph.name.is_empty() {
        "main".to_string()
    } else {
        graph.name.clone()
    };
    cx.builder
        .finish(name, results)
        .map_err(|err| OnnxXlaError::Compilation(err.to_string()))
}
