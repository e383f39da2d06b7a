//! Per-operator translators: shape rules plus lowering into program instructions.
//!
//! Every supported ONNX operator maps to one [`Translator`]. The checker reads
//! [`Translator::lowered_kinds`] and [`Translator::unsupported_config`] to decide support
//! without lowering anything.

mod conv_pool;
mod elementwise;
mod linalg;
mod normalization;
mod reduce;
mod shape;

use std::collections::HashMap;

use crate::backend::ir::{DType, ElementwiseBinaryOp, ElementwiseUnaryOp, ReduceKind};
use crate::backend::legality::OperationKind;
use crate::backend::shape_helpers::{checked_element_count_or_error, normalize_axis};
use crate::error::{OnnxXlaError, Result};
use crate::graph::{Node, OpType};
use crate::tensor::{ElemType, Tensor, TensorDesc};

use super::lower::LowerCx;

pub(crate) use shape::constant_value;

/// Fully static type of one graph tensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueType {
    pub elem_type: ElemType,
    pub dims: Vec<usize>,
}

impl ValueType {
    pub fn new(elem_type: ElemType, dims: Vec<usize>) -> Self {
        Self { elem_type, dims }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn with_dims(&self, dims: Vec<usize>) -> Self {
        Self::new(self.elem_type, dims)
    }

    pub fn desc(&self) -> TensorDesc {
        TensorDesc::from_dims(self.elem_type, &self.dims)
    }
}

pub(crate) struct InferCx<'a> {
    pub opset: i64,
    pub types: &'a HashMap<String, ValueType>,
    pub constants: &'a HashMap<String, Tensor>,
}

impl InferCx<'_> {
    pub fn input(&self, node: &Node, index: usize) -> Result<&ValueType> {
        let name = node
            .input(index)
            .ok_or_else(|| shape_error(node, format!("input {index} is required")))?;
        self.types
            .get(name)
            .ok_or_else(|| shape_error(node, format!("input `{name}` has no inferred type")))
    }

    pub fn optional_input(&self, node: &Node, index: usize) -> Option<&ValueType> {
        node.input(index).and_then(|name| self.types.get(name))
    }

    /// Compile-time value of an input slot, `None` when the slot is empty.
    pub fn constant_input(&self, node: &Node, index: usize) -> Result<Option<&Tensor>> {
        constant_slot(node, index, self.constants)
    }
}

pub(crate) fn constant_slot<'t>(
    node: &Node,
    index: usize,
    constants: &'t HashMap<String, Tensor>,
) -> Result<Option<&'t Tensor>> {
    let Some(name) = node.input(index) else {
        return Ok(None);
    };
    constants.get(name).map(Some).ok_or_else(|| {
        OnnxXlaError::unsupported(
            node.op_type.as_str(),
            format!("input `{name}` must be a compile-time constant"),
        )
    })
}

pub(crate) trait Translator: Sync {
    /// Program operation kinds the lowering of this operator may emit.
    fn lowered_kinds(&self) -> &'static [OperationKind];

    /// Reason this node's configuration cannot be lowered, decided from attributes and
    /// arity alone.
    fn unsupported_config(&self, _node: &Node, _opset: i64) -> Option<String> {
        None
    }

    /// Reason this node cannot be lowered given the values of its constant inputs,
    /// looked up by input slot.
    fn unsupported_constants(
        &self,
        _node: &Node,
        _constant: &dyn Fn(usize) -> Option<Tensor>,
    ) -> Option<String> {
        None
    }

    /// Whether data inputs must be floating point.
    fn float_only(&self) -> bool {
        false
    }

    /// Input slots consumed as compile-time constants rather than data.
    fn constant_inputs(&self) -> &'static [usize] {
        &[]
    }

    fn infer(&self, node: &Node, cx: &InferCx<'_>) -> Result<Vec<ValueType>>;

    /// Emits instructions and binds every node output.
    fn lower(&self, node: &Node, cx: &mut LowerCx<'_>) -> Result<()>;
}

/// Translator for a default-domain operator, if one exists.
pub(crate) fn translator_for(op: &OpType) -> Option<&'static dyn Translator> {
    use conv_pool::{AveragePool, Conv, GlobalPool, MaxPool};
    use elementwise::{Binary, Passthrough, Relu, Unary, Variadic};
    use linalg::{Gemm, MatMul};
    use normalization::{BatchNormalization, Lrn, Softmax};
    use reduce::{Reduce, ReduceMode};
    use shape::{Concat, Constant, Flatten, Reshape, Squeeze, Transpose, Unsqueeze};

    Some(match op {
        OpType::Add => &Binary(ElementwiseBinaryOp::Add),
        OpType::Sub => &Binary(ElementwiseBinaryOp::Sub),
        OpType::Mul => &Binary(ElementwiseBinaryOp::Mul),
        OpType::Div => &Binary(ElementwiseBinaryOp::Div),
        OpType::Pow => &Binary(ElementwiseBinaryOp::Pow),
        OpType::Max => &Variadic(ElementwiseBinaryOp::Maximum),
        OpType::Min => &Variadic(ElementwiseBinaryOp::Minimum),
        OpType::Sum => &Variadic(ElementwiseBinaryOp::Add),
        OpType::Relu => &Relu,
        OpType::Neg => &Unary(ElementwiseUnaryOp::Neg),
        OpType::Abs => &Unary(ElementwiseUnaryOp::Abs),
        OpType::Exp => &Unary(ElementwiseUnaryOp::Exp),
        OpType::Log => &Unary(ElementwiseUnaryOp::Log),
        OpType::Sqrt => &Unary(ElementwiseUnaryOp::Sqrt),
        OpType::Reciprocal => &Unary(ElementwiseUnaryOp::Reciprocal),
        OpType::Sigmoid => &Unary(ElementwiseUnaryOp::Sigmoid),
        OpType::Tanh => &Unary(ElementwiseUnaryOp::Tanh),
        OpType::Identity => &Passthrough::Identity,
        OpType::Dropout => &Passthrough::Dropout,
        OpType::Gemm => &Gemm,
        OpType::MatMul => &MatMul,
        OpType::Conv => &Conv,
        OpType::MaxPool => &MaxPool,
        OpType::AveragePool => &AveragePool,
        OpType::GlobalAveragePool => &GlobalPool(ReduceKind::Sum),
        OpType::GlobalMaxPool => &GlobalPool(ReduceKind::Max),
        OpType::BatchNormalization => &BatchNormalization,
        OpType::LRN => &Lrn,
        OpType::Softmax => &Softmax,
        OpType::Concat => &Concat,
        OpType::Transpose => &Transpose,
        OpType::Reshape => &Reshape,
        OpType::Flatten => &Flatten,
        OpType::Squeeze => &Squeeze,
        OpType::Unsqueeze => &Unsqueeze,
        OpType::Constant => &Constant,
        OpType::ReduceSum => &Reduce(ReduceMode::Sum),
        OpType::ReduceMean => &Reduce(ReduceMode::Mean),
        OpType::ReduceMax => &Reduce(ReduceMode::Max),
        OpType::ReduceMin => &Reduce(ReduceMode::Min),
        OpType::Other(_) => return None,
    })
}

pub(crate) fn shape_error(node: &Node, message: impl Into<String>) -> OnnxXlaError {
    OnnxXlaError::shape(node.display_name(), message)
}

/// Product of `dims`, or a shape error naming `node` when it overflows `usize`.
pub(crate) fn element_count(node: &Node, dims: &[usize]) -> Result<usize> {
    checked_element_count_or_error(dims, || {
        shape_error(node, format!("element count of {dims:?} overflows"))
    })
}

pub(crate) fn unsupported(node: &Node, reason: impl Into<String>) -> OnnxXlaError {
    OnnxXlaError::unsupported(node.op_type.as_str(), reason)
}

/// Normalizes a possibly negative axis against `rank`.
pub(crate) fn axis(node: &Node, axis: i64, rank: usize) -> Result<usize> {
    normalize_axis(axis, rank)
        .ok_or_else(|| shape_error(node, format!("axis {axis} is out of range for rank {rank}")))
}

/// Normalizes a list of axes, rejecting duplicates.
pub(crate) fn axes(node: &Node, values: &[i64], rank: usize) -> Result<Vec<usize>> {
    let mut out = Vec::with_capacity(values.len());
    for &value in values {
        let normalized = axis(node, value, rank)?;
        if out.contains(&normalized) {
            return Err(shape_error(node, format!("axis {value} is repeated")));
        }
        out.push(normalized);
    }
    Ok(out)
}

pub(crate) fn int_values(node: &Node, tensor: &Tensor) -> Result<Vec<i64>> {
    tensor.to_i64_vec().ok_or_else(|| {
        shape_error(
            node,
            format!("expected an integer tensor, found {}", tensor.elem_type()),
        )
    })
}

pub(crate) fn same_elem_type(node: &Node, types: &[&ValueType]) -> Result<ElemType> {
    let first = types
        .first()
        .map(|ty| ty.elem_type)
        .ok_or_else(|| shape_error(node, "operator has no inputs"))?;
    if let Some(other) = types.iter().find(|ty| ty.elem_type != first) {
        return Err(shape_error(
            node,
            format!("element types differ: {first} vs {}", other.elem_type),
        ));
    }
    Ok(first)
}

/// Program dtype of an element type, or an unsupported-operator error.
pub(crate) fn dtype(node: &Node, elem_type: ElemType) -> Result<DType> {
    elem_type
        .to_dtype()
        .ok_or_else(|| unsupported(node, format!("element type {elem_type} cannot be lowered")))
}

/// `auto_pad` values the pooling and conv lowerings understand.
pub(crate) fn check_auto_pad(node: &Node) -> Option<String> {
    match node.attr_string("auto_pad") {
        None | Some("NOTSET" | "VALID" | "SAME_UPPER" | "SAME_LOWER") => None,
        Some(other) => Some(format!("auto_pad `{other}` is not supported")),
    }
}
