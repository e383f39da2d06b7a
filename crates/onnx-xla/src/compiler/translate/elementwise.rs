use crate::backend::ir::{ElementwiseBinaryOp, ElementwiseUnaryOp, ValueId};
use crate::backend::legality::OperationKind;
use crate::backend::shape_helpers::broadcast_shapes;
use crate::compiler::lower::LowerCx;
use crate::error::Result;
use crate::graph::Node;
use crate::tensor::{Tensor, TensorData};

use super::{same_elem_type, shape_error, unsupported, InferCx, Translator, ValueType};

/// Two-input arithmetic with multidirectional broadcasting.
pub(crate) struct Binary(pub ElementwiseBinaryOp);

/// Pre-opset-7 `broadcast=1, axis=k`: the right operand is aligned starting at `k`.
fn legacy_rhs_dims(node: &Node, lhs: &[usize], rhs: &[usize]) -> Result<Option<Vec<usize>>> {
    if node.attr_int("broadcast") != Some(1) {
        return Ok(None);
    }
    let Some(axis) = node.attr_int("axis") else {
        return Ok(None);
    };
    let rank = lhs.len() as i64;
    let start = if axis < 0 { axis + rank } else { axis };
    if start < 0 || start as usize + rhs.len() > lhs.len() {
        return Err(shape_error(
            node,
            format!("legacy broadcast axis {axis} does not fit {rhs:?} into {lhs:?}"),
        ));
    }
    let start = start as usize;
    let mut dims = vec![1; lhs.len()];
    dims[start..start + rhs.len()].copy_from_slice(rhs);
    Ok(Some(dims))
}

fn broadcast_or_error(node: &Node, lhs: &[usize], rhs: &[usize]) -> Result<Vec<usize>> {
    broadcast_shapes(lhs, rhs)
        .ok_or_else(|| shape_error(node, format!("shapes {lhs:?} and {rhs:?} do not broadcast")))
}

impl Translator for Binary {
    fn lowered_kinds(&self) -> &'static [OperationKind] {
        &[
            OperationKind::Reshape,
            OperationKind::BroadcastTo,
            OperationKind::ElementwiseBinary,
        ]
    }

    fn float_only(&self) -> bool {
        self.0 == ElementwiseBinaryOp::Pow
    }

    fn infer(&self, node: &Node, cx: &InferCx<'_>) -> Result<Vec<ValueType>> {
        let (lhs, rhs) = (cx.input(node, 0)?, cx.input(node, 1)?);
        let elem_type = same_elem_type(node, &[lhs, rhs])?;
        let rhs_dims = legacy_rhs_dims(node, &lhs.dims, &rhs.dims)?.unwrap_or_else(|| rhs.dims.clone());
        let dims = broadcast_or_error(node, &lhs.dims, &rhs_dims)?;
        Ok(vec![ValueType::new(elem_type, dims)])
    }

    fn lower(&self, node: &Node, cx: &mut LowerCx<'_>) -> Result<()> {
        let lhs = cx.input(node, 0)?;
        let mut rhs = cx.input(node, 1)?;
        if let Some(dims) = legacy_rhs_dims(node, &cx.dims(lhs), &cx.dims(rhs))? {
            rhs = cx.reshape(rhs, &dims);
        }
        let out = cx.binary(self.0, lhs, rhs)?;
        cx.bind(node, 0, out);
        Ok(())
    }
}

/// `Sum`, `Max`, `Min`: any number of inputs, folded left to right.
pub(crate) struct Variadic(pub ElementwiseBinaryOp);

impl Translator for Variadic {
    fn lowered_kinds(&self) -> &'static [OperationKind] {
        &[OperationKind::BroadcastTo, OperationKind::ElementwiseBinary]
    }

    fn infer(&self, node: &Node, cx: &InferCx<'_>) -> Result<Vec<ValueType>> {
        let inputs = (0..node.inputs.len())
            .map(|index| cx.input(node, index))
            .collect::<Result<Vec<_>>>()?;
        let elem_type = same_elem_type(node, &inputs)?;
        let mut dims = inputs[0].dims.clone();
        for input in &inputs[1..] {
            dims = broadcast_or_error(node, &dims, &input.dims)?;
        }
        Ok(vec![ValueType::new(elem_type, dims)])
    }

    fn lower(&self, node: &Node, cx: &mut LowerCx<'_>) -> Result<()> {
        let mut acc = cx.input(node, 0)?;
        for index in 1..node.inputs.len() {
            let next = cx.input(node, index)?;
            acc = cx.binary(self.0, acc, next)?;
        }
        cx.bind(node, 0, acc);
        Ok(())
    }
}

pub(crate) struct Unary(pub ElementwiseUnaryOp);

impl Translator for Unary {
    fn lowered_kinds(&self) -> &'static [OperationKind] {
        &[OperationKind::ElementwiseUnary]
    }

    fn float_only(&self) -> bool {
        !matches!(self.0, ElementwiseUnaryOp::Neg | ElementwiseUnaryOp::Abs)
    }

    fn infer(&self, node: &Node, cx: &InferCx<'_>) -> Result<Vec<ValueType>> {
        Ok(vec![cx.input(node, 0)?.clone()])
    }

    fn lower(&self, node: &Node, cx: &mut LowerCx<'_>) -> Result<()> {
        let x = cx.input(node, 0)?;
        let out = cx.unary(self.0, x);
        cx.bind(node, 0, out);
        Ok(())
    }
}

/// `max(x, 0)`.
pub(crate) struct Relu;

impl Translator for Relu {
    fn lowered_kinds(&self) -> &'static [OperationKind] {
        &[
            OperationKind::Constant,
            OperationKind::BroadcastTo,
            OperationKind::ElementwiseBinary,
        ]
    }

    fn infer(&self, node: &Node, cx: &InferCx<'_>) -> Result<Vec<ValueType>> {
        Ok(vec![cx.input(node, 0)?.clone()])
    }

    fn lower(&self, node: &Node, cx: &mut LowerCx<'_>) -> Result<()> {
        let x = cx.input(node, 0)?;
        let dims = cx.dims(x);
        let zero = cx.splat(cx.dtype_of(x), 0.0, &dims);
        let out = cx.binary(ElementwiseBinaryOp::Maximum, x, zero)?;
        cx.bind(node, 0, out);
        Ok(())
    }
}

/// Operators that forward their first input unchanged at inference time.
pub(crate) enum Passthrough {
    Identity,
    /// Inference-mode dropout; the mask output is rejected up front.
    Dropout,
}

impl Translator for Passthrough {
    fn lowered_kinds(&self) -> &'static [OperationKind] {
        &[]
    }

    fn unsupported_config(&self, node: &Node, _opset: i64) -> Option<String> {
        match self {
            Passthrough::Dropout if node.extra_outputs().next().is_some() => {
                Some("the mask output is only produced in training".into())
            }
            _ => None,
        }
    }

    fn unsupported_constants(
        &self,
        _node: &Node,
        constant: &dyn Fn(usize) -> Option<Tensor>,
    ) -> Option<String> {
        match self {
            Passthrough::Dropout if constant(2).is_some_and(|mode| is_truthy(&mode)) => {
                Some("training mode is not supported".into())
            }
            _ => None,
        }
    }

    fn constant_inputs(&self) -> &'static [usize] {
        match self {
            Passthrough::Identity => &[],
            Passthrough::Dropout => &[1, 2],
        }
    }

    fn infer(&self, node: &Node, cx: &InferCx<'_>) -> Result<Vec<ValueType>> {
        let constant = |slot| cx.constant_input(node, slot).ok().flatten().cloned();
        if let Some(reason) = self.unsupported_constants(node, &constant) {
            return Err(unsupported(node, reason));
        }
        Ok(vec![cx.input(node, 0)?.clone()])
    }

    fn lower(&self, node: &Node, cx: &mut LowerCx<'_>) -> Result<()> {
        let x: ValueId = cx.input(node, 0)?;
        cx.bind(node, 0, x);
        Ok(())
    }
}

fn is_truthy(tensor: &Tensor) -> bool {
    match tensor.data() {
        TensorData::Bool(values) => values.iter().any(|&b| b),
        _ => tensor
            .to_i64_vec()
            .is_some_and(|values| values.iter().any(|&v| v != 0)),
    }
}
