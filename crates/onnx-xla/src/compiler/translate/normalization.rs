use crate::backend::ir::{
    ElementwiseBinaryOp, ElementwiseUnaryOp, Operation, ReduceKind, ReduceWindowSpec,
};
use crate::backend::legality::OperationKind;
use crate::compiler::lower::LowerCx;
use crate::error::Result;
use crate::graph::Node;

use super::{axis, same_elem_type, shape_error, InferCx, Translator, ValueType};

const DEFAULT_EPSILON: f32 = 1e-5;

/// Inference-mode batch normalization over channel axis 1.
pub(crate) struct BatchNormalization;

impl Translator for BatchNormalization {
    fn lowered_kinds(&self) -> &'static [OperationKind] {
        &[
            OperationKind::Constant,
            OperationKind::Reshape,
            OperationKind::BroadcastTo,
            OperationKind::ElementwiseBinary,
            OperationKind::ElementwiseUnary,
        ]
    }

    fn unsupported_config(&self, node: &Node, _opset: i64) -> Option<String> {
        if node.extra_outputs().next().is_some() {
            return Some("running statistics outputs are only produced in training".into());
        }
        if node.attr_int("training_mode").unwrap_or(0) != 0 {
            return Some("training_mode is not supported".into());
        }
        if node.attr_int("spatial") == Some(0) {
            return Some("per-activation statistics (spatial=0) are not supported".into());
        }
        None
    }

    fn float_only(&self) -> bool {
        true
    }

    fn infer(&self, node: &Node, cx: &InferCx<'_>) -> Result<Vec<ValueType>> {
        let x = cx.input(node, 0)?;
        if x.rank() < 2 {
            return Err(shape_error(
                node,
                format!("input must be [N, C, ...], got {:?}", x.dims),
            ));
        }
        let channels = x.dims[1];
        let mut operands = vec![x];
        for (index, name) in ["scale", "B", "mean", "var"].iter().enumerate() {
            let param = cx.input(node, index + 1)?;
            if param.dims != [channels] {
                return Err(shape_error(
                    node,
                    format!("{name} must be [{channels}], got {:?}", param.dims),
                ));
            }
            operands.push(param);
        }
        same_elem_type(node, &operands)?;
        Ok(vec![x.clone()])
    }

    fn lower(&self, node: &Node, cx: &mut LowerCx<'_>) -> Result<()> {
        let x_ty = cx.input_type(node, 0)?;
        let dtype = cx.dtype_for(node, x_ty)?;
        let channels = x_ty.dims[1];
        let epsilon = node.attr_float("epsilon").unwrap_or(DEFAULT_EPSILON);

        let x = cx.input(node, 0)?;
        let scale = cx.input(node, 1)?;
        let bias = cx.input(node, 2)?;
        let mean = cx.input(node, 3)?;
        let var = cx.input(node, 4)?;

        // factor = scale / sqrt(var + epsilon), computed on [C].
        let eps = cx.splat(dtype, epsilon as f64, &[channels]);
        let var_eps = cx.binary(ElementwiseBinaryOp::Add, var, eps)?;
        let std = cx.unary(ElementwiseUnaryOp::Sqrt, var_eps);
        let factor = cx.binary(ElementwiseBinaryOp::Div, scale, std)?;

        let mut channel_dims = vec![1; x_ty.rank()];
        channel_dims[1] = channels;
        let mean = cx.reshape(mean, &channel_dims);
        let factor = cx.reshape(factor, &channel_dims);
        let bias = cx.reshape(bias, &channel_dims);

        let centered = cx.binary(ElementwiseBinaryOp::Sub, x, mean)?;
        let scaled = cx.binary(ElementwiseBinaryOp::Mul, centered, factor)?;
        let out = cx.binary(ElementwiseBinaryOp::Add, scaled, bias)?;
        cx.bind(node, 0, out);
        Ok(())
    }
}

/// Local response normalization across channels.
pub(crate) struct Lrn;

struct LrnAttrs {
    size: usize,
    alpha: f32,
    beta: f32,
    bias: f32,
}

impl LrnAttrs {
    fn from_node(node: &Node) -> Result<Self> {
        let size = node.attr_int("size").unwrap_or(0);
        if size < 1 {
            return Err(shape_error(node, format!("size must be positive, got {size}")));
        }
        Ok(Self {
            size: size as usize,
            alpha: node.attr_float("alpha").unwrap_or(1e-4),
            beta: node.attr_float("beta").unwrap_or(0.75),
            bias: node.attr_float("bias").unwrap_or(1.0),
        })
    }
}

impl Translator for Lrn {
    fn lowered_kinds(&self) -> &'static [OperationKind] {
        &[
            OperationKind::ElementwiseBinary,
            OperationKind::ReduceWindow,
            OperationKind::Constant,
            OperationKind::BroadcastTo,
        ]
    }

    fn float_only(&self) -> bool {
        true
    }

    fn infer(&self, node: &Node, cx: &InferCx<'_>) -> Result<Vec<ValueType>> {
        LrnAttrs::from_node(node)?;
        let x = cx.input(node, 0)?;
        if x.rank() < 2 {
            return Err(shape_error(
                node,
                format!("input must be [N, C, ...], got {:?}", x.dims),
            ));
        }
        Ok(vec![x.clone()])
    }

    fn lower(&self, node: &Node, cx: &mut LowerCx<'_>) -> Result<()> {
        let attrs = LrnAttrs::from_node(node)?;
        let x_ty = cx.input_type(node, 0)?;
        let dtype = cx.dtype_for(node, x_ty)?;
        let dims = &x_ty.dims;
        let x = cx.input(node, 0)?;

        let squared = cx.binary(ElementwiseBinaryOp::Mul, x, x)?;
        let rank = x_ty.rank();
        let mut window_dims = vec![1; rank];
        window_dims[1] = attrs.size;
        let mut padding = vec![(0, 0); rank];
        padding[1] = ((attrs.size - 1) / 2, attrs.size / 2);
        let spec = ReduceWindowSpec {
            window_dims,
            strides: vec![1; rank],
            padding,
            window_dilation: vec![1; rank],
            reduce: ReduceKind::Sum,
        };
        let sum_sq = cx.emit(Operation::ReduceWindow(spec), &[squared], dtype, dims);

        let scale = cx.splat(dtype, (attrs.alpha / attrs.size as f32) as f64, dims);
        let scaled = cx.binary(ElementwiseBinaryOp::Mul, sum_sq, scale)?;
        let bias = cx.splat(dtype, attrs.bias as f64, dims);
        let base = cx.binary(ElementwiseBinaryOp::Add, scaled, bias)?;
        let beta = cx.splat(dtype, attrs.beta as f64, dims);
        let denom = cx.binary(ElementwiseBinaryOp::Pow, base, beta)?;
        let out = cx.binary(ElementwiseBinaryOp::Div, x, denom)?;
        cx.bind(node, 0, out);
        Ok(())
    }
}

/// Max-subtracted softmax.
///
/// Before opset 13 the input is treated as 2-D, reducing over `[axis, rank)` with a
/// default axis of 1; from opset 13 only `axis` (default -1) is reduced.
pub(crate) struct Softmax;

fn softmax_axes(node: &Node, opset: i64, rank: usize) -> Result<Vec<usize>> {
    if opset < 13 {
        let start = axis(node, node.attr_int("axis").unwrap_or(1), rank)?;
        Ok((start..rank).collect())
    } else {
        Ok(vec![axis(node, node.attr_int("axis").unwrap_or(-1), rank)?])
    }
}

impl Translator for Softmax {
    fn lowered_kinds(&self) -> &'static [OperationKind] {
        &[
            OperationKind::Reduce,
            OperationKind::BroadcastTo,
            OperationKind::ElementwiseBinary,
            OperationKind::ElementwiseUnary,
        ]
    }

    fn float_only(&self) -> bool {
        true
    }

    fn infer(&self, node: &Node, cx: &InferCx<'_>) -> Result<Vec<ValueType>> {
        let x = cx.input(node, 0)?;
        softmax_axes(node, cx.opset, x.rank())?;
        Ok(vec![x.clone()])
    }

    fn lower(&self, node: &Node, cx: &mut LowerCx<'_>) -> Result<()> {
        let x_ty = cx.input_type(node, 0)?;
        let axes = softmax_axes(node, cx.opset, x_ty.rank())?;
        let x = cx.input(node, 0)?;
        let max = cx.reduce(x, ReduceKind::Max, &axes, true);
        let shifted = cx.binary(ElementwiseBinaryOp::Sub, x, max)?;
        let exp = cx.unary(ElementwiseUnaryOp::Exp, shifted);
        let sum = cx.reduce(exp, ReduceKind::Sum, &axes, true);
        let out = cx.binary(ElementwiseBinaryOp::Div, exp, sum)?;
        cx.bind(node, 0, out);
        Ok(())
    }
}
