use crate::backend::ir::{
    ConvSpec, DType, ElementwiseBinaryOp, Operation, ReduceKind, ReduceWindowSpec, TensorLiteral,
};
use crate::backend::legality::OperationKind;
use crate::compiler::lower::LowerCx;
use crate::error::Result;
use crate::graph::Node;

use super::{
    check_auto_pad, element_count, same_elem_type, shape_error, unsupported, InferCx, Translator,
    ValueType,
};

/// Resolved sliding-window geometry over the spatial axes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Window {
    pub kernel: Vec<usize>,
    pub strides: Vec<usize>,
    pub dilations: Vec<usize>,
    pub pads: Vec<(usize, usize)>,
    pub out: Vec<usize>,
}

fn spatial_attr(node: &Node, name: &str, rank: usize) -> Result<Vec<usize>> {
    match node.attr_ints(name) {
        None => Ok(vec![1; rank]),
        Some(values) if values.len() == rank && values.iter().all(|&v| v >= 1) => {
            values
                .iter()
                .map(|&v| {
                    usize::try_from(v)
                        .map_err(|_| shape_error(node, format!("`{name}` value {v} is too large")))
                })
                .collect()
        }
        Some(values) => Err(shape_error(
            node,
            format!("`{name}` must hold {rank} positive values, got {values:?}"),
        )),
    }
}

fn pad_value(node: &Node, pad: i64) -> Result<usize> {
    usize::try_from(pad).map_err(|_| shape_error(node, format!("pad {pad} is too large")))
}

fn overflow(node: &Node, axis: usize) -> crate::error::OnnxXlaError {
    shape_error(node, format!("window extent on spatial axis {axis} overflows"))
}

/// Extent covered by one dilated kernel window.
fn window_span(node: &Node, kernel: usize, dilation: usize) -> Result<usize> {
    (kernel - 1)
        .checked_mul(dilation)
        .and_then(|reach| reach.checked_add(1))
        .ok_or_else(|| shape_error(node, format!("kernel {kernel} with dilation {dilation} overflows")))
}

/// Computes padding and output extents for `spatial` inputs under `kernel`.
pub(crate) fn resolve_window(node: &Node, spatial: &[usize], kernel: &[usize]) -> Result<Window> {
    let rank = spatial.len();
    if kernel.len() != rank || kernel.contains(&0) {
        return Err(shape_error(
            node,
            format!("kernel {kernel:?} does not fit spatial extents {spatial:?}"),
        ));
    }
    let strides = spatial_attr(node, "strides", rank)?;
    let dilations = spatial_attr(node, "dilations", rank)?;
    let auto_pad = node.attr_string("auto_pad").unwrap_or("NOTSET");

    let pads = match auto_pad {
        "NOTSET" => match node.attr_ints("pads") {
            None => vec![(0, 0); rank],
            Some(pads) if pads.len() == 2 * rank && pads.iter().all(|&p| p >= 0) => (0..rank)
                .map(|axis| -> Result<(usize, usize)> {
                    Ok((pad_value(node, pads[axis])?, pad_value(node, pads[axis + rank])?))
                })
                .collect::<Result<Vec<_>>>()?,
            Some(pads) => {
                return Err(shape_error(
                    node,
                    format!("`pads` must hold {} non-negative values, got {pads:?}", 2 * rank),
                ))
            }
        },
        "VALID" => vec![(0, 0); rank],
        "SAME_UPPER" | "SAME_LOWER" => (0..rank)
            .map(|axis| -> Result<(usize, usize)> {
                let out = spatial[axis].div_ceil(strides[axis]);
                let span = window_span(node, kernel[axis], dilations[axis])?;
                let covered = out
                    .saturating_sub(1)
                    .checked_mul(strides[axis])
                    .and_then(|reach| reach.checked_add(span))
                    .ok_or_else(|| overflow(node, axis))?;
                let total = covered.saturating_sub(spatial[axis]);
                let (small, large) = (total / 2, total - total / 2);
                Ok(if auto_pad == "SAME_UPPER" {
                    (small, large)
                } else {
                    (large, small)
                })
            })
            .collect::<Result<Vec<_>>>()?,
        other => return Err(unsupported(node, format!("auto_pad `{other}` is not supported"))),
    };

    let mut out = Vec::with_capacity(rank);
    for axis in 0..rank {
        let padded = spatial[axis]
            .checked_add(pads[axis].0)
            .and_then(|extent| extent.checked_add(pads[axis].1))
            .ok_or_else(|| overflow(node, axis))?;
        let span = window_span(node, kernel[axis], dilations[axis])?;
        if padded < span {
            return Err(shape_error(
                node,
                format!(
                    "window of extent {span} does not fit padded axis of extent {padded}"
                ),
            ));
        }
        out.push((padded - span) / strides[axis] + 1);
    }

    Ok(Window {
        kernel: kernel.to_vec(),
        strides,
        dilations,
        pads,
        out,
    })
}

fn pooling_config(node: &Node) -> Option<String> {
    if node.attr_int("ceil_mode").unwrap_or(0) != 0 {
        return Some("ceil_mode is not supported".into());
    }
    check_auto_pad(node)
}

fn pooled_type(x: &ValueType, window: &Window) -> ValueType {
    let mut dims = x.dims[..2].to_vec();
    dims.extend_from_slice(&window.out);
    x.with_dims(dims)
}

/// Kernel shape of a pooling node, checked against the input rank.
fn pool_window(node: &Node, x: &ValueType) -> Result<Window> {
    if x.rank() < 3 {
        return Err(shape_error(
            node,
            format!("input must be [N, C, spatial...], got {:?}", x.dims),
        ));
    }
    let kernel = node
        .attr_ints("kernel_shape")
        .ok_or_else(|| shape_error(node, "kernel_shape is required"))?;
    if kernel.len() != x.rank() - 2 || kernel.iter().any(|&k| k < 1) {
        return Err(shape_error(
            node,
            format!("kernel_shape {kernel:?} does not match input {:?}", x.dims),
        ));
    }
    let kernel = kernel.iter().map(|&k| k as usize).collect::<Vec<_>>();
    resolve_window(node, &x.dims[2..], &kernel)
}

/// Window spec over the full `[N, C, spatial...]` layout.
fn full_rank_window(window: &Window, reduce: ReduceKind) -> ReduceWindowSpec {
    let lead = |fill| vec![fill, fill];
    let mut window_dims = lead(1);
    window_dims.extend_from_slice(&window.kernel);
    let mut strides = lead(1);
    strides.extend_from_slice(&window.strides);
    let mut window_dilation = lead(1);
    window_dilation.extend_from_slice(&window.dilations);
    let mut padding = vec![(0, 0); 2];
    padding.extend_from_slice(&window.pads);
    ReduceWindowSpec {
        window_dims,
        strides,
        padding,
        window_dilation,
        reduce,
    }
}

pub(crate) struct Conv;

impl Translator for Conv {
    fn lowered_kinds(&self) -> &'static [OperationKind] {
        &[
            OperationKind::Conv,
            OperationKind::Reshape,
            OperationKind::BroadcastTo,
            OperationKind::ElementwiseBinary,
        ]
    }

    fn unsupported_config(&self, node: &Node, _opset: i64) -> Option<String> {
        check_auto_pad(node)
    }

    fn float_only(&self) -> bool {
        true
    }

    fn infer(&self, node: &Node, cx: &InferCx<'_>) -> Result<Vec<ValueType>> {
        let (x, w) = (cx.input(node, 0)?, cx.input(node, 1)?);
        let mut operands = vec![x, w];
        if x.rank() < 3 || w.rank() != x.rank() {
            return Err(shape_error(
                node,
                format!("expected [N, C, spatial...] input and matching weights, got {:?} and {:?}", x.dims, w.dims),
            ));
        }
        let groups = node.attr_int("group").unwrap_or(1);
        if groups < 1 {
            return Err(shape_error(node, format!("group must be positive, got {groups}")));
        }
        let groups = groups as usize;
        let (channels, out_channels) = (x.dims[1], w.dims[0]);
        if channels % groups != 0
            || w.dims[1].checked_mul(groups) != Some(channels)
            || out_channels % groups != 0
        {
            return Err(shape_error(
                node,
                format!(
                    "weights {:?} do not match {channels} input channels in {groups} groups",
                    w.dims
                ),
            ));
        }
        if let Some(kernel_shape) = node.attr_ints("kernel_shape") {
            let matches = kernel_shape.len() == w.rank() - 2
                && kernel_shape
                    .iter()
                    .zip(&w.dims[2..])
                    .all(|(&k, &d)| k >= 0 && k as usize == d);
            if !matches {
                return Err(shape_error(
                    node,
                    format!("kernel_shape {kernel_shape:?} disagrees with weights {:?}", w.dims),
                ));
            }
        }
        if let Some(bias) = cx.optional_input(node, 2) {
            if bias.dims != [out_channels] {
                return Err(shape_error(
                    node,
                    format!("bias must be [{out_channels}], got {:?}", bias.dims),
                ));
            }
            operands.push(bias);
        }
        let elem_type = same_elem_type(node, &operands)?;
        let window = resolve_window(node, &x.dims[2..], &w.dims[2..])?;
        let mut dims = vec![x.dims[0], out_channels];
        dims.extend_from_slice(&window.out);
        Ok(vec![ValueType::new(elem_type, dims)])
    }

    fn lower(&self, node: &Node, cx: &mut LowerCx<'_>) -> Result<()> {
        let x_ty = cx.input_type(node, 0)?;
        let w_ty = cx.input_type(node, 1)?;
        let out_ty = cx.output_type(node, 0)?;
        let dtype = cx.dtype_for(node, out_ty)?;
        let window = resolve_window(node, &x_ty.dims[2..], &w_ty.dims[2..])?;
        let spec = ConvSpec {
            strides: window.strides,
            padding: window.pads,
            dilations: window.dilations,
            groups: node.attr_int("group").unwrap_or(1) as usize,
        };
        let x = cx.input(node, 0)?;
        let w = cx.input(node, 1)?;
        let mut out = cx.emit(Operation::Conv(spec), &[x, w], dtype, &out_ty.dims);
        if let Some(bias) = cx.optional_input(node, 2)? {
            // [M] -> [1, M, 1, ...] so the add broadcasts along the channel axis.
            let mut bias_dims = vec![1; out_ty.rank()];
            bias_dims[1] = out_ty.dims[1];
            let bias = cx.reshape(bias, &bias_dims);
            out = cx.binary(ElementwiseBinaryOp::Add, out, bias)?;
        }
        cx.bind(node, 0, out);
        Ok(())
    }
}

pub(crate) struct MaxPool;

impl Translator for MaxPool {
    fn lowered_kinds(&self) -> &'static [OperationKind] {
        &[OperationKind::ReduceWindow]
    }

    fn unsupported_config(&self, node: &Node, _opset: i64) -> Option<String> {
        if node.extra_outputs().next().is_some() {
            return Some("the indices output is not supported".into());
        }
        if node.attr_int("storage_order").unwrap_or(0) != 0 {
            return Some("storage_order must be 0".into());
        }
        pooling_config(node)
    }

    fn infer(&self, node: &Node, cx: &InferCx<'_>) -> Result<Vec<ValueType>> {
        let x = cx.input(node, 0)?;
        let window = pool_window(node, x)?;
        Ok(vec![pooled_type(x, &window)])
    }

    fn lower(&self, node: &Node, cx: &mut LowerCx<'_>) -> Result<()> {
        if let Some(reason) = self.unsupported_config(node, cx.opset) {
            return Err(unsupported(node, reason));
        }
        let x_ty = cx.input_type(node, 0)?;
        let out_ty = cx.output_type(node, 0)?;
        let dtype = cx.dtype_for(node, out_ty)?;
        let window = pool_window(node, x_ty)?;
        let x = cx.input(node, 0)?;
        let out = cx.emit(
            Operation::ReduceWindow(full_rank_window(&window, ReduceKind::Max)),
            &[x],
            dtype,
            &out_ty.dims,
        );
        cx.bind(node, 0, out);
        Ok(())
    }
}

pub(crate) struct AveragePool;

impl Translator for AveragePool {
    fn lowered_kinds(&self) -> &'static [OperationKind] {
        &[
            OperationKind::ReduceWindow,
            OperationKind::Constant,
            OperationKind::BroadcastTo,
            OperationKind::ElementwiseBinary,
        ]
    }

    fn unsupported_config(&self, node: &Node, _opset: i64) -> Option<String> {
        pooling_config(node)
    }

    fn float_only(&self) -> bool {
        true
    }

    fn infer(&self, node: &Node, cx: &InferCx<'_>) -> Result<Vec<ValueType>> {
        let x = cx.input(node, 0)?;
        let window = pool_window(node, x)?;
        Ok(vec![pooled_type(x, &window)])
    }

    fn lower(&self, node: &Node, cx: &mut LowerCx<'_>) -> Result<()> {
        let x_ty = cx.input_type(node, 0)?;
        let out_ty = cx.output_type(node, 0)?;
        let dtype = cx.dtype_for(node, out_ty)?;
        let window = pool_window(node, x_ty)?;
        let spec = full_rank_window(&window, ReduceKind::Sum);
        let x = cx.input(node, 0)?;
        let sum = cx.emit(Operation::ReduceWindow(spec.clone()), &[x], dtype, &out_ty.dims);

        let include_pad = node.attr_int("count_include_pad").unwrap_or(0) != 0;
        let unpadded = window.pads.iter().all(|&(lo, hi)| lo == 0 && hi == 0);
        let divisor = if include_pad || unpadded {
            let size = element_count(node, &window.kernel)?;
            cx.splat(dtype, size as f64, &out_ty.dims)
        } else {
            // Per-position count of real elements: the same window summed over ones.
            let mut ones_dims = vec![1, 1];
            ones_dims.extend_from_slice(&x_ty.dims[2..]);
            let mut count_dims = vec![1, 1];
            count_dims.extend_from_slice(&window.out);
            let ones = cx.literal(TensorLiteral::filled_f32(&ones_dims, 1.0));
            cx.emit(Operation::ReduceWindow(spec), &[ones], DType::F32, &count_dims)
        };
        let out = cx.binary(ElementwiseBinaryOp::Div, sum, divisor)?;
        cx.bind(node, 0, out);
        Ok(())
    }
}

/// `GlobalAveragePool` (`Sum`, then divided) and `GlobalMaxPool` (`Max`).
pub(crate) struct GlobalPool(pub ReduceKind);

impl Translator for GlobalPool {
    fn lowered_kinds(&self) -> &'static [OperationKind] {
        match self.0 {
            ReduceKind::Sum => &[
                OperationKind::Reduce,
                OperationKind::Constant,
                OperationKind::BroadcastTo,
                OperationKind::ElementwiseBinary,
            ],
            _ => &[OperationKind::Reduce],
        }
    }

    fn float_only(&self) -> bool {
        self.0 == ReduceKind::Sum
    }

    fn infer(&self, node: &Node, cx: &InferCx<'_>) -> Result<Vec<ValueType>> {
        let x = cx.input(node, 0)?;
        if x.rank() < 3 {
            return Err(shape_error(
                node,
                format!("input must be [N, C, spatial...], got {:?}", x.dims),
            ));
        }
        let mut dims = x.dims[..2].to_vec();
        dims.resize(x.rank(), 1);
        Ok(vec![x.with_dims(dims)])
    }

    fn lower(&self, node: &Node, cx: &mut LowerCx<'_>) -> Result<()> {
        let x_ty = cx.input_type(node, 0)?;
        let x = cx.input(node, 0)?;
        let axes = (2..x_ty.rank()).collect::<Vec<_>>();
        let mut out = cx.reduce(x, self.0, &axes, true);
        if self.0 == ReduceKind::Sum {
            let count = element_count(node, &x_ty.dims[2..])?;
            let dims = cx.dims(out);
            let divisor = cx.splat(cx.dtype_of(out), count as f64, &dims);
            out = cx.binary(ElementwiseBinaryOp::Div, out, divisor)?;
        }
        cx.bind(node, 0, out);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::graph::{AttributeValue, OpType};

    fn node(attrs: &[(&str, AttributeValue)]) -> Node {
        Node {
            name: "pool".into(),
            op_type: OpType::MaxPool,
            domain: String::new(),
            inputs: vec!["x".into()],
            outputs: vec!["y".into()],
            attributes: attrs
                .iter()
                .cloned()
                .map(|(k, v)| (k.to_string(), v))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn explicit_pads_and_strides() {
        let n = node(&[
            ("pads", AttributeValue::Ints(vec![1, 1, 1, 1])),
            ("strides", AttributeValue::Ints(vec![2, 2])),
        ]);
        let window = resolve_window(&n, &[5, 5], &[3, 3]).unwrap();
        assert_eq!(window.out, vec![3, 3]);
        assert_eq!(window.pads, vec![(1, 1), (1, 1)]);
    }

    #[test]
    fn same_upper_and_lower_place_the_odd_element() {
        let upper = node(&[("auto_pad", AttributeValue::String("SAME_UPPER".into()))]);
        let window = resolve_window(&upper, &[4], &[2]).unwrap();
        assert_eq!(window.out, vec![4]);
        assert_eq!(window.pads, vec![(0, 1)]);

        let lower = node(&[("auto_pad", AttributeValue::String("SAME_LOWER".into()))]);
        let window = resolve_window(&lower, &[4], &[2]).unwrap();
        assert_eq!(window.pads, vec![(1, 0)]);
    }

    #[test]
    fn same_padding_with_stride_and_dilation() {
        let n = node(&[
            ("auto_pad", AttributeValue::String("SAME_UPPER".into())),
            ("strides", AttributeValue::Ints(vec![2])),
            ("dilations", AttributeValue::Ints(vec![2])),
        ]);
        // out = ceil(7/2) = 4, total = 3*2 + 2*2 + 1 - 7 = 4
        let window = resolve_window(&n, &[7], &[3]).unwrap();
        assert_eq!(window.out, vec![4]);
        assert_eq!(window.pads, vec![(2, 2)]);
    }

    #[test]
    fn dilated_output_extent() {
        let n = node(&[("dilations", AttributeValue::Ints(vec![2, 2]))]);
        let window = resolve_window(&n, &[7, 7], &[3, 3]).unwrap();
        assert_eq!(window.out, vec![3, 3]);
    }

    #[test]
    fn oversized_window_is_a_shape_error() {
        let n = node(&[]);
        let err = resolve_window(&n, &[2], &[3]).unwrap_err();
        assert!(matches!(err, crate::error::OnnxXlaError::ShapeInference { .. }));
    }

    #[test]
    fn oversized_pads_and_dilations_are_shape_errors() {
        let huge = i64::MAX;
        let padded = node(&[("pads", AttributeValue::Ints(vec![huge, huge]))]);
        assert!(matches!(
            resolve_window(&padded, &[4], &[2]),
            Err(crate::error::OnnxXlaError::ShapeInference { .. })
        ));

        let dilated = node(&[("dilations", AttributeValue::Ints(vec![huge]))]);
        assert!(resolve_window(&dilated, &[4], &[usize::MAX]).is_err());

        let same = node(&[
            ("auto_pad", AttributeValue::String("SAME_UPPER".into())),
            ("dilations", AttributeValue::Ints(vec![huge])),
        ]);
        assert!(resolve_window(&same, &[4], &[4]).is_err());
    }
}
