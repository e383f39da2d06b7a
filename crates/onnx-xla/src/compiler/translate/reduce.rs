use crate::backend::ir::{ElementwiseBinaryOp, ReduceKind};
use crate::backend::legality::OperationKind;
use crate::compiler::lower::LowerCx;
use crate::error::Result;
use crate::graph::Node;

use super::{axes, element_count, int_values, InferCx, Translator, ValueType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReduceMode {
    Sum,
    Mean,
    Max,
    Min,
}

impl ReduceMode {
    fn kind(self) -> ReduceKind {
        match self {
            ReduceMode::Sum | ReduceMode::Mean => ReduceKind::Sum,
            ReduceMode::Max => ReduceKind::Max,
            ReduceMode::Min => ReduceKind::Min,
        }
    }
}

/// `ReduceSum`, `ReduceMean`, `ReduceMax`, `ReduceMin`.
pub(crate) struct Reduce(pub ReduceMode);

/// Axes to reduce; `None` means the node is a no-op (`noop_with_empty_axes`).
fn reduced_axes(node: &Node, rank: usize, listed: Option<Vec<i64>>) -> Result<Option<Vec<usize>>> {
    match listed {
        Some(values) if !values.is_empty() => axes(node, &values, rank).map(Some),
        _ if node.attr_int("noop_with_empty_axes").unwrap_or(0) != 0 => Ok(None),
        _ => Ok(Some((0..rank).collect())),
    }
}

fn listed_axes(node: &Node, constant: Option<&crate::tensor::Tensor>) -> Result<Option<Vec<i64>>> {
    match constant {
        Some(tensor) => int_values(node, tensor).map(Some),
        None => Ok(node.attr_ints("axes").map(<[i64]>::to_vec)),
    }
}

impl Translator for Reduce {
    fn lowered_kinds(&self) -> &'static [OperationKind] {
        match self.0 {
            ReduceMode::Mean => &[
                OperationKind::Reduce,
                OperationKind::Constant,
                OperationKind::BroadcastTo,
                OperationKind::ElementwiseBinary,
            ],
            _ => &[OperationKind::Reduce],
        }
    }

    fn float_only(&self) -> bool {
        self.0 == ReduceMode::Mean
    }

    fn constant_inputs(&self) -> &'static [usize] {
        &[1]
    }

    fn infer(&self, node: &Node, cx: &InferCx<'_>) -> Result<Vec<ValueType>> {
        let x = cx.input(node, 0)?;
        let listed = listed_axes(node, cx.constant_input(node, 1)?)?;
        let Some(axes) = reduced_axes(node, x.rank(), listed)? else {
            return Ok(vec![x.clone()]);
        };
        let keepdims = node.attr_int("keepdims").unwrap_or(1) != 0;
        let dims = x
            .dims
            .iter()
            .enumerate()
            .filter_map(|(axis, &dim)| match (axes.contains(&axis), keepdims) {
                (false, _) => Some(dim),
                (true, true) => Some(1),
                (true, false) => None,
            })
            .collect();
        Ok(vec![x.with_dims(dims)])
    }

    fn lower(&self, node: &Node, cx: &mut LowerCx<'_>) -> Result<()> {
        let x_ty = cx.input_type(node, 0)?;
        let listed = listed_axes(node, cx.constant_input(node, 1)?)?;
        let x = cx.input(node, 0)?;
        let Some(axes) = reduced_axes(node, x_ty.rank(), listed)? else {
            cx.bind(node, 0, x);
            return Ok(());
        };
        let keepdims = node.attr_int("keepdims").unwrap_or(1) != 0;
        let mut out = cx.reduce(x, self.0.kind(), &axes, keepdims);
        if self.0 == ReduceMode::Mean {
            let reduced = axes.iter().map(|&a| x_ty.dims[a]).collect::<Vec<_>>();
            let count = element_count(node, &reduced)?;
            let dims = cx.dims(out);
            let divisor = cx.splat(cx.dtype_of(out), count as f64, &dims);
            out = cx.binary(ElementwiseBinaryOp::Div, out, divisor)?;
        }
        cx.bind(node, 0, out);
        Ok(())
    }
}
