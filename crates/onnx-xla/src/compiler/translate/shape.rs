use crate::backend::ir::{ConcatSpec, Operation, TransposeSpec};
use crate::backend::legality::OperationKind;
use crate::compiler::lower::LowerCx;
use crate::error::Result;
use crate::graph::Node;
use crate::tensor::Tensor;

use super::{
    axes, axis, element_count, int_values, same_elem_type, shape_error, InferCx, Translator,
    ValueType,
};

/// Resolves a Reshape target against the input dims.
///
/// `-1` (at most once) is inferred from the remaining extent; `0` copies the input dim
/// unless `allow_zero` is set.
pub(crate) fn resolve_reshape(
    node: &Node,
    input: &[usize],
    target: &[i64],
    allow_zero: bool,
) -> Result<Vec<usize>> {
    let total = element_count(node, input)?;
    let mut inferred = None;
    let mut dims = Vec::with_capacity(target.len());
    for (index, &value) in target.iter().enumerate() {
        match value {
            -1 => {
                if inferred.replace(index).is_some() {
                    return Err(shape_error(node, "shape may contain at most one -1"));
                }
                dims.push(1);
            }
            0 if !allow_zero => {
                let dim = input.get(index).copied().ok_or_else(|| {
                    shape_error(
                        node,
                        format!("0 at position {index} has no input dim to copy"),
                    )
                })?;
                dims.push(dim);
            }
            value if value >= 0 => {
                let dim = usize::try_from(value).map_err(|_| {
                    shape_error(node, format!("shape entry {value} does not fit in usize"))
                })?;
                dims.push(dim);
            }
            value => {
                return Err(shape_error(node, format!("invalid shape entry {value}")));
            }
        }
    }
    if let Some(index) = inferred {
        let known = element_count(node, &dims)?;
        if known == 0 || total % known != 0 {
            return Err(shape_error(
                node,
                format!("cannot infer -1 of {target:?} from {total} elements"),
            ));
        }
        dims[index] = total / known;
    }
    if element_count(node, &dims)? != total {
        return Err(shape_error(
            node,
            format!("shape {target:?} does not hold {total} elements of {input:?}"),
        ));
    }
    Ok(dims)
}

/// Single-kind translators that only change the logical shape.
fn reshape_lowering(node: &Node, cx: &mut LowerCx<'_>) -> Result<()> {
    let out_ty = cx.output_type(node, 0)?;
    let x = cx.input(node, 0)?;
    let out = cx.reshape(x, &out_ty.dims);
    cx.bind(node, 0, out);
    Ok(())
}

pub(crate) struct Reshape;

impl Translator for Reshape {
    fn lowered_kinds(&self) -> &'static [OperationKind] {
        &[OperationKind::Reshape]
    }

    fn unsupported_config(&self, node: &Node, _opset: i64) -> Option<String> {
        if node.input(1).is_none() && node.attr_ints("shape").is_none() {
            return Some("a target shape is required".into());
        }
        None
    }

    fn constant_inputs(&self) -> &'static [usize] {
        &[1]
    }

    fn infer(&self, node: &Node, cx: &InferCx<'_>) -> Result<Vec<ValueType>> {
        let x = cx.input(node, 0)?;
        let target = match cx.constant_input(node, 1)? {
            Some(tensor) => int_values(node, tensor)?,
            None => node
                .attr_ints("shape")
                .map(<[i64]>::to_vec)
                .ok_or_else(|| shape_error(node, "a target shape is required"))?,
        };
        let allow_zero = node.attr_int("allowzero").unwrap_or(0) != 0;
        let dims = resolve_reshape(node, &x.dims, &target, allow_zero)?;
        Ok(vec![x.with_dims(dims)])
    }

    fn lower(&self, node: &Node, cx: &mut LowerCx<'_>) -> Result<()> {
        reshape_lowering(node, cx)
    }
}

pub(crate) struct Flatten;

impl Translator for Flatten {
    fn lowered_kinds(&self) -> &'static [OperationKind] {
        &[OperationKind::Reshape]
    }

    fn infer(&self, node: &Node, cx: &InferCx<'_>) -> Result<Vec<ValueType>> {
        let x = cx.input(node, 0)?;
        let rank = x.rank() as i64;
        let value = node.attr_int("axis").unwrap_or(1);
        let split = if value < 0 { value + rank } else { value };
        if !(0..=rank).contains(&split) {
            return Err(shape_error(
                node,
                format!("axis {value} is out of range for rank {rank}"),
            ));
        }
        let split = split as usize;
        let outer = element_count(node, &x.dims[..split])?;
        let inner = element_count(node, &x.dims[split..])?;
        Ok(vec![x.with_dims(vec![outer, inner])])
    }

    fn lower(&self, node: &Node, cx: &mut LowerCx<'_>) -> Result<()> {
        reshape_lowering(node, cx)
    }
}

fn axes_operand(node: &Node, cx: &InferCx<'_>) -> Result<Option<Vec<i64>>> {
    if let Some(tensor) = cx.constant_input(node, 1)? {
        return int_values(node, tensor).map(Some);
    }
    Ok(node.attr_ints("axes").map(<[i64]>::to_vec))
}

pub(crate) struct Squeeze;

impl Translator for Squeeze {
    fn lowered_kinds(&self) -> &'static [OperationKind] {
        &[OperationKind::Reshape]
    }

    fn constant_inputs(&self) -> &'static [usize] {
        &[1]
    }

    fn infer(&self, node: &Node, cx: &InferCx<'_>) -> Result<Vec<ValueType>> {
        let x = cx.input(node, 0)?;
        let squeezed = match axes_operand(node, cx)? {
            Some(values) if !values.is_empty() => {
                let squeezed = axes(node, &values, x.rank())?;
                if let Some(&bad) = squeezed.iter().find(|&&a| x.dims[a] != 1) {
                    return Err(shape_error(
                        node,
                        format!("axis {bad} has extent {}, expected 1", x.dims[bad]),
                    ));
                }
                squeezed
            }
            _ => (0..x.rank()).filter(|&a| x.dims[a] == 1).collect(),
        };
        let dims = x
            .dims
            .iter()
            .enumerate()
            .filter(|(index, _)| !squeezed.contains(index))
            .map(|(_, &dim)| dim)
            .collect();
        Ok(vec![x.with_dims(dims)])
    }

    fn lower(&self, node: &Node, cx: &mut LowerCx<'_>) -> Result<()> {
        reshape_lowering(node, cx)
    }
}

pub(crate) struct Unsqueeze;

impl Translator for Unsqueeze {
    fn lowered_kinds(&self) -> &'static [OperationKind] {
        &[OperationKind::Reshape]
    }

    fn constant_inputs(&self) -> &'static [usize] {
        &[1]
    }

    fn infer(&self, node: &Node, cx: &InferCx<'_>) -> Result<Vec<ValueType>> {
        let x = cx.input(node, 0)?;
        let values = axes_operand(node, cx)?
            .filter(|values| !values.is_empty())
            .ok_or_else(|| shape_error(node, "axes are required"))?;
        let out_rank = x.rank() + values.len();
        let inserted = axes(node, &values, out_rank)?;
        let mut source = x.dims.iter();
        let dims = (0..out_rank)
            .map(|index| {
                if inserted.contains(&index) {
                    1
                } else {
                    source.next().copied().unwrap_or(1)
                }
            })
            .collect();
        Ok(vec![x.with_dims(dims)])
    }

    fn lower(&self, node: &Node, cx: &mut LowerCx<'_>) -> Result<()> {
        reshape_lowering(node, cx)
    }
}

pub(crate) struct Transpose;

fn permutation(node: &Node, rank: usize) -> Result<Vec<usize>> {
    let Some(perm) = node.attr_ints("perm") else {
        return Ok((0..rank).rev().collect());
    };
    let mut seen = vec![false; rank];
    let mut out = Vec::with_capacity(rank);
    for &value in perm {
        let index = usize::try_from(value)
            .ok()
            .filter(|&index| index < rank && !seen[index])
            .ok_or_else(|| {
                shape_error(node, format!("perm {perm:?} is not a permutation of rank {rank}"))
            })?;
        seen[index] = true;
        out.push(index);
    }
    if out.len() != rank {
        return Err(shape_error(
            node,
            format!("perm {perm:?} is not a permutation of rank {rank}"),
        ));
    }
    Ok(out)
}

impl Translator for Transpose {
    fn lowered_kinds(&self) -> &'static [OperationKind] {
        &[OperationKind::Transpose]
    }

    fn infer(&self, node: &Node, cx: &InferCx<'_>) -> Result<Vec<ValueType>> {
        let x = cx.input(node, 0)?;
        let perm = permutation(node, x.rank())?;
        Ok(vec![x.with_dims(perm.iter().map(|&p| x.dims[p]).collect())])
    }

    fn lower(&self, node: &Node, cx: &mut LowerCx<'_>) -> Result<()> {
        let x_ty = cx.input_type(node, 0)?;
        let out_ty = cx.output_type(node, 0)?;
        let dtype = cx.dtype_for(node, out_ty)?;
        let perm = permutation(node, x_ty.rank())?;
        let x = cx.input(node, 0)?;
        let out = cx.emit(
            Operation::Transpose(TransposeSpec { perm }),
            &[x],
            dtype,
            &out_ty.dims,
        );
        cx.bind(node, 0, out);
        Ok(())
    }
}

pub(crate) struct Concat;

impl Translator for Concat {
    fn lowered_kinds(&self) -> &'static [OperationKind] {
        &[OperationKind::Concat]
    }

    fn infer(&self, node: &Node, cx: &InferCx<'_>) -> Result<Vec<ValueType>> {
        let inputs = (0..node.inputs.len())
            .map(|index| cx.input(node, index))
            .collect::<Result<Vec<_>>>()?;
        let elem_type = same_elem_type(node, &inputs)?;
        let first = inputs[0];
        let value = node
            .attr_int("axis")
            .ok_or_else(|| shape_error(node, "axis is required"))?;
        let axis = axis(node, value, first.rank())?;
        let mut dims = first.dims.clone();
        for input in &inputs[1..] {
            let compatible = input.rank() == first.rank()
                && (0..first.rank()).all(|a| a == axis || input.dims[a] == first.dims[a]);
            if !compatible {
                return Err(shape_error(
                    node,
                    format!(
                        "{:?} cannot be concatenated with {:?} on axis {axis}",
                        input.dims, first.dims
                    ),
                ));
            }
            dims[axis] = dims[axis].checked_add(input.dims[axis]).ok_or_else(|| {
                shape_error(node, format!("concatenated extent on axis {axis} overflows"))
            })?;
        }
        Ok(vec![ValueType::new(elem_type, dims)])
    }

    fn lower(&self, node: &Node, cx: &mut LowerCx<'_>) -> Result<()> {
        let out_ty = cx.output_type(node, 0)?;
        let dtype = cx.dtype_for(node, out_ty)?;
        let first = cx.input_type(node, 0)?;
        let value = node.attr_int("axis").unwrap_or(0);
        let axis = axis(node, value, first.rank())?;
        let operands = (0..node.inputs.len())
            .map(|index| cx.input(node, index))
            .collect::<Result<Vec<_>>>()?;
        let out = cx.emit(
            Operation::Concat(ConcatSpec { axis }),
            &operands,
            dtype,
            &out_ty.dims,
        );
        cx.bind(node, 0, out);
        Ok(())
    }
}

/// `Constant`: its value joins the constant table and is lowered on first use.
pub(crate) struct Constant;

/// Value carried by a `Constant` node.
pub(crate) fn constant_value(node: &Node) -> Result<Tensor> {
    let candidates = [
        node.attr_tensor("value").cloned().map(Ok),
        node.attr_float("value_float").map(|v| Ok(Tensor::scalar_f32(v))),
        node.attr_floats("value_floats")
            .map(|v| Tensor::from_f32(&[v.len()], v.to_vec())),
        node.attr_int("value_int")
            .map(|v| Tensor::from_i64(&[], vec![v])),
        node.attr_ints("value_ints")
            .map(|v| Tensor::from_i64(&[v.len()], v.to_vec())),
    ];
    let mut present = candidates.into_iter().flatten();
    match (present.next(), present.next()) {
        (Some(value), None) => value,
        (None, _) => Err(shape_error(node, "no value attribute is set")),
        (Some(_), Some(_)) => Err(shape_error(node, "more than one value attribute is set")),
    }
}

impl Translator for Constant {
    fn lowered_kinds(&self) -> &'static [OperationKind] {
        &[OperationKind::Constant]
    }

    fn infer(&self, node: &Node, _cx: &InferCx<'_>) -> Result<Vec<ValueType>> {
        let value = constant_value(node)?;
        Ok(vec![ValueType::new(value.elem_type(), value.dims().to_vec())])
    }

    fn lower(&self, _node: &Node, _cx: &mut LowerCx<'_>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::graph::OpType;

    fn reshape_node() -> Node {
        Node {
            name: "r".into(),
            op_type: OpType::Reshape,
            domain: String::new(),
            inputs: vec!["x".into(), "s".into()],
            outputs: vec!["y".into()],
            attributes: BTreeMap::new(),
        }
    }

    #[test]
    fn reshape_infers_minus_one() {
        let dims = resolve_reshape(&reshape_node(), &[2, 3, 4], &[6, -1, 2], false).unwrap();
        assert_eq!(dims, vec![6, 2, 2]);
    }

    #[test]
    fn reshape_zero_copies_input_dim() {
        let dims = resolve_reshape(&reshape_node(), &[4, 3, 2], &[4, 0, 2], false).unwrap();
        assert_eq!(dims, vec![4, 3, 2]);
    }

    #[test]
    fn reshape_rejects_bad_targets() {
        let node = reshape_node();
        assert!(resolve_reshape(&node, &[2, 3], &[-1, -1], false).is_err());
        assert!(resolve_reshape(&node, &[2, 3], &[-2, 3], false).is_err());
        assert!(resolve_reshape(&node, &[2, 3], &[4, 2], false).is_err());
    }

    #[test]
    fn allow_zero_keeps_literal_zero() {
        let dims = resolve_reshape(&reshape_node(), &[0, 3], &[0, 3], true).unwrap();
        assert_eq!(dims, vec![0, 3]);
    }

    #[test]
    fn reshape_rejects_overflowing_targets() {
        let node = reshape_node();
        let huge = (1i64 << 61) + 3;
        let err = resolve_reshape(&node, &[2, 3, 4], &[8, huge], false).unwrap_err();
        assert!(matches!(err, crate::error::OnnxXlaError::ShapeInference { .. }));
        assert!(resolve_reshape(&node, &[2, 3, 4], &[-1, 1 << 62, 8], false).is_err());
        assert!(resolve_reshape(&node, &[usize::MAX, 2], &[-1], false).is_err());
    }
}
