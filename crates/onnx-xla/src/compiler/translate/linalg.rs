use crate::backend::ir::{DotGeneralSpec, ElementwiseBinaryOp, Operation};
use crate::backend::legality::OperationKind;
use crate::backend::shape_helpers::is_broadcastable_to;
use crate::compiler::lower::LowerCx;
use crate::error::Result;
use crate::graph::Node;

use super::{same_elem_type, shape_error, InferCx, Translator, ValueType};

/// `alpha * op(A) . op(B) + beta * C`.
pub(crate) struct Gemm;

struct GemmAttrs {
    alpha: f32,
    beta: f32,
    trans_a: bool,
    trans_b: bool,
}

impl GemmAttrs {
    fn from_node(node: &Node) -> Self {
        Self {
            alpha: node.attr_float("alpha").unwrap_or(1.0),
            beta: node.attr_float("beta").unwrap_or(1.0),
            trans_a: node.attr_int("transA").unwrap_or(0) != 0,
            trans_b: node.attr_int("transB").unwrap_or(0) != 0,
        }
    }
}

impl Translator for Gemm {
    fn lowered_kinds(&self) -> &'static [OperationKind] {
        &[
            OperationKind::DotGeneral,
            OperationKind::Constant,
            OperationKind::BroadcastTo,
            OperationKind::ElementwiseBinary,
        ]
    }

    fn float_only(&self) -> bool {
        true
    }

    fn infer(&self, node: &Node, cx: &InferCx<'_>) -> Result<Vec<ValueType>> {
        let attrs = GemmAttrs::from_node(node);
        let (a, b) = (cx.input(node, 0)?, cx.input(node, 1)?);
        if a.rank() != 2 || b.rank() != 2 {
            return Err(shape_error(
                node,
                format!("operands must be rank 2, got {:?} and {:?}", a.dims, b.dims),
            ));
        }
        let (m, k_a) = if attrs.trans_a {
            (a.dims[1], a.dims[0])
        } else {
            (a.dims[0], a.dims[1])
        };
        let (k_b, n) = if attrs.trans_b {
            (b.dims[1], b.dims[0])
        } else {
            (b.dims[0], b.dims[1])
        };
        if k_a != k_b {
            return Err(shape_error(
                node,
                format!("inner dimensions differ: {k_a} vs {k_b}"),
            ));
        }
        let mut operands = vec![a, b];
        if let Some(c) = cx.optional_input(node, 2) {
            if !is_broadcastable_to(&c.dims, &[m, n]) {
                return Err(shape_error(
                    node,
                    format!("C of shape {:?} does not broadcast to [{m}, {n}]", c.dims),
                ));
            }
            operands.push(c);
        }
        let elem_type = same_elem_type(node, &operands)?;
        Ok(vec![ValueType::new(elem_type, vec![m, n])])
    }

    fn lower(&self, node: &Node, cx: &mut LowerCx<'_>) -> Result<()> {
        let attrs = GemmAttrs::from_node(node);
        let out_ty = cx.output_type(node, 0)?;
        let dtype = cx.dtype_for(node, out_ty)?;
        let a = cx.input(node, 0)?;
        let b = cx.input(node, 1)?;
        let spec = DotGeneralSpec {
            batch_lhs: Vec::new(),
            batch_rhs: Vec::new(),
            contract_lhs: vec![if attrs.trans_a { 0 } else { 1 }],
            contract_rhs: vec![if attrs.trans_b { 1 } else { 0 }],
        };
        let mut out = cx.emit(Operation::DotGeneral(spec), &[a, b], dtype, &out_ty.dims);
        if attrs.alpha != 1.0 {
            let alpha = cx.splat(dtype, attrs.alpha as f64, &out_ty.dims);
            out = cx.binary(ElementwiseBinaryOp::Mul, out, alpha)?;
        }
        if let Some(mut c) = cx.optional_input(node, 2)? {
            if attrs.beta != 1.0 {
                let c_dims = cx.dims(c);
                let beta = cx.splat(dtype, attrs.beta as f64, &c_dims);
                c = cx.binary(ElementwiseBinaryOp::Mul, c, beta)?;
            }
            out = cx.binary(ElementwiseBinaryOp::Add, out, c)?;
        }
        cx.bind(node, 0, out);
        Ok(())
    }
}

/// Matrix product over the two trailing axes.
///
/// Equal-rank operands share their leading batch axes; a rank-2 right operand is
/// applied to every leading row of the left one.
pub(crate) struct MatMul;

fn matmul_spec(node: &Node, lhs: &[usize], rhs: &[usize]) -> Result<(DotGeneralSpec, Vec<usize>)> {
    let (lr, rr) = (lhs.len(), rhs.len());
    if lr < 2 || rr < 2 {
        return Err(shape_error(
            node,
            format!("operands must have rank >= 2, got {lhs:?} and {rhs:?}"),
        ));
    }
    if lhs[lr - 1] != rhs[rr - 2] {
        return Err(shape_error(
            node,
            format!("inner dimensions differ: {lhs:?} x {rhs:?}"),
        ));
    }
    if lr == rr {
        if lhs[..lr - 2] != rhs[..rr - 2] {
            return Err(shape_error(
                node,
                format!("batch dimensions differ: {lhs:?} x {rhs:?}"),
            ));
        }
        let batch = (0..lr - 2).collect::<Vec<_>>();
        let mut out = lhs[..lr - 1].to_vec();
        out.push(rhs[rr - 1]);
        let spec = DotGeneralSpec {
            batch_lhs: batch.clone(),
            batch_rhs: batch,
            contract_lhs: vec![lr - 1],
            contract_rhs: vec![rr - 2],
        };
        return Ok((spec, out));
    }
    if rr == 2 {
        let mut out = lhs[..lr - 1].to_vec();
        out.push(rhs[1]);
        let spec = DotGeneralSpec {
            batch_lhs: Vec::new(),
            batch_rhs: Vec::new(),
            contract_lhs: vec![lr - 1],
            contract_rhs: vec![0],
        };
        return Ok((spec, out));
    }
    Err(shape_error(
        node,
        format!("cannot multiply rank {lr} by rank {rr}"),
    ))
}

impl Translator for MatMul {
    fn lowered_kinds(&self) -> &'static [OperationKind] {
        &[OperationKind::DotGeneral]
    }

    fn infer(&self, node: &Node, cx: &InferCx<'_>) -> Result<Vec<ValueType>> {
        let (a, b) = (cx.input(node, 0)?, cx.input(node, 1)?);
        let elem_type = same_elem_type(node, &[a, b])?;
        let (_, dims) = matmul_spec(node, &a.dims, &b.dims)?;
        Ok(vec![ValueType::new(elem_type, dims)])
    }

    fn lower(&self, node: &Node, cx: &mut LowerCx<'_>) -> Result<()> {
        let a = cx.input(node, 0)?;
        let b = cx.input(node, 1)?;
        let (spec, dims) = matmul_spec(node, &cx.dims(a), &cx.dims(b))?;
        let dtype = cx.dtype_of(a);
        let out = cx.emit(Operation::DotGeneral(spec), &[a, b], dtype, &dims);
        cx.bind(node, 0, out);
        Ok(())
    }
}
