use crate::backend::ir::{
    ElementwiseBinaryOp, Function, Instruction, Operand, Operation, ReshapeSpec, TensorSpec,
    ValueId,
};
use crate::backend::optimizer::{FunctionPass, OptimizeContext, PassResult};

use super::util::{build_def_map, use_counts, value_spec};

/// Folds `add(conv(x, w), broadcast(per_channel))` into `conv(x, w, bias)`.
///
/// The conv kernel adds its bias once per output element after accumulation, which
/// is exactly the rounding the separate add performs, so the rewrite is bit-exact.
#[derive(Default)]
pub struct ConvBiasFusionPass;

impl ConvBiasFusionPass {
    const NAME: &'static str = "conv-bias-fusion";
}

struct Candidate {
    add_index: usize,
    conv_index: usize,
    bias_source: ValueId,
    bias_spec: TensorSpec,
    channels: usize,
}

impl FunctionPass for ConvBiasFusionPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, function: &mut Function, _cx: &mut OptimizeContext<'_>) -> PassResult {
        let mut stats = PassResult::default();
        while let Some(candidate) = find_candidate(function) {
            stats.iterations += 1;
            apply(function, candidate);
            stats.changed = true;
            stats.rewrites_applied += 1;
            stats.erased_insts += 1;
        }
        stats
    }
}

fn find_candidate(function: &Function) -> Option<Candidate> {
    let def_map = build_def_map(function);
    let uses = use_counts(function);

    for (add_index, add) in function.body.iter().enumerate() {
        if add.op != Operation::ElementwiseBinary(ElementwiseBinaryOp::Add) {
            continue;
        }
        let [Operand::Value(lhs), Operand::Value(rhs)] = add.operands.as_slice() else {
            continue;
        };
        for (conv_id, other_id) in [(*lhs, *rhs), (*rhs, *lhs)] {
            let Some(&conv_index) = def_map.get(&conv_id) else {
                continue;
            };
            let conv = &function.body[conv_index];
            if !matches!(conv.op, Operation::Conv(_)) || conv.operands.len() != 2 {
                continue;
            }
            if uses.get(&conv_id).copied().unwrap_or(0) != 1 {
                continue;
            }
            let Some(&bcast_index) = def_map.get(&other_id) else {
                continue;
            };
            if let Some((bias_source, bias_spec, channels)) =
                per_channel_source(function, &function.body[bcast_index], conv)
            {
                return Some(Candidate {
                    add_index,
                    conv_index,
                    bias_source,
                    bias_spec,
                    channels,
                });
            }
        }
    }
    None
}

/// Matches `broadcast_to(v)` where `v` varies only along the conv output channel axis.
fn per_channel_source(
    function: &Function,
    bcast: &Instruction,
    conv: &Instruction,
) -> Option<(ValueId, TensorSpec, usize)> {
    let Operation::BroadcastTo(_) = &bcast.op else {
        return None;
    };
    let [Operand::Value(source)] = bcast.operands.as_slice() else {
        return None;
    };
    let out_dims = conv.output.static_dims()?;
    if out_dims.len() < 2 || bcast.output != conv.output {
        return None;
    }
    let channels = out_dims[1];
    let source_spec = value_spec(function, *source)?;
    let src_dims = source_spec.static_dims()?;
    if src_dims.len() > out_dims.len() {
        return None;
    }
    let offset = out_dims.len() - src_dims.len();
    for axis in 0..out_dims.len() {
        let dim = if axis < offset { 1 } else { src_dims[axis - offset] };
        let expected = if axis == 1 { channels } else { 1 };
        if dim != expected {
            return None;
        }
    }
    Some((*source, source_spec, channels))
}

fn apply(function: &mut Function, candidate: Candidate) {
    let Candidate {
        add_index,
        conv_index,
        bias_source,
        bias_spec,
        channels,
    } = candidate;

    let reshape_id = function.next_value_id();
    let reshape = Instruction {
        id: reshape_id,
        op: Operation::Reshape(ReshapeSpec {
            new_shape: vec![channels],
        }),
        operands: vec![Operand::Value(bias_source)],
        output: TensorSpec::from_dims(bias_spec.dtype, &[channels]),
    };

    let conv = &function.body[conv_index];
    let mut operands = conv.operands.clone();
    operands.push(Operand::Value(reshape_id));
    let fused = Instruction {
        id: function.body[add_index].id,
        op: conv.op.clone(),
        operands,
        output: function.body[add_index].output.clone(),
    };

    function.body[add_index] = fused;
    function.body.insert(add_index, reshape);
    function.body.remove(conv_index);
}
