use std::collections::HashMap;

use crate::backend::ir::{Function, Operand, TensorSpec, ValueId};

/// Maps each instruction result to its index in `function.body`.
pub(super) fn build_def_map(function: &Function) -> HashMap<ValueId, usize> {
    function
        .body
        .iter()
        .enumerate()
        .map(|(idx, inst)| (inst.id, idx))
        .collect()
}

/// Counts operand references plus function results per value.
pub(super) fn use_counts(function: &Function) -> HashMap<ValueId, usize> {
    let mut counts: HashMap<ValueId, usize> = HashMap::new();
    for inst in &function.body {
        for operand in &inst.operands {
            if let Operand::Value(id) = operand {
                *counts.entry(*id).or_default() += 1;
            }
        }
    }
    for id in &function.result_ids {
        *counts.entry(*id).or_default() += 1;
    }
    counts
}

/// Rewrites every operand and result that names `from` to name `to`.
pub(super) fn replace_all_uses(function: &mut Function, from: ValueId, to: ValueId) {
    if from == to {
        return;
    }
    for inst in &mut function.body {
        for operand in &mut inst.operands {
            if let Operand::Value(id) = operand {
                if *id == from {
                    *id = to;
                }
            }
        }
    }
    for id in &mut function.result_ids {
        if *id == from {
            *id = to;
        }
    }
}

/// Type of a parameter or instruction result.
pub(super) fn value_spec(function: &Function, id: ValueId) -> Option<TensorSpec> {
    if let Some(pos) = function.parameter_ids.iter().position(|param| *param == id) {
        return function.parameters.get(pos).cloned();
    }
    function
        .body
        .iter()
        .find(|inst| inst.id == id)
        .map(|inst| inst.output.clone())
}
