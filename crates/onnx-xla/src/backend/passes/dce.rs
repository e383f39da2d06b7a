use std::collections::HashSet;

use crate::backend::ir::{Function, Operand, ValueId};
use crate::backend::optimizer::{FunctionPass, OptimizeContext, PassResult};

use super::util::build_def_map;

/// Removes instructions whose results never reach a function result.
///
/// Parameters are kept even when unused; their slots are bound by callers.
#[derive(Default)]
pub struct DeadCodeEliminationPass;

impl DeadCodeEliminationPass {
    const NAME: &'static str = "dce";
}

impl FunctionPass for DeadCodeEliminationPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, function: &mut Function, _cx: &mut OptimizeContext<'_>) -> PassResult {
        let def_map = build_def_map(function);

        let mut worklist: Vec<ValueId> = function.result_ids.clone();
        let mut live: HashSet<ValueId> = HashSet::new();
        while let Some(value) = worklist.pop() {
            if !live.insert(value) {
                continue;
            }
            let Some(&idx) = def_map.get(&value) else {
                continue;
            };
            for operand in &function.body[idx].operands {
                if let Operand::Value(dep) = operand {
                    worklist.push(*dep);
                }
            }
        }

        let before = function.body.len();
        function.body.retain(|inst| live.contains(&inst.id));
        let removed = before.saturating_sub(function.body.len());

        PassResult {
            changed: removed > 0,
            iterations: 1,
            rewrites_applied: 0,
            erased_insts: removed,
        }
    }
}
