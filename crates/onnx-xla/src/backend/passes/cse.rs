use std::collections::{HashMap, HashSet};

use crate::backend::ir::{Function, Operand, ValueId};
use crate::backend::optimizer::{FunctionPass, OptimizeContext, PassResult};

use super::util::replace_all_uses;

/// Common-subexpression elimination.
///
/// Every lowered operation is pure, so instructions with identical
/// `(op, operands, output)` are merged into the first occurrence.
#[derive(Default)]
pub struct CommonSubexpressionEliminationPass;

impl CommonSubexpressionEliminationPass {
    const NAME: &'static str = "cse";
}

impl FunctionPass for CommonSubexpressionEliminationPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, function: &mut Function, _cx: &mut OptimizeContext<'_>) -> PassResult {
        let mut seen: HashMap<Vec<u8>, ValueId> = HashMap::new();
        let mut replacements: HashMap<ValueId, ValueId> = HashMap::new();
        let mut stats = PassResult::default();

        for idx in 0..function.body.len() {
            stats.iterations += 1;
            // Earlier merges must be visible before keying this instruction.
            for operand in &mut function.body[idx].operands {
                if let Operand::Value(id) = operand {
                    if let Some(to) = replacements.get(id) {
                        *id = *to;
                    }
                }
            }
            let inst = &function.body[idx];
            let key = match serde_json::to_vec(&(&inst.op, &inst.operands, &inst.output)) {
                Ok(bytes) => bytes,
                Err(_) => continue,
            };
            match seen.get(&key) {
                Some(existing) => {
                    replacements.insert(inst.id, *existing);
                }
                None => {
                    seen.insert(key, inst.id);
                }
            }
        }

        if replacements.is_empty() {
            return stats;
        }

        let erased: HashSet<ValueId> = replacements.keys().copied().collect();
        for (from, to) in &replacements {
            replace_all_uses(function, *from, *to);
        }
        function.body.retain(|inst| !erased.contains(&inst.id));

        stats.changed = true;
        stats.rewrites_applied = replacements.len();
        stats.erased_insts = replacements.len();
        stats
    }
}
