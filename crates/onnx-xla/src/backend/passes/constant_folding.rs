use std::collections::HashMap;

use crate::backend::ir::{Function, Operand, Operation, TensorLiteral, ValueId};
use crate::backend::optimizer::{FunctionPass, OptimizeContext, PassResult};
use crate::backend::registry::BackendHandle;

/// Largest result (in elements) the pass will materialize at compile time.
const DEFAULT_MAX_FOLD_ELEMENTS: usize = 1 << 24;

/// Evaluates instructions whose operands are all constants on the target backend and
/// replaces them with `Constant` instructions. Results larger than their operands
/// combined are left unfolded.
///
/// Folding runs the same kernels the program would run, so results are bit-identical
/// to runtime evaluation on that backend.
pub struct ConstantFoldingPass {
    max_elements: usize,
}

impl Default for ConstantFoldingPass {
    fn default() -> Self {
        Self {
            max_elements: DEFAULT_MAX_FOLD_ELEMENTS,
        }
    }
}

impl ConstantFoldingPass {
    const NAME: &'static str = "constant-folding";

    pub fn with_max_elements(max_elements: usize) -> Self {
        Self { max_elements }
    }
}

impl FunctionPass for ConstantFoldingPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, function: &mut Function, cx: &mut OptimizeContext<'_>) -> PassResult {
        let mut stats = PassResult::default();
        let mut constants: HashMap<ValueId, TensorLiteral> = HashMap::new();

        for idx in 0..function.body.len() {
            stats.iterations += 1;
            let inst = &function.body[idx];
            if let Operation::Constant(literal) = &inst.op {
                constants.insert(inst.id, literal.clone());
                continue;
            }
            if cx.is_failed_fold(inst.id) {
                continue;
            }
            let Some(inputs) = constant_operands(&inst.operands, &constants) else {
                continue;
            };
            let Some(count) = inst.output.element_count() else {
                continue;
            };
            if count > self.max_elements {
                continue;
            }
            // Expanding ops (broadcasts) stay in the program so a small constant is not
            // stored at full size as a weight.
            let operand_count = inputs
                .iter()
                .filter_map(|literal| literal.spec.element_count())
                .fold(0usize, usize::saturating_add);
            if count > operand_count {
                continue;
            }

            match evaluate(cx, inst, inputs) {
                Ok(literal) => {
                    let inst = &mut function.body[idx];
                    tracing::trace!(value = inst.id.0, op = inst.op.label(), "folded constant");
                    inst.op = Operation::Constant(literal.clone());
                    inst.operands.clear();
                    constants.insert(inst.id, literal);
                    stats.changed = true;
                    stats.rewrites_applied += 1;
                }
                Err(message) => {
                    tracing::debug!(value = inst.id.0, %message, "constant folding skipped");
                    let id = inst.id;
                    cx.record_failed_fold(id);
                }
            }
        }

        stats
    }
}

fn constant_operands(
    operands: &[Operand],
    constants: &HashMap<ValueId, TensorLiteral>,
) -> Option<Vec<TensorLiteral>> {
    operands
        .iter()
        .map(|operand| match operand {
            Operand::Value(id) => constants.get(id).cloned(),
            Operand::Literal(literal) => Some(literal.clone()),
        })
        .collect()
}

fn evaluate(
    cx: &OptimizeContext<'_>,
    inst: &crate::backend::ir::Instruction,
    inputs: Vec<TensorLiteral>,
) -> Result<TensorLiteral, String> {
    let backend = cx.backend();
    let handles = inputs
        .into_iter()
        .map(|literal| backend.materialize(literal))
        .collect::<Result<Vec<BackendHandle>, _>>()
        .map_err(|err| err.to_string())?;
    let refs = handles.iter().collect::<Vec<_>>();
    let outputs = backend
        .execute_instruction(inst, &refs)
        .map_err(|err| err.to_string())?;
    let [output] = outputs.as_slice() else {
        return Err(format!("expected one result, got {}", outputs.len()));
    };
    let literal = backend.to_literal(output).map_err(|err| err.to_string())?;
    if literal.spec != inst.output {
        return Err(format!(
            "backend produced {} for an instruction typed {}",
            literal.spec, inst.output
        ));
    }
    Ok(literal)
}
