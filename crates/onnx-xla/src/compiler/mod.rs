//! Graph-to-program compilation: shape inference, lowering, optimization, and
//! assembly of a [`PreparedExecutable`].

mod deadline;
mod lower;
mod shape_inference;
pub(crate) mod translate;

use std::time::Duration;

use crate::backend::ir::{Function, Operation, Program, TensorLiteral};
use crate::backend::legality::check_program_legality;
use crate::backend::optimizer::{optimizer_for_level, OptimizeContext};
use crate::backend::registry::{BackendHandle, ErasedBackend};
use crate::checker::find_incompatibility;
use crate::error::{OnnxXlaError, Result};
use crate::executable::{ExecutableMetadata, PreparedExecutable, TensorSlot};
use crate::graph::Graph;
use crate::options::BackendOptions;

pub use deadline::Deadline;
pub use shape_inference::{infer_shapes, InferredGraph};
pub use translate::ValueType;

/// Compiles `graph` for `backend`.
///
/// The compatibility check is repeated here; a failed compile drops every device
/// handle it allocated.
pub fn compile(
    graph: &Graph,
    backend: Box<dyn ErasedBackend>,
    options: &BackendOptions,
) -> Result<PreparedExecutable> {
    let deadline = Deadline::new(options.timeout());
    let caps = backend.capabilities();

    if let Some(issue) = find_incompatibility(graph, &caps) {
        tracing::debug!(device = backend.backend_name(), %issue, "graph rejected by the checker");
        return Err(issue.into_error());
    }

    let inferred = infer_shapes(graph, &deadline)?;
    deadline.check()?;
    let mut function = lower::lower_graph(graph, &inferred, &deadline)?;
    let lowered_len = function.body.len();

    let optimizer = optimizer_for_level(options.optimization_level);
    let stats = {
        let mut cx = OptimizeContext::new(backend.as_ref(), &deadline);
        optimizer.optimize(&mut function, &mut cx)?
    };

    let weight_literals = hoist_constants(&mut function);
    let program = Program::new(function.name.clone()).with_functions(vec![function]);
    check_program_legality(&program, &caps).map_err(|report| {
        let detail = report
            .diagnostics
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        let op = report
            .diagnostics
            .first()
            .and_then(|diagnostic| diagnostic.kind)
            .map_or_else(|| "program".to_string(), |kind| format!("{kind:?}"));
        OnnxXlaError::unsupported(op, format!("device rejected the lowered program: {detail}"))
    })?;
    deadline.check()?;

    let weights = weight_literals
        .into_iter()
        .map(|literal| backend.materialize(literal))
        .collect::<std::result::Result<Vec<BackendHandle>, _>>()
        .map_err(OnnxXlaError::Execution)?;
    deadline.check()?;

    let metadata = ExecutableMetadata {
        device: options.device.clone(),
        inputs: graph
            .runtime_inputs()
            .map(|input| TensorSlot::from_inferred(&input.name, &inferred))
            .collect::<Result<_>>()?,
        outputs: graph
            .outputs
            .iter()
            .map(|output| TensorSlot::from_inferred(&output.name, &inferred))
            .collect::<Result<_>>()?,
        is_thread_safe: backend.is_thread_safe(),
    };

    tracing::trace!(program = %program, "assembled program");
    tracing::info!(
        graph = %graph.name,
        device = %metadata.device,
        level = %options.optimization_level,
        nodes = graph.node_count(),
        lowered = lowered_len,
        instructions = program.functions[0].body.len(),
        weights = weights.len(),
        rewrites = stats.rewrites_applied,
        elapsed_ms = duration_ms(deadline.elapsed()),
        "compiled graph"
    );

    Ok(PreparedExecutable::new(program, weights, backend, metadata))
}

/// Moves every `Constant` instruction into a trailing parameter and returns the literals
/// in parameter order. Value ids are preserved, so no operand is rewritten.
fn hoist_constants(function: &mut Function) -> Vec<TensorLiteral> {
    let mut literals = Vec::new();
    let mut body = Vec::with_capacity(function.body.len());
    for inst in std::mem::take(&mut function.body) {
        match inst.op {
            Operation::Constant(literal) => {
                function.parameter_ids.push(inst.id);
                function.parameters.push(inst.output);
                literals.push(literal);
            }
            _ => body.push(inst),
        }
    }
    function.body = body;
    literals
}

fn duration_ms(duration: Duration) -> u64 {
    duration.as_millis().try_into().unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ir::{
        DType, ElementwiseBinaryOp, Operand, ProgramBuilder, TensorSpec,
    };

    #[test]
    fn hoisting_appends_constants_after_runtime_parameters() {
        let mut builder = ProgramBuilder::new();
        let spec = TensorSpec::from_dims(DType::F32, &[2]);
        let x = builder.add_parameter(spec.clone());
        let literal = TensorLiteral::from_f32(&[2], vec![1.0, 2.0]).unwrap();
        let c = builder.emit_single(Operation::Constant(literal.clone()), Vec::new(), spec.clone());
        let sum = builder.emit_single(
            Operation::ElementwiseBinary(ElementwiseBinaryOp::Add),
            vec![Operand::Value(x), Operand::Value(c)],
            spec.clone(),
        );
        let mut function = builder.finish("main", vec![sum]).unwrap();

        let weights = hoist_constants(&mut function);

        assert_eq!(weights, vec![literal]);
        assert_eq!(function.parameter_ids, vec![x, c]);
        assert_eq!(function.parameters, vec![spec.clone(), spec]);
        assert_eq!(function.body.len(), 1);
        assert_eq!(function.body[0].id, sum);
    }
}
