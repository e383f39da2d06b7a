//! Binds caller tensors to a prepared executable and runs it on its device.

use std::sync::{MutexGuard, PoisonError};

use crate::backend::ir::BackendError;
use crate::backend::registry::BackendHandle;
use crate::error::{OnnxXlaError, Result};
use crate::executable::{PreparedExecutable, TensorSlot};
use crate::tensor::Tensor;

/// Runs `executable` on `inputs`, given in the order of its input metadata.
///
/// Inputs are validated before anything reaches the device. Runs of executables that
/// are not thread-safe are serialized. Every call returns freshly converted outputs.
pub fn run(executable: &PreparedExecutable, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
    let input_handles = materialize_inputs(executable, inputs)?;
    run_materialized(executable, &input_handles)
}

/// Validates `inputs` and uploads them to the executable's device.
pub(crate) fn materialize_inputs(
    executable: &PreparedExecutable,
    inputs: &[Tensor],
) -> Result<Vec<BackendHandle>> {
    validate_inputs(&executable.metadata.inputs, inputs)?;
    let _guard = serialize(executable);
    let backend = executable.backend.as_ref();
    inputs
        .iter()
        .map(|tensor| {
            let literal = tensor.to_literal()?;
            backend.materialize(literal).map_err(OnnxXlaError::Execution)
        })
        .collect()
}

/// Runs on inputs already resident on the device. The handles are only borrowed, so
/// the same inputs may be run again.
pub(crate) fn run_materialized(
    executable: &PreparedExecutable,
    input_handles: &[BackendHandle],
) -> Result<Vec<Tensor>> {
    let _guard = serialize(executable);
    let backend = executable.backend.as_ref();
    let parameters = input_handles
        .iter()
        .chain(executable.weights.iter())
        .collect::<Vec<_>>();

    tracing::trace!(
        device = %executable.metadata.device,
        inputs = input_handles.len(),
        weights = executable.weights.len(),
        "running executable"
    );
    let results = backend
        .run_program(&executable.program, &parameters)
        .map_err(OnnxXlaError::Execution)?;

    let expected = &executable.metadata.outputs;
    if results.len() != expected.len() {
        return Err(OnnxXlaError::Execution(BackendError::execution(format!(
            "device returned {} outputs, expected {}",
            results.len(),
            expected.len()
        ))));
    }
    results
        .iter()
        .zip(expected)
        .map(|(handle, slot)| {
            let literal = backend.to_literal(handle).map_err(OnnxXlaError::Execution)?;
            let tensor = Tensor::from_literal(&literal)?;
            if tensor.desc() != slot.desc {
                return Err(OnnxXlaError::Execution(BackendError::execution(format!(
                    "output `{}` came back as {}, expected {}",
                    slot.name,
                    tensor.desc(),
                    slot.desc
                ))));
            }
            Ok(tensor)
        })
        .collect()
}

fn serialize(executable: &PreparedExecutable) -> Option<MutexGuard<'_, ()>> {
    executable
        .run_lock
        .as_ref()
        .map(|lock| lock.lock().unwrap_or_else(PoisonError::into_inner))
}

/// Checks count, element type, and shape of every input against the executable's slots.
pub fn validate_inputs(slots: &[TensorSlot], inputs: &[Tensor]) -> Result<()> {
    if inputs.len() != slots.len() {
        return Err(OnnxXlaError::InputMismatch(format!(
            "expected {} inputs, got {}",
            slots.len(),
            inputs.len()
        )));
    }
    for (index, (slot, tensor)) in slots.iter().zip(inputs).enumerate() {
        if tensor.elem_type() != slot.desc.elem_type {
            return Err(OnnxXlaError::InputMismatch(format!(
                "input #{index} `{}` expects {}, got {}",
                slot.name,
                slot.desc.elem_type,
                tensor.elem_type()
            )));
        }
        if slot.desc.static_dims().as_deref() != Some(tensor.dims()) {
            return Err(OnnxXlaError::InputMismatch(format!(
                "input #{index} `{}` expects shape [{}], got {:?}",
                slot.name,
                slot.desc.shape,
                tensor.dims()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{ElemType, TensorDesc};

    fn slots() -> Vec<TensorSlot> {
        vec![TensorSlot {
            name: "x".into(),
            desc: TensorDesc::from_dims(ElemType::Float, &[2, 2]),
        }]
    }

    #[test]
    fn accepts_matching_inputs() {
        let x = Tensor::from_f32(&[2, 2], vec![0.0; 4]).unwrap();
        assert!(validate_inputs(&slots(), &[x]).is_ok());
    }

    #[test]
    fn rejects_wrong_count_type_and_shape() {
        let err = validate_inputs(&slots(), &[]).unwrap_err();
        assert!(matches!(err, OnnxXlaError::InputMismatch(_)));

        let ints = Tensor::from_i64(&[2, 2], vec![0; 4]).unwrap();
        let err = validate_inputs(&slots(), &[ints]).unwrap_err();
        assert!(matches!(err, OnnxXlaError::InputMismatch(ref msg) if msg.contains("int64")));

        let wide = Tensor::from_f32(&[1, 4], vec![0.0; 4]).unwrap();
        let err = validate_inputs(&slots(), &[wide]).unwrap_err();
        assert!(matches!(err, OnnxXlaError::InputMismatch(ref msg) if msg.contains("shape")));
    }
}
