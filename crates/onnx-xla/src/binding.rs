//! Named input/output binding and fenced asynchronous runs.
//!
//! A [`GraphIo`] matches caller tensors to an executable's inputs by name and checks the
//! caller's output descriptors once, then keeps the inputs resident on the device so
//! the same binding can be run any number of times.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::backend::ir::BackendError;
use crate::backend::registry::BackendHandle;
use crate::engine;
use crate::error::{OnnxXlaError, Result};
use crate::event::Event;
use crate::executable::{ExecutableHandle, TensorSlot};
use crate::tensor::Tensor;

/// Inputs uploaded for one executable plus the output layout the caller expects.
#[derive(Debug)]
pub struct GraphIo {
    executable: ExecutableHandle,
    inputs: Vec<BackendHandle>,
    outputs: Vec<TensorSlot>,
    /// For each bound output, its index in the executable's output list.
    output_order: Vec<usize>,
}

impl GraphIo {
    /// Binds `inputs` and `outputs` by name, in any order.
    ///
    /// Every executable input and output must be named exactly once, with the element
    /// type and shape the executable was compiled for.
    pub fn bind(
        executable: &ExecutableHandle,
        inputs: Vec<(String, Tensor)>,
        outputs: &[TensorSlot],
    ) -> Result<Self> {
        let ordered = order_inputs(executable.inputs(), inputs)?;
        let output_order = order_outputs(executable.outputs(), outputs)?;
        let inputs = engine::materialize_inputs(executable, &ordered)?;
        tracing::debug!(
            device = %executable.device(),
            inputs = inputs.len(),
            outputs = outputs.len(),
            "bound graph io"
        );
        Ok(Self {
            executable: Arc::clone(executable),
            inputs,
            outputs: outputs.to_vec(),
            output_order,
        })
    }

    pub fn executable(&self) -> &ExecutableHandle {
        &self.executable
    }

    /// Output descriptors in the order results are returned.
    pub fn outputs(&self) -> &[TensorSlot] {
        &self.outputs
    }

    /// Runs on the bound inputs, returning outputs in bound-descriptor order.
    pub fn run(&self) -> Result<Vec<Tensor>> {
        let mut results = engine::run_materialized(&self.executable, &self.inputs)?
            .into_iter()
            .map(Some)
            .collect::<Vec<_>>();
        self.output_order
            .iter()
            .map(|&index| {
                results.get_mut(index).and_then(Option::take).ok_or_else(|| {
                    OnnxXlaError::Execution(BackendError::execution(format!(
                        "output #{index} is missing from the device results"
                    )))
                })
            })
            .collect()
    }
}

/// Handle to a run started by [`run_fenced`].
pub struct PendingRun {
    output: Event,
    handle: JoinHandle<Result<Vec<Tensor>>>,
}

impl PendingRun {
    /// Signalled once the run has finished, whether or not it succeeded.
    pub fn output_event(&self) -> &Event {
        &self.output
    }

    /// Blocks until the run finishes and returns its outputs.
    pub fn wait(self) -> Result<Vec<Tensor>> {
        self.handle.join().map_err(|_| {
            OnnxXlaError::Execution(BackendError::execution("run thread panicked"))
        })?
    }
}

/// Runs `io` on a worker thread once `input` is signalled.
///
/// The returned output event is signalled after the run completes. A failed run still
/// signals it; the error is reported by [`PendingRun::wait`].
pub fn run_fenced(io: Arc<GraphIo>, input: Event) -> Result<PendingRun> {
    let output = Event::new();
    let signal = output.clone();
    let handle = thread::Builder::new()
        .name("onnx-xla-run".to_string())
        .spawn(move || {
            input.wait();
            let result = io.run();
            if let Err(err) = &result {
                tracing::debug!(error = %err, "fenced run failed");
            }
            signal.signal()?;
            result
        })
        .map_err(|err| {
            OnnxXlaError::Execution(BackendError::execution(format!(
                "failed to spawn run thread: {err}"
            )))
        })?;
    Ok(PendingRun { output, handle })
}

fn order_inputs(slots: &[TensorSlot], inputs: Vec<(String, Tensor)>) -> Result<Vec<Tensor>> {
    if inputs.len() != slots.len() {
        return Err(OnnxXlaError::InputMismatch(format!(
            "expected {} inputs, got {}",
            slots.len(),
            inputs.len()
        )));
    }
    let mut by_name = HashMap::with_capacity(inputs.len());
    for (name, tensor) in inputs {
        if by_name.insert(name.clone(), tensor).is_some() {
            return Err(OnnxXlaError::InvalidArgument(format!(
                "input `{name}` is bound twice"
            )));
        }
    }
    slots
        .iter()
        .map(|slot| {
            by_name.remove(&slot.name).ok_or_else(|| {
                OnnxXlaError::InvalidArgument(format!("input `{}` is not bound", slot.name))
            })
        })
        .collect()
}

fn order_outputs(slots: &[TensorSlot], outputs: &[TensorSlot]) -> Result<Vec<usize>> {
    if outputs.len() != slots.len() {
        return Err(OnnxXlaError::InvalidArgument(format!(
            "expected {} outputs, got {}",
            slots.len(),
            outputs.len()
        )));
    }
    let mut seen = vec![false; slots.len()];
    outputs
        .iter()
        .map(|bound| {
            let index = slots
                .iter()
                .position(|slot| slot.name == bound.name)
                .ok_or_else(|| {
                    OnnxXlaError::InvalidArgument(format!("no output named `{}`", bound.name))
                })?;
            if std::mem::replace(&mut seen[index], true) {
                return Err(OnnxXlaError::InvalidArgument(format!(
                    "output `{}` is bound twice",
                    bound.name
                )));
            }
            if bound.desc != slots[index].desc {
                return Err(OnnxXlaError::InvalidArgument(format!(
                    "output `{}` is {}, bound as {}",
                    bound.name, slots[index].desc, bound.desc
                )));
            }
            Ok(index)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{ElemType, TensorDesc};

    fn slot(name: &str, dims: &[usize]) -> TensorSlot {
        TensorSlot {
            name: name.into(),
            desc: TensorDesc::from_dims(ElemType::Float, dims),
        }
    }

    #[test]
    fn inputs_are_reordered_by_name() {
        let slots = [slot("a", &[1]), slot("b", &[2])];
        let a = Tensor::from_f32(&[1], vec![1.0]).unwrap();
        let b = Tensor::from_f32(&[2], vec![2.0, 3.0]).unwrap();
        let ordered =
            order_inputs(&slots, vec![("b".into(), b.clone()), ("a".into(), a.clone())]).unwrap();
        assert_eq!(ordered, vec![a.clone(), b]);

        let err = order_inputs(&slots, vec![("a".into(), a.clone()), ("a".into(), a)]).unwrap_err();
        assert!(matches!(err, OnnxXlaError::InvalidArgument(ref msg) if msg.contains("twice")));
    }

    #[test]
    fn output_descriptors_must_match() {
        let slots = [slot("y", &[2, 3]), slot("z", &[1])];
        let order = order_outputs(&slots, &[slot("z", &[1]), slot("y", &[2, 3])]).unwrap();
        assert_eq!(order, vec![1, 0]);

        assert!(order_outputs(&slots, &[slot("y", &[3, 2]), slot("z", &[1])]).is_err());
        assert!(order_outputs(&slots, &[slot("y", &[2, 3]), slot("w", &[1])]).is_err());
        assert!(order_outputs(&slots, &[slot("y", &[2, 3]), slot("y", &[2, 3])]).is_err());
        assert!(order_outputs(&slots, &[slot("y", &[2, 3])]).is_err());
    }
}
