//! Compiled, device-resident executables.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::backend::ir::Program;
use crate::backend::registry::{BackendHandle, ErasedBackend};
use crate::compiler::InferredGraph;
use crate::error::{OnnxXlaError, Result};
use crate::tensor::{Tensor, TensorDesc};

/// Shared handle returned by `prepare`.
pub type ExecutableHandle = Arc<PreparedExecutable>;

/// Name and static descriptor of one executable input or output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorSlot {
    pub name: String,
    pub desc: TensorDesc,
}

impl TensorSlot {
    pub(crate) fn from_inferred(name: &str, inferred: &InferredGraph) -> Result<Self> {
        let ty = inferred
            .type_of(name)
            .ok_or_else(|| OnnxXlaError::shape(name, "tensor has no inferred type"))?;
        Ok(Self {
            name: name.to_string(),
            desc: ty.desc(),
        })
    }
}

impl fmt::Display for TensorSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.desc)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutableMetadata {
    /// Id of the device the executable was compiled for.
    pub device: String,
    /// Runtime inputs in binding order; initializers are not listed.
    pub inputs: Vec<TensorSlot>,
    pub outputs: Vec<TensorSlot>,
    /// When false, concurrent runs are serialized internally.
    pub is_thread_safe: bool,
}

/// Immutable compiled program plus the weights it owns on its device.
///
/// Weights are dropped together with the executable.
pub struct PreparedExecutable {
    pub(crate) program: Program,
    pub(crate) weights: Vec<BackendHandle>,
    pub(crate) backend: Box<dyn ErasedBackend>,
    pub(crate) metadata: ExecutableMetadata,
    pub(crate) run_lock: Option<Mutex<()>>,
}

impl PreparedExecutable {
    pub(crate) fn new(
        program: Program,
        weights: Vec<BackendHandle>,
        backend: Box<dyn ErasedBackend>,
        metadata: ExecutableMetadata,
    ) -> Self {
        let run_lock = (!metadata.is_thread_safe).then(|| Mutex::new(()));
        Self {
            program,
            weights,
            backend,
            metadata,
            run_lock,
        }
    }

    pub fn metadata(&self) -> &ExecutableMetadata {
        &self.metadata
    }

    pub fn device(&self) -> &str {
        &self.metadata.device
    }

    pub fn inputs(&self) -> &[TensorSlot] {
        &self.metadata.inputs
    }

    pub fn outputs(&self) -> &[TensorSlot] {
        &self.metadata.outputs
    }

    pub fn is_thread_safe(&self) -> bool {
        self.metadata.is_thread_safe
    }

    /// The lowered program, with constants hoisted into trailing parameters.
    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn weight_count(&self) -> usize {
        self.weights.len()
    }

    /// Runs the executable once. See [`crate::engine::run`].
    pub fn run(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        crate::engine::run(self, inputs)
    }
}

impl fmt::Debug for PreparedExecutable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedExecutable")
            .field("device", &self.metadata.device)
            .field("inputs", &self.metadata.inputs)
            .field("outputs", &self.metadata.outputs)
            .field("weights", &self.weights.len())
            .finish()
    }
}
