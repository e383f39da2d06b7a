//! Runtime backend registry for device selection by name.
//!
//! Device backends register a constructor under a device id (e.g. `"CPU"`) from any
//! crate. The facade snapshots this registry once when it is constructed.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock, RwLock};

use super::ir::{BackendError, BackendResult, Instruction, PortableBackend, Program, TensorLiteral};
use super::legality::DeviceCapabilities;

/// Type-erased tensor handle that is downcast to the concrete backend handle type.
pub type BackendHandle = Box<dyn Any + Send + Sync>;

/// Factory function that creates a new backend instance.
pub type BackendConstructor = Box<dyn Fn() -> Box<dyn ErasedBackend> + Send + Sync>;

/// Object-safe view of a [`PortableBackend`].
///
/// Every method works with type-erased handles that get downcast internally.
pub trait ErasedBackend: Send + Sync {
    fn backend_name(&self) -> &str;

    fn device_description(&self) -> String;

    fn capabilities(&self) -> DeviceCapabilities;

    fn is_thread_safe(&self) -> bool;

    fn materialize(&self, literal: TensorLiteral) -> BackendResult<BackendHandle>;

    fn to_literal(&self, handle: &BackendHandle) -> BackendResult<TensorLiteral>;

    fn execute_instruction(
        &self,
        instruction: &Instruction,
        inputs: &[&BackendHandle],
    ) -> BackendResult<Vec<BackendHandle>>;

    fn run_program(
        &self,
        program: &Program,
        entry_inputs: &[&BackendHandle],
    ) -> BackendResult<Vec<BackendHandle>>;

    fn clone_backend(&self) -> Box<dyn ErasedBackend>;

    fn as_any(&self) -> &dyn Any;
}

/// Wrapper that implements [`ErasedBackend`] for any concrete [`PortableBackend`].
struct BackendWrapper<B: PortableBackend> {
    inner: Arc<B>,
}

impl<B: PortableBackend> BackendWrapper<B> {
    fn new(backend: B) -> Self {
        Self {
            inner: Arc::new(backend),
        }
    }

    fn backend(&self) -> &Arc<B> {
        &self.inner
    }

    fn downcast_all(&self, handles: &[&BackendHandle]) -> BackendResult<Vec<B::TensorHandle>> {
        handles
            .iter()
            .map(|handle| {
                handle
                    .downcast_ref::<B::TensorHandle>()
                    .cloned()
                    .ok_or_else(|| {
                        BackendError::execution(format!(
                            "input handle type mismatch for backend {}",
                            self.inner.backend_name()
                        ))
                    })
            })
            .collect()
    }
}

fn erase_all<H: Send + Sync + 'static>(handles: Vec<H>) -> Vec<BackendHandle> {
    handles
        .into_iter()
        .map(|h| Box::new(h) as BackendHandle)
        .collect()
}

impl<B: PortableBackend + 'static> ErasedBackend for BackendWrapper<B> {
    fn backend_name(&self) -> &str {
        self.inner.backend_name()
    }

    fn device_description(&self) -> String {
        self.inner.device_description()
    }

    fn capabilities(&self) -> DeviceCapabilities {
        self.inner.capabilities()
    }

    fn is_thread_safe(&self) -> bool {
        self.inner.is_thread_safe()
    }

    fn materialize(&self, literal: TensorLiteral) -> BackendResult<BackendHandle> {
        let handle = self.inner.materialize(literal)?;
        Ok(Box::new(handle) as BackendHandle)
    }

    fn to_literal(&self, handle: &BackendHandle) -> BackendResult<TensorLiteral> {
        let typed_handle = handle.downcast_ref::<B::TensorHandle>().ok_or_else(|| {
            BackendError::execution(format!(
                "handle type mismatch for backend {}",
                self.backend_name()
            ))
        })?;
        self.inner.to_literal(typed_handle)
    }

    fn execute_instruction(
        &self,
        instruction: &Instruction,
        inputs: &[&BackendHandle],
    ) -> BackendResult<Vec<BackendHandle>> {
        let typed_inputs = self.downcast_all(inputs)?;
        let outputs = self.inner.execute_instruction(instruction, &typed_inputs)?;
        Ok(erase_all(outputs))
    }

    fn run_program(
        &self,
        program: &Program,
        entry_inputs: &[&BackendHandle],
    ) -> BackendResult<Vec<BackendHandle>> {
        let typed_inputs = self.downcast_all(entry_inputs)?;
        let outputs = self.inner.run_program(program, &typed_inputs)?;
        Ok(erase_all(outputs))
    }

    fn clone_backend(&self) -> Box<dyn ErasedBackend> {
        Box::new(BackendWrapper {
            inner: Arc::clone(&self.inner),
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Global registry mapping device ids to constructors.
///
/// Ids are unique ignoring ASCII case; re-registering an id replaces the constructor.
struct BackendRegistry {
    backends: RwLock<BTreeMap<String, (String, BackendConstructor)>>,
}

impl BackendRegistry {
    fn new() -> Self {
        Self {
            backends: RwLock::new(BTreeMap::new()),
        }
    }

    fn register(&self, name: String, constructor: BackendConstructor) {
        let key = name.to_ascii_uppercase();
        let mut backends = self
            .backends
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        backends.insert(key, (name, constructor));
    }

    fn create(&self, name: &str) -> Option<Box<dyn ErasedBackend>> {
        let registry = self
            .backends
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let (_, constructor) = registry.get(&name.to_ascii_uppercase())?;
        Some(constructor())
    }

    fn list_backends(&self) -> Vec<String> {
        self.backends
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn has_backend(&self, name: &str) -> bool {
        self.backends
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(&name.to_ascii_uppercase())
    }
}

static GLOBAL_REGISTRY: OnceLock<BackendRegistry> = OnceLock::new();

fn global_registry() -> &'static BackendRegistry {
    GLOBAL_REGISTRY.get_or_init(BackendRegistry::new)
}

/// Register a device backend under `name` with a constructor function.
///
/// # Example
/// ```ignore
/// use onnx_xla::backend::registry::register_backend;
///
/// pub fn register() {
///     register_backend("NPU", || Box::new(MyBackendWrapper::new(MyBackend::create())));
/// }
/// ```
pub fn register_backend<F>(name: impl Into<String>, constructor: F)
where
    F: Fn() -> Box<dyn ErasedBackend> + Send + Sync + 'static,
{
    let name = name.into();
    tracing::debug!(device = %name, "registering device backend");
    global_registry().register(name, Box::new(constructor));
}

/// Register a concrete [`PortableBackend`] implementation.
pub fn register_portable_backend<B, F>(name: impl Into<String>, constructor: F)
where
    B: PortableBackend + 'static,
    F: Fn() -> B + Send + Sync + 'static,
{
    register_backend(name, move || Box::new(BackendWrapper::new(constructor())));
}

/// Create a backend instance by device id (ASCII case-insensitive).
pub fn create_backend(name: &str) -> Option<Box<dyn ErasedBackend>> {
    global_registry().create(name)
}

/// Registered device ids, sorted.
pub fn list_backends() -> Vec<String> {
    global_registry().list_backends()
}

pub fn has_backend(name: &str) -> bool {
    global_registry().has_backend(name)
}

/// Recovers the typed backend behind an erased one.
pub fn get_typed_backend<B: PortableBackend + 'static>(
    backend: &dyn ErasedBackend,
) -> Option<Arc<B>> {
    backend
        .as_any()
        .downcast_ref::<BackendWrapper<B>>()
        .map(|wrapper| Arc::clone(wrapper.backend()))
}
