//! ONNXIFI-style facade: compatibility queries, prepare, and run over serialized models.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};

use lru::LruCache;

use crate::backend::hashing::{fnv1a_bytes, fnv1a_hash};
use crate::binding::{self, GraphIo, PendingRun};
use crate::checker;
use crate::compiler;
use crate::device::{DeviceInfo, DeviceRegistry};
use crate::error::{OnnxXlaError, Result};
use crate::event::Event;
use crate::executable::{ExecutableHandle, TensorSlot};
use crate::graph::{self, Graph};
use crate::options::BackendOptions;
use crate::tensor::Tensor;

pub const BACKEND_NAME: &str = "onnx-xla";
pub const BACKEND_VENDOR: &str = "onnx-xla contributors";
pub const BACKEND_VERSION: &str = "1.0.0";

/// Static description of the facade as seen through one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendInfo {
    pub name: String,
    pub vendor: String,
    pub version: String,
    pub device: String,
    pub device_description: String,
    /// Largest graph, in nodes, the device accepts; `None` when unbounded.
    pub max_graph_size: Option<usize>,
    /// Prepared executables that may coexist; `usize::MAX` means no limit.
    pub max_graph_count: usize,
}

/// Entry point for callers holding serialized ONNX models.
///
/// The device list is fixed when the facade is built. Prepared executables are cached
/// by model bytes and normalized options; the cache is the only shared mutable state.
pub struct OnnxifiBackend {
    devices: DeviceRegistry,
    cache: Option<Mutex<LruCache<u64, ExecutableHandle>>>,
}

impl OnnxifiBackend {
    pub fn new() -> Self {
        Self::with_cache_capacity(crate::env::executable_cache_capacity())
    }

    /// Facade with an explicit cache size; 0 disables caching.
    pub fn with_cache_capacity(capacity: usize) -> Self {
        Self {
            devices: DeviceRegistry::snapshot(),
            cache: NonZeroUsize::new(capacity).map(|capacity| Mutex::new(LruCache::new(capacity))),
        }
    }

    pub fn devices(&self) -> &DeviceRegistry {
        &self.devices
    }

    pub fn get_devices_info(&self) -> Vec<(String, String)> {
        self.devices.list_devices()
    }

    pub fn supports_device(&self, device: &str) -> bool {
        self.devices.supports_device(device)
    }

    pub fn backend_info(&self, device: &str) -> Result<BackendInfo> {
        let info = self.device(device)?;
        Ok(BackendInfo {
            name: BACKEND_NAME.to_string(),
            vendor: BACKEND_VENDOR.to_string(),
            version: BACKEND_VERSION.to_string(),
            device: info.id.clone(),
            device_description: info.description.clone(),
            max_graph_size: info.capabilities.max_graph_size,
            max_graph_count: usize::MAX,
        })
    }

    /// Whether `model` can be prepared on `device`.
    ///
    /// Malformed models and invalid options are errors; an unknown device or any
    /// capability gap is `Ok(false)`.
    pub fn is_compatible(
        &self,
        model: &[u8],
        device: &str,
        options: &HashMap<String, String>,
    ) -> Result<bool> {
        let options = BackendOptions::from_map(device, options)?;
        let mut graph = graph::decode(model)?;
        let Some(info) = self.devices.get(device) else {
            return Ok(false);
        };
        graph.bind_dims(&options.dim_bindings);
        let compatible = checker::is_compatible(&graph, &info.capabilities);
        tracing::debug!(graph = %graph.name, device = %info.id, compatible, "compatibility query");
        Ok(compatible)
    }

    /// Decodes, validates, and compiles `model` for `device`, reusing a cached
    /// executable for identical bytes and options.
    pub fn prepare(
        &self,
        model: &[u8],
        device: &str,
        options: &HashMap<String, String>,
    ) -> Result<ExecutableHandle> {
        let options = BackendOptions::from_map(device, options)?;
        self.prepare_with_options(model, &options)
    }

    pub fn prepare_with_options(
        &self,
        model: &[u8],
        options: &BackendOptions,
    ) -> Result<ExecutableHandle> {
        let graph = graph::decode(model)?;
        self.device(&options.device)?;

        let key = cache_key(model, options);
        if let Some(hit) = self.cached(key) {
            tracing::debug!(graph = %graph.name, key, "executable cache hit");
            return Ok(hit);
        }
        tracing::debug!(graph = %graph.name, key, "executable cache miss");

        let executable = self.compile(graph, options)?;
        if let Some(cache) = &self.cache {
            cache
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .put(key, Arc::clone(&executable));
        }
        Ok(executable)
    }

    /// Prepares `model` with the named runtime inputs bound as constant weights.
    ///
    /// The model must not carry initializers. The result is never cached.
    pub fn prepare_with_weights(
        &self,
        model: &[u8],
        device: &str,
        options: &HashMap<String, String>,
        weights: Vec<(String, Tensor)>,
    ) -> Result<ExecutableHandle> {
        let options = BackendOptions::from_map(device, options)?;
        let mut graph = graph::decode(model)?;
        self.device(&options.device)?;
        graph.bind_weights(weights)?;
        self.compile(graph, &options)
    }

    pub fn run(&self, executable: &ExecutableHandle, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        crate::engine::run(executable, inputs)
    }

    /// Binds named inputs and expected outputs for repeated or fenced runs.
    pub fn set_graph_io(
        &self,
        executable: &ExecutableHandle,
        inputs: Vec<(String, Tensor)>,
        outputs: &[TensorSlot],
    ) -> Result<Arc<GraphIo>> {
        GraphIo::bind(executable, inputs, outputs).map(Arc::new)
    }

    /// Starts `io` once `input` is signalled; the returned run signals its own output
    /// event when done.
    pub fn run_graph(&self, io: &Arc<GraphIo>, input: Event) -> Result<PendingRun> {
        binding::run_fenced(Arc::clone(io), input)
    }

    /// Number of executables currently cached.
    pub fn cached_executables(&self) -> usize {
        self.cache.as_ref().map_or(0, |cache| {
            cache.lock().unwrap_or_else(PoisonError::into_inner).len()
        })
    }

    fn device(&self, device: &str) -> Result<&DeviceInfo> {
        self.devices
            .get(device)
            .ok_or_else(|| OnnxXlaError::UnsupportedDevice(device.to_string()))
    }

    fn cached(&self, key: u64) -> Option<ExecutableHandle> {
        let cache = self.cache.as_ref()?;
        let mut cache = cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.get(&key).cloned()
    }

    fn compile(&self, mut graph: Graph, options: &BackendOptions) -> Result<ExecutableHandle> {
        graph.bind_dims(&options.dim_bindings);
        let device = self.device(&options.device)?.id.clone();
        let backend = self
            .devices
            .instantiate(&device)
            .ok_or_else(|| OnnxXlaError::UnsupportedDevice(device.clone()))?;
        let options = BackendOptions {
            device,
            ..options.clone()
        };
        compiler::compile(&graph, backend, &options).map(Arc::new)
    }
}

impl Default for OnnxifiBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn cache_key(model: &[u8], options: &BackendOptions) -> u64 {
    let hash = fnv1a_hash(model);
    let hash = fnv1a_bytes(hash, &[0xff]);
    fnv1a_bytes(hash, options.fingerprint().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::OptimizationLevel;

    #[test]
    fn cache_key_depends_on_bytes_and_options() {
        let options = BackendOptions::new("CPU").with_optimization_level(OptimizationLevel::Basic);
        let base = cache_key(b"model", &options);
        assert_eq!(base, cache_key(b"model", &options.clone()));
        assert_ne!(base, cache_key(b"model2", &options));
        assert_ne!(
            base,
            cache_key(
                b"model",
                &options.clone().with_optimization_level(OptimizationLevel::None)
            )
        );
        assert_eq!(base, cache_key(b"model", &BackendOptions { device: "cpu".into(), ..options }));
    }
}
