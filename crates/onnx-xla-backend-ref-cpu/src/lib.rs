pub mod cpu;

pub use cpu::{CpuBackend, CpuTensor, TensorData, MAX_GRAPH_SIZE};

/// Device id the reference backend registers under.
pub const DEVICE_ID: &str = "CPU";

/// Register the CPU backend with the global backend registry.
///
/// This function is called automatically via a static initializer, but can also
/// be called manually to ensure the backend is registered. Registering twice is
/// harmless.
pub fn register_cpu_backend() {
    onnx_xla::backend::registry::register_portable_backend(DEVICE_ID, CpuBackend::new);
}

// Auto-register on library load
#[cfg(not(target_family = "wasm"))]
#[used]
#[link_section = ".init_array"]
static REGISTER_CPU_BACKEND: extern "C" fn() = {
    extern "C" fn register() {
        register_cpu_backend();
    }
    register
};
