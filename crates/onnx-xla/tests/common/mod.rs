#![allow(dead_code)]

use std::collections::HashMap;

use onnx_xla::{OnnxifiBackend, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub fn facade() -> OnnxifiBackend {
    onnx_xla_backend_ref_cpu::register_cpu_backend();
    OnnxifiBackend::with_cache_capacity(8)
}

pub fn no_options() -> HashMap<String, String> {
    HashMap::new()
}

pub fn options(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

/// Prepares `model` on the CPU device and runs it once.
pub fn run_cpu(model: &[u8], inputs: &[Tensor]) -> anyhow::Result<Vec<Tensor>> {
    let backend = facade();
    let executable = backend.prepare(model, "CPU", &no_options())?;
    Ok(backend.run(&executable, inputs)?)
}

pub fn random_tensor(seed: u64, dims: &[usize]) -> Tensor {
    let mut rng = StdRng::seed_from_u64(seed);
    let len = dims.iter().product::<usize>();
    let values = (0..len)
        .map(|_| rng.gen_range(-1.0f32..1.0))
        .collect::<Vec<_>>();
    Tensor::from_f32(dims, values).unwrap()
}

pub fn assert_close(actual: &[f32], expected: &[f32], tol: f32) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (idx, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            (a - e).abs() <= tol,
            "element {idx}: got {a}, expected {e} (tol {tol})"
        );
    }
}

pub fn f32_values(tensor: &Tensor) -> &[f32] {
    tensor.as_f32().expect("float32 tensor")
}
