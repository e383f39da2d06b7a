use onnx_xla::backend::ir::{PortableBackend, TensorLiteral};
use onnx_xla::backend::legality::OperationKind;
use onnx_xla::backend::registry::{create_backend, get_typed_backend, has_backend, list_backends};
use onnx_xla::DType;
use onnx_xla_backend_ref_cpu::{CpuBackend, DEVICE_ID, MAX_GRAPH_SIZE};

#[test]
fn test_cpu_backend_registration() {
    onnx_xla_backend_ref_cpu::register_cpu_backend();
    // Registering again must not add a second entry.
    onnx_xla_backend_ref_cpu::register_cpu_backend();

    let backends = list_backends();
    assert_eq!(
        backends.iter().filter(|name| name.eq_ignore_ascii_case(DEVICE_ID)).count(),
        1
    );
    assert!(has_backend("cpu"));
    assert!(has_backend("CPU"));

    let backend = create_backend("cpu").expect("failed to create cpu backend");
    assert_eq!(backend.backend_name(), "CPU");
    assert!(backend.is_thread_safe());

    let caps = backend.capabilities();
    assert!(OperationKind::ALL.iter().all(|kind| caps.supports_op(*kind)));
    assert!(caps.supports_dtype(DType::F32));
    assert!(caps.supports_dtype(DType::Si64));
    assert!(!caps.allow_dynamic_dims);
    assert_eq!(caps.max_graph_size, Some(MAX_GRAPH_SIZE));

    let typed = get_typed_backend::<CpuBackend>(backend.as_ref()).expect("typed cpu backend");
    let literal = TensorLiteral::from_f32(&[2], vec![1.0, 2.0]).unwrap();
    let handle = typed.materialize(literal.clone()).unwrap();
    assert_eq!(typed.to_literal(&handle).unwrap(), literal);

    assert!(!has_backend("nonexistent"));
    assert!(create_backend("nonexistent").is_none());
}
