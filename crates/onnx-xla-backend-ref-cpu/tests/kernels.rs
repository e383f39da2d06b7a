use onnx_xla::backend::ir::{
    BroadcastToSpec, ConcatSpec, ConvSpec, DType, DotGeneralSpec, ElementwiseBinaryOp,
    ElementwiseUnaryOp, Function, Instruction, Operand, Operation, PortableBackend, Program,
    ReduceKind, ReduceSpec, ReduceWindowSpec, Shape, TensorLiteral, TensorSpec, TransposeSpec,
    ValueId,
};
use onnx_xla_backend_ref_cpu::{CpuBackend, CpuTensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn f32_tensor(backend: &CpuBackend, dims: &[usize], values: Vec<f32>) -> CpuTensor {
    backend
        .materialize(TensorLiteral::from_f32(dims, values).unwrap())
        .unwrap()
}

fn instruction(op: Operation, dtype: DType, dims: &[usize]) -> Instruction {
    Instruction {
        id: ValueId(0),
        op,
        operands: Vec::new(),
        output: TensorSpec::from_dims(dtype, dims),
    }
}

fn run_f32(backend: &CpuBackend, inst: Instruction, inputs: &[CpuTensor]) -> Vec<f32> {
    let outputs = backend.execute_instruction(&inst, inputs).unwrap();
    assert_eq!(outputs.len(), 1);
    let literal = backend.to_literal(&outputs[0]).unwrap();
    assert_eq!(literal.spec, inst.output);
    literal.as_f32().unwrap().to_vec()
}

fn conv_spec(strides: &[usize], pads: &[(usize, usize)], groups: usize) -> ConvSpec {
    ConvSpec {
        strides: strides.to_vec(),
        padding: pads.to_vec(),
        dilations: vec![1; strides.len()],
        groups,
    }
}

#[test]
fn conv_sums_each_window() {
    let backend = CpuBackend::new();
    let x = f32_tensor(&backend, &[1, 1, 3, 3], (1..=9).map(|v| v as f32).collect());
    let w = f32_tensor(&backend, &[1, 1, 2, 2], vec![1.0; 4]);
    let inst = instruction(
        Operation::Conv(conv_spec(&[1, 1], &[(0, 0), (0, 0)], 1)),
        DType::F32,
        &[1, 1, 2, 2],
    );
    assert_eq!(run_f32(&backend, inst, &[x, w]), vec![12.0, 16.0, 24.0, 28.0]);
}

#[test]
fn conv_with_padding_stride_and_bias() {
    let backend = CpuBackend::new();
    let x = f32_tensor(&backend, &[1, 1, 3, 3], vec![1.0; 9]);
    let w = f32_tensor(&backend, &[1, 1, 3, 3], vec![1.0; 9]);
    let bias = f32_tensor(&backend, &[1], vec![0.5]);
    let inst = instruction(
        Operation::Conv(conv_spec(&[2, 2], &[(1, 1), (1, 1)], 1)),
        DType::F32,
        &[1, 1, 2, 2],
    );
    assert_eq!(run_f32(&backend, inst, &[x, w, bias]), vec![4.5; 4]);
}

#[test]
fn grouped_conv_keeps_channels_apart() {
    let backend = CpuBackend::new();
    let x = f32_tensor(
        &backend,
        &[1, 2, 2, 2],
        vec![1.0, 1.0, 1.0, 1.0, 2.0, 2.0, 2.0, 2.0],
    );
    let w = f32_tensor(&backend, &[2, 1, 1, 1], vec![3.0, 5.0]);
    let inst = instruction(
        Operation::Conv(conv_spec(&[1, 1], &[(0, 0), (0, 0)], 2)),
        DType::F32,
        &[1, 2, 2, 2],
    );
    assert_eq!(
        run_f32(&backend, inst, &[x, w]),
        vec![3.0, 3.0, 3.0, 3.0, 10.0, 10.0, 10.0, 10.0]
    );
}

#[test]
fn conv_bias_matches_separate_add_bitwise() {
    let backend = CpuBackend::new();
    let mut rng = StdRng::seed_from_u64(7);
    let mut random = |len: usize| (0..len).map(|_| rng.gen_range(-1.0f32..1.0)).collect::<Vec<_>>();
    let x = f32_tensor(&backend, &[2, 3, 5, 5], random(2 * 3 * 5 * 5));
    let w = f32_tensor(&backend, &[4, 3, 3, 3], random(4 * 3 * 3 * 3));
    let bias_values = random(4);
    let bias = f32_tensor(&backend, &[4], bias_values.clone());
    let spec = conv_spec(&[1, 1], &[(1, 1), (1, 1)], 1);
    let out_dims = [2, 4, 5, 5];

    let fused = run_f32(
        &backend,
        instruction(Operation::Conv(spec.clone()), DType::F32, &out_dims),
        &[x.clone(), w.clone(), bias],
    );
    let plain = run_f32(
        &backend,
        instruction(Operation::Conv(spec), DType::F32, &out_dims),
        &[x, w],
    );
    let per_channel = 25;
    for (idx, (fused, plain)) in fused.iter().zip(&plain).enumerate() {
        let channel = (idx / per_channel) % 4;
        assert_eq!(fused.to_bits(), (plain + bias_values[channel]).to_bits());
    }
}

#[test]
fn reduce_window_ignores_padding() {
    let backend = CpuBackend::new();
    let x = f32_tensor(&backend, &[1, 1, 4], vec![1.0, 3.0, 2.0, 4.0]);
    let window = |reduce| ReduceWindowSpec {
        window_dims: vec![1, 1, 3],
        strides: vec![1, 1, 1],
        padding: vec![(0, 0), (0, 0), (1, 1)],
        window_dilation: vec![1, 1, 1],
        reduce,
    };
    let max = instruction(
        Operation::ReduceWindow(window(ReduceKind::Max)),
        DType::F32,
        &[1, 1, 4],
    );
    assert_eq!(run_f32(&backend, max, &[x]), vec![3.0, 3.0, 4.0, 4.0]);

    let ones = f32_tensor(&backend, &[1, 1, 4], vec![1.0; 4]);
    let sum = instruction(
        Operation::ReduceWindow(window(ReduceKind::Sum)),
        DType::F32,
        &[1, 1, 4],
    );
    assert_eq!(run_f32(&backend, sum, &[ones]), vec![2.0, 3.0, 3.0, 2.0]);
}

#[test]
fn strided_reduce_window() {
    let backend = CpuBackend::new();
    let x = f32_tensor(&backend, &[1, 1, 4], vec![1.0, 3.0, 2.0, 4.0]);
    let inst = instruction(
        Operation::ReduceWindow(ReduceWindowSpec {
            window_dims: vec![1, 1, 2],
            strides: vec![1, 1, 2],
            padding: vec![(0, 0); 3],
            window_dilation: vec![1, 1, 1],
            reduce: ReduceKind::Max,
        }),
        DType::F32,
        &[1, 1, 2],
    );
    assert_eq!(run_f32(&backend, inst, &[x]), vec![3.0, 4.0]);
}

#[test]
fn batched_dot_general() {
    let backend = CpuBackend::new();
    let lhs = f32_tensor(
        &backend,
        &[2, 2, 3],
        vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
    );
    let rhs = f32_tensor(&backend, &[2, 3, 1], vec![1.0, 1.0, 1.0, 2.0, 3.0, 4.0]);
    let inst = instruction(
        Operation::DotGeneral(DotGeneralSpec {
            batch_lhs: vec![0],
            batch_rhs: vec![0],
            contract_lhs: vec![2],
            contract_rhs: vec![1],
        }),
        DType::F32,
        &[2, 2, 1],
    );
    assert_eq!(run_f32(&backend, inst, &[lhs, rhs]), vec![6.0, 15.0, 2.0, 3.0]);
}

#[test]
fn layout_operations() {
    let backend = CpuBackend::new();
    let x = f32_tensor(&backend, &[2, 3], (0..6).map(|v| v as f32).collect());
    let transpose = instruction(
        Operation::Transpose(TransposeSpec { perm: vec![1, 0] }),
        DType::F32,
        &[3, 2],
    );
    assert_eq!(
        run_f32(&backend, transpose, &[x]),
        vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]
    );

    let row = f32_tensor(&backend, &[3], vec![1.0, 2.0, 3.0]);
    let col = f32_tensor(&backend, &[2, 1], vec![1.0, 2.0]);
    let broadcast = instruction(
        Operation::BroadcastTo(BroadcastToSpec {
            result_shape: Shape::from_static(&[2, 3]),
        }),
        DType::F32,
        &[2, 3],
    );
    assert_eq!(
        run_f32(&backend, broadcast.clone(), &[row]),
        vec![1.0, 2.0, 3.0, 1.0, 2.0, 3.0]
    );
    assert_eq!(
        run_f32(&backend, broadcast, &[col]),
        vec![1.0, 1.0, 1.0, 2.0, 2.0, 2.0]
    );

    let a = f32_tensor(&backend, &[2, 1], vec![1.0, 2.0]);
    let b = f32_tensor(&backend, &[2, 2], vec![3.0, 4.0, 5.0, 6.0]);
    let concat = instruction(Operation::Concat(ConcatSpec { axis: 1 }), DType::F32, &[2, 3]);
    assert_eq!(
        run_f32(&backend, concat, &[a, b]),
        vec![1.0, 3.0, 4.0, 2.0, 5.0, 6.0]
    );
}

#[test]
fn multi_axis_reduce() {
    let backend = CpuBackend::new();
    let x = f32_tensor(&backend, &[2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let rows = instruction(
        Operation::Reduce(ReduceSpec {
            kind: ReduceKind::Sum,
            axes: vec![1],
            keepdims: false,
        }),
        DType::F32,
        &[2],
    );
    assert_eq!(run_f32(&backend, rows, &[x.clone()]), vec![6.0, 15.0]);

    let all = instruction(
        Operation::Reduce(ReduceSpec {
            kind: ReduceKind::Max,
            axes: vec![0, 1],
            keepdims: true,
        }),
        DType::F32,
        &[1, 1],
    );
    assert_eq!(run_f32(&backend, all, &[x]), vec![6.0]);
}

#[test]
fn float_extrema_keep_nan() {
    let backend = CpuBackend::new();
    let x = f32_tensor(&backend, &[3], vec![f32::NAN, 1.0, -4.0]);
    let zero = f32_tensor(&backend, &[3], vec![0.0; 3]);
    for op in [ElementwiseBinaryOp::Maximum, ElementwiseBinaryOp::Minimum] {
        let inst = instruction(Operation::ElementwiseBinary(op), DType::F32, &[3]);
        let out = run_f32(&backend, inst, &[x.clone(), zero.clone()]);
        assert!(out[0].is_nan(), "{op:?} dropped NaN");
        assert!(!out[1].is_nan() && !out[2].is_nan());
    }

    let max = instruction(
        Operation::Reduce(ReduceSpec {
            kind: ReduceKind::Max,
            axes: vec![0],
            keepdims: true,
        }),
        DType::F32,
        &[1],
    );
    assert!(run_f32(&backend, max, &[x])[0].is_nan());
}

#[test]
fn integer_elementwise() {
    let backend = CpuBackend::new();
    let a = backend
        .materialize(TensorLiteral::from_i64(&[2], vec![1, -2]).unwrap())
        .unwrap();
    let b = backend
        .materialize(TensorLiteral::from_i64(&[2], vec![3, 4]).unwrap())
        .unwrap();
    let add = instruction(
        Operation::ElementwiseBinary(ElementwiseBinaryOp::Add),
        DType::Si64,
        &[2],
    );
    let out = backend.execute_instruction(&add, &[a.clone(), b]).unwrap();
    let literal = backend.to_literal(&out[0]).unwrap();
    assert_eq!(literal.as_i64(), Some(&[4i64, 2][..]));

    let exp = instruction(
        Operation::ElementwiseUnary(ElementwiseUnaryOp::Exp),
        DType::Si64,
        &[2],
    );
    assert!(backend.execute_instruction(&exp, &[a]).is_err());
}

#[test]
fn programs_may_return_parameters() {
    let backend = CpuBackend::new();
    let spec = TensorSpec::from_dims(DType::F32, &[2]);
    let function = Function {
        name: "main".into(),
        parameters: vec![spec.clone(), spec.clone()],
        parameter_ids: vec![ValueId(0), ValueId(1)],
        results: vec![spec.clone(), spec.clone()],
        body: vec![Instruction {
            id: ValueId(2),
            op: Operation::ElementwiseBinary(ElementwiseBinaryOp::Mul),
            operands: vec![Operand::Value(ValueId(0)), Operand::Value(ValueId(1))],
            output: spec,
        }],
        result_ids: vec![ValueId(2), ValueId(1)],
    };
    let program = Program::new("main").with_functions(vec![function]);
    let x = f32_tensor(&backend, &[2], vec![2.0, 3.0]);
    let y = f32_tensor(&backend, &[2], vec![4.0, 5.0]);

    let outputs = backend.run_program(&program, &[x, y]).unwrap();

    let product = backend.to_literal(&outputs[0]).unwrap();
    let passthrough = backend.to_literal(&outputs[1]).unwrap();
    assert_eq!(product.as_f32(), Some(&[8.0f32, 15.0][..]));
    assert_eq!(passthrough.as_f32(), Some(&[4.0f32, 5.0][..]));
}

#[test]
fn parameter_specs_are_enforced() {
    let backend = CpuBackend::new();
    let spec = TensorSpec::from_dims(DType::F32, &[2]);
    let function = Function {
        name: "main".into(),
        parameters: vec![spec.clone()],
        parameter_ids: vec![ValueId(0)],
        results: vec![spec],
        body: Vec::new(),
        result_ids: vec![ValueId(0)],
    };
    let program = Program::new("main").with_functions(vec![function]);
    let wrong = f32_tensor(&backend, &[3], vec![0.0; 3]);
    assert!(backend.run_program(&program, &[wrong]).is_err());
}
