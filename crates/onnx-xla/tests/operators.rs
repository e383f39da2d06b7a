mod common;

use common::{assert_close, f32_values, run_cpu};
use onnx_xla::onnx::{ModelBuilder, NodeBuilder};
use onnx_xla::{ElemType, Tensor};

fn seq(dims: &[usize], start: f32) -> Tensor {
    let len = dims.iter().product::<usize>();
    Tensor::from_f32(dims, (0..len).map(|v| start + v as f32).collect::<Vec<_>>()).unwrap()
}

#[test]
fn conv_with_bias() {
    let model = ModelBuilder::new("conv")
        .input("x", ElemType::Float, &[1, 1, 3, 3])
        .initializer(
            "w",
            &Tensor::from_f32(&[1, 1, 2, 2], vec![1.0, 0.0, 0.0, 1.0]).unwrap(),
        )
        .initializer("b", &Tensor::from_f32(&[1], vec![10.0]).unwrap())
        .output("y", ElemType::Float, &[1, 1, 2, 2])
        .node(
            NodeBuilder::new("Conv")
                .inputs(&["x", "w", "b"])
                .outputs(&["y"])
                .attr_ints("kernel_shape", &[2, 2]),
        )
        .to_bytes();
    let outputs = run_cpu(&model, &[seq(&[1, 1, 3, 3], 1.0)]).unwrap();
    assert_eq!(outputs[0].dims(), &[1, 1, 2, 2]);
    assert_eq!(f32_values(&outputs[0]), &[16.0, 18.0, 22.0, 24.0]);
}

#[test]
fn conv_same_upper_padding() {
    let model = ModelBuilder::new("conv-same")
        .input("x", ElemType::Float, &[1, 1, 3, 3])
        .initializer("w", &Tensor::from_f32(&[1, 1, 3, 3], vec![1.0; 9]).unwrap())
        .output("y", ElemType::Float, &[1, 1, 3, 3])
        .node(
            NodeBuilder::new("Conv")
                .inputs(&["x", "w"])
                .outputs(&["y"])
                .attr_string("auto_pad", "SAME_UPPER"),
        )
        .to_bytes();
    let x = Tensor::from_f32(&[1, 1, 3, 3], vec![1.0; 9]).unwrap();
    let outputs = run_cpu(&model, &[x]).unwrap();
    assert_eq!(
        f32_values(&outputs[0]),
        &[4.0, 6.0, 4.0, 6.0, 9.0, 6.0, 4.0, 6.0, 4.0]
    );
}

#[test]
fn max_pool_strided() {
    let model = ModelBuilder::new("maxpool")
        .input("x", ElemType::Float, &[1, 1, 4, 4])
        .output("y", ElemType::Float, &[1, 1, 2, 2])
        .node(
            NodeBuilder::new("MaxPool")
                .inputs(&["x"])
                .outputs(&["y"])
                .attr_ints("kernel_shape", &[2, 2])
                .attr_ints("strides", &[2, 2]),
        )
        .to_bytes();
    let outputs = run_cpu(&model, &[seq(&[1, 1, 4, 4], 0.0)]).unwrap();
    assert_eq!(f32_values(&outputs[0]), &[5.0, 7.0, 13.0, 15.0]);
}

fn average_pool_model(count_include_pad: i64) -> Vec<u8> {
    ModelBuilder::new("avgpool")
        .input("x", ElemType::Float, &[1, 1, 1, 3])
        .output("y", ElemType::Float, &[1, 1, 1, 4])
        .node(
            NodeBuilder::new("AveragePool")
                .inputs(&["x"])
                .outputs(&["y"])
                .attr_ints("kernel_shape", &[1, 2])
                .attr_ints("pads", &[0, 1, 0, 1])
                .attr_int("count_include_pad", count_include_pad),
        )
        .to_bytes()
}

#[test]
fn average_pool_padding_divisors() {
    let x = seq(&[1, 1, 1, 3], 1.0);
    let excluded = run_cpu(&average_pool_model(0), &[x.clone()]).unwrap();
    assert_close(f32_values(&excluded[0]), &[1.0, 1.5, 2.5, 3.0], 1e-6);
    let included = run_cpu(&average_pool_model(1), &[x]).unwrap();
    assert_close(f32_values(&included[0]), &[0.5, 1.5, 2.5, 1.5], 1e-6);
}

#[test]
fn global_pools() {
    let model = ModelBuilder::new("global")
        .input("x", ElemType::Float, &[1, 2, 2, 2])
        .output("avg", ElemType::Float, &[1, 2, 1, 1])
        .output("max", ElemType::Float, &[1, 2, 1, 1])
        .node(
            NodeBuilder::new("GlobalAveragePool")
                .inputs(&["x"])
                .outputs(&["avg"]),
        )
        .node(NodeBuilder::new("GlobalMaxPool").inputs(&["x"]).outputs(&["max"]))
        .to_bytes();
    let outputs = run_cpu(&model, &[seq(&[1, 2, 2, 2], 0.0)]).unwrap();
    assert_close(f32_values(&outputs[0]), &[1.5, 5.5], 1e-6);
    assert_eq!(f32_values(&outputs[1]), &[3.0, 7.0]);
}

#[test]
fn gemm_with_transpose_and_scaling() {
    let model = ModelBuilder::new("gemm")
        .input("a", ElemType::Float, &[2, 3])
        .initializer(
            "b",
            &Tensor::from_f32(&[2, 3], vec![1.0, 0.0, 1.0, 0.0, 1.0, 0.0]).unwrap(),
        )
        .initializer("c", &Tensor::from_f32(&[2], vec![1.0, -1.0]).unwrap())
        .output("y", ElemType::Float, &[2, 2])
        .node(
            NodeBuilder::new("Gemm")
                .inputs(&["a", "b", "c"])
                .outputs(&["y"])
                .attr_int("transB", 1)
                .attr_float("alpha", 2.0)
                .attr_float("beta", 0.5),
        )
        .to_bytes();
    let outputs = run_cpu(&model, &[seq(&[2, 3], 1.0)]).unwrap();
    assert_close(f32_values(&outputs[0]), &[8.5, 3.5, 20.5, 9.5], 1e-6);
}

#[test]
fn batched_matmul_against_matrix() {
    let model = ModelBuilder::new("matmul")
        .input("a", ElemType::Float, &[2, 1, 2])
        .initializer(
            "b",
            &Tensor::from_f32(&[2, 3], vec![1.0, 0.0, 2.0, 0.0, 1.0, 3.0]).unwrap(),
        )
        .output("y", ElemType::Float, &[2, 1, 3])
        .node(NodeBuilder::new("MatMul").inputs(&["a", "b"]).outputs(&["y"]))
        .to_bytes();
    let outputs = run_cpu(&model, &[seq(&[2, 1, 2], 1.0)]).unwrap();
    assert_eq!(
        f32_values(&outputs[0]),
        &[1.0, 2.0, 8.0, 3.0, 4.0, 18.0]
    );
}

#[test]
fn batch_normalization_inference() {
    let model = ModelBuilder::new("bn")
        .input("x", ElemType::Float, &[1, 2, 1, 2])
        .initializer("scale", &Tensor::from_f32(&[2], vec![1.0, 2.0]).unwrap())
        .initializer("bias", &Tensor::from_f32(&[2], vec![0.0, 1.0]).unwrap())
        .initializer("mean", &Tensor::from_f32(&[2], vec![1.0, 3.0]).unwrap())
        .initializer("var", &Tensor::from_f32(&[2], vec![4.0, 0.25]).unwrap())
        .output("y", ElemType::Float, &[1, 2, 1, 2])
        .node(
            NodeBuilder::new("BatchNormalization")
                .inputs(&["x", "scale", "bias", "mean", "var"])
                .outputs(&["y"])
                .attr_float("epsilon", 0.0),
        )
        .to_bytes();
    let outputs = run_cpu(&model, &[seq(&[1, 2, 1, 2], 1.0)]).unwrap();
    assert_close(f32_values(&outputs[0]), &[0.0, 0.5, 1.0, 5.0], 1e-6);
}

#[test]
fn softmax_normalizes_last_axis() {
    let model = ModelBuilder::new("softmax")
        .input("x", ElemType::Float, &[2, 3])
        .output("y", ElemType::Float, &[2, 3])
        .node(NodeBuilder::new("Softmax").inputs(&["x"]).outputs(&["y"]))
        .to_bytes();
    let (ln2, ln3) = (2f32.ln(), 3f32.ln());
    let x = Tensor::from_f32(&[2, 3], vec![0.0, ln2, ln3, 100.0, 100.0, 100.0]).unwrap();
    let outputs = run_cpu(&model, &[x]).unwrap();
    let third = 1.0 / 3.0;
    assert_close(
        f32_values(&outputs[0]),
        &[1.0 / 6.0, 2.0 / 6.0, 3.0 / 6.0, third, third, third],
        1e-5,
    );
}

#[test]
fn softmax_before_opset_13_flattens_trailing_axes() {
    let model = ModelBuilder::new("softmax-legacy")
        .opset(11)
        .input("x", ElemType::Float, &[1, 2, 2])
        .output("y", ElemType::Float, &[1, 2, 2])
        .node(NodeBuilder::new("Softmax").inputs(&["x"]).outputs(&["y"]))
        .to_bytes();
    let x = Tensor::from_f32(&[1, 2, 2], vec![0.0; 4]).unwrap();
    let outputs = run_cpu(&model, &[x]).unwrap();
    assert_close(f32_values(&outputs[0]), &[0.25; 4], 1e-6);
}

#[test]
fn lrn_across_channels() {
    let model = ModelBuilder::new("lrn")
        .input("x", ElemType::Float, &[1, 3, 1, 1])
        .output("y", ElemType::Float, &[1, 3, 1, 1])
        .node(
            NodeBuilder::new("LRN")
                .inputs(&["x"])
                .outputs(&["y"])
                .attr_int("size", 3)
                .attr_float("alpha", 3.0)
                .attr_float("beta", 1.0)
                .attr_float("bias", 1.0),
        )
        .to_bytes();
    let outputs = run_cpu(&model, &[seq(&[1, 3, 1, 1], 1.0)]).unwrap();
    assert_close(
        f32_values(&outputs[0]),
        &[1.0 / 6.0, 2.0 / 15.0, 3.0 / 14.0],
        1e-6,
    );
}

#[test]
fn reductions_with_and_without_keepdims() {
    let model = ModelBuilder::new("reduce")
        .input("x", ElemType::Float, &[2, 3])
        .output("mean", ElemType::Float, &[2, 1])
        .output("max", ElemType::Float, &[3])
        .node(
            NodeBuilder::new("ReduceMean")
                .inputs(&["x"])
                .outputs(&["mean"])
                .attr_ints("axes", &[1]),
        )
        .node(
            NodeBuilder::new("ReduceMax")
                .inputs(&["x"])
                .outputs(&["max"])
                .attr_ints("axes", &[0])
                .attr_int("keepdims", 0),
        )
        .to_bytes();
    let outputs = run_cpu(&model, &[seq(&[2, 3], 1.0)]).unwrap();
    assert_eq!(outputs[0].dims(), &[2, 1]);
    assert_close(f32_values(&outputs[0]), &[2.0, 5.0], 1e-6);
    assert_eq!(f32_values(&outputs[1]), &[4.0, 5.0, 6.0]);
}

#[test]
fn broadcasting_arithmetic() {
    let model = ModelBuilder::new("broadcast")
        .input("x", ElemType::Float, &[2, 3])
        .initializer("row", &Tensor::from_f32(&[3], vec![1.0, 2.0, 3.0]).unwrap())
        .initializer("col", &Tensor::from_f32(&[2, 1], vec![10.0, 20.0]).unwrap())
        .output("y", ElemType::Float, &[2, 3])
        .node(NodeBuilder::new("Mul").inputs(&["x", "row"]).outputs(&["t"]))
        .node(NodeBuilder::new("Add").inputs(&["t", "col"]).outputs(&["y"]))
        .to_bytes();
    let outputs = run_cpu(&model, &[seq(&[2, 3], 0.0)]).unwrap();
    assert_eq!(
        f32_values(&outputs[0]),
        &[10.0, 12.0, 16.0, 23.0, 28.0, 35.0]
    );
}

#[test]
fn relu_and_max_keep_nan() {
    let model = ModelBuilder::new("nan")
        .input("x", ElemType::Float, &[2])
        .input("z", ElemType::Float, &[2])
        .output("r", ElemType::Float, &[2])
        .output("m", ElemType::Float, &[2])
        .node(NodeBuilder::new("Relu").inputs(&["x"]).outputs(&["r"]))
        .node(NodeBuilder::new("Max").inputs(&["z", "x"]).outputs(&["m"]))
        .to_bytes();
    let x = Tensor::from_f32(&[2], vec![f32::NAN, 1.0]).unwrap();
    let z = Tensor::from_f32(&[2], vec![0.0, 3.0]).unwrap();
    let outputs = run_cpu(&model, &[x, z]).unwrap();
    let relu = f32_values(&outputs[0]);
    assert!(relu[0].is_nan());
    assert_eq!(relu[1], 1.0);
    let max = f32_values(&outputs[1]);
    assert!(max[0].is_nan());
    assert_eq!(max[1], 3.0);
}

#[test]
fn integer_arithmetic() {
    let model = ModelBuilder::new("int")
        .input("a", ElemType::Int64, &[3])
        .input("b", ElemType::Int64, &[3])
        .output("y", ElemType::Int64, &[3])
        .node(NodeBuilder::new("Sub").inputs(&["a", "b"]).outputs(&["t"]))
        .node(NodeBuilder::new("Abs").inputs(&["t"]).outputs(&["y"]))
        .to_bytes();
    let a = Tensor::from_i64(&[3], vec![1, 5, -2]).unwrap();
    let b = Tensor::from_i64(&[3], vec![4, 2, 2]).unwrap();
    let outputs = run_cpu(&model, &[a, b]).unwrap();
    assert_eq!(outputs[0].as_i64(), Some(&[3i64, 3, 4][..]));
}

#[test]
fn layout_operators() {
    let model = ModelBuilder::new("layout")
        .input("x", ElemType::Float, &[2, 3])
        .initializer("axes", &Tensor::from_i64(&[1], vec![0]).unwrap())
        .output("t", ElemType::Float, &[3, 2])
        .output("c", ElemType::Float, &[2, 6])
        .output("u", ElemType::Float, &[1, 2, 3])
        .output("f", ElemType::Float, &[2, 3])
        .node(
            NodeBuilder::new("Transpose")
                .inputs(&["x"])
                .outputs(&["t"])
                .attr_ints("perm", &[1, 0]),
        )
        .node(
            NodeBuilder::new("Concat")
                .inputs(&["x", "x"])
                .outputs(&["c"])
                .attr_int("axis", -1),
        )
        .node(NodeBuilder::new("Unsqueeze").inputs(&["x", "axes"]).outputs(&["u"]))
        .node(
            NodeBuilder::new("Flatten")
                .inputs(&["u"])
                .outputs(&["f"])
                .attr_int("axis", 2),
        )
        .to_bytes();
    let x = seq(&[2, 3], 0.0);
    let outputs = run_cpu(&model, &[x]).unwrap();
    assert_eq!(f32_values(&outputs[0]), &[0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
    assert_eq!(
        f32_values(&outputs[1]),
        &[0.0, 1.0, 2.0, 0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 3.0, 4.0, 5.0]
    );
    assert_eq!(outputs[2].dims(), &[1, 2, 3]);
    assert_eq!(outputs[3].dims(), &[2, 3]);
    assert_eq!(f32_values(&outputs[3]), &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
}

#[test]
fn constant_nodes_feed_computation() {
    let model = ModelBuilder::new("constant")
        .input("x", ElemType::Float, &[2])
        .output("y", ElemType::Float, &[2])
        .node(
            NodeBuilder::new("Constant")
                .outputs(&["k"])
                .attr_tensor("value", &Tensor::from_f32(&[2], vec![0.5, 2.0]).unwrap()),
        )
        .node(NodeBuilder::new("Mul").inputs(&["x", "k"]).outputs(&["y"]))
        .to_bytes();
    let x = Tensor::from_f32(&[2], vec![4.0, 4.0]).unwrap();
    let outputs = run_cpu(&model, &[x]).unwrap();
    assert_eq!(f32_values(&outputs[0]), &[2.0, 8.0]);
}
