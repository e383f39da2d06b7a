mod common;

use common::{facade, options, random_tensor};
use onnx_xla::backend::ir::Operation;
use onnx_xla::onnx::{ModelBuilder, NodeBuilder};
use onnx_xla::{ElemType, ExecutableHandle, Tensor};

fn conv_block() -> Vec<u8> {
    ModelBuilder::new("conv-block")
        .input("x", ElemType::Float, &[2, 3, 6, 6])
        .initializer("w", &random_tensor(11, &[4, 3, 3, 3]))
        .initializer("b", &random_tensor(12, &[4]))
        .initializer("scale", &Tensor::from_f32(&[4], vec![1.0, 0.5, 2.0, 1.5]).unwrap())
        .initializer("shift", &Tensor::from_f32(&[4], vec![0.0, 0.1, -0.1, 0.2]).unwrap())
        .initializer("mean", &Tensor::from_f32(&[4], vec![0.1, 0.0, -0.2, 0.3]).unwrap())
        .initializer("var", &Tensor::from_f32(&[4], vec![1.0, 2.0, 0.5, 1.5]).unwrap())
        .output("y", ElemType::Float, &[2, 4, 3, 3])
        .node(
            NodeBuilder::new("Conv")
                .inputs(&["x", "w", "b"])
                .outputs(&["c"])
                .attr_ints("pads", &[1, 1, 1, 1]),
        )
        .node(
            NodeBuilder::new("BatchNormalization")
                .inputs(&["c", "scale", "shift", "mean", "var"])
                .outputs(&["n"]),
        )
        .node(NodeBuilder::new("Relu").inputs(&["n"]).outputs(&["r"]))
        .node(
            NodeBuilder::new("MaxPool")
                .inputs(&["r"])
                .outputs(&["y"])
                .attr_ints("kernel_shape", &[2, 2])
                .attr_ints("strides", &[2, 2]),
        )
        .to_bytes()
}

fn prepare_at(level: &str) -> ExecutableHandle {
    facade()
        .prepare(&conv_block(), "CPU", &options(&[("optimization_level", level)]))
        .unwrap()
}

fn conv_operand_counts(executable: &ExecutableHandle) -> Vec<usize> {
    let entry = executable.program().entry_function().unwrap();
    entry
        .body
        .iter()
        .filter(|inst| matches!(inst.op, Operation::Conv(_)))
        .map(|inst| inst.operands.len())
        .collect()
}

#[test]
fn optimization_levels_agree_bitwise() {
    let x = random_tensor(5, &[2, 3, 6, 6]);
    let outputs = ["none", "basic", "aggressive"]
        .iter()
        .map(|level| {
            let executable = prepare_at(level);
            executable.run(&[x.clone()]).unwrap()
        })
        .collect::<Vec<_>>();

    let reference = outputs[0][0].as_f32().unwrap();
    for other in &outputs[1..] {
        let values = other[0].as_f32().unwrap();
        assert_eq!(values.len(), reference.len());
        for (a, b) in values.iter().zip(reference) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }
}

#[test]
fn aggressive_level_fuses_conv_bias() {
    assert_eq!(conv_operand_counts(&prepare_at("none")), vec![2]);
    assert_eq!(conv_operand_counts(&prepare_at("aggressive")), vec![3]);
}

#[test]
fn basic_level_never_grows_the_program() {
    let none = prepare_at("none");
    let basic = prepare_at("basic");
    let len = |executable: &ExecutableHandle| {
        executable.program().entry_function().unwrap().body.len()
    };
    assert!(len(&basic) <= len(&none));
}

#[test]
fn constants_become_weight_parameters() {
    let executable = prepare_at("none");
    let entry = executable.program().entry_function().unwrap();
    assert!(executable.weight_count() > 0);
    assert_eq!(
        entry.parameters.len(),
        executable.inputs().len() + executable.weight_count()
    );
    assert!(!entry
        .body
        .iter()
        .any(|inst| matches!(inst.op, Operation::Constant(_))));
}

#[test]
fn folding_keeps_broadcast_scalars_small() {
    let model = ModelBuilder::new("wide-relu")
        .input("x", ElemType::Float, &[1, 64, 112, 112])
        .output("y", ElemType::Float, &[1, 64, 112, 112])
        .node(NodeBuilder::new("Relu").inputs(&["x"]).outputs(&["y"]))
        .to_bytes();
    for level in ["basic", "aggressive"] {
        let executable = facade()
            .prepare(&model, "CPU", &options(&[("optimization_level", level)]))
            .unwrap();
        let entry = executable.program().entry_function().unwrap();
        let weights = &entry.parameters[executable.inputs().len()..];
        assert_eq!(weights.len(), executable.weight_count());
        for spec in weights {
            assert_eq!(spec.element_count(), Some(1), "{level}: weight {spec}");
        }
        assert!(entry
            .body
            .iter()
            .any(|inst| matches!(inst.op, Operation::BroadcastTo(_))));
    }
}
