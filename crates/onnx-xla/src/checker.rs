//! Static compatibility gate over a decoded graph and a device's capabilities.
//!
//! The checker never lowers anything: operator support is read off each translator's
//! declared operation kinds and configuration limits, and element types are propagated
//! from graph inputs and constants.

use std::collections::HashMap;
use std::fmt;

use crate::backend::legality::DeviceCapabilities;
use crate::compiler::translate::{constant_value, translator_for};
use crate::error::OnnxXlaError;
use crate::graph::{Graph, OpType};
use crate::tensor::{ElemType, Tensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IncompatibilityKind {
    Operator,
    ElementType,
    DynamicShape,
    GraphSize,
}

/// One reason a graph cannot run on a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incompatibility {
    pub kind: IncompatibilityKind,
    /// Index of the offending node, if the problem belongs to one.
    pub node_index: Option<usize>,
    /// Operator type, or the tensor name for input-level problems.
    pub subject: String,
    pub message: String,
}

impl Incompatibility {
    /// Error the compiler raises for this incompatibility.
    pub fn into_error(self) -> OnnxXlaError {
        match self.kind {
            IncompatibilityKind::DynamicShape => OnnxXlaError::shape(self.subject, self.message),
            _ => OnnxXlaError::unsupported(self.subject, self.message),
        }
    }
}

impl fmt::Display for Incompatibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.node_index {
            Some(index) => write!(f, "node #{index} `{}`: {}", self.subject, self.message),
            None => write!(f, "`{}`: {}", self.subject, self.message),
        }
    }
}

/// True when every node, element type, and shape of `graph` fits `caps`.
pub fn is_compatible(graph: &Graph, caps: &DeviceCapabilities) -> bool {
    find_incompatibility(graph, caps).is_none()
}

/// First incompatibility in graph order.
pub fn find_incompatibility(graph: &Graph, caps: &DeviceCapabilities) -> Option<Incompatibility> {
    let mut first = None;
    scan(graph, caps, &mut |issue| {
        first = Some(issue);
        false
    });
    first
}

/// Every incompatibility, in graph order.
pub fn compatibility_report(graph: &Graph, caps: &DeviceCapabilities) -> Vec<Incompatibility> {
    let mut issues = Vec::new();
    scan(graph, caps, &mut |issue| {
        issues.push(issue);
        true
    });
    issues
}

/// Walks the graph, handing each issue to `sink`; stops when `sink` returns false.
fn scan(graph: &Graph, caps: &DeviceCapabilities, sink: &mut dyn FnMut(Incompatibility) -> bool) {
    let mut report = |kind, node_index, subject: &str, message: String| {
        sink(Incompatibility {
            kind,
            node_index,
            subject: subject.to_string(),
            message,
        })
    };

    if let Some(limit) = caps.max_graph_size {
        if graph.node_count() > limit {
            let message = format!("{} nodes exceed the device limit of {limit}", graph.node_count());
            if !report(IncompatibilityKind::GraphSize, None, "graph", message) {
                return;
            }
        }
    }

    let element_issue = |elem: ElemType| -> Option<String> {
        match elem.to_dtype() {
            None => Some(format!("element type {elem} is not supported")),
            Some(dtype) if !caps.supports_dtype(dtype) => {
                Some(format!("element type {elem} is not supported by the device"))
            }
            Some(_) => None,
        }
    };

    let mut elem_types: HashMap<&str, ElemType> = HashMap::new();
    let mut constants: HashMap<&str, Tensor> = HashMap::new();
    for (name, tensor) in &graph.initializers {
        elem_types.insert(name, tensor.elem_type());
        constants.insert(name, tensor.clone());
    }

    for input in graph.runtime_inputs() {
        let Some(desc) = &input.desc else { continue };
        elem_types.insert(&input.name, desc.elem_type);
        if let Some(message) = element_issue(desc.elem_type) {
            if !report(IncompatibilityKind::ElementType, None, &input.name, message) {
                return;
            }
        }
        if !caps.allow_dynamic_dims && !desc.shape.is_static() {
            let message = format!("dynamic shape [{}] is not supported", desc.shape);
            if !report(IncompatibilityKind::DynamicShape, None, &input.name, message) {
                return;
            }
        }
    }

    for (index, node) in graph.nodes.iter().enumerate() {
        let op = node.op_type.as_str();
        let mut node_issue = |kind, message: String| report(kind, Some(index), op, message);

        if !node.in_default_domain() {
            if !node_issue(
                IncompatibilityKind::Operator,
                format!("operator domain `{}` is not supported", node.domain),
            ) {
                return;
            }
            continue;
        }
        let Some(translator) = translator_for(&node.op_type) else {
            if !node_issue(IncompatibilityKind::Operator, "operator is not supported".into()) {
                return;
            }
            continue;
        };
        if let Some(kind) = translator
            .lowered_kinds()
            .iter()
            .find(|kind| !caps.supports_op(**kind))
        {
            if !node_issue(
                IncompatibilityKind::Operator,
                format!("device does not support {kind:?} operations"),
            ) {
                return;
            }
        }
        if let Some(reason) = translator.unsupported_config(node, graph.opset_version) {
            if !node_issue(IncompatibilityKind::Operator, reason) {
                return;
            }
        }
        let constant = |slot: usize| {
            node.input(slot)
                .and_then(|name| constants.get(name))
                .cloned()
        };
        if let Some(reason) = translator.unsupported_constants(node, &constant) {
            if !node_issue(IncompatibilityKind::Operator, reason) {
                return;
            }
        }

        let constant_slots = translator.constant_inputs();
        let mut first_data_type = None;
        for (slot, name) in node.inputs.iter().enumerate() {
            if name.is_empty() {
                continue;
            }
            if constant_slots.contains(&slot) {
                if !constants.contains_key(name.as_str())
                    && !node_issue(
                        IncompatibilityKind::Operator,
                        format!("input `{name}` must be a compile-time constant"),
                    )
                {
                    return;
                }
                continue;
            }
            let Some(&elem) = elem_types.get(name.as_str()) else {
                continue;
            };
            first_data_type.get_or_insert(elem);
            if let Some(message) = element_issue(elem) {
                if !node_issue(IncompatibilityKind::ElementType, message) {
                    return;
                }
            } else if translator.float_only() && elem != ElemType::Float {
                if !node_issue(
                    IncompatibilityKind::ElementType,
                    format!("operator requires float32 inputs, `{name}` is {elem}"),
                ) {
                    return;
                }
            }
        }

        let produced = if node.op_type == OpType::Constant {
            let value = constant_value(node).ok();
            let elem = value.as_ref().map(Tensor::elem_type);
            if let (Some(output), Some(value)) = (node.output(0), value) {
                constants.insert(output, value);
            }
            elem
        } else {
            first_data_type
        };
        if let Some(elem) = produced {
            for output in node.outputs.iter().filter(|name| !name.is_empty()) {
                elem_types.insert(output, elem);
            }
        }
    }

    for output in &graph.outputs {
        if let Some(&elem) = elem_types.get(output.name.as_str()) {
            if let Some(message) = element_issue(elem) {
                if !report(IncompatibilityKind::ElementType, None, &output.name, message) {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::legality::OperationKind;
    use crate::onnx::{ModelBuilder, NodeBuilder};

    fn conv_then_unknown() -> Graph {
        let model = ModelBuilder::new("mixed")
            .input("x", ElemType::Float, &[1, 1, 2, 2])
            .initializer("w", &Tensor::from_f32(&[1, 1, 1, 1], vec![1.0]).unwrap())
            .output_unshaped("y", ElemType::Float)
            .node(NodeBuilder::new("Conv").inputs(&["x", "w"]).outputs(&["c"]))
            .node(NodeBuilder::new("Hardmax2").inputs(&["c"]).outputs(&["h"]))
            .node(NodeBuilder::new("Relu").inputs(&["h"]).outputs(&["y"]))
            .to_bytes();
        crate::graph::decode(&model).unwrap()
    }

    #[test]
    fn report_lists_every_issue_in_graph_order() {
        let graph = conv_then_unknown();
        let caps = DeviceCapabilities::default()
            .allow_ops(
                OperationKind::ALL
                    .into_iter()
                    .filter(|kind| *kind != OperationKind::Conv),
            )
            .with_max_graph_size(2);

        let report = compatibility_report(&graph, &caps);
        let summary = report
            .iter()
            .map(|issue| (issue.kind, issue.node_index, issue.subject.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(
            summary,
            vec![
                (IncompatibilityKind::GraphSize, None, "graph"),
                (IncompatibilityKind::Operator, Some(0), "Conv"),
                (IncompatibilityKind::Operator, Some(1), "Hardmax2"),
            ]
        );
        assert_eq!(find_incompatibility(&graph, &caps).as_ref(), report.first());
        assert!(!is_compatible(&graph, &caps));
    }

    #[test]
    fn unrestricted_device_reports_only_unknown_operators() {
        let report = compatibility_report(&conv_then_unknown(), &DeviceCapabilities::default());
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].node_index, Some(1));
        assert!(matches!(
            report[0].clone().into_error(),
            OnnxXlaError::UnsupportedOperator { ref op, .. } if op == "Hardmax2"
        ));
    }
}
