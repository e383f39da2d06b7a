//! Static shape inference over a decoded graph.

use std::collections::HashMap;

use crate::error::{OnnxXlaError, Result};
use crate::graph::{Graph, OpType};
use crate::tensor::{Tensor, TensorDesc};

use super::deadline::Deadline;
use super::translate::{self, translator_for, InferCx, ValueType};

/// Static type of every tensor plus the compile-time constant table.
#[derive(Debug, Default)]
pub struct InferredGraph {
    pub types: HashMap<String, ValueType>,
    /// Initializers and `Constant` node outputs.
    pub constants: HashMap<String, Tensor>,
}

impl InferredGraph {
    pub fn type_of(&self, name: &str) -> Option<&ValueType> {
        self.types.get(name)
    }
}

/// Resolves every tensor of `graph` to a static type.
///
/// Fails when a runtime input has an unbound dynamic dimension, when an operator's
/// shape rules reject its operands, or when a declared output or `value_info` shape
/// disagrees with the inferred one.
pub fn infer_shapes(graph: &Graph, deadline: &Deadline) -> Result<InferredGraph> {
    let mut inferred = InferredGraph::default();

    for (name, tensor) in &graph.initializers {
        inferred.types.insert(
            name.clone(),
            ValueType::new(tensor.elem_type(), tensor.dims().to_vec()),
        );
        inferred.constants.insert(name.clone(), tensor.clone());
    }

    for input in graph.runtime_inputs() {
        let desc = input
            .desc
            .as_ref()
            .ok_or_else(|| OnnxXlaError::shape(&input.name, "graph input has no type"))?;
        let dims = desc.static_dims().ok_or_else(|| {
            let symbols = desc
                .shape
                .dims()
                .iter()
                .filter(|dim| dim.as_static().is_none())
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            OnnxXlaError::shape(
                &input.name,
                format!("dimensions [{symbols}] are unresolved; bind them with `dim.<name>` options"),
            )
        })?;
        inferred
            .types
            .insert(input.name.clone(), ValueType::new(desc.elem_type, dims));
    }

    for node in &graph.nodes {
        deadline.check()?;
        let translator = translator_for(&node.op_type)
            .ok_or_else(|| translate::unsupported(node, "no lowering exists"))?;
        let outputs = {
            let cx = InferCx {
                opset: graph.opset_version,
                types: &inferred.types,
                constants: &inferred.constants,
            };
            translator.infer(node, &cx)?
        };
        for (index, name) in node.outputs.iter().enumerate() {
            if name.is_empty() {
                continue;
            }
            let ty = outputs.get(index).cloned().ok_or_else(|| {
                translate::unsupported(node, format!("output {index} is not produced"))
            })?;
            translate::element_count(node, &ty.dims)?;
            tracing::trace!(tensor = %name, dims = ?ty.dims, "inferred");
            inferred.types.insert(name.clone(), ty);
        }
        if node.op_type == OpType::Constant {
            if let Some(name) = node.output(0) {
                let value = translate::constant_value(node)?;
                inferred.constants.insert(name.to_string(), value);
            }
        }
    }

    for output in &graph.outputs {
        let ty = inferred
            .types
            .get(&output.name)
            .ok_or_else(|| OnnxXlaError::shape(&output.name, "graph output has no type"))?;
        if let Some(desc) = &output.desc {
            check_declared(&output.name, desc, ty)?;
        }
    }
    for (name, desc) in &graph.value_info {
        if let Some(ty) = inferred.types.get(name) {
            check_declared(name, desc, ty)?;
        }
    }

    Ok(inferred)
}

fn check_declared(name: &str, desc: &TensorDesc, ty: &ValueType) -> Result<()> {
    let dims_agree = desc.shape.rank() == ty.rank()
        && desc
            .shape
            .dims()
            .iter()
            .zip(&ty.dims)
            .all(|(declared, &actual)| declared.as_static().map_or(true, |d| d == actual));
    if desc.elem_type != ty.elem_type || !dims_agree {
        return Err(OnnxXlaError::shape(
            name,
            format!(
                "declared as {desc}, inferred {}",
                ty.desc()
            ),
        ));
    }
    Ok(())
}
