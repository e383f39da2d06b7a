use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use prost::Message;

use super::schema::{schema_for, VARIADIC};
use super::{is_default_domain, AttributeKind, AttributeValue, Graph, Node, OpType, ValueInfo};
use crate::backend::ir::{DimSymbol, Dimension, Shape};
use crate::error::{OnnxXlaError, Result};
use crate::onnx::proto::{
    self, attribute_proto::AttributeType, tensor_proto::DataLocation, tensor_shape_proto,
    type_proto,
};
use crate::tensor::{ElemType, Tensor, TensorData, TensorDesc};

/// Opset assumed when a model imports no default-domain operator set.
const FALLBACK_OPSET: i64 = 13;

/// Decodes serialized ONNX bytes into a validated [`Graph`].
pub fn decode(bytes: &[u8]) -> Result<Graph> {
    let model = proto::ModelProto::decode(bytes)
        .map_err(|err| OnnxXlaError::MalformedInput(format!("invalid protobuf: {err}")))?;
    decode_model(&model)
}

/// Validates an already-decoded model message.
pub fn decode_model(model: &proto::ModelProto) -> Result<Graph> {
    let graph = model
        .graph
        .as_ref()
        .ok_or_else(|| OnnxXlaError::MalformedInput("model has no graph".into()))?;

    let opset_version = model
        .opset_import
        .iter()
        .find(|opset| is_default_domain(&opset.domain))
        .map(|opset| opset.version)
        .unwrap_or_else(|| {
            tracing::warn!(
                opset = FALLBACK_OPSET,
                "model imports no default operator set; assuming fallback"
            );
            FALLBACK_OPSET
        });

    let mut initializers = BTreeMap::new();
    for tensor in &graph.initializer {
        if tensor.name.is_empty() {
            return Err(OnnxXlaError::Schema("initializer without a name".into()));
        }
        let value = decode_tensor(tensor)?;
        if initializers.insert(tensor.name.clone(), value).is_some() {
            return Err(OnnxXlaError::Schema(format!(
                "initializer `{}` is defined more than once",
                tensor.name
            )));
        }
    }

    let mut defined: HashSet<String> = initializers.keys().cloned().collect();
    let mut inputs = Vec::with_capacity(graph.input.len());
    let mut input_names = HashSet::new();
    for info in &graph.input {
        if info.name.is_empty() {
            return Err(OnnxXlaError::Schema("graph input without a name".into()));
        }
        if !input_names.insert(info.name.as_str()) {
            return Err(OnnxXlaError::Schema(format!(
                "graph input `{}` is declared more than once",
                info.name
            )));
        }
        let desc = decode_value_type(&info.name, info.r#type.as_ref())?;
        let is_initializer = initializers.contains_key(&info.name);
        if desc.is_none() && !is_initializer {
            return Err(OnnxXlaError::Schema(format!(
                "graph input `{}` has no tensor type",
                info.name
            )));
        }
        defined.insert(info.name.clone());
        inputs.push(ValueInfo {
            name: info.name.clone(),
            desc,
        });
    }

    let mut nodes = Vec::with_capacity(graph.node.len());
    for (index, node) in graph.node.iter().enumerate() {
        let node = decode_node(index, node)?;
        for input in node.inputs.iter().filter(|name| !name.is_empty()) {
            if !defined.contains(input) {
                return Err(OnnxXlaError::Schema(format!(
                    "node `{}` reads undefined tensor `{input}`",
                    node.display_name()
                )));
            }
        }
        for output in node.outputs.iter().filter(|name| !name.is_empty()) {
            if !defined.insert(output.clone()) {
                return Err(OnnxXlaError::Schema(format!(
                    "tensor `{output}` is defined more than once (again by `{}`)",
                    node.display_name()
                )));
            }
        }
        nodes.push(node);
    }

    let mut outputs = Vec::with_capacity(graph.output.len());
    let mut output_names = HashSet::new();
    for info in &graph.output {
        if !defined.contains(&info.name) {
            return Err(OnnxXlaError::Schema(format!(
                "graph output `{}` is never defined",
                info.name
            )));
        }
        if !output_names.insert(info.name.as_str()) {
            return Err(OnnxXlaError::Schema(format!(
                "graph output `{}` is listed more than once",
                info.name
            )));
        }
        outputs.push(ValueInfo {
            name: info.name.clone(),
            desc: decode_value_type(&info.name, info.r#type.as_ref())?,
        });
    }

    let mut value_info = HashMap::new();
    for info in &graph.value_info {
        if let Some(desc) = decode_value_type(&info.name, info.r#type.as_ref())? {
            value_info.insert(info.name.clone(), desc);
        }
    }

    let metadata = model
        .metadata_props
        .iter()
        .map(|entry| (entry.key.clone(), entry.value.clone()))
        .collect();

    tracing::debug!(
        graph = %graph.name,
        nodes = nodes.len(),
        initializers = initializers.len(),
        opset = opset_version,
        "decoded model"
    );

    Ok(Graph {
        name: graph.name.clone(),
        producer_name: model.producer_name.clone(),
        producer_version: model.producer_version.clone(),
        ir_version: model.ir_version,
        opset_version,
        inputs,
        outputs,
        initializers,
        value_info,
        nodes,
        metadata,
    })
}

fn decode_node(index: usize, node: &proto::NodeProto) -> Result<Node> {
    let op_type = OpType::from_name(&node.op_type);
    let label = if node.name.is_empty() {
        format!("#{index} {}", node.op_type)
    } else {
        node.name.clone()
    };

    let mut attributes = BTreeMap::new();
    for attr in &node.attribute {
        let value = decode_attribute(&label, attr)?;
        if attributes.insert(attr.name.clone(), value).is_some() {
            return Err(OnnxXlaError::Schema(format!(
                "node `{label}` repeats attribute `{}`",
                attr.name
            )));
        }
    }

    let schema = if is_default_domain(&node.domain) {
        schema_for(&op_type)
    } else {
        None
    };
    if let Some(schema) = schema {
        check_arity(&label, "input", &node.input, schema.min_inputs, schema.max_inputs)?;
        check_arity(&label, "output", &node.output, schema.min_outputs, schema.max_outputs)?;
        for (name, value) in &attributes {
            match schema.attribute(name) {
                Some(expected) if expected.kind != value.kind() => {
                    return Err(OnnxXlaError::Schema(format!(
                        "attribute `{name}` of `{label}` must be {:?}, found {:?}",
                        expected.kind,
                        value.kind()
                    )));
                }
                Some(_) => {}
                None => {
                    tracing::warn!(node = %label, attribute = %name, "ignoring unknown attribute");
                }
            }
        }
        for required in schema.required_attributes() {
            if !attributes.contains_key(required.name) {
                return Err(OnnxXlaError::Schema(format!(
                    "`{label}` is missing required attribute `{}`",
                    required.name
                )));
            }
        }
    }

    Ok(Node {
        name: node.name.clone(),
        op_type,
        domain: node.domain.clone(),
        inputs: node.input.clone(),
        outputs: node.output.clone(),
        attributes,
    })
}

/// Leading `min` slots must be filled; trailing empty slots count as omitted.
fn check_arity(label: &str, what: &str, names: &[String], min: usize, max: usize) -> Result<()> {
    let declared = names
        .iter()
        .rposition(|name| !name.is_empty())
        .map_or(0, |last| last + 1);
    let bound = if max == VARIADIC {
        "any".to_string()
    } else {
        max.to_string()
    };
    if declared < min || declared > max {
        return Err(OnnxXlaError::Schema(format!(
            "`{label}` has {declared} {what}s, schema allows {min}..={bound}"
        )));
    }
    if let Some(missing) = names.iter().take(min).position(String::is_empty) {
        return Err(OnnxXlaError::Schema(format!(
            "`{label}` leaves required {what} {missing} empty"
        )));
    }
    Ok(())
}

fn decode_attribute(label: &str, attr: &proto::AttributeProto) -> Result<AttributeValue> {
    let kind = match AttributeType::try_from(attr.r#type) {
        Ok(AttributeType::Undefined) => infer_attribute_kind(attr),
        Ok(kind) => Some(attribute_kind(kind)),
        Err(_) => None,
    }
    .ok_or_else(|| {
        OnnxXlaError::Schema(format!(
            "attribute `{}` of `{label}` has unknown type {}",
            attr.name, attr.r#type
        ))
    })?;

    let utf8 = |bytes: &[u8]| {
        String::from_utf8(bytes.to_vec()).map_err(|_| {
            OnnxXlaError::MalformedInput(format!("attribute `{}` is not valid UTF-8", attr.name))
        })
    };

    Ok(match kind {
        AttributeKind::Float => AttributeValue::Float(attr.f),
        AttributeKind::Int => AttributeValue::Int(attr.i),
        AttributeKind::String => AttributeValue::String(utf8(&attr.s)?),
        AttributeKind::Tensor => {
            let tensor = attr.t.as_ref().ok_or_else(|| {
                OnnxXlaError::Schema(format!("tensor attribute `{}` has no value", attr.name))
            })?;
            AttributeValue::Tensor(decode_tensor(tensor)?)
        }
        AttributeKind::Graph => {
            let graph = attr.g.clone().ok_or_else(|| {
                OnnxXlaError::Schema(format!("graph attribute `{}` has no value", attr.name))
            })?;
            AttributeValue::Graph(Box::new(graph))
        }
        AttributeKind::Floats => AttributeValue::Floats(attr.floats.clone()),
        AttributeKind::Ints => AttributeValue::Ints(attr.ints.clone()),
        AttributeKind::Strings => AttributeValue::Strings(
            attr.strings
                .iter()
                .map(|s| utf8(s.as_slice()))
                .collect::<Result<Vec<_>>>()?,
        ),
        AttributeKind::Tensors => AttributeValue::Tensors(
            attr.tensors
                .iter()
                .map(decode_tensor)
                .collect::<Result<Vec<_>>>()?,
        ),
        AttributeKind::Graphs => AttributeValue::Graphs(attr.graphs.clone()),
    })
}

fn attribute_kind(kind: AttributeType) -> AttributeKind {
    match kind {
        AttributeType::Float | AttributeType::Undefined => AttributeKind::Float,
        AttributeType::Int => AttributeKind::Int,
        AttributeType::String => AttributeKind::String,
        AttributeType::Tensor => AttributeKind::Tensor,
        AttributeType::Graph => AttributeKind::Graph,
        AttributeType::Floats => AttributeKind::Floats,
        AttributeType::Ints => AttributeKind::Ints,
        AttributeType::Strings => AttributeKind::Strings,
        AttributeType::Tensors => AttributeKind::Tensors,
        AttributeType::Graphs => AttributeKind::Graphs,
    }
}

/// Old serializers leave `type` unset; pick the kind from whichever field carries data.
fn infer_attribute_kind(attr: &proto::AttributeProto) -> Option<AttributeKind> {
    if !attr.floats.is_empty() {
        Some(AttributeKind::Floats)
    } else if !attr.ints.is_empty() {
        Some(AttributeKind::Ints)
    } else if !attr.strings.is_empty() {
        Some(AttributeKind::Strings)
    } else if !attr.tensors.is_empty() {
        Some(AttributeKind::Tensors)
    } else if !attr.graphs.is_empty() {
        Some(AttributeKind::Graphs)
    } else if attr.t.is_some() {
        Some(AttributeKind::Tensor)
    } else if attr.g.is_some() {
        Some(AttributeKind::Graph)
    } else if !attr.s.is_empty() {
        Some(AttributeKind::String)
    } else if attr.f != 0.0 {
        Some(AttributeKind::Float)
    } else {
        Some(AttributeKind::Int)
    }
}

/// Tensor descriptor of a value; `None` when the value carries no type.
fn decode_value_type(name: &str, ty: Option<&proto::TypeProto>) -> Result<Option<TensorDesc>> {
    let Some(ty) = ty else {
        return Ok(None);
    };
    let Some(type_proto::Value::TensorType(tensor)) = &ty.value else {
        return Err(OnnxXlaError::Schema(format!(
            "value `{name}` is not a tensor"
        )));
    };
    let elem_type = decode_elem_type(tensor.elem_type)?;
    let dims = match &tensor.shape {
        Some(shape) => shape
            .dim
            .iter()
            .enumerate()
            .map(|(axis, dim)| decode_dim(name, axis, dim))
            .collect::<Result<Vec<_>>>()?,
        // Unknown rank: treated like an untyped value.
        None => return Ok(None),
    };
    Ok(Some(TensorDesc::new(elem_type, Shape::new(dims))))
}

fn decode_dim(name: &str, axis: usize, dim: &tensor_shape_proto::Dimension) -> Result<Dimension> {
    use tensor_shape_proto::dimension::Value;
    Ok(match &dim.value {
        Some(Value::DimValue(value)) if *value >= 0 => Dimension::Static(*value as usize),
        Some(Value::DimValue(value)) => {
            return Err(OnnxXlaError::MalformedInput(format!(
                "value `{name}` has negative extent {value} on axis {axis}"
            )))
        }
        Some(Value::DimParam(param)) if !param.is_empty() => {
            Dimension::Dynamic(DimSymbol::new(param.clone()))
        }
        _ => Dimension::Dynamic(DimSymbol::new(format!("{name}:{axis}"))),
    })
}

fn decode_elem_type(code: i32) -> Result<ElemType> {
    ElemType::from_onnx(code)
        .ok_or_else(|| OnnxXlaError::MalformedInput(format!("unknown element type code {code}")))
}

/// Decodes a tensor message, accepting either `raw_data` or the typed repeated fields.
pub(crate) fn decode_tensor(tensor: &proto::TensorProto) -> Result<Tensor> {
    let label = if tensor.name.is_empty() {
        "<anonymous>"
    } else {
        tensor.name.as_str()
    };
    if tensor.data_location == DataLocation::External as i32 {
        return Err(OnnxXlaError::MalformedInput(format!(
            "tensor `{label}` stores its data externally"
        )));
    }
    let elem_type = decode_elem_type(tensor.data_type)?;
    let dims = tensor
        .dims
        .iter()
        .map(|&d| {
            usize::try_from(d).map_err(|_| {
                OnnxXlaError::MalformedInput(format!("tensor `{label}` has negative dim {d}"))
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let count = dims
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| {
            OnnxXlaError::MalformedInput(format!("tensor `{label}` element count overflows"))
        })?;

    let data = if !tensor.raw_data.is_empty() {
        raw_payload(label, elem_type, &tensor.raw_data, count)?
    } else {
        typed_payload(label, elem_type, tensor)?
    };

    Tensor::new(elem_type, dims, data).map_err(|err| {
        OnnxXlaError::MalformedInput(format!("tensor `{label}` data disagrees with its dims: {err}"))
    })
}

fn raw_payload(label: &str, elem_type: ElemType, raw: &[u8], count: usize) -> Result<TensorData> {
    let size = elem_type.size_in_bytes().ok_or_else(|| {
        OnnxXlaError::MalformedInput(format!("tensor `{label}`: {elem_type} cannot use raw_data"))
    })?;
    if count.checked_mul(size) != Some(raw.len()) {
        return Err(OnnxXlaError::MalformedInput(format!(
            "tensor `{label}` has {} raw bytes, {count} x {elem_type} needs {}",
            raw.len(),
            count.saturating_mul(size)
        )));
    }
    Ok(match elem_type {
        ElemType::Float => TensorData::F32(le_chunks(raw, f32::from_le_bytes)),
        ElemType::Double => TensorData::F64(le_chunks(raw, f64::from_le_bytes)),
        ElemType::Int32 => TensorData::I32(le_chunks(raw, i32::from_le_bytes)),
        ElemType::Int64 => TensorData::I64(le_chunks(raw, i64::from_le_bytes)),
        ElemType::Uint8 => TensorData::U8(Arc::from(raw)),
        ElemType::Bool => TensorData::Bool(raw.iter().map(|&b| b != 0).collect()),
        _ => TensorData::Raw(Arc::from(raw)),
    })
}

fn le_chunks<T, const N: usize>(raw: &[u8], convert: fn([u8; N]) -> T) -> Arc<[T]> {
    raw.chunks_exact(N)
        .map(|chunk| {
            let mut bytes = [0u8; N];
            bytes.copy_from_slice(chunk);
            convert(bytes)
        })
        .collect()
}

fn typed_payload(label: &str, elem_type: ElemType, tensor: &proto::TensorProto) -> Result<TensorData> {
    // Narrow integer and half-precision types are widened into `int32_data`.
    let narrow = |size: usize| -> TensorData {
        let bytes = tensor
            .int32_data
            .iter()
            .flat_map(|&v| v.to_le_bytes().into_iter().take(size))
            .collect::<Vec<u8>>();
        TensorData::Raw(Arc::from(bytes))
    };
    Ok(match elem_type {
        ElemType::Float => TensorData::F32(Arc::from(tensor.float_data.as_slice())),
        ElemType::Double => TensorData::F64(Arc::from(tensor.double_data.as_slice())),
        ElemType::Int32 => TensorData::I32(Arc::from(tensor.int32_data.as_slice())),
        ElemType::Int64 => TensorData::I64(Arc::from(tensor.int64_data.as_slice())),
        ElemType::Uint8 => TensorData::U8(tensor.int32_data.iter().map(|&v| v as u8).collect()),
        ElemType::Bool => TensorData::Bool(tensor.int32_data.iter().map(|&v| v != 0).collect()),
        ElemType::Int8 => narrow(1),
        ElemType::Int16 | ElemType::Uint16 | ElemType::Float16 | ElemType::Bfloat16 => narrow(2),
        ElemType::Uint32 => TensorData::Raw(
            tensor
                .uint64_data
                .iter()
                .flat_map(|&v| (v as u32).to_le_bytes())
                .collect(),
        ),
        ElemType::Uint64 => TensorData::Raw(
            tensor
                .uint64_data
                .iter()
                .flat_map(|&v| v.to_le_bytes())
                .collect(),
        ),
        ElemType::Complex64 => TensorData::Raw(
            tensor
                .float_data
                .iter()
                .flat_map(|&v| v.to_le_bytes())
                .collect(),
        ),
        ElemType::Complex128 => TensorData::Raw(
            tensor
                .double_data
                .iter()
                .flat_map(|&v| v.to_le_bytes())
                .collect(),
        ),
        ElemType::String => TensorData::Strings(
            tensor
                .string_data
                .iter()
                .map(|s| {
                    String::from_utf8(s.clone()).map_err(|_| {
                        OnnxXlaError::MalformedInput(format!(
                            "tensor `{label}` holds a non-UTF-8 string"
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?
                .into(),
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onnx::{ModelBuilder, NodeBuilder};

    fn relu_model() -> ModelBuilder {
        ModelBuilder::new("relu")
            .input("x", ElemType::Float, &[2, 3])
            .output("y", ElemType::Float, &[2, 3])
            .node(NodeBuilder::new("Relu").inputs(&["x"]).outputs(&["y"]))
    }

    #[test]
    fn decodes_a_simple_graph() {
        let graph = decode(&relu_model().to_bytes()).unwrap();
        assert_eq!(graph.nodes.len(), 1);
        assert_eq!(graph.nodes[0].op_type, OpType::Relu);
        assert_eq!(graph.opset_version, 13);
        assert_eq!(graph.runtime_inputs().count(), 1);
    }

    #[test]
    fn garbage_bytes_are_malformed() {
        let err = decode(&[0xff, 0xff, 0xff, 0x01]).unwrap_err();
        assert!(matches!(err, OnnxXlaError::MalformedInput(_)));
    }

    #[test]
    fn missing_graph_is_malformed() {
        let bytes = proto::ModelProto::default().encode_to_vec();
        assert!(matches!(
            decode(&bytes).unwrap_err(),
            OnnxXlaError::MalformedInput(_)
        ));
    }

    #[test]
    fn undefined_inputs_and_duplicate_outputs_are_schema_errors() {
        let bytes = ModelBuilder::new("bad")
            .input("x", ElemType::Float, &[1])
            .output("y", ElemType::Float, &[1])
            .node(NodeBuilder::new("Relu").inputs(&["nope"]).outputs(&["y"]))
            .to_bytes();
        assert!(matches!(decode(&bytes).unwrap_err(), OnnxXlaError::Schema(_)));

        let bytes = ModelBuilder::new("dup")
            .input("x", ElemType::Float, &[1])
            .output("y", ElemType::Float, &[1])
            .node(NodeBuilder::new("Relu").inputs(&["x"]).outputs(&["y"]))
            .node(NodeBuilder::new("Neg").inputs(&["x"]).outputs(&["y"]))
            .to_bytes();
        assert!(matches!(decode(&bytes).unwrap_err(), OnnxXlaError::Schema(_)));
    }

    #[test]
    fn node_output_may_not_shadow_a_graph_input() {
        let bytes = ModelBuilder::new("shadow")
            .input("x", ElemType::Float, &[1])
            .output("x", ElemType::Float, &[1])
            .node(NodeBuilder::new("Relu").inputs(&["x"]).outputs(&["x"]))
            .to_bytes();
        assert!(matches!(decode(&bytes).unwrap_err(), OnnxXlaError::Schema(_)));
    }

    #[test]
    fn attribute_types_and_required_attributes_are_checked() {
        let bytes = ModelBuilder::new("concat")
            .input("a", ElemType::Float, &[1])
            .output("b", ElemType::Float, &[1])
            .node(NodeBuilder::new("Concat").inputs(&["a"]).outputs(&["b"]))
            .to_bytes();
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(err, OnnxXlaError::Schema(ref msg) if msg.contains("axis")));

        let bytes = ModelBuilder::new("conv")
            .input("x", ElemType::Float, &[1, 1, 3, 3])
            .input("w", ElemType::Float, &[1, 1, 1, 1])
            .output("y", ElemType::Float, &[1, 1, 3, 3])
            .node(
                NodeBuilder::new("Conv")
                    .inputs(&["x", "w"])
                    .outputs(&["y"])
                    .attr_int("strides", 1),
            )
            .to_bytes();
        assert!(matches!(decode(&bytes).unwrap_err(), OnnxXlaError::Schema(_)));
    }

    #[test]
    fn unknown_attributes_are_preserved() {
        let bytes = ModelBuilder::new("relu")
            .input("x", ElemType::Float, &[1])
            .output("y", ElemType::Float, &[1])
            .node(
                NodeBuilder::new("Relu")
                    .inputs(&["x"])
                    .outputs(&["y"])
                    .attr_string("vendor_hint", "fast"),
            )
            .to_bytes();
        let graph = decode(&bytes).unwrap();
        assert_eq!(graph.nodes[0].attr_string("vendor_hint"), Some("fast"));
    }

    #[test]
    fn arity_outside_schema_is_rejected() {
        let bytes = ModelBuilder::new("add")
            .input("x", ElemType::Float, &[1])
            .output("y", ElemType::Float, &[1])
            .node(NodeBuilder::new("Add").inputs(&["x"]).outputs(&["y"]))
            .to_bytes();
        assert!(matches!(decode(&bytes).unwrap_err(), OnnxXlaError::Schema(_)));
    }

    #[test]
    fn initializer_length_must_match_dims() {
        let bad = proto::TensorProto {
            name: "w".into(),
            dims: vec![2, 2],
            data_type: ElemType::Float.onnx_code(),
            float_data: vec![1.0, 2.0, 3.0],
            ..Default::default()
        };
        let bytes = relu_model().raw_initializer(bad).to_bytes();
        assert!(matches!(
            decode(&bytes).unwrap_err(),
            OnnxXlaError::MalformedInput(_)
        ));
    }

    #[test]
    fn unknown_element_type_is_malformed() {
        let bad = proto::TensorProto {
            name: "w".into(),
            dims: vec![1],
            data_type: 42,
            ..Default::default()
        };
        let bytes = relu_model().raw_initializer(bad).to_bytes();
        assert!(matches!(
            decode(&bytes).unwrap_err(),
            OnnxXlaError::MalformedInput(_)
        ));
    }

    #[test]
    fn raw_and_typed_payloads_decode_alike() {
        let tensor = Tensor::from_f32(&[3], vec![1.5, -2.0, 0.25]).unwrap();
        let raw = crate::onnx::builder::tensor_proto("w", &tensor);
        assert!(!raw.raw_data.is_empty());
        assert_eq!(decode_tensor(&raw).unwrap(), tensor);

        let typed = proto::TensorProto {
            raw_data: Vec::new(),
            float_data: vec![1.5, -2.0, 0.25],
            ..raw
        };
        assert_eq!(decode_tensor(&typed).unwrap(), tensor);
    }

    #[test]
    fn symbolic_and_unknown_dims_become_dynamic() {
        let bytes = ModelBuilder::new("dyn")
            .input_dims(
                "x",
                ElemType::Float,
                &[Dimension::Dynamic(DimSymbol::new("batch")), Dimension::Static(3)],
            )
            .output_unshaped("y", ElemType::Float)
            .node(NodeBuilder::new("Relu").inputs(&["x"]).outputs(&["y"]))
            .to_bytes();
        let mut graph = decode(&bytes).unwrap();
        let desc = graph.inputs[0].desc.clone().unwrap();
        assert!(!desc.shape.is_static());

        let bindings = BTreeMap::from([("batch".to_string(), 4usize)]);
        graph.bind_dims(&bindings);
        let desc = graph.inputs[0].desc.clone().unwrap();
        assert_eq!(desc.static_dims(), Some(vec![4, 3]));
    }
}
