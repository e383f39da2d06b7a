//! Programmatic construction of ONNX models.
//!
//! ```ignore
//! let bytes = ModelBuilder::new("relu")
//!     .input("x", ElemType::Float, &[2, 3])
//!     .output("y", ElemType::Float, &[2, 3])
//!     .node(NodeBuilder::new("Relu").inputs(&["x"]).outputs(&["y"]))
//!     .to_bytes();
//! ```

use prost::Message;

use crate::backend::ir::Dimension;
use crate::onnx::proto::{
    self, attribute_proto::AttributeType, tensor_shape_proto, type_proto, AttributeProto,
    GraphProto, ModelProto, NodeProto, OperatorSetIdProto, TensorProto, TensorShapeProto,
    TypeProto, ValueInfoProto,
};
use crate::tensor::{ElemType, Tensor, TensorData};

/// Opset used when the caller does not pick one.
pub const DEFAULT_OPSET: i64 = 13;

const IR_VERSION: i64 = 8;

pub struct ModelBuilder {
    graph_name: String,
    opset: i64,
    producer_name: String,
    inputs: Vec<ValueInfoProto>,
    outputs: Vec<ValueInfoProto>,
    value_info: Vec<ValueInfoProto>,
    initializers: Vec<TensorProto>,
    nodes: Vec<NodeProto>,
}

impl ModelBuilder {
    pub fn new(graph_name: impl Into<String>) -> Self {
        Self {
            graph_name: graph_name.into(),
            opset: DEFAULT_OPSET,
            producer_name: env!("CARGO_PKG_NAME").to_string(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            value_info: Vec::new(),
            initializers: Vec::new(),
            nodes: Vec::new(),
        }
    }

    pub fn opset(mut self, version: i64) -> Self {
        self.opset = version;
        self
    }

    pub fn producer(mut self, name: impl Into<String>) -> Self {
        self.producer_name = name.into();
        self
    }

    pub fn input(self, name: &str, elem_type: ElemType, dims: &[usize]) -> Self {
        let dims = dims.iter().map(|&d| Dimension::Static(d)).collect::<Vec<_>>();
        self.input_dims(name, elem_type, &dims)
    }

    /// Graph input whose dims may be symbolic.
    pub fn input_dims(mut self, name: &str, elem_type: ElemType, dims: &[Dimension]) -> Self {
        self.inputs.push(value_info(name, elem_type, Some(dims)));
        self
    }

    pub fn output(mut self, name: &str, elem_type: ElemType, dims: &[usize]) -> Self {
        let dims = dims.iter().map(|&d| Dimension::Static(d)).collect::<Vec<_>>();
        self.outputs.push(value_info(name, elem_type, Some(&dims)));
        self
    }

    /// Graph output with an element type but no declared shape.
    pub fn output_unshaped(mut self, name: &str, elem_type: ElemType) -> Self {
        self.outputs.push(value_info(name, elem_type, None));
        self
    }

    pub fn value_info(mut self, name: &str, elem_type: ElemType, dims: &[usize]) -> Self {
        let dims = dims.iter().map(|&d| Dimension::Static(d)).collect::<Vec<_>>();
        self.value_info.push(value_info(name, elem_type, Some(&dims)));
        self
    }

    pub fn initializer(mut self, name: &str, tensor: &Tensor) -> Self {
        self.initializers.push(tensor_proto(name, tensor));
        self
    }

    /// Adds a raw initializer message, for payloads `Tensor` cannot express.
    pub fn raw_initializer(mut self, tensor: TensorProto) -> Self {
        self.initializers.push(tensor);
        self
    }

    pub fn node(mut self, node: NodeBuilder) -> Self {
        self.nodes.push(node.build());
        self
    }

    pub fn build(self) -> ModelProto {
        ModelProto {
            ir_version: IR_VERSION,
            producer_name: self.producer_name,
            producer_version: env!("CARGO_PKG_VERSION").to_string(),
            opset_import: vec![OperatorSetIdProto {
                domain: String::new(),
                version: self.opset,
            }],
            graph: Some(GraphProto {
                name: self.graph_name,
                node: self.nodes,
                initializer: self.initializers,
                input: self.inputs,
                output: self.outputs,
                value_info: self.value_info,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn to_bytes(self) -> Vec<u8> {
        self.build().encode_to_vec()
    }
}

pub struct NodeBuilder {
    proto: NodeProto,
}

impl NodeBuilder {
    pub fn new(op_type: &str) -> Self {
        Self {
            proto: NodeProto {
                op_type: op_type.to_string(),
                ..Default::default()
            },
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.proto.name = name.to_string();
        self
    }

    pub fn domain(mut self, domain: &str) -> Self {
        self.proto.domain = domain.to_string();
        self
    }

    /// Input names; an empty string marks an omitted optional input.
    pub fn inputs(mut self, names: &[&str]) -> Self {
        self.proto.input = names.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn outputs(mut self, names: &[&str]) -> Self {
        self.proto.output = names.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn attr_int(self, name: &str, value: i64) -> Self {
        self.attr(AttributeProto {
            i: value,
            r#type: AttributeType::Int as i32,
            ..named(name)
        })
    }

    pub fn attr_ints(self, name: &str, values: &[i64]) -> Self {
        self.attr(AttributeProto {
            ints: values.to_vec(),
            r#type: AttributeType::Ints as i32,
            ..named(name)
        })
    }

    pub fn attr_float(self, name: &str, value: f32) -> Self {
        self.attr(AttributeProto {
            f: value,
            r#type: AttributeType::Float as i32,
            ..named(name)
        })
    }

    pub fn attr_floats(self, name: &str, values: &[f32]) -> Self {
        self.attr(AttributeProto {
            floats: values.to_vec(),
            r#type: AttributeType::Floats as i32,
            ..named(name)
        })
    }

    pub fn attr_string(self, name: &str, value: &str) -> Self {
        self.attr(AttributeProto {
            s: value.as_bytes().to_vec(),
            r#type: AttributeType::String as i32,
            ..named(name)
        })
    }

    pub fn attr_tensor(self, name: &str, tensor: &Tensor) -> Self {
        self.attr(AttributeProto {
            t: Some(tensor_proto("", tensor)),
            r#type: AttributeType::Tensor as i32,
            ..named(name)
        })
    }

    /// Appends a pre-built attribute verbatim.
    pub fn attr(mut self, attribute: AttributeProto) -> Self {
        self.proto.attribute.push(attribute);
        self
    }

    pub fn build(self) -> NodeProto {
        self.proto
    }
}

fn named(name: &str) -> AttributeProto {
    AttributeProto {
        name: name.to_string(),
        ..Default::default()
    }
}

fn value_info(name: &str, elem_type: ElemType, dims: Option<&[Dimension]>) -> ValueInfoProto {
    let shape = dims.map(|dims| TensorShapeProto {
        dim: dims
            .iter()
            .map(|dim| tensor_shape_proto::Dimension {
                value: Some(match dim {
                    Dimension::Static(value) => {
                        tensor_shape_proto::dimension::Value::DimValue(*value as i64)
                    }
                    Dimension::Dynamic(symbol) => {
                        tensor_shape_proto::dimension::Value::DimParam(symbol.as_str().to_string())
                    }
                }),
                ..Default::default()
            })
            .collect(),
    });
    ValueInfoProto {
        name: name.to_string(),
        r#type: Some(TypeProto {
            value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                elem_type: elem_type.onnx_code(),
                shape,
            })),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Encodes a host tensor. Floats go through `raw_data` so both payload paths get exercised
/// by decoders.
pub fn tensor_proto(name: &str, tensor: &Tensor) -> TensorProto {
    let mut proto = TensorProto {
        name: name.to_string(),
        dims: tensor.dims().iter().map(|&d| d as i64).collect(),
        data_type: tensor.elem_type().onnx_code(),
        ..Default::default()
    };
    match tensor.data() {
        TensorData::F32(values) => {
            proto.raw_data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        }
        TensorData::F64(values) => proto.double_data = values.to_vec(),
        TensorData::I32(values) => proto.int32_data = values.to_vec(),
        TensorData::I64(values) => proto.int64_data = values.to_vec(),
        TensorData::U8(values) => proto.int32_data = values.iter().map(|&v| v as i32).collect(),
        TensorData::Bool(values) => proto.int32_data = values.iter().map(|&v| v as i32).collect(),
        TensorData::Strings(values) => {
            proto.string_data = values.iter().map(|s| s.as_bytes().to_vec()).collect();
        }
        TensorData::Raw(bytes) => proto.raw_data = bytes.to_vec(),
    }
    proto
}

/// Shorthand for tests that need to tweak a decoded message.
pub fn decode_model(bytes: &[u8]) -> Result<ModelProto, prost::DecodeError> {
    proto::ModelProto::decode(bytes)
}
