//! Typed, validated view of an ONNX graph.

mod decode;
pub mod schema;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use crate::backend::ir::Dimension;
use crate::error::{OnnxXlaError, Result};
use crate::onnx::proto;
use crate::tensor::{Tensor, TensorDesc};

pub use decode::{decode, decode_model};

macro_rules! op_types {
    ($($variant:ident),+ $(,)?) => {
        /// Operator vocabulary understood by the compiler.
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub enum OpType {
            $($variant,)+
            /// Anything outside the vocabulary; kept so the checker can name it.
            Other(String),
        }

        impl OpType {
            pub fn from_name(name: &str) -> Self {
                match name {
                    $(stringify!($variant) => OpType::$variant,)+
                    other => OpType::Other(other.to_string()),
                }
            }

            pub fn as_str(&self) -> &str {
                match self {
                    $(OpType::$variant => stringify!($variant),)+
                    OpType::Other(name) => name,
                }
            }
        }
    };
}

op_types! {
    Add, Sub, Mul, Div, Pow, Max, Min, Sum,
    Relu, Neg, Abs, Exp, Log, Sqrt, Reciprocal, Sigmoid, Tanh,
    Identity, Dropout,
    Gemm, MatMul,
    Conv, MaxPool, AveragePool, GlobalAveragePool, GlobalMaxPool,
    BatchNormalization, LRN, Softmax,
    Concat, Transpose, Reshape, Flatten, Squeeze, Unsqueeze, Constant,
    ReduceSum, ReduceMean, ReduceMax, ReduceMin,
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeKind {
    Float,
    Int,
    String,
    Tensor,
    Graph,
    Floats,
    Ints,
    Strings,
    Tensors,
    Graphs,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Float(f32),
    Int(i64),
    String(String),
    Tensor(Tensor),
    /// Subgraphs are carried undecoded; no supported operator consumes them.
    Graph(Box<proto::GraphProto>),
    Floats(Vec<f32>),
    Ints(Vec<i64>),
    Strings(Vec<String>),
    Tensors(Vec<Tensor>),
    Graphs(Vec<proto::GraphProto>),
}

impl AttributeValue {
    pub fn kind(&self) -> AttributeKind {
        match self {
            AttributeValue::Float(_) => AttributeKind::Float,
            AttributeValue::Int(_) => AttributeKind::Int,
            AttributeValue::String(_) => AttributeKind::String,
            AttributeValue::Tensor(_) => AttributeKind::Tensor,
            AttributeValue::Graph(_) => AttributeKind::Graph,
            AttributeValue::Floats(_) => AttributeKind::Floats,
            AttributeValue::Ints(_) => AttributeKind::Ints,
            AttributeValue::Strings(_) => AttributeKind::Strings,
            AttributeValue::Tensors(_) => AttributeKind::Tensors,
            AttributeValue::Graphs(_) => AttributeKind::Graphs,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub name: String,
    pub op_type: OpType,
    pub domain: String,
    /// Input names in schema order; empty strings are omitted optional inputs.
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub attributes: BTreeMap<String, AttributeValue>,
}

impl Node {
    /// Name used in diagnostics: the node name, or `op(first_output)` when unnamed.
    pub fn display_name(&self) -> String {
        if !self.name.is_empty() {
            return self.name.clone();
        }
        match self.outputs.first() {
            Some(output) => format!("{}({output})", self.op_type),
            None => self.op_type.to_string(),
        }
    }

    /// True for the ONNX default operator set (`""` or `"ai.onnx"`).
    pub fn in_default_domain(&self) -> bool {
        is_default_domain(&self.domain)
    }

    pub fn input(&self, index: usize) -> Option<&str> {
        self.inputs
            .get(index)
            .map(String::as_str)
            .filter(|name| !name.is_empty())
    }

    pub fn output(&self, index: usize) -> Option<&str> {
        self.outputs
            .get(index)
            .map(String::as_str)
            .filter(|name| !name.is_empty())
    }

    /// Present (non-empty) outputs after the first.
    pub fn extra_outputs(&self) -> impl Iterator<Item = &str> {
        self.outputs
            .iter()
            .skip(1)
            .map(String::as_str)
            .filter(|name| !name.is_empty())
    }

    pub fn attr(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    pub fn attr_int(&self, name: &str) -> Option<i64> {
        match self.attr(name)? {
            AttributeValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn attr_float(&self, name: &str) -> Option<f32> {
        match self.attr(name)? {
            AttributeValue::Float(value) => Some(*value),
            _ => None,
        }
    }

    pub fn attr_ints(&self, name: &str) -> Option<&[i64]> {
        match self.attr(name)? {
            AttributeValue::Ints(values) => Some(values),
            _ => None,
        }
    }

    pub fn attr_floats(&self, name: &str) -> Option<&[f32]> {
        match self.attr(name)? {
            AttributeValue::Floats(values) => Some(values),
            _ => None,
        }
    }

    pub fn attr_string(&self, name: &str) -> Option<&str> {
        match self.attr(name)? {
            AttributeValue::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn attr_tensor(&self, name: &str) -> Option<&Tensor> {
        match self.attr(name)? {
            AttributeValue::Tensor(value) => Some(value),
            _ => None,
        }
    }
}

pub(crate) fn is_default_domain(domain: &str) -> bool {
    domain.is_empty() || domain == "ai.onnx"
}

/// Named graph input or output. Outputs may omit their type.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueInfo {
    pub name: String,
    pub desc: Option<TensorDesc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Graph {
    pub name: String,
    pub producer_name: String,
    pub producer_version: String,
    pub ir_version: i64,
    /// Version of the default operator set.
    pub opset_version: i64,
    /// Graph inputs in declaration order, including any that are also initializers.
    pub inputs: Vec<ValueInfo>,
    pub outputs: Vec<ValueInfo>,
    pub initializers: BTreeMap<String, Tensor>,
    pub value_info: HashMap<String, TensorDesc>,
    pub nodes: Vec<Node>,
    pub metadata: BTreeMap<String, String>,
}

impl Graph {
    /// Inputs the caller must feed at run time (initializers excluded).
    pub fn runtime_inputs(&self) -> impl Iterator<Item = &ValueInfo> {
        self.inputs
            .iter()
            .filter(|input| !self.initializers.contains_key(&input.name))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// True when `name` feeds a node or is a graph output.
    pub fn is_consumed(&self, name: &str) -> bool {
        self.outputs.iter().any(|output| output.name == name)
            || self
                .nodes
                .iter()
                .any(|node| node.inputs.iter().any(|input| input == name))
    }

    /// Replaces named dynamic dimensions on graph inputs and outputs with bound values.
    pub fn bind_dims(&mut self, bindings: &BTreeMap<String, usize>) {
        if bindings.is_empty() {
            return;
        }
        let descs = self
            .inputs
            .iter_mut()
            .chain(self.outputs.iter_mut())
            .filter_map(|info| info.desc.as_mut())
            .chain(self.value_info.values_mut());
        for desc in descs {
            for dim in desc.shape.dims_mut() {
                if let Dimension::Dynamic(symbol) = dim {
                    if let Some(&value) = bindings.get(symbol.as_str()) {
                        *dim = Dimension::Static(value);
                    }
                }
            }
        }
    }

    /// Turns named runtime inputs into constant weights.
    ///
    /// Fails when the graph already carries initializers, when a name is not a runtime
    /// input, or when a tensor disagrees with the declared descriptor.
    pub fn bind_weights(&mut self, weights: Vec<(String, Tensor)>) -> Result<()> {
        if weights.is_empty() {
            return Ok(());
        }
        if !self.initializers.is_empty() {
            return Err(OnnxXlaError::Schema(
                "a model with initializers cannot also take weight descriptors".into(),
            ));
        }
        let mut seen = HashSet::new();
        for (name, tensor) in weights {
            if !seen.insert(name.clone()) {
                return Err(OnnxXlaError::InvalidArgument(format!(
                    "weight `{name}` is given twice"
                )));
            }
            let declared = self
                .inputs
                .iter()
                .find(|input| input.name == name)
                .ok_or_else(|| {
                    OnnxXlaError::InvalidArgument(format!("weight `{name}` is not a graph input"))
                })?;
            if let Some(desc) = &declared.desc {
                if !desc_accepts(desc, &tensor) {
                    return Err(OnnxXlaError::InputMismatch(format!(
                        "weight `{name}` is {}, graph declares {desc}",
                        tensor.desc()
                    )));
                }
            }
            self.initializers.insert(name, tensor);
        }
        Ok(())
    }
}

/// Whether `tensor` can bind to `desc` (dynamic dims accept any extent).
pub(crate) fn desc_accepts(desc: &TensorDesc, tensor: &Tensor) -> bool {
    desc.elem_type == tensor.elem_type()
        && desc.shape.rank() == tensor.dims().len()
        && desc
            .shape
            .dims()
            .iter()
            .zip(tensor.dims())
            .all(|(dim, &actual)| dim.as_static().map_or(true, |d| d == actual))
}
