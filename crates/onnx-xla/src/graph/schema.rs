//! Per-operator structural schema: arity and attribute types.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use super::{AttributeKind, OpType};

/// Unbounded upper arity.
pub const VARIADIC: usize = usize::MAX;

#[derive(Debug, Clone, Copy)]
pub struct AttrSchema {
    pub name: &'static str,
    pub kind: AttributeKind,
    pub required: bool,
}

#[derive(Debug, Clone)]
pub struct OpSchema {
    pub min_inputs: usize,
    pub max_inputs: usize,
    pub min_outputs: usize,
    pub max_outputs: usize,
    pub attributes: Vec<AttrSchema>,
}

impl OpSchema {
    fn new(inputs: (usize, usize), outputs: (usize, usize)) -> Self {
        Self {
            min_inputs: inputs.0,
            max_inputs: inputs.1,
            min_outputs: outputs.0,
            max_outputs: outputs.1,
            attributes: Vec::new(),
        }
    }

    fn attr(mut self, name: &'static str, kind: AttributeKind) -> Self {
        self.attributes.push(AttrSchema {
            name,
            kind,
            required: false,
        });
        self
    }

    fn required(mut self, name: &'static str, kind: AttributeKind) -> Self {
        self.attributes.push(AttrSchema {
            name,
            kind,
            required: true,
        });
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&AttrSchema> {
        self.attributes.iter().find(|attr| attr.name == name)
    }

    pub fn required_attributes(&self) -> impl Iterator<Item = &AttrSchema> {
        self.attributes.iter().filter(|attr| attr.required)
    }
}

static SCHEMAS: Lazy<HashMap<OpType, OpSchema>> = Lazy::new(build_schemas);

/// Schema for a vocabulary operator; `None` for [`OpType::Other`].
pub fn schema_for(op: &OpType) -> Option<&'static OpSchema> {
    SCHEMAS.get(op)
}

fn build_schemas() -> HashMap<OpType, OpSchema> {
    use AttributeKind::{Float, Floats, Int, Ints, String, Tensor};

    let one = (1, 1);
    let mut table = HashMap::new();

    for op in [OpType::Add, OpType::Sub, OpType::Mul, OpType::Div, OpType::Pow] {
        // `broadcast`/`axis` are the pre-opset-7 broadcasting controls.
        table.insert(
            op,
            OpSchema::new((2, 2), one)
                .attr("broadcast", Int)
                .attr("axis", Int),
        );
    }
    for op in [OpType::Max, OpType::Min, OpType::Sum] {
        table.insert(op, OpSchema::new((1, VARIADIC), one));
    }
    for op in [
        OpType::Relu,
        OpType::Neg,
        OpType::Abs,
        OpType::Exp,
        OpType::Log,
        OpType::Sqrt,
        OpType::Reciprocal,
        OpType::Sigmoid,
        OpType::Tanh,
        OpType::Identity,
        OpType::GlobalAveragePool,
        OpType::GlobalMaxPool,
    ] {
        table.insert(op, OpSchema::new(one, one));
    }
    table.insert(
        OpType::Dropout,
        OpSchema::new((1, 3), (1, 2))
            .attr("ratio", Float)
            .attr("seed", Int)
            .attr("is_test", Int),
    );
    table.insert(
        OpType::Gemm,
        OpSchema::new((2, 3), one)
            .attr("alpha", Float)
            .attr("beta", Float)
            .attr("transA", Int)
            .attr("transB", Int)
            .attr("broadcast", Int),
    );
    table.insert(OpType::MatMul, OpSchema::new((2, 2), one));
    table.insert(
        OpType::Conv,
        OpSchema::new((2, 3), one)
            .attr("auto_pad", String)
            .attr("dilations", Ints)
            .attr("group", Int)
            .attr("kernel_shape", Ints)
            .attr("pads", Ints)
            .attr("strides", Ints),
    );
    table.insert(
        OpType::MaxPool,
        OpSchema::new(one, (1, 2))
            .attr("auto_pad", String)
            .attr("ceil_mode", Int)
            .attr("dilations", Ints)
            .required("kernel_shape", Ints)
            .attr("pads", Ints)
            .attr("storage_order", Int)
            .attr("strides", Ints),
    );
    table.insert(
        OpType::AveragePool,
        OpSchema::new(one, one)
            .attr("auto_pad", String)
            .attr("ceil_mode", Int)
            .attr("count_include_pad", Int)
            .required("kernel_shape", Ints)
            .attr("pads", Ints)
            .attr("strides", Ints),
    );
    table.insert(
        OpType::BatchNormalization,
        OpSchema::new((5, 5), (1, 5))
            .attr("epsilon", Float)
            .attr("momentum", Float)
            .attr("spatial", Int)
            .attr("is_test", Int)
            .attr("training_mode", Int),
    );
    table.insert(
        OpType::LRN,
        OpSchema::new(one, one)
            .attr("alpha", Float)
            .attr("beta", Float)
            .attr("bias", Float)
            .required("size", Int),
    );
    table.insert(OpType::Softmax, OpSchema::new(one, one).attr("axis", Int));
    table.insert(
        OpType::Concat,
        OpSchema::new((1, VARIADIC), one).required("axis", Int),
    );
    table.insert(OpType::Transpose, OpSchema::new(one, one).attr("perm", Ints));
    table.insert(
        OpType::Reshape,
        OpSchema::new((1, 2), one)
            .attr("shape", Ints)
            .attr("allowzero", Int),
    );
    table.insert(OpType::Flatten, OpSchema::new(one, one).attr("axis", Int));
    for op in [OpType::Squeeze, OpType::Unsqueeze] {
        table.insert(op, OpSchema::new((1, 2), one).attr("axes", Ints));
    }
    table.insert(
        OpType::Constant,
        OpSchema::new((0, 0), one)
            .attr("value", Tensor)
            .attr("value_float", Float)
            .attr("value_floats", Floats)
            .attr("value_int", Int)
            .attr("value_ints", Ints),
    );
    for op in [
        OpType::ReduceSum,
        OpType::ReduceMean,
        OpType::ReduceMax,
        OpType::ReduceMin,
    ] {
        table.insert(
            op,
            OpSchema::new((1, 2), one)
                .attr("axes", Ints)
                .attr("keepdims", Int)
                .attr("noop_with_empty_axes", Int),
        );
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pooling_requires_kernel_shape() {
        for op in [OpType::MaxPool, OpType::AveragePool] {
            let schema = schema_for(&op).unwrap();
            let required = schema.required_attributes().map(|a| a.name).collect::<Vec<_>>();
            assert_eq!(required, vec!["kernel_shape"]);
        }
    }

    #[test]
    fn unknown_operators_have_no_schema() {
        assert!(schema_for(&OpType::Other("Gather".into())).is_none());
        assert!(schema_for(&OpType::Concat).is_some());
    }
}
