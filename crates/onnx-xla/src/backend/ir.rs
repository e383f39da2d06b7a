use std::{collections::HashMap, fmt, sync::Arc};

use serde::{ser::SerializeStruct, Serialize};

use crate::backend::legality::DeviceCapabilities;

/// Scalar element types a lowered program may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DType {
    F32,
    Si64,
}

impl DType {
    pub fn is_float(self) -> bool {
        matches!(self, DType::F32)
    }

    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::F32 => 4,
            DType::Si64 => 8,
        }
    }
}

/// Names a symbolic dynamic dimension (e.g. `batch`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DimSymbol(Arc<str>);

impl DimSymbol {
    pub fn new(name: impl Into<String>) -> Self {
        Self(Arc::<str>::from(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Serialize for DimSymbol {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

/// Represents a single axis extent in a tensor shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum Dimension {
    Static(usize),
    Dynamic(DimSymbol),
}

impl Dimension {
    pub fn as_static(&self) -> Option<usize> {
        match self {
            Dimension::Static(value) => Some(*value),
            Dimension::Dynamic(_) => None,
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dimension::Static(value) => write!(f, "{value}"),
            Dimension::Dynamic(sym) => write!(f, "?{}", sym.as_str()),
        }
    }
}

/// Logical tensor shape as an ordered list of dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Shape {
    dims: Vec<Dimension>,
}

impl Shape {
    pub fn new(dims: impl Into<Vec<Dimension>>) -> Self {
        Self { dims: dims.into() }
    }

    pub fn from_static(dims: &[usize]) -> Self {
        Self {
            dims: dims.iter().copied().map(Dimension::Static).collect(),
        }
    }

    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[Dimension] {
        &self.dims
    }

    pub fn dims_mut(&mut self) -> &mut [Dimension] {
        &mut self.dims
    }

    /// Returns static dimensions when all dims are static.
    pub fn static_dims(&self) -> Option<Vec<usize>> {
        self.dims.iter().map(Dimension::as_static).collect()
    }

    pub fn is_static(&self) -> bool {
        self.dims.iter().all(|dim| dim.as_static().is_some())
    }

    /// Returns element count when all dims are static.
    pub fn element_count(&self) -> Option<usize> {
        let mut count = 1usize;
        for dim in &self.dims {
            count = count.checked_mul(dim.as_static()?)?;
        }
        Some(count)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dims.is_empty() {
            return f.write_str("[]");
        }
        let dims = self
            .dims
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        f.write_str(&dims.join("x"))
    }
}

/// Tensor metadata coupling dtype and shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TensorSpec {
    pub dtype: DType,
    pub shape: Shape,
}

impl TensorSpec {
    pub fn new(dtype: DType, shape: Shape) -> Self {
        Self { dtype, shape }
    }

    pub fn from_dims(dtype: DType, dims: &[usize]) -> Self {
        Self::new(dtype, Shape::from_static(dims))
    }

    pub fn element_count(&self) -> Option<usize> {
        self.shape.element_count()
    }

    pub fn static_dims(&self) -> Option<Vec<usize>> {
        self.shape.static_dims()
    }
}

impl fmt::Display for TensorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tensor<{:?} x {}>", self.dtype, self.shape)
    }
}

/// Typed element storage for a literal.
#[derive(Debug, Clone, PartialEq)]
pub enum LiteralData {
    F32(Arc<[f32]>),
    Si64(Arc<[i64]>),
}

impl LiteralData {
    pub fn len(&self) -> usize {
        match self {
            LiteralData::F32(values) => values.len(),
            LiteralData::Si64(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> DType {
        match self {
            LiteralData::F32(_) => DType::F32,
            LiteralData::Si64(_) => DType::Si64,
        }
    }
}

/// Dense literal tensor payload.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorLiteral {
    pub spec: TensorSpec,
    pub data: LiteralData,
}

impl TensorLiteral {
    /// Builds a literal, checking that the payload matches the static shape.
    pub fn new(spec: TensorSpec, data: LiteralData) -> BackendResult<Self> {
        if spec.dtype != data.dtype() {
            return Err(BackendError::contract(
                ContractErrorCode::DTypeNotSupported,
                format!(
                    "literal payload is {:?} but spec declares {:?}",
                    data.dtype(),
                    spec.dtype
                ),
            ));
        }
        let expected = spec.element_count().ok_or_else(|| {
            BackendError::contract(
                ContractErrorCode::DynamicDimension,
                "literals require static shapes".to_string(),
            )
        })?;
        if expected != data.len() {
            return Err(BackendError::contract(
                ContractErrorCode::ShapeMismatch,
                format!(
                    "literal of shape {} expects {expected} elements, got {}",
                    spec.shape,
                    data.len()
                ),
            ));
        }
        Ok(Self { spec, data })
    }

    pub fn from_f32(dims: &[usize], values: impl Into<Arc<[f32]>>) -> BackendResult<Self> {
        Self::new(
            TensorSpec::from_dims(DType::F32, dims),
            LiteralData::F32(values.into()),
        )
    }

    pub fn from_i64(dims: &[usize], values: impl Into<Arc<[i64]>>) -> BackendResult<Self> {
        Self::new(
            TensorSpec::from_dims(DType::Si64, dims),
            LiteralData::Si64(values.into()),
        )
    }

    pub fn scalar_f32(value: f32) -> Self {
        Self {
            spec: TensorSpec::from_dims(DType::F32, &[]),
            data: LiteralData::F32(Arc::from(vec![value])),
        }
    }

    pub fn scalar_i64(value: i64) -> Self {
        Self {
            spec: TensorSpec::from_dims(DType::Si64, &[]),
            data: LiteralData::Si64(Arc::from(vec![value])),
        }
    }

    /// Literal of `dims` with every element equal to `value`.
    pub fn filled_f32(dims: &[usize], value: f32) -> Self {
        let count = dims.iter().product();
        Self {
            spec: TensorSpec::from_dims(DType::F32, dims),
            data: LiteralData::F32(Arc::from(vec![value; count])),
        }
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            LiteralData::F32(values) => Some(values),
            LiteralData::Si64(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<&[i64]> {
        match &self.data {
            LiteralData::Si64(values) => Some(values),
            LiteralData::F32(_) => None,
        }
    }
}

impl Serialize for TensorLiteral {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("TensorLiteral", 2)?;
        state.serialize_field("spec", &self.spec)?;
        match &self.data {
            LiteralData::F32(values) => state.serialize_field("f32", values.as_ref())?,
            LiteralData::Si64(values) => state.serialize_field("si64", values.as_ref())?,
        }
        state.end()
    }
}

/// Elementwise unary ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ElementwiseUnaryOp {
    Neg,
    Abs,
    Exp,
    Log,
    Sqrt,
    Rsqrt,
    Reciprocal,
    Tanh,
    Sigmoid,
}

/// Elementwise binary ops. Operands must already share one shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ElementwiseBinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Maximum,
    Minimum,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ReduceKind {
    Sum,
    Max,
    Min,
}

/// Fully describes a `dot_general` contraction.
///
/// The result layout is `[batch..., lhs_free..., rhs_free...]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DotGeneralSpec {
    pub batch_lhs: Vec<usize>,
    pub batch_rhs: Vec<usize>,
    pub contract_lhs: Vec<usize>,
    pub contract_rhs: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReduceSpec {
    pub kind: ReduceKind,
    pub axes: Vec<usize>,
    pub keepdims: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ReshapeSpec {
    pub new_shape: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransposeSpec {
    pub perm: Vec<usize>,
}

/// Numpy-style broadcast: operand dims align with the trailing result dims.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct BroadcastToSpec {
    pub result_shape: Shape,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConcatSpec {
    pub axis: usize,
}

/// Sliding-window reduction. Padded positions contribute nothing to the window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReduceWindowSpec {
    pub window_dims: Vec<usize>,
    pub strides: Vec<usize>,
    pub padding: Vec<(usize, usize)>,
    pub window_dilation: Vec<usize>,
    pub reduce: ReduceKind,
}

/// Grouped N-d convolution over `[N, C, spatial...]` inputs and `[M, C/groups, k...]` kernels.
///
/// A third operand, when present, is a `[M]` bias added after full accumulation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConvSpec {
    pub strides: Vec<usize>,
    pub padding: Vec<(usize, usize)>,
    pub dilations: Vec<usize>,
    pub groups: usize,
}

/// Unique identifier for SSA values in a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ValueId(pub u32);

/// Operand reference in an instruction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Operand {
    Value(ValueId),
    Literal(TensorLiteral),
}

/// Declarative form of lowered operations.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Operation {
    Constant(TensorLiteral),
    ElementwiseUnary(ElementwiseUnaryOp),
    ElementwiseBinary(ElementwiseBinaryOp),
    BroadcastTo(BroadcastToSpec),
    Reshape(ReshapeSpec),
    Transpose(TransposeSpec),
    Concat(ConcatSpec),
    DotGeneral(DotGeneralSpec),
    Reduce(ReduceSpec),
    ReduceWindow(ReduceWindowSpec),
    Conv(ConvSpec),
}

impl Operation {
    pub fn label(&self) -> &'static str {
        match self {
            Operation::Constant(_) => "constant",
            Operation::ElementwiseUnary(_) => "elementwise_unary",
            Operation::ElementwiseBinary(_) => "elementwise_binary",
            Operation::BroadcastTo(_) => "broadcast_to",
            Operation::Reshape(_) => "reshape",
            Operation::Transpose(_) => "transpose",
            Operation::Concat(_) => "concat",
            Operation::DotGeneral(_) => "dot_general",
            Operation::Reduce(_) => "reduce",
            Operation::ReduceWindow(_) => "reduce_window",
            Operation::Conv(_) => "conv",
        }
    }
}

/// Single SSA instruction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Instruction {
    pub id: ValueId,
    pub op: Operation,
    pub operands: Vec<Operand>,
    pub output: TensorSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Function {
    pub name: String,
    pub parameters: Vec<TensorSpec>,
    pub parameter_ids: Vec<ValueId>,
    pub results: Vec<TensorSpec>,
    pub body: Vec<Instruction>,
    pub result_ids: Vec<ValueId>,
}

impl Function {
    /// Returns the smallest id not yet used by a parameter or instruction.
    pub fn next_value_id(&self) -> ValueId {
        let max = self
            .parameter_ids
            .iter()
            .chain(self.body.iter().map(|inst| &inst.id))
            .map(|id| id.0)
            .max();
        ValueId(max.map_or(0, |max| max + 1))
    }
}

/// Complete lowered module.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Program {
    pub entry: String,
    pub functions: Vec<Function>,
}

impl Program {
    pub fn new(entry: impl Into<String>) -> Self {
        Self {
            entry: entry.into(),
            functions: Vec::new(),
        }
    }

    pub fn with_functions(mut self, functions: Vec<Function>) -> Self {
        self.functions = functions;
        self
    }

    pub fn entry_function(&self) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == self.entry)
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_line(
            f,
            0,
            &format!("program @{} {{", self.entry),
        )?;
        for function in &self.functions {
            fmt_function(function, 1, f)?;
        }
        write_line(f, 0, "}")
    }
}

fn fmt_function(function: &Function, indent: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write_line(f, indent, &format!("func @{} {{", function.name))?;
    if !function.parameter_ids.is_empty() {
        write_line(f, indent + 1, "params:")?;
        for (value_id, spec) in function.parameter_ids.iter().zip(&function.parameters) {
            write_line(f, indent + 2, &format!("%{} : {spec}", value_id.0))?;
        }
    }
    if !function.body.is_empty() {
        write_line(f, indent + 1, "body:")?;
        for instruction in &function.body {
            fmt_instruction(instruction, indent + 2, f)?;
        }
    }
    if !function.result_ids.is_empty() {
        write_line(f, indent + 1, "results:")?;
        for (value_id, spec) in function.result_ids.iter().zip(&function.results) {
            write_line(f, indent + 2, &format!("%{} : {spec}", value_id.0))?;
        }
    }
    write_line(f, indent, "}")
}

fn fmt_instruction(
    instruction: &Instruction,
    indent: usize,
    f: &mut fmt::Formatter<'_>,
) -> fmt::Result {
    let operands = instruction
        .operands
        .iter()
        .map(format_operand)
        .collect::<Vec<_>>()
        .join(", ");
    let op_repr = match &instruction.op {
        Operation::Constant(literal) => format!("Constant({})", literal.spec),
        other => format!("{other:?}"),
    };
    let line = if operands.is_empty() {
        format!("%{} = {} -> {}", instruction.id.0, op_repr, instruction.output)
    } else {
        format!(
            "%{} = {}({}) -> {}",
            instruction.id.0, op_repr, operands, instruction.output
        )
    };
    write_line(f, indent, &line)
}

fn format_operand(operand: &Operand) -> String {
    match operand {
        Operand::Value(id) => format!("%{}", id.0),
        Operand::Literal(lit) => format!("literal({})", lit.spec),
    }
}

fn write_line(f: &mut fmt::Formatter<'_>, indent: usize, line: &str) -> fmt::Result {
    for _ in 0..indent {
        f.write_str("  ")?;
    }
    writeln!(f, "{line}")
}

/// Lightweight builder for constructing functions programmatically.
#[derive(Default)]
pub struct ProgramBuilder {
    next_value_id: u32,
    parameters: Vec<(ValueId, TensorSpec)>,
    instructions: Vec<Instruction>,
    value_types: HashMap<ValueId, TensorSpec>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_parameter(&mut self, spec: TensorSpec) -> ValueId {
        let id = ValueId(self.next_value_id);
        self.next_value_id += 1;
        self.value_types.insert(id, spec.clone());
        self.parameters.push((id, spec));
        id
    }

    pub fn emit_single(
        &mut self,
        op: Operation,
        operands: Vec<Operand>,
        output: TensorSpec,
    ) -> ValueId {
        let id = ValueId(self.next_value_id);
        self.next_value_id += 1;
        self.value_types.insert(id, output.clone());
        self.instructions.push(Instruction {
            id,
            op,
            operands,
            output,
        });
        id
    }

    pub fn value_type(&self, id: ValueId) -> Option<&TensorSpec> {
        self.value_types.get(&id)
    }

    pub fn instruction_count(&self) -> usize {
        self.instructions.len()
    }

    pub fn finish(self, name: impl Into<String>, result_ids: Vec<ValueId>) -> BackendResult<Function> {
        let mut results = Vec::with_capacity(result_ids.len());
        for id in &result_ids {
            let spec = self.value_types.get(id).ok_or_else(|| {
                BackendError::execution(format!("result value %{} has no recorded type", id.0))
            })?;
            results.push(spec.clone());
        }
        let (parameter_ids, parameters): (Vec<_>, Vec<_>) = self.parameters.into_iter().unzip();
        Ok(Function {
            name: name.into(),
            parameters,
            parameter_ids,
            results,
            body: self.instructions,
            result_ids,
        })
    }
}

/// Identifiers for contract violations detected by backends before execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ContractErrorCode {
    DynamicDimension,
    DTypeNotSupported,
    ShapeMismatch,
    InvalidAttributeValue,
    IntegerDivideByZero,
    BroadcastDimsInvalid,
}

impl ContractErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContractErrorCode::DynamicDimension => "dynamic dimension not allowed",
            ContractErrorCode::DTypeNotSupported => "dtype not supported for op",
            ContractErrorCode::ShapeMismatch => "operand shape mismatch",
            ContractErrorCode::InvalidAttributeValue => "invalid attribute value",
            ContractErrorCode::IntegerDivideByZero => "integer divide by zero",
            ContractErrorCode::BroadcastDimsInvalid => "broadcast dims incompatible",
        }
    }
}

/// Backend error surfaced to higher layers.
#[derive(Debug)]
pub enum BackendError {
    Contract {
        code: ContractErrorCode,
        detail: String,
    },
    Unimplemented {
        op: &'static str,
        reason: String,
    },
    Execution {
        message: String,
    },
}

impl BackendError {
    pub fn contract(code: ContractErrorCode, detail: impl Into<String>) -> Self {
        BackendError::Contract {
            code,
            detail: detail.into(),
        }
    }

    pub fn unimplemented(op: &'static str, reason: impl Into<String>) -> Self {
        BackendError::Unimplemented {
            op,
            reason: reason.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution {
            message: message.into(),
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Contract { code, detail } => write!(f, "{} ({detail})", code.as_str()),
            BackendError::Unimplemented { op, reason } => {
                write!(f, "{op} is not implemented: {reason}")
            }
            BackendError::Execution { message } => {
                write!(f, "backend execution failure: {message}")
            }
        }
    }
}

impl std::error::Error for BackendError {}

/// Convenience alias for results returned by backend routines.
pub type BackendResult<T> = Result<T, BackendError>;

/// Device backend that evaluates lowered programs.
pub trait PortableBackend: Send + Sync {
    type TensorHandle: Clone + Send + Sync + 'static;

    /// Returns a human-readable backend identifier (e.g., `"CPU"`).
    fn backend_name(&self) -> &str;

    /// One-line description reported by device enumeration.
    fn device_description(&self) -> String {
        format!("{} device", self.backend_name())
    }

    /// Operations and dtypes this backend accepts.
    fn capabilities(&self) -> DeviceCapabilities {
        DeviceCapabilities::default()
    }

    /// Whether one prepared program may be run from several threads at once.
    fn is_thread_safe(&self) -> bool {
        true
    }

    /// Materialises a tensor handle from host data.
    fn materialize(&self, literal: TensorLiteral) -> BackendResult<Self::TensorHandle>;

    /// Reads back a tensor handle into a dense literal.
    fn to_literal(&self, tensor: &Self::TensorHandle) -> BackendResult<TensorLiteral>;

    /// Executes a single instruction given already materialised operand handles.
    fn execute_instruction(
        &self,
        instruction: &Instruction,
        inputs: &[Self::TensorHandle],
    ) -> BackendResult<Vec<Self::TensorHandle>>;

    /// Executes an entire program starting from the entry function.
    fn run_program(
        &self,
        program: &Program,
        entry_inputs: &[Self::TensorHandle],
    ) -> BackendResult<Vec<Self::TensorHandle>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scale_program() -> Program {
        let mut builder = ProgramBuilder::new();
        let spec = TensorSpec::from_dims(DType::F32, &[2]);
        let x = builder.add_parameter(spec.clone());
        let two = TensorLiteral::from_f32(&[2], vec![2.0, 2.0]).unwrap();
        let y = builder.emit_single(
            Operation::ElementwiseBinary(ElementwiseBinaryOp::Mul),
            vec![Operand::Value(x), Operand::Literal(two)],
            spec,
        );
        let function = builder.finish("main", vec![y]).unwrap();
        Program::new("main").with_functions(vec![function])
    }

    #[test]
    fn literal_length_must_match_spec() {
        let err = TensorLiteral::new(
            TensorSpec::from_dims(DType::F32, &[3]),
            LiteralData::F32(Arc::from(vec![1.0f32, 2.0])),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            BackendError::Contract {
                code: ContractErrorCode::ShapeMismatch,
                ..
            }
        ));
    }

    #[test]
    fn program_text_lists_params_body_and_results() {
        let text = scale_program().to_string();
        assert!(text.starts_with("program @main"));
        assert!(text.contains("params:"));
        assert!(text.contains("%1 = ElementwiseBinary(Mul)(%0, literal(tensor<F32 x 2>))"));
        assert!(text.contains("results:"));
    }

    #[test]
    fn builder_rejects_unknown_results() {
        let builder = ProgramBuilder::new();
        assert!(builder.finish("main", vec![ValueId(7)]).is_err());
    }
}
