use std::collections::HashMap;
use std::sync::Arc;

use onnx_xla::backend::ir::{
    BackendError, BackendResult, BroadcastToSpec, ConcatSpec, ContractErrorCode, ConvSpec, DType,
    Dimension, DotGeneralSpec, ElementwiseBinaryOp, ElementwiseUnaryOp, Instruction, LiteralData,
    Operand, Operation, PortableBackend, Program, ReduceKind, ReduceSpec, ReduceWindowSpec,
    ReshapeSpec, Shape, TensorLiteral, TensorSpec, TransposeSpec, ValueId,
};
use onnx_xla::backend::legality::{DeviceCapabilities, OperationKind};

/// Largest program, in graph nodes, the reference device accepts.
pub const MAX_GRAPH_SIZE: usize = 1_000_000;

#[derive(Debug, Clone)]
pub struct CpuTensor {
    pub spec: TensorSpec,
    pub data: TensorData,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Arc<[f32]>),
    Si64(Arc<[i64]>),
}

impl TensorData {
    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(values) => values.len(),
            TensorData::Si64(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> DType {
        match self {
            TensorData::F32(_) => DType::F32,
            TensorData::Si64(_) => DType::Si64,
        }
    }

    /// New buffer whose element `i` is `self[indices[i]]`.
    fn gather(&self, indices: impl Iterator<Item = usize>) -> TensorData {
        match self {
            TensorData::F32(values) => TensorData::F32(indices.map(|idx| values[idx]).collect()),
            TensorData::Si64(values) => TensorData::Si64(indices.map(|idx| values[idx]).collect()),
        }
    }
}

/// Element types the interpreter computes on.
trait Scalar: Copy + PartialOrd + Send + Sync + 'static {
    const ZERO: Self;
    const LOWEST: Self;
    const HIGHEST: Self;

    fn add(self, rhs: Self) -> Self;
    fn mul(self, rhs: Self) -> Self;
    fn maximum(self, rhs: Self) -> Self;
    fn minimum(self, rhs: Self) -> Self;

    fn view(data: &TensorData) -> Option<&[Self]>;
    fn wrap(values: Vec<Self>) -> TensorData;
}

/// `f32::max` ignores a NaN operand; these propagate it instead.
fn nan_max(x: f32, y: f32) -> f32 {
    if x.is_nan() || y.is_nan() {
        f32::NAN
    } else {
        x.max(y)
    }
}

fn nan_min(x: f32, y: f32) -> f32 {
    if x.is_nan() || y.is_nan() {
        f32::NAN
    } else {
        x.min(y)
    }
}

impl Scalar for f32 {
    const ZERO: Self = 0.0;
    const LOWEST: Self = f32::NEG_INFINITY;
    const HIGHEST: Self = f32::INFINITY;

    fn add(self, rhs: Self) -> Self {
        self + rhs
    }

    fn mul(self, rhs: Self) -> Self {
        self * rhs
    }

    fn maximum(self, rhs: Self) -> Self {
        nan_max(self, rhs)
    }

    fn minimum(self, rhs: Self) -> Self {
        nan_min(self, rhs)
    }

    fn view(data: &TensorData) -> Option<&[Self]> {
        match data {
            TensorData::F32(values) => Some(values),
            TensorData::Si64(_) => None,
        }
    }

    fn wrap(values: Vec<Self>) -> TensorData {
        TensorData::F32(Arc::from(values))
    }
}

impl Scalar for i64 {
    const ZERO: Self = 0;
    const LOWEST: Self = i64::MIN;
    const HIGHEST: Self = i64::MAX;

    fn add(self, rhs: Self) -> Self {
        self.wrapping_add(rhs)
    }

    fn mul(self, rhs: Self) -> Self {
        self.wrapping_mul(rhs)
    }

    fn maximum(self, rhs: Self) -> Self {
        self.max(rhs)
    }

    fn minimum(self, rhs: Self) -> Self {
        self.min(rhs)
    }

    fn view(data: &TensorData) -> Option<&[Self]> {
        match data {
            TensorData::Si64(values) => Some(values),
            TensorData::F32(_) => None,
        }
    }

    fn wrap(values: Vec<Self>) -> TensorData {
        TensorData::Si64(Arc::from(values))
    }
}

/// Deterministic single-threaded interpreter for lowered programs.
#[derive(Debug, Clone)]
pub struct CpuBackend {
    capabilities: DeviceCapabilities,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self::with_capabilities(Self::default_capabilities())
    }

    /// Backend advertising a custom capability set; kernels are unchanged.
    pub fn with_capabilities(capabilities: DeviceCapabilities) -> Self {
        Self { capabilities }
    }

    pub fn default_capabilities() -> DeviceCapabilities {
        DeviceCapabilities::default()
            .allow_ops(OperationKind::ALL)
            .allow_dtypes([DType::F32, DType::Si64])
            .with_dynamic_dims(false)
            .with_max_graph_size(MAX_GRAPH_SIZE)
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl PortableBackend for CpuBackend {
    type TensorHandle = CpuTensor;

    fn backend_name(&self) -> &str {
        "CPU"
    }

    fn device_description(&self) -> String {
        "Reference CPU interpreter (f32, i64)".to_string()
    }

    fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities.clone()
    }

    fn is_thread_safe(&self) -> bool {
        true
    }

    fn materialize(&self, literal: TensorLiteral) -> BackendResult<Self::TensorHandle> {
        literal_to_tensor(&literal)
    }

    fn to_literal(&self, tensor: &Self::TensorHandle) -> BackendResult<TensorLiteral> {
        tensor_to_literal(tensor)
    }

    fn execute_instruction(
        &self,
        instruction: &Instruction,
        inputs: &[Self::TensorHandle],
    ) -> BackendResult<Vec<Self::TensorHandle>> {
        Ok(vec![execute_operation(instruction, inputs)?])
    }

    fn run_program(
        &self,
        program: &Program,
        entry_inputs: &[Self::TensorHandle],
    ) -> BackendResult<Vec<Self::TensorHandle>> {
        let function = program
            .entry_function()
            .ok_or_else(|| BackendError::execution("entry function not found"))?;

        if function.parameter_ids.len() != entry_inputs.len() {
            return Err(BackendError::execution(format!(
                "entry expects {} parameters, got {}",
                function.parameter_ids.len(),
                entry_inputs.len()
            )));
        }

        let mut values: HashMap<ValueId, CpuTensor> = HashMap::new();
        for ((param_id, spec), handle) in function
            .parameter_ids
            .iter()
            .zip(&function.parameters)
            .zip(entry_inputs)
        {
            if &handle.spec != spec {
                return Err(BackendError::contract(
                    ContractErrorCode::ShapeMismatch,
                    format!(
                        "parameter {:?} expects {spec}, got {}",
                        param_id, handle.spec
                    ),
                ));
            }
            values.insert(*param_id, handle.clone());
        }

        for (instr_index, instruction) in function.body.iter().enumerate() {
            let mut inputs = Vec::with_capacity(instruction.operands.len());
            for operand in &instruction.operands {
                let tensor = match operand {
                    Operand::Value(id) => values.get(id).cloned().ok_or_else(|| {
                        BackendError::execution(format!("operand value {id:?} missing"))
                    })?,
                    Operand::Literal(lit) => literal_to_tensor(lit)?,
                };
                inputs.push(tensor);
            }
            let output = execute_operation(instruction, &inputs).map_err(|err| {
                augment_backend_error(err, &function.name, instr_index, instruction, &inputs)
            })?;
            tracing::trace!(
                index = instr_index,
                op = instruction.op.label(),
                output = %output.spec,
                "executed instruction"
            );
            values.insert(instruction.id, output);
        }

        let mut results = Vec::with_capacity(function.result_ids.len());
        for id in &function.result_ids {
            let value = values
                .get(id)
                .cloned()
                .ok_or_else(|| BackendError::execution("missing function result value"))?;
            results.push(value);
        }
        Ok(results)
    }
}

fn literal_to_tensor(literal: &TensorLiteral) -> BackendResult<CpuTensor> {
    let data = match &literal.data {
        LiteralData::F32(values) => TensorData::F32(Arc::clone(values)),
        LiteralData::Si64(values) => TensorData::Si64(Arc::clone(values)),
    };
    Ok(CpuTensor {
        spec: literal.spec.clone(),
        data,
    })
}

fn tensor_to_literal(tensor: &CpuTensor) -> BackendResult<TensorLiteral> {
    let data = match &tensor.data {
        TensorData::F32(values) => LiteralData::F32(Arc::clone(values)),
        TensorData::Si64(values) => LiteralData::Si64(Arc::clone(values)),
    };
    TensorLiteral::new(tensor.spec.clone(), data)
}

fn execute_operation(instruction: &Instruction, inputs: &[CpuTensor]) -> BackendResult<CpuTensor> {
    let output = &instruction.output;
    let data = match &instruction.op {
        Operation::Constant(literal) => literal_to_tensor(literal)?.data,
        Operation::ElementwiseUnary(op) => op_elementwise_unary(inputs, *op)?,
        Operation::ElementwiseBinary(op) => op_elementwise_binary(inputs, *op)?,
        Operation::BroadcastTo(spec) => op_broadcast_to(inputs, output, spec)?,
        Operation::Reshape(spec) => op_reshape(inputs, output, spec)?,
        Operation::Transpose(spec) => op_transpose(inputs, output, spec)?,
        Operation::Concat(spec) => op_concat(inputs, output, spec)?,
        Operation::DotGeneral(spec) => op_dot_general(inputs, output, spec)?,
        Operation::Reduce(spec) => op_reduce(inputs, output, spec)?,
        Operation::ReduceWindow(spec) => op_reduce_window(inputs, output, spec)?,
        Operation::Conv(spec) => op_conv(inputs, output, spec)?,
    };
    if data.dtype() != output.dtype {
        return Err(BackendError::contract(
            ContractErrorCode::DTypeNotSupported,
            format!("result is {:?}, instruction declares {:?}", data.dtype(), output.dtype),
        ));
    }
    if data.len() != element_count(&output.shape)? {
        return Err(BackendError::contract(
            ContractErrorCode::ShapeMismatch,
            format!("result has {} elements, instruction declares {}", data.len(), output),
        ));
    }
    Ok(CpuTensor {
        spec: output.clone(),
        data,
    })
}

fn augment_backend_error(
    error: BackendError,
    function_name: &str,
    instruction_index: usize,
    instruction: &Instruction,
    inputs: &[CpuTensor],
) -> BackendError {
    let location = format!(
        "at function `{}` instruction #{}, {} id {:?} operands [{}]",
        function_name,
        instruction_index,
        instruction.op.label(),
        instruction.id,
        format_operands(&instruction.operands, inputs)
    );
    match error {
        BackendError::Execution { message } => BackendError::Execution {
            message: format!("{message} ({location})"),
        },
        BackendError::Unimplemented { op, reason } => BackendError::Unimplemented {
            op,
            reason: format!("{reason} ({location})"),
        },
        BackendError::Contract { code, detail } => BackendError::Contract {
            code,
            detail: format!("{detail} ({location})"),
        },
    }
}

fn format_operands(operands: &[Operand], inputs: &[CpuTensor]) -> String {
    if operands.is_empty() {
        return String::from("<none>");
    }
    operands
        .iter()
        .zip(inputs)
        .map(|(operand, tensor)| match operand {
            Operand::Value(id) => format!("value {:?} {}", id, tensor.spec),
            Operand::Literal(_) => format!("literal {}", tensor.spec),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn dtype_error(op: &str, dtype: DType) -> BackendError {
    BackendError::contract(
        ContractErrorCode::DTypeNotSupported,
        format!("{op} does not support {dtype:?}"),
    )
}

fn typed<'a, T: Scalar>(op: &str, tensor: &'a CpuTensor) -> BackendResult<&'a [T]> {
    T::view(&tensor.data).ok_or_else(|| dtype_error(op, tensor.data.dtype()))
}

fn op_elementwise_unary(inputs: &[CpuTensor], op: ElementwiseUnaryOp) -> BackendResult<TensorData> {
    let input = expect_single(inputs)?;
    match &input.data {
        TensorData::F32(values) => {
            let apply: fn(f32) -> f32 = match op {
                ElementwiseUnaryOp::Neg => |x| -x,
                ElementwiseUnaryOp::Abs => f32::abs,
                ElementwiseUnaryOp::Exp => f32::exp,
                ElementwiseUnaryOp::Log => f32::ln,
                ElementwiseUnaryOp::Sqrt => f32::sqrt,
                ElementwiseUnaryOp::Rsqrt => |x| 1.0 / x.sqrt(),
                ElementwiseUnaryOp::Reciprocal => |x| 1.0 / x,
                ElementwiseUnaryOp::Tanh => f32::tanh,
                ElementwiseUnaryOp::Sigmoid => |x| 1.0 / (1.0 + (-x).exp()),
            };
            Ok(TensorData::F32(values.iter().map(|&x| apply(x)).collect()))
        }
        TensorData::Si64(values) => {
            let apply: fn(i64) -> i64 = match op {
                ElementwiseUnaryOp::Neg => i64::wrapping_neg,
                ElementwiseUnaryOp::Abs => i64::wrapping_abs,
                other => {
                    return Err(BackendError::contract(
                        ContractErrorCode::DTypeNotSupported,
                        format!("{other:?} is only defined for f32"),
                    ))
                }
            };
            Ok(TensorData::Si64(values.iter().map(|&x| apply(x)).collect()))
        }
    }
}

fn op_elementwise_binary(
    inputs: &[CpuTensor],
    op: ElementwiseBinaryOp,
) -> BackendResult<TensorData> {
    let [lhs, rhs] = inputs else {
        return Err(BackendError::execution("elementwise binary expects 2 inputs"));
    };
    if lhs.spec.shape != rhs.spec.shape {
        return Err(BackendError::contract(
            ContractErrorCode::ShapeMismatch,
            format!("elementwise operands {} and {} differ", lhs.spec, rhs.spec),
        ));
    }
    match (&lhs.data, &rhs.data) {
        (TensorData::F32(a), TensorData::F32(b)) => {
            let apply: fn(f32, f32) -> f32 = match op {
                ElementwiseBinaryOp::Add => |x, y| x + y,
                ElementwiseBinaryOp::Sub => |x, y| x - y,
                ElementwiseBinaryOp::Mul => |x, y| x * y,
                ElementwiseBinaryOp::Div => |x, y| x / y,
                ElementwiseBinaryOp::Maximum => nan_max,
                ElementwiseBinaryOp::Minimum => nan_min,
                ElementwiseBinaryOp::Pow => f32::powf,
            };
            Ok(TensorData::F32(
                a.iter().zip(b.iter()).map(|(&x, &y)| apply(x, y)).collect(),
            ))
        }
        (TensorData::Si64(a), TensorData::Si64(b)) => {
            let result = a
                .iter()
                .zip(b.iter())
                .map(|(&x, &y)| binary_i64(op, x, y))
                .collect::<BackendResult<Vec<_>>>()?;
            Ok(TensorData::Si64(Arc::from(result)))
        }
        _ => Err(BackendError::contract(
            ContractErrorCode::DTypeNotSupported,
            "elementwise operands have different dtypes",
        )),
    }
}

fn binary_i64(op: ElementwiseBinaryOp, x: i64, y: i64) -> BackendResult<i64> {
    Ok(match op {
        ElementwiseBinaryOp::Add => x.wrapping_add(y),
        ElementwiseBinaryOp::Sub => x.wrapping_sub(y),
        ElementwiseBinaryOp::Mul => x.wrapping_mul(y),
        ElementwiseBinaryOp::Div => {
            if y == 0 {
                return Err(BackendError::contract(
                    ContractErrorCode::IntegerDivideByZero,
                    format!("{x} / 0"),
                ));
            }
            x.wrapping_div(y)
        }
        ElementwiseBinaryOp::Maximum => x.max(y),
        ElementwiseBinaryOp::Minimum => x.min(y),
        ElementwiseBinaryOp::Pow => {
            let exponent = u32::try_from(y).map_err(|_| {
                BackendError::contract(
                    ContractErrorCode::InvalidAttributeValue,
                    format!("integer exponent {y} is out of range"),
                )
            })?;
            x.wrapping_pow(exponent)
        }
    })
}

fn op_reshape(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    spec: &ReshapeSpec,
) -> BackendResult<TensorData> {
    let input = expect_single(inputs)?;
    let out_dims = static_dims(&output.shape)?;
    if out_dims != spec.new_shape || input.data.len() != out_dims.iter().product::<usize>() {
        return Err(BackendError::contract(
            ContractErrorCode::ShapeMismatch,
            format!("cannot reshape {} to {:?}", input.spec, spec.new_shape),
        ));
    }
    Ok(input.data.clone())
}

fn op_transpose(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    spec: &TransposeSpec,
) -> BackendResult<TensorData> {
    let input = expect_single(inputs)?;
    let input_dims = static_dims(&input.spec.shape)?;
    let out_dims = static_dims(&output.shape)?;
    let valid = spec.perm.len() == input_dims.len()
        && out_dims.len() == input_dims.len()
        && spec
            .perm
            .iter()
            .zip(&out_dims)
            .all(|(&axis, &dim)| axis < input_dims.len() && input_dims[axis] == dim);
    if !valid {
        return Err(BackendError::contract(
            ContractErrorCode::InvalidAttributeValue,
            format!("permutation {:?} does not map {} to {}", spec.perm, input.spec, output),
        ));
    }
    let input_strides = compute_strides(&input_dims);
    let count = out_dims.iter().product::<usize>();
    Ok(input.data.gather((0..count).map(|idx| {
        unravel_index(idx, &out_dims)
            .iter()
            .enumerate()
            .map(|(out_axis, &coord)| coord * input_strides[spec.perm[out_axis]])
            .sum::<usize>()
    })))
}

fn op_broadcast_to(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    spec: &BroadcastToSpec,
) -> BackendResult<TensorData> {
    let input = expect_single(inputs)?;
    let input_dims = static_dims(&input.spec.shape)?;
    let out_dims = static_dims(&output.shape)?;
    let spec_dims = static_dims(&spec.result_shape)?;
    if out_dims != spec_dims {
        return Err(BackendError::execution("broadcast_to result shape mismatch"));
    }
    if out_dims.len() < input_dims.len() {
        return Err(BackendError::contract(
            ContractErrorCode::BroadcastDimsInvalid,
            "broadcast_to result rank must be >= operand rank",
        ));
    }
    let rank_diff = out_dims.len() - input_dims.len();
    let mut aligned_in_dims = vec![1usize; out_dims.len()];
    aligned_in_dims[rank_diff..].copy_from_slice(&input_dims);
    for (&dim, &out_dim) in aligned_in_dims.iter().zip(&out_dims) {
        if dim != 1 && dim != out_dim {
            return Err(BackendError::contract(
                ContractErrorCode::BroadcastDimsInvalid,
                format!("cannot broadcast {} to {}", input.spec, output),
            ));
        }
    }
    if aligned_in_dims == out_dims {
        return Ok(input.data.clone());
    }
    let in_strides = compute_strides(&aligned_in_dims);
    let count = out_dims.iter().product::<usize>();
    Ok(input.data.gather((0..count).map(|idx| {
        unravel_index(idx, &out_dims)
            .iter()
            .zip(&aligned_in_dims)
            .zip(&in_strides)
            .map(|((&coord, &dim), &stride)| if dim == 1 { 0 } else { coord * stride })
            .sum::<usize>()
    })))
}

fn op_concat(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    spec: &ConcatSpec,
) -> BackendResult<TensorData> {
    if inputs.is_empty() {
        return Err(BackendError::execution("concat expects at least one input"));
    }
    let out_dims = static_dims(&output.shape)?;
    let axis = spec.axis;
    if axis >= out_dims.len() {
        return Err(BackendError::contract(
            ContractErrorCode::InvalidAttributeValue,
            "concat axis out of range",
        ));
    }
    let mut axis_total = 0usize;
    for tensor in inputs {
        let dims = static_dims(&tensor.spec.shape)?;
        if dims.len() != out_dims.len()
            || dims
                .iter()
                .zip(&out_dims)
                .enumerate()
                .any(|(idx, (dim, out_dim))| idx != axis && dim != out_dim)
        {
            return Err(BackendError::contract(
                ContractErrorCode::ShapeMismatch,
                format!("concat operand {} does not fit {}", tensor.spec, output),
            ));
        }
        axis_total += dims[axis];
    }
    if axis_total != out_dims[axis] {
        return Err(BackendError::contract(
            ContractErrorCode::ShapeMismatch,
            "concat inputs do not match output axis length",
        ));
    }
    match output.dtype {
        DType::F32 => concat_typed::<f32>(inputs, &out_dims, axis),
        DType::Si64 => concat_typed::<i64>(inputs, &out_dims, axis),
    }
}

fn concat_typed<T: Scalar>(
    inputs: &[CpuTensor],
    out_dims: &[usize],
    axis: usize,
) -> BackendResult<TensorData> {
    let axis_inner = out_dims[axis + 1..].iter().product::<usize>();
    let outer = out_dims[..axis].iter().product::<usize>();
    let parts = inputs
        .iter()
        .map(|tensor| {
            let dims = static_dims(&tensor.spec.shape)?;
            Ok((dims[axis] * axis_inner, typed::<T>("concat", tensor)?))
        })
        .collect::<BackendResult<Vec<_>>>()?;

    let mut result = Vec::with_capacity(out_dims.iter().product());
    for outer_idx in 0..outer {
        for (chunk, values) in &parts {
            let start = outer_idx * chunk;
            result.extend_from_slice(&values[start..start + chunk]);
        }
    }
    Ok(T::wrap(result))
}

fn op_dot_general(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    spec: &DotGeneralSpec,
) -> BackendResult<TensorData> {
    let [lhs, rhs] = inputs else {
        return Err(BackendError::execution("dot_general expects two inputs"));
    };
    if spec.batch_lhs.len() != spec.batch_rhs.len()
        || spec.contract_lhs.len() != spec.contract_rhs.len()
    {
        return Err(BackendError::contract(
            ContractErrorCode::InvalidAttributeValue,
            "dot_general axis lists must pair up",
        ));
    }
    match output.dtype {
        DType::F32 => dot_general_typed(
            typed::<f32>("dot_general", lhs)?,
            typed::<f32>("dot_general", rhs)?,
            lhs,
            rhs,
            spec,
        ),
        DType::Si64 => dot_general_typed(
            typed::<i64>("dot_general", lhs)?,
            typed::<i64>("dot_general", rhs)?,
            lhs,
            rhs,
            spec,
        ),
    }
}

fn dot_general_typed<T: Scalar>(
    lhs_values: &[T],
    rhs_values: &[T],
    lhs: &CpuTensor,
    rhs: &CpuTensor,
    spec: &DotGeneralSpec,
) -> BackendResult<TensorData> {
    let lhs_dims = static_dims(&lhs.spec.shape)?;
    let rhs_dims = static_dims(&rhs.spec.shape)?;
    let lhs_strides = compute_strides(&lhs_dims);
    let rhs_strides = compute_strides(&rhs_dims);

    let paired = spec
        .batch_lhs
        .iter()
        .zip(&spec.batch_rhs)
        .chain(spec.contract_lhs.iter().zip(&spec.contract_rhs));
    for (&l, &r) in paired {
        if l >= lhs_dims.len() || r >= rhs_dims.len() || lhs_dims[l] != rhs_dims[r] {
            return Err(BackendError::contract(
                ContractErrorCode::ShapeMismatch,
                format!("dot_general axes {l}/{r} do not match {} x {}", lhs.spec, rhs.spec),
            ));
        }
    }

    let lhs_free_axes: Vec<usize> = (0..lhs_dims.len())
        .filter(|ax| !spec.batch_lhs.contains(ax) && !spec.contract_lhs.contains(ax))
        .collect();
    let rhs_free_axes: Vec<usize> = (0..rhs_dims.len())
        .filter(|ax| !spec.batch_rhs.contains(ax) && !spec.contract_rhs.contains(ax))
        .collect();

    let batch_shape: Vec<usize> = spec.batch_lhs.iter().map(|&ax| lhs_dims[ax]).collect();
    let lhs_free_shape: Vec<usize> = lhs_free_axes.iter().map(|&ax| lhs_dims[ax]).collect();
    let rhs_free_shape: Vec<usize> = rhs_free_axes.iter().map(|&ax| rhs_dims[ax]).collect();
    let contract_shape: Vec<usize> = spec.contract_lhs.iter().map(|&ax| lhs_dims[ax]).collect();

    let lhs_axes = AxisGroups {
        strides: &lhs_strides,
        batch: &spec.batch_lhs,
        free: &lhs_free_axes,
        contract: &spec.contract_lhs,
    };
    let rhs_axes = AxisGroups {
        strides: &rhs_strides,
        batch: &spec.batch_rhs,
        free: &rhs_free_axes,
        contract: &spec.contract_rhs,
    };

    let out_len = batch_shape
        .iter()
        .chain(&lhs_free_shape)
        .chain(&rhs_free_shape)
        .product::<usize>();
    let mut output = Vec::with_capacity(out_len);
    for batch_index in MultiIndex::new(&batch_shape) {
        for lhs_free_index in MultiIndex::new(&lhs_free_shape) {
            for rhs_free_index in MultiIndex::new(&rhs_free_shape) {
                let mut sum = T::ZERO;
                for contract_index in MultiIndex::new(&contract_shape) {
                    let lhs_idx = lhs_axes.index(&batch_index, &lhs_free_index, &contract_index);
                    let rhs_idx = rhs_axes.index(&batch_index, &rhs_free_index, &contract_index);
                    sum = sum.add(lhs_values[lhs_idx].mul(rhs_values[rhs_idx]));
                }
                output.push(sum);
            }
        }
    }
    Ok(T::wrap(output))
}

fn reduce_identity<T: Scalar>(kind: ReduceKind) -> T {
    match kind {
        ReduceKind::Sum => T::ZERO,
        ReduceKind::Max => T::LOWEST,
        ReduceKind::Min => T::HIGHEST,
    }
}

fn reduce_step<T: Scalar>(kind: ReduceKind, acc: T, value: T) -> T {
    match kind {
        ReduceKind::Sum => acc.add(value),
        ReduceKind::Max => acc.maximum(value),
        ReduceKind::Min => acc.minimum(value),
    }
}

fn op_reduce(inputs: &[CpuTensor], output: &TensorSpec, spec: &ReduceSpec) -> BackendResult<TensorData> {
    let input = expect_single(inputs)?;
    let in_dims = static_dims(&input.spec.shape)?;
    if spec.axes.iter().any(|&axis| axis >= in_dims.len()) {
        return Err(BackendError::contract(
            ContractErrorCode::InvalidAttributeValue,
            format!("reduce axes {:?} out of range for {}", spec.axes, input.spec),
        ));
    }
    let kept_dims: Vec<usize> = in_dims
        .iter()
        .enumerate()
        .map(|(axis, &dim)| if spec.axes.contains(&axis) { 1 } else { dim })
        .collect();
    let expected: Vec<usize> = if spec.keepdims {
        kept_dims.clone()
    } else {
        in_dims
            .iter()
            .enumerate()
            .filter(|(axis, _)| !spec.axes.contains(axis))
            .map(|(_, &dim)| dim)
            .collect()
    };
    if static_dims(&output.shape)? != expected {
        return Err(BackendError::contract(
            ContractErrorCode::ShapeMismatch,
            format!("reduce of {} cannot produce {}", input.spec, output),
        ));
    }
    match &input.data {
        TensorData::F32(values) => Ok(f32::wrap(reduce_typed(
            &values[..],
            &in_dims,
            &kept_dims,
            spec.kind,
        ))),
        TensorData::Si64(values) => Ok(i64::wrap(reduce_typed(
            &values[..],
            &in_dims,
            &kept_dims,
            spec.kind,
        ))),
    }
}

/// Reduces into the keepdims layout; dropping unit axes afterwards does not move data.
fn reduce_typed<T: Scalar>(
    values: &[T],
    in_dims: &[usize],
    kept_dims: &[usize],
    kind: ReduceKind,
) -> Vec<T> {
    let out_strides = compute_strides(kept_dims);
    let mut result = vec![reduce_identity::<T>(kind); kept_dims.iter().product()];
    for (idx, &value) in values.iter().enumerate() {
        let out_idx: usize = unravel_index(idx, in_dims)
            .iter()
            .zip(kept_dims)
            .zip(&out_strides)
            .map(|((&coord, &dim), &stride)| if dim == 1 { 0 } else { coord * stride })
            .sum();
        result[out_idx] = reduce_step(kind, result[out_idx], value);
    }
    result
}

fn op_reduce_window(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    spec: &ReduceWindowSpec,
) -> BackendResult<TensorData> {
    let input = expect_single(inputs)?;
    let in_dims = static_dims(&input.spec.shape)?;
    let out_dims = static_dims(&output.shape)?;
    let rank = in_dims.len();
    if out_dims.len() != rank
        || spec.window_dims.len() != rank
        || spec.strides.len() != rank
        || spec.padding.len() != rank
        || spec.window_dilation.len() != rank
    {
        return Err(BackendError::contract(
            ContractErrorCode::InvalidAttributeValue,
            format!("reduce_window attributes must all have rank {rank}"),
        ));
    }
    let window = Window {
        in_dims: &in_dims,
        out_dims: &out_dims,
        kernel: &spec.window_dims,
        strides: &spec.strides,
        pads_begin: spec.padding.iter().map(|(lo, _)| *lo).collect(),
        dilations: &spec.window_dilation,
    };
    match &input.data {
        TensorData::F32(values) => {
            Ok(f32::wrap(reduce_window_typed(&values[..], &window, spec.reduce)))
        }
        TensorData::Si64(values) => {
            Ok(i64::wrap(reduce_window_typed(&values[..], &window, spec.reduce)))
        }
    }
}

/// Geometry of a strided, dilated, padded window over full-rank coordinates.
struct Window<'a> {
    in_dims: &'a [usize],
    out_dims: &'a [usize],
    kernel: &'a [usize],
    strides: &'a [usize],
    pads_begin: Vec<usize>,
    dilations: &'a [usize],
}

impl Window<'_> {
    /// Writes the input coordinate for an output coordinate and window offset into
    /// `coord`; false when the tap falls in padding.
    fn source(&self, out: &[usize], offset: &[usize], coord: &mut [usize]) -> bool {
        for axis in 0..self.in_dims.len() {
            let pos = (out[axis] * self.strides[axis] + offset[axis] * self.dilations[axis]) as isize
                - self.pads_begin[axis] as isize;
            if pos < 0 || pos >= self.in_dims[axis] as isize {
                return false;
            }
            coord[axis] = pos as usize;
        }
        true
    }
}

fn reduce_window_typed<T: Scalar>(values: &[T], window: &Window<'_>, kind: ReduceKind) -> Vec<T> {
    let in_strides = compute_strides(window.in_dims);
    let mut coord = vec![0usize; window.in_dims.len()];
    let mut result = Vec::with_capacity(window.out_dims.iter().product());
    for out in MultiIndex::new(window.out_dims) {
        let mut acc = reduce_identity::<T>(kind);
        for offset in MultiIndex::new(window.kernel) {
            if window.source(&out, &offset, &mut coord) {
                let linear: usize = coord.iter().zip(&in_strides).map(|(pos, stride)| pos * stride).sum();
                acc = reduce_step(kind, acc, values[linear]);
            }
        }
        result.push(acc);
    }
    result
}

fn op_conv(inputs: &[CpuTensor], output: &TensorSpec, spec: &ConvSpec) -> BackendResult<TensorData> {
    let (x, w, bias) = match inputs {
        [x, w] => (x, w, None),
        [x, w, bias] => (x, w, Some(bias)),
        _ => return Err(BackendError::execution("conv expects 2 or 3 inputs")),
    };
    let x_dims = static_dims(&x.spec.shape)?;
    let w_dims = static_dims(&w.spec.shape)?;
    let out_dims = static_dims(&output.shape)?;
    let spatial = x_dims.len().saturating_sub(2);
    let groups = spec.groups;
    let valid = x_dims.len() >= 3
        && w_dims.len() == x_dims.len()
        && out_dims.len() == x_dims.len()
        && spec.strides.len() == spatial
        && spec.padding.len() == spatial
        && spec.dilations.len() == spatial
        && groups > 0
        && x_dims[1] % groups == 0
        && w_dims[0] % groups == 0
        && w_dims[1] * groups == x_dims[1]
        && out_dims[0] == x_dims[0]
        && out_dims[1] == w_dims[0];
    if !valid {
        return Err(BackendError::contract(
            ContractErrorCode::ShapeMismatch,
            format!("conv of {} with {} cannot produce {}", x.spec, w.spec, output),
        ));
    }
    if let Some(bias) = bias {
        if static_dims(&bias.spec.shape)? != [w_dims[0]] {
            return Err(BackendError::contract(
                ContractErrorCode::ShapeMismatch,
                format!("conv bias {} must be [{}]", bias.spec, w_dims[0]),
            ));
        }
    }
    let geometry = ConvGeometry {
        x_dims: &x_dims,
        w_dims: &w_dims,
        out_dims: &out_dims,
        window: Window {
            in_dims: &x_dims[2..],
            out_dims: &out_dims[2..],
            kernel: &w_dims[2..],
            strides: &spec.strides,
            pads_begin: spec.padding.iter().map(|(lo, _)| *lo).collect(),
            dilations: &spec.dilations,
        },
        groups,
    };
    match output.dtype {
        DType::F32 => conv_typed::<f32>(
            typed("conv", x)?,
            typed("conv", w)?,
            bias.map(|b| typed("conv", b)).transpose()?,
            &geometry,
        ),
        DType::Si64 => conv_typed::<i64>(
            typed("conv", x)?,
            typed("conv", w)?,
            bias.map(|b| typed("conv", b)).transpose()?,
            &geometry,
        ),
    }
}

struct ConvGeometry<'a> {
    x_dims: &'a [usize],
    w_dims: &'a [usize],
    out_dims: &'a [usize],
    window: Window<'a>,
    groups: usize,
}

/// Accumulates every input channel and kernel tap first, then adds the bias once.
fn conv_typed<T: Scalar>(
    x: &[T],
    w: &[T],
    bias: Option<&[T]>,
    geometry: &ConvGeometry<'_>,
) -> BackendResult<TensorData> {
    let x_strides = compute_strides(geometry.x_dims);
    let w_strides = compute_strides(geometry.w_dims);
    let batch = geometry.x_dims[0];
    let out_channels = geometry.w_dims[0];
    let group_in = geometry.w_dims[1];
    let group_out = out_channels / geometry.groups;
    let spatial_x_strides = &x_strides[2..];
    let spatial_w_strides = &w_strides[2..];

    let mut coord = vec![0usize; geometry.window.in_dims.len()];
    let mut result = Vec::with_capacity(geometry.out_dims.iter().product());
    for n in 0..batch {
        for m in 0..out_channels {
            let group = m / group_out;
            for out in MultiIndex::new(geometry.window.out_dims) {
                let mut acc = T::ZERO;
                for c in 0..group_in {
                    let x_base = n * x_strides[0] + (group * group_in + c) * x_strides[1];
                    let w_base = m * w_strides[0] + c * w_strides[1];
                    for offset in MultiIndex::new(geometry.window.kernel) {
                        if !geometry.window.source(&out, &offset, &mut coord) {
                            continue;
                        }
                        let x_idx = x_base
                            + coord
                                .iter()
                                .zip(spatial_x_strides)
                                .map(|(pos, stride)| pos * stride)
                                .sum::<usize>();
                        let w_idx = w_base
                            + offset
                                .iter()
                                .zip(spatial_w_strides)
                                .map(|(tap, stride)| tap * stride)
                                .sum::<usize>();
                        acc = acc.add(x[x_idx].mul(w[w_idx]));
                    }
                }
                if let Some(bias) = bias {
                    acc = acc.add(bias[m]);
                }
                result.push(acc);
            }
        }
    }
    Ok(T::wrap(result))
}

fn expect_single(inputs: &[CpuTensor]) -> BackendResult<&CpuTensor> {
    match inputs {
        [single] => Ok(single),
        _ => Err(BackendError::execution("operation expects single input")),
    }
}

fn static_dims(shape: &Shape) -> BackendResult<Vec<usize>> {
    shape
        .dims()
        .iter()
        .map(|dim| match dim {
            Dimension::Static(v) => Ok(*v),
            Dimension::Dynamic(sym) => Err(BackendError::contract(
                ContractErrorCode::DynamicDimension,
                format!("dynamic dimension {} not supported at runtime", sym.as_str()),
            )),
        })
        .collect()
}

fn element_count(shape: &Shape) -> BackendResult<usize> {
    Ok(static_dims(shape)?.into_iter().product())
}

fn compute_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; dims.len()];
    let mut acc = 1usize;
    for (i, dim) in dims.iter().enumerate().rev() {
        strides[i] = acc;
        acc *= *dim;
    }
    strides
}

fn unravel_index(mut index: usize, dims: &[usize]) -> Vec<usize> {
    let mut coords = vec![0; dims.len()];
    for (i, dim) in dims.iter().enumerate().rev() {
        coords[i] = index % *dim;
        index /= *dim;
    }
    coords
}

/// Row-major walk over every coordinate of `shape`; yields nothing when a dim is zero.
struct MultiIndex {
    shape: Vec<usize>,
    current: Vec<usize>,
    first: bool,
}

impl MultiIndex {
    fn new(shape: &[usize]) -> Self {
        Self {
            shape: shape.to_vec(),
            current: vec![0; shape.len()],
            first: !shape.contains(&0),
        }
    }
}

impl Iterator for MultiIndex {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.first {
            self.first = false;
            return Some(self.current.clone());
        }
        for i in (0..self.current.len()).rev() {
            self.current[i] += 1;
            if self.current[i] < self.shape[i] {
                return Some(self.current.clone());
            }
            self.current[i] = 0;
        }
        None
    }
}

struct AxisGroups<'a> {
    strides: &'a [usize],
    batch: &'a [usize],
    free: &'a [usize],
    contract: &'a [usize],
}

impl AxisGroups<'_> {
    fn index(&self, batch_index: &[usize], free_index: &[usize], contract_index: &[usize]) -> usize {
        let mut index = 0usize;
        for (axis, &coord) in self.batch.iter().zip(batch_index) {
            index += coord * self.strides[*axis];
        }
        for (axis, &coord) in self.free.iter().zip(free_index) {
            index += coord * self.strides[*axis];
        }
        for (axis, &coord) in self.contract.iter().zip(contract_index) {
            index += coord * self.strides[*axis];
        }
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_index_walks_row_major() {
        let all: Vec<_> = MultiIndex::new(&[2, 2]).collect();
        assert_eq!(all, vec![vec![0, 0], vec![0, 1], vec![1, 0], vec![1, 1]]);
        assert_eq!(MultiIndex::new(&[]).count(), 1);
        assert_eq!(MultiIndex::new(&[3, 0]).count(), 0);
    }

    #[test]
    fn window_source_skips_padding() {
        let window = Window {
            in_dims: &[3],
            out_dims: &[3],
            kernel: &[3],
            strides: &[1],
            pads_begin: vec![1],
            dilations: &[1],
        };
        let mut coord = vec![0];
        assert!(!window.source(&[0], &[0], &mut coord));
        assert!(window.source(&[0], &[1], &mut coord));
        assert_eq!(coord, vec![0]);
        assert!(!window.source(&[2], &[2], &mut coord));
    }

    #[test]
    fn integer_division_by_zero_is_a_contract_error() {
        let err = binary_i64(ElementwiseBinaryOp::Div, 4, 0).unwrap_err();
        assert!(matches!(
            err,
            BackendError::Contract {
                code: ContractErrorCode::IntegerDivideByZero,
                ..
            }
        ));
        assert_eq!(binary_i64(ElementwiseBinaryOp::Div, -7, 2).unwrap(), -3);
    }

    #[test]
    fn float_extrema_propagate_nan() {
        assert!(nan_max(f32::NAN, 1.0).is_nan());
        assert!(nan_max(0.0, f32::NAN).is_nan());
        assert!(nan_min(f32::NAN, -1.0).is_nan());
        assert_eq!(nan_max(-2.0, 3.0), 3.0);
        assert_eq!(nan_min(-2.0, 3.0), -2.0);
        assert!(<f32 as Scalar>::maximum(f32::NEG_INFINITY, f32::NAN).is_nan());
    }
}
