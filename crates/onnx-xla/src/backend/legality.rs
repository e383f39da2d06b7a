use std::collections::HashSet;
use std::fmt;

use crate::backend::ir::{DType, Operand, Operation, Program, TensorSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OperationKind {
    Constant,
    ElementwiseUnary,
    ElementwiseBinary,
    BroadcastTo,
    Reshape,
    Transpose,
    Concat,
    DotGeneral,
    Reduce,
    ReduceWindow,
    Conv,
}

impl OperationKind {
    pub const ALL: [OperationKind; 11] = [
        OperationKind::Constant,
        OperationKind::ElementwiseUnary,
        OperationKind::ElementwiseBinary,
        OperationKind::BroadcastTo,
        OperationKind::Reshape,
        OperationKind::Transpose,
        OperationKind::Concat,
        OperationKind::DotGeneral,
        OperationKind::Reduce,
        OperationKind::ReduceWindow,
        OperationKind::Conv,
    ];

    pub fn from_op(op: &Operation) -> Self {
        match op {
            Operation::Constant(_) => OperationKind::Constant,
            Operation::ElementwiseUnary(_) => OperationKind::ElementwiseUnary,
            Operation::ElementwiseBinary(_) => OperationKind::ElementwiseBinary,
            Operation::BroadcastTo(_) => OperationKind::BroadcastTo,
            Operation::Reshape(_) => OperationKind::Reshape,
            Operation::Transpose(_) => OperationKind::Transpose,
            Operation::Concat(_) => OperationKind::Concat,
            Operation::DotGeneral(_) => OperationKind::DotGeneral,
            Operation::Reduce(_) => OperationKind::Reduce,
            Operation::ReduceWindow(_) => OperationKind::ReduceWindow,
            Operation::Conv(_) => OperationKind::Conv,
        }
    }
}

/// Capability set a device backend advertises.
///
/// `None` for ops or dtypes means "anything".
#[derive(Debug, Clone)]
pub struct DeviceCapabilities {
    pub allowed_ops: Option<HashSet<OperationKind>>,
    pub allow_dynamic_dims: bool,
    pub allowed_dtypes: Option<HashSet<DType>>,
    pub max_graph_size: Option<usize>,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            allowed_ops: None,
            allow_dynamic_dims: false,
            allowed_dtypes: None,
            max_graph_size: None,
        }
    }
}

impl DeviceCapabilities {
    pub fn allow_ops(mut self, ops: impl IntoIterator<Item = OperationKind>) -> Self {
        self.allowed_ops = Some(ops.into_iter().collect());
        self
    }

    pub fn allow_dtypes(mut self, dtypes: impl IntoIterator<Item = DType>) -> Self {
        self.allowed_dtypes = Some(dtypes.into_iter().collect());
        self
    }

    pub fn with_dynamic_dims(mut self, allowed: bool) -> Self {
        self.allow_dynamic_dims = allowed;
        self
    }

    pub fn with_max_graph_size(mut self, nodes: usize) -> Self {
        self.max_graph_size = Some(nodes);
        self
    }

    pub fn supports_op(&self, kind: OperationKind) -> bool {
        self.allowed_ops
            .as_ref()
            .map_or(true, |allowed| allowed.contains(&kind))
    }

    pub fn supports_dtype(&self, dtype: DType) -> bool {
        self.allowed_dtypes
            .as_ref()
            .map_or(true, |allowed| allowed.contains(&dtype))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegalityDiagnostic {
    pub function: String,
    pub instruction_index: Option<usize>,
    pub kind: Option<OperationKind>,
    pub message: String,
}

impl fmt::Display for LegalityDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.instruction_index {
            Some(idx) => write!(f, "@{}#{}: {}", self.function, idx, self.message),
            None => write!(f, "@{}: {}", self.function, self.message),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LegalityReport {
    pub diagnostics: Vec<LegalityDiagnostic>,
}

impl LegalityReport {
    pub fn is_ok(&self) -> bool {
        self.diagnostics.is_empty()
    }
}

/// Verifies that every instruction and value of `program` fits the capability set.
pub fn check_program_legality(
    program: &Program,
    caps: &DeviceCapabilities,
) -> Result<(), LegalityReport> {
    let mut report = LegalityReport::default();

    for function in &program.functions {
        for spec in function.parameters.iter().chain(function.results.iter()) {
            check_tensor_spec(spec, caps, &mut report, &function.name, None);
        }
        for (idx, inst) in function.body.iter().enumerate() {
            let kind = OperationKind::from_op(&inst.op);
            if !caps.supports_op(kind) {
                report.diagnostics.push(LegalityDiagnostic {
                    function: function.name.clone(),
                    instruction_index: Some(idx),
                    kind: Some(kind),
                    message: format!("operation {kind:?} is not allowed"),
                });
            }
            check_tensor_spec(&inst.output, caps, &mut report, &function.name, Some(idx));
            for operand in &inst.operands {
                if let Operand::Literal(literal) = operand {
                    check_tensor_spec(&literal.spec, caps, &mut report, &function.name, Some(idx));
                }
            }
        }
    }

    if report.is_ok() {
        Ok(())
    } else {
        Err(report)
    }
}

fn check_tensor_spec(
    spec: &TensorSpec,
    caps: &DeviceCapabilities,
    report: &mut LegalityReport,
    function: &str,
    inst_index: Option<usize>,
) {
    if !caps.allow_dynamic_dims && !spec.shape.is_static() {
        report.diagnostics.push(LegalityDiagnostic {
            function: function.to_string(),
            instruction_index: inst_index,
            kind: None,
            message: "dynamic dimensions are not allowed".to_string(),
        });
    }
    if !caps.supports_dtype(spec.dtype) {
        report.diagnostics.push(LegalityDiagnostic {
            function: function.to_string(),
            instruction_index: inst_index,
            kind: None,
            message: format!("dtype {:?} is not allowed", spec.dtype),
        });
    }
}
