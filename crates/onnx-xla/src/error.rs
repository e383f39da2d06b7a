use thiserror::Error;

use crate::backend::ir::BackendError;

/// Every failure the decoder, compiler, and runtime surface to callers.
#[derive(Debug, Error)]
pub enum OnnxXlaError {
    /// The bytes are not a decodable ONNX model.
    #[error("malformed model: {0}")]
    MalformedInput(String),

    /// The model decodes but is structurally invalid.
    #[error("schema violation: {0}")]
    Schema(String),

    #[error("unsupported operator `{op}`: {reason}")]
    UnsupportedOperator { op: String, reason: String },

    #[error("unsupported device `{0}`")]
    UnsupportedDevice(String),

    #[error("shape inference failed at `{node}`: {message}")]
    ShapeInference { node: String, message: String },

    #[error("input mismatch: {0}")]
    InputMismatch(String),

    #[error("execution failed: {0}")]
    Execution(#[source] BackendError),

    #[error("invalid option `{key}`: {reason}")]
    InvalidOptions { key: String, reason: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An event or binding was used out of order, such as signalling an event twice.
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("compilation exceeded its {timeout_ms} ms budget")]
    CompilationTimeout { timeout_ms: u64 },

    /// Lowering produced a program the target backend rejected.
    #[error("compilation failed: {0}")]
    Compilation(String),
}

impl OnnxXlaError {
    pub(crate) fn shape(node: impl Into<String>, message: impl Into<String>) -> Self {
        OnnxXlaError::ShapeInference {
            node: node.into(),
            message: message.into(),
        }
    }

    pub(crate) fn unsupported(op: impl Into<String>, reason: impl Into<String>) -> Self {
        OnnxXlaError::UnsupportedOperator {
            op: op.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn option(key: impl Into<String>, reason: impl Into<String>) -> Self {
        OnnxXlaError::InvalidOptions {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, OnnxXlaError>;
