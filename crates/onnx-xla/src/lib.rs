//! Compiles ONNX graphs into device executables behind an ONNXIFI-style interface.

pub mod backend;
pub mod binding;
pub mod checker;
pub mod compiler;
pub mod device;
pub mod engine;
mod env;
pub mod error;
pub mod event;
pub mod executable;
pub mod graph;
pub mod interface;
pub mod onnx;
pub mod options;
pub mod tensor;

pub use backend::ir::{DType, PortableBackend};
pub use binding::{GraphIo, PendingRun};
pub use device::{DeviceInfo, DeviceRegistry};
pub use error::{OnnxXlaError, Result};
pub use event::{Event, EventState};
pub use executable::{ExecutableHandle, ExecutableMetadata, PreparedExecutable, TensorSlot};
pub use graph::Graph;
pub use interface::{BackendInfo, OnnxifiBackend};
pub use options::{BackendOptions, OptimizationLevel};
pub use tensor::{ElemType, Tensor, TensorData, TensorDesc};
