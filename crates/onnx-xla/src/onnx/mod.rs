//! ONNX wire format: prost message definitions and a programmatic model builder.

pub mod builder;
pub mod proto;

pub use builder::{ModelBuilder, NodeBuilder};
