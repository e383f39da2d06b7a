//! Optimization passes over lowered functions.

mod constant_folding;
mod conv_bias_fusion;
mod cse;
mod dce;
mod util;

pub use constant_folding::ConstantFoldingPass;
pub use conv_bias_fusion::ConvBiasFusionPass;
pub use cse::CommonSubexpressionEliminationPass;
pub use dce::DeadCodeEliminationPass;

pub use crate::backend::optimizer::{FunctionPass, PassResult as FunctionPassResult};
