//! Function-level optimization infrastructure.
//!
//! - a single context-aware pass trait,
//! - a pipeline builder with bounded fixed points,
//! - per-level default pipelines.

mod context;

use std::sync::Arc;

use crate::backend::ir::Function;
use crate::backend::pipeline::PipelineOptimizer;
use crate::error::Result;
use crate::options::OptimizationLevel;

pub use context::OptimizeContext;

/// Result returned by a [`FunctionPass`] after it runs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassResult {
    /// Whether the pass changed the IR.
    pub changed: bool,
    /// Number of rewrite iterations executed while applying the pass.
    pub iterations: usize,
    /// Total number of patterns applied by the pass.
    pub rewrites_applied: usize,
    /// Instructions removed by the pass.
    pub erased_insts: usize,
}

impl PassResult {
    /// Merges two run results, accumulating statistics.
    pub fn merge(self, other: PassResult) -> PassResult {
        PassResult {
            changed: self.changed || other.changed,
            iterations: self.iterations + other.iterations,
            rewrites_applied: self.rewrites_applied + other.rewrites_applied,
            erased_insts: self.erased_insts + other.erased_insts,
        }
    }
}

/// Canonical interface implemented by optimization passes that operate on a single function.
pub trait FunctionPass: Send + Sync {
    fn name(&self) -> &'static str;
    fn run(&self, function: &mut Function, cx: &mut OptimizeContext<'_>) -> PassResult;
}

/// Runs a sequence of passes over a function. Fails only when the compile deadline expires.
pub trait Optimizer: Send + Sync {
    fn optimize(&self, function: &mut Function, cx: &mut OptimizeContext<'_>) -> Result<PassResult>;
}

/// Builds the default pipeline for `level`.
pub fn optimizer_for_level(level: OptimizationLevel) -> Arc<dyn Optimizer> {
    Arc::new(PipelineOptimizer::for_level(level))
}
