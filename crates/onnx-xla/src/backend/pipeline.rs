use std::sync::Arc;

use crate::backend::ir::Function;
use crate::backend::optimizer::{FunctionPass, OptimizeContext, Optimizer, PassResult};
use crate::backend::passes::{
    CommonSubexpressionEliminationPass, ConstantFoldingPass, ConvBiasFusionPass,
    DeadCodeEliminationPass,
};
use crate::error::Result;
use crate::options::OptimizationLevel;

pub enum Step {
    Pass(Arc<dyn FunctionPass>),
    FixedPoint { max_iters: usize, steps: Vec<Step> },
}

#[derive(Default)]
pub struct PipelineBuilder {
    steps: Vec<Step>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn pass(&mut self, pass: Arc<dyn FunctionPass>) {
        self.steps.push(Step::Pass(pass));
    }

    pub fn fixed_point<F>(&mut self, max_iters: usize, build: F)
    where
        F: FnOnce(&mut PipelineBuilder),
    {
        let mut inner = PipelineBuilder::new();
        build(&mut inner);
        self.steps.push(Step::FixedPoint {
            max_iters: max_iters.max(1),
            steps: inner.steps,
        });
    }

    pub fn finish(self) -> Vec<Step> {
        self.steps
    }
}

pub struct PipelineOptimizer {
    steps: Vec<Step>,
    log_stats: bool,
}

impl PipelineOptimizer {
    pub fn from_steps(steps: Vec<Step>) -> Self {
        Self {
            steps,
            log_stats: crate::env::pass_stats_enabled(),
        }
    }

    pub fn for_level(level: OptimizationLevel) -> Self {
        let mut builder = PipelineBuilder::new();
        match level {
            OptimizationLevel::None => {}
            OptimizationLevel::Basic => {
                builder.pass(Arc::new(ConstantFoldingPass::default()));
                builder.pass(Arc::new(DeadCodeEliminationPass));
            }
            OptimizationLevel::Aggressive => {
                // Fusion matches the bias broadcast exactly as lowering emitted it.
                builder.pass(Arc::new(ConvBiasFusionPass));
                builder.fixed_point(crate::env::optimizer_max_iters(), |p| {
                    p.pass(Arc::new(ConstantFoldingPass::default()));
                    p.pass(Arc::new(CommonSubexpressionEliminationPass));
                    p.pass(Arc::new(DeadCodeEliminationPass));
                });
            }
        }
        Self::from_steps(builder.finish())
    }
}

impl Optimizer for PipelineOptimizer {
    fn optimize(&self, function: &mut Function, cx: &mut OptimizeContext<'_>) -> Result<PassResult> {
        let mut result = PassResult::default();
        run_steps(&self.steps, function, cx, &mut result, self.log_stats)?;
        Ok(result)
    }
}

fn run_steps(
    steps: &[Step],
    function: &mut Function,
    cx: &mut OptimizeContext<'_>,
    totals: &mut PassResult,
    log_stats: bool,
) -> Result<bool> {
    let mut changed_any = false;
    for step in steps {
        cx.deadline().check()?;
        match step {
            Step::Pass(pass) => {
                let stats = pass.run(function, cx);
                changed_any |= stats.changed;
                *totals = totals.merge(stats);
                log_pass_stats(pass.name(), function, stats, log_stats);
            }
            Step::FixedPoint { max_iters, steps } => {
                for _ in 0..*max_iters {
                    let mut local = PassResult::default();
                    let changed = run_steps(steps, function, cx, &mut local, log_stats)?;
                    *totals = totals.merge(local);
                    changed_any |= changed;
                    if !changed {
                        break;
                    }
                }
            }
        }
    }
    Ok(changed_any)
}

fn log_pass_stats(name: &str, function: &Function, stats: PassResult, log_stats: bool) {
    if log_stats {
        tracing::info!(
            pass = name,
            function = %function.name,
            changed = stats.changed,
            rewrites = stats.rewrites_applied,
            erased = stats.erased_insts,
            body_len = function.body.len(),
            "optimizer pass"
        );
    } else {
        tracing::debug!(
            pass = name,
            changed = stats.changed,
            rewrites = stats.rewrites_applied,
            erased = stats.erased_insts,
            body_len = function.body.len(),
            "optimizer pass"
        );
    }
}
