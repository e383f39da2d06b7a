use std::time::{Duration, Instant};

use crate::error::{OnnxXlaError, Result};

/// Wall-clock budget for one compilation, polled between nodes and passes.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    budget: Option<Duration>,
}

impl Deadline {
    pub fn new(budget: Option<Duration>) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    pub fn unbounded() -> Self {
        Self::new(None)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn check(&self) -> Result<()> {
        match self.budget {
            Some(budget) if self.elapsed() >= budget => Err(OnnxXlaError::CompilationTimeout {
                timeout_ms: budget.as_millis() as u64,
            }),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_budget_expires_immediately() {
        let deadline = Deadline::new(Some(Duration::ZERO));
        assert!(matches!(
            deadline.check(),
            Err(OnnxXlaError::CompilationTimeout { timeout_ms: 0 })
        ));
    }

    #[test]
    fn unbounded_never_expires() {
        assert!(Deadline::unbounded().check().is_ok());
    }
}
