use std::collections::HashSet;

use crate::backend::ir::ValueId;
use crate::backend::registry::ErasedBackend;
use crate::compiler::Deadline;

pub struct OptimizeContext<'a> {
    backend: &'a dyn ErasedBackend,
    deadline: &'a Deadline,
    failed_folds: HashSet<ValueId>,
}

impl<'a> OptimizeContext<'a> {
    pub fn new(backend: &'a dyn ErasedBackend, deadline: &'a Deadline) -> Self {
        Self {
            backend,
            deadline,
            failed_folds: HashSet::new(),
        }
    }

    /// Backend used to evaluate constant subgraphs.
    pub fn backend(&self) -> &'a dyn ErasedBackend {
        self.backend
    }

    pub fn deadline(&self) -> &'a Deadline {
        self.deadline
    }

    pub fn is_failed_fold(&self, value: ValueId) -> bool {
        self.failed_folds.contains(&value)
    }

    pub fn record_failed_fold(&mut self, value: ValueId) {
        self.failed_folds.insert(value);
    }
}
