//! Fail-fast step accumulation.
//!
//! Every pipeline records its steps through a [`StepLog`]. Once a failing step
//! is recorded the log is closed: the caller must stop, and the finished result
//! reports `fail`.

use crate::core::types::{Operation, OperationResult, Status, Step};

#[derive(Debug, Default)]
pub struct StepLog {
    steps: Vec<Step>,
    failed: bool,
}

impl StepLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a step. Returns `true` when the pipeline may continue.
    pub fn record(&mut self, step: Step) -> bool {
        debug_assert!(!self.failed, "step recorded after a failing step");
        if !step.passed() {
            self.failed = true;
        }
        self.steps.push(step);
        !self.failed
    }

    pub fn finish(self, operation: Operation) -> OperationResult {
        let status = if self.failed {
            Status::Fail
        } else {
            Status::Pass
        };
        OperationResult {
            operation,
            status,
            steps: self.steps,
        }
    }
}
