//! Shared deterministic types for the patch lifecycle.
//!
//! These types are the contract between pipelines and their callers. They are
//! serialized verbatim into the final result line, so field names and enum
//! spellings must stay stable.

use serde::{Deserialize, Serialize};

/// Overall outcome of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pass,
    Fail,
}

/// How a step ended.
///
/// `Exited` covers every command that ran to completion, including non-zero
/// exits; the other variants record why no ordinary exit code exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    /// The command ran and exited on its own.
    Exited,
    /// `git apply` rejected the diff (context mismatch, conflicts).
    PatchRejected,
    /// The command exceeded its per-step timeout and was killed.
    Timeout,
    /// The run was cancelled while the command was running.
    Cancelled,
    /// The command could not be started.
    SpawnFailure,
    /// The isolated workspace could not be created.
    WorkspaceFailure,
    /// Required input was missing or malformed.
    InvalidInput,
    /// A publish was requested without the safety configuration allowing it.
    NotAuthorized,
}

/// One executed command plus its exit code and captured transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub exit_code: i32,
    pub outcome: StepOutcome,
    pub log: String,
    #[serde(default)]
    pub duration_ms: u64,
}

impl Step {
    /// A step passes only when its command exited on its own with code 0.
    pub fn passed(&self) -> bool {
        self.outcome == StepOutcome::Exited && self.exit_code == 0
    }

    /// Build a step that never ran a command (refusals, invalid input).
    pub fn synthetic(
        name: impl Into<String>,
        outcome: StepOutcome,
        exit_code: i32,
        log: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            exit_code,
            outcome,
            log: log.into(),
            duration_ms: 0,
        }
    }
}

/// Which entry point produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Verify,
    Apply,
    Rollback,
    VerifyAndApply,
}

/// Final structured outcome of verify, apply or rollback.
///
/// `steps` is in execution order and ends at the first failing step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    pub operation: Operation,
    pub status: Status,
    pub steps: Vec<Step>,
}

pub type VerificationResult = OperationResult;
pub type ApplyResult = OperationResult;
pub type RollbackResult = OperationResult;

impl OperationResult {
    /// A failed result carrying a single synthetic step.
    pub fn refused(operation: Operation, step: Step) -> Self {
        Self {
            operation,
            status: Status::Fail,
            steps: vec![step],
        }
    }

    pub fn passed(&self) -> bool {
        self.status == Status::Pass
    }

    /// Append the steps of a follow-up operation that only ran because this
    /// one passed.
    pub fn chain(self, next: OperationResult, operation: Operation) -> Self {
        let status = if self.passed() && next.passed() {
            Status::Pass
        } else {
            Status::Fail
        };
        let mut steps = self.steps;
        steps.extend(next.steps);
        Self {
            operation,
            status,
            steps,
        }
    }
}

/// Candidate patch produced by the propose collaborator.
///
/// Read-only to the orchestrator. `diff` defaults to empty so a proposal
/// missing it still parses and is rejected later as invalid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PatchProposal {
    #[serde(default, alias = "patch_diff")]
    pub diff: String,
    #[serde(default)]
    pub confidence_score: f64,
    #[serde(default)]
    pub explanation: String,
    #[serde(default)]
    pub affected_files: Vec<String>,
    #[serde(default)]
    pub test_commands: Vec<String>,
}

/// Point-in-time projection of a commit made by this system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRef {
    pub hash: String,
    pub author: String,
    pub date: String,
    pub subject: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(name: &str, exit_code: i32, outcome: StepOutcome) -> Step {
        Step::synthetic(name, outcome, exit_code, "")
    }

    #[test]
    fn only_clean_exits_pass() {
        assert!(step("a", 0, StepOutcome::Exited).passed());
        assert!(!step("a", 1, StepOutcome::Exited).passed());
        assert!(!step("a", 0, StepOutcome::Timeout).passed());
    }

    #[test]
    fn proposal_accepts_patch_diff_alias() {
        let raw = r#"{"patch_diff":"diff --git a/x b/x","confidence_score":0.8,"explanation":"e","affected_files":["x"],"test_commands":["pytest -q"]}"#;
        let proposal: PatchProposal = serde_json::from_str(raw).expect("parse");
        assert_eq!(proposal.diff, "diff --git a/x b/x");
        assert_eq!(proposal.test_commands, vec!["pytest -q"]);
    }

    #[test]
    fn proposal_without_diff_parses_empty() {
        let proposal: PatchProposal =
            serde_json::from_str(r#"{"explanation":"nothing"}"#).expect("parse");
        assert!(proposal.diff.is_empty());
    }

    #[test]
    fn chain_fails_when_either_side_fails() {
        let verify = OperationResult {
            operation: Operation::Verify,
            status: Status::Pass,
            steps: vec![step("Apply Patch", 0, StepOutcome::Exited)],
        };
        let apply = OperationResult::refused(
            Operation::Apply,
            step("Commit", 1, StepOutcome::Exited),
        );
        let chained = verify.chain(apply, Operation::VerifyAndApply);
        assert_eq!(chained.status, Status::Fail);
        assert_eq!(chained.steps.len(), 2);
        assert_eq!(chained.operation, Operation::VerifyAndApply);
    }

    #[test]
    fn result_serializes_with_stable_spelling() {
        let result = OperationResult::refused(
            Operation::Rollback,
            step("Revert abc1234", 124, StepOutcome::Timeout),
        );
        let json = serde_json::to_string(&result).expect("serialize");
        assert_eq!(
            json,
            r#"{"operation":"rollback","status":"fail","steps":[{"name":"Revert abc1234","exit_code":124,"outcome":"timeout","log":"","duration_ms":0}]}"#
        );
    }
}
