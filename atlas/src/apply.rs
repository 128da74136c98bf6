//! Apply gate: commit a verified patch to the primary working tree and
//! optionally publish it.
//!
//! Steps, fail-fast: `Apply Patch` → `Stage Changes` → `Commit` → `Push to Origin`.
//! Stage and commit are both limited to the paths the diff touches, so
//! anything the operator staged beforehand stays out of the commit.
//!
//! `git apply` is atomic, so a rejected diff leaves the primary tree untouched.
//! A failed push leaves the local commit in place; recovering from that is an
//! operator decision, not something this gate undoes.

use std::path::Path;

use tracing::{info, instrument, warn};

use crate::core::diff::{touched_paths, validate_diff};
use crate::core::history::marked_message;
use crate::core::safety::{SafetyConfig, ensure_push_enabled};
use crate::core::step_log::StepLog;
use crate::core::types::{ApplyResult, Operation, OperationResult, StepOutcome};
use crate::io::git;
use crate::io::process::{CommandRunner, RunControl};
use crate::io::transcript::Transcript;
use crate::step::{error_step, run_step};

pub const AUTHORIZE_PUSH_STEP: &str = "Authorize Push";

#[derive(Debug, Clone, Copy)]
pub struct ApplyRequest<'a> {
    pub repo_root: &'a Path,
    pub diff: &'a str,
    /// Prefixed with the commit marker when missing.
    pub commit_message: &'a str,
    pub push: bool,
}

/// Run the apply gate. The confirmation phrase is the caller's responsibility;
/// the gate itself only refuses a push that `safety` does not allow.
#[instrument(skip_all, fields(push = request.push))]
pub fn apply(
    runner: &dyn CommandRunner,
    transcript: &mut dyn Transcript,
    request: &ApplyRequest<'_>,
    safety: &SafetyConfig,
    control: &RunControl,
) -> ApplyResult {
    if let Err(err) = validate_diff(request.diff) {
        transcript.line(&format!("error: {err}"));
        return OperationResult::refused(Operation::Apply, error_step("Validate Patch", &err));
    }
    if request.push
        && let Err(err) = ensure_push_enabled(safety)
    {
        warn!(err = %err, "push refused by safety config");
        transcript.line(&format!("error: {err}"));
        return OperationResult::refused(Operation::Apply, error_step(AUTHORIZE_PUSH_STEP, &err));
    }

    let root = request.repo_root;
    let paths = touched_paths(request.diff);
    let message = marked_message(request.commit_message);
    let planned = [
        ("Apply Patch", git::apply_spec(request.diff), StepOutcome::PatchRejected),
        ("Stage Changes", git::stage_spec(&paths), StepOutcome::Exited),
        ("Commit", git::commit_spec(&message, &paths), StepOutcome::Exited),
    ];

    let mut log = StepLog::new();
    for (name, spec, failure) in &planned {
        let step = run_step(runner, transcript, control, name, spec, root, *failure);
        if !log.record(step) {
            return finish(log);
        }
    }

    if request.push {
        let step = run_step(
            runner,
            transcript,
            control,
            "Push to Origin",
            &git::push_spec(),
            root,
            StepOutcome::Exited,
        );
        log.record(step);
    } else {
        transcript.line("Push not requested; the commit stays local.");
    }
    finish(log)
}

fn finish(log: StepLog) -> ApplyResult {
    let result = log.finish(Operation::Apply);
    info!(status = ?result.status, steps = result.steps.len(), "apply finished");
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Status;
    use crate::test_support::{ADD_IMPORT, FakeRunner};

    fn request(push: bool) -> ApplyRequest<'static> {
        ApplyRequest {
            repo_root: Path::new("/repo"),
            diff: ADD_IMPORT,
            commit_message: "add sys import",
            push,
        }
    }

    fn run(runner: &FakeRunner, push: bool, safety: SafetyConfig) -> ApplyResult {
        apply(runner, &mut Vec::new(), &request(push), &safety, &RunControl::default())
    }

    fn push_allowed() -> SafetyConfig {
        SafetyConfig {
            enable_master_push: true,
            ..SafetyConfig::default()
        }
    }

    #[test]
    fn push_is_never_issued_when_disabled() {
        let runner = FakeRunner::new();
        let result = run(&runner, true, SafetyConfig::default());

        assert_eq!(result.status, Status::Fail);
        assert_eq!(result.steps.len(), 1);
        assert_eq!(result.steps[0].name, AUTHORIZE_PUSH_STEP);
        assert_eq!(result.steps[0].outcome, StepOutcome::NotAuthorized);
        assert!(!runner.issued("git push"));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn local_apply_commits_with_marker_and_only_diff_paths() {
        let runner = FakeRunner::new();
        let result = run(&runner, false, SafetyConfig::default());

        assert_eq!(result.status, Status::Pass);
        let names: Vec<_> = result.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Apply Patch", "Stage Changes", "Commit"]);
        assert!(runner.issued("git add -A -- src/app.py"));
        let commit = runner
            .calls()
            .into_iter()
            .find(|call| call.command.starts_with("git commit"))
            .expect("commit call");
        assert_eq!(commit.stdin.as_deref(), Some("atlas: add sys import"));
        assert!(commit.command.ends_with("--only -- src/app.py"));
        assert!(!runner.issued("git push"));
    }

    #[test]
    fn push_runs_last_when_allowed() {
        let runner = FakeRunner::new();
        let result = run(&runner, true, push_allowed());

        assert_eq!(result.status, Status::Pass);
        assert_eq!(result.steps.last().map(|s| s.name.as_str()), Some("Push to Origin"));
        assert!(runner.position("git commit") < runner.position("git push"));
    }

    #[test]
    fn rejected_patch_stops_everything() {
        let runner = FakeRunner::new().exit("git apply", 1, "error: src/app.py: patch does not apply");
        let result = run(&runner, true, push_allowed());

        assert_eq!(result.steps.len(), 1);
        assert_eq!(result.steps[0].outcome, StepOutcome::PatchRejected);
        assert!(!runner.issued("git add"));
        assert!(!runner.issued("git commit"));
        assert!(!runner.issued("git push"));
    }

    #[test]
    fn failed_push_is_reported_without_undoing_the_commit() {
        let runner = FakeRunner::new().exit("git push", 128, "fatal: could not read Username");
        let result = run(&runner, true, push_allowed());

        assert_eq!(result.status, Status::Fail);
        assert_eq!(result.steps.len(), 4);
        assert_eq!(result.steps[3].exit_code, 128);
        assert!(!runner.issued("git reset"));
        assert!(!runner.issued("git revert"));
    }
}
