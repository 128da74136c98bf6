//! Rollback gate: revert a commit in the primary repository and optionally
//! publish the revert.

use std::path::Path;

use tracing::{debug, info, instrument, warn};

use crate::core::history::validate_commit_hash;
use crate::core::safety::{SafetyConfig, ensure_push_enabled};
use crate::core::step_log::StepLog;
use crate::core::types::{Operation, OperationResult, RollbackResult, StepOutcome};
use crate::io::git;
use crate::io::process::{CommandRunner, RunControl};
use crate::io::transcript::Transcript;
use crate::step::{error_step, run_step};

#[derive(Debug, Clone, Copy)]
pub struct RollbackRequest<'a> {
    pub repo_root: &'a Path,
    pub commit_hash: &'a str,
    pub push: bool,
    /// Operator-supplied reason, echoed to the transcript.
    pub reason: Option<&'a str>,
}

/// Revert `commit_hash`. Conflicts are reported, never resolved; the revert
/// is aborted afterwards so the primary tree is not left mid-revert.
#[instrument(skip_all, fields(commit = request.commit_hash, push = request.push))]
pub fn rollback(
    runner: &dyn CommandRunner,
    transcript: &mut dyn Transcript,
    request: &RollbackRequest<'_>,
    safety: &SafetyConfig,
    control: &RunControl,
) -> RollbackResult {
    let hash = request.commit_hash.trim();
    if let Err(err) = validate_commit_hash(hash) {
        transcript.line(&format!("error: {err}"));
        return OperationResult::refused(Operation::Rollback, error_step("Validate Commit", &err));
    }
    if request.push
        && let Err(err) = ensure_push_enabled(safety)
    {
        warn!(err = %err, "push refused by safety config");
        transcript.line(&format!("error: {err}"));
        return OperationResult::refused(Operation::Rollback, error_step("Authorize Push", &err));
    }
    if let Some(reason) = request.reason.map(str::trim).filter(|r| !r.is_empty()) {
        transcript.line(&format!("Reason: {reason}"));
    }

    let root = request.repo_root;
    let mut log = StepLog::new();
    let revert = run_step(
        runner,
        transcript,
        control,
        &format!("Revert {hash}"),
        &git::revert_spec(hash),
        root,
        StepOutcome::Exited,
    );
    if !log.record(revert) {
        abort_revert(runner, transcript, root, control);
    } else if request.push {
        let step = run_step(
            runner,
            transcript,
            control,
            "Push Revert",
            &git::push_spec(),
            root,
            StepOutcome::Exited,
        );
        log.record(step);
    } else {
        transcript.line("Push not requested; the revert commit stays local.");
    }

    let result = log.finish(Operation::Rollback);
    info!(status = ?result.status, steps = result.steps.len(), "rollback finished");
    result
}

/// Best-effort `git revert --abort`. Not a recorded step.
fn abort_revert(
    runner: &dyn CommandRunner,
    transcript: &mut dyn Transcript,
    root: &Path,
    control: &RunControl,
) {
    let spec = git::revert_abort_spec();
    match runner.run(&spec, root, &control.cleanup(), &mut |line| transcript.line(line)) {
        Ok(outcome) if outcome.success() => debug!("aborted in-progress revert"),
        // Nothing to abort when the revert failed before starting.
        Ok(outcome) => debug!(exit_code = ?outcome.exit_code, "revert --abort had nothing to do"),
        Err(err) => warn!(err = %err, "revert --abort could not run"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Status;
    use crate::test_support::FakeRunner;

    fn run(runner: &FakeRunner, hash: &str, push: bool, safety: SafetyConfig) -> RollbackResult {
        let request = RollbackRequest {
            repo_root: Path::new("/repo"),
            commit_hash: hash,
            push,
            reason: Some("broke the build"),
        };
        rollback(runner, &mut Vec::new(), &request, &safety, &RunControl::default())
    }

    #[test]
    fn local_revert_is_a_single_step() {
        let runner = FakeRunner::new();
        let result = run(&runner, "abc1234", false, SafetyConfig::default());

        assert_eq!(result.status, Status::Pass);
        assert_eq!(result.steps.len(), 1);
        assert_eq!(result.steps[0].name, "Revert abc1234");
        assert!(runner.issued("git revert --no-edit abc1234"));
        assert!(!runner.issued("git push"));
    }

    #[test]
    fn conflict_is_reported_and_aborted() {
        let runner = FakeRunner::new().exit(
            "git revert --no-edit",
            1,
            "CONFLICT (content): Merge conflict in src/app.py",
        );
        let result = run(&runner, "abc1234", true, SafetyConfig {
            enable_master_push: true,
            ..SafetyConfig::default()
        });

        assert_eq!(result.status, Status::Fail);
        assert_eq!(result.steps.len(), 1);
        assert!(result.steps[0].log.contains("CONFLICT"));
        assert!(runner.issued("git revert --abort"));
        assert!(!runner.issued("git push"));
    }

    #[test]
    fn hostile_hash_is_rejected_before_git_runs() {
        let runner = FakeRunner::new();
        let result = run(&runner, "HEAD; rm -rf /", false, SafetyConfig::default());

        assert_eq!(result.steps[0].outcome, StepOutcome::InvalidInput);
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn push_disabled_refuses_up_front() {
        let runner = FakeRunner::new();
        let result = run(&runner, "abc1234", true, SafetyConfig::default());

        assert_eq!(result.steps[0].outcome, StepOutcome::NotAuthorized);
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn allowed_push_follows_the_revert() {
        let runner = FakeRunner::new();
        let result = run(&runner, "abc1234", true, SafetyConfig {
            enable_master_push: true,
            ..SafetyConfig::default()
        });

        let names: Vec<_> = result.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Revert abc1234", "Push Revert"]);
    }
}
