//! Verification pipeline: apply a proposal in a disposable workspace, then
//! build and test it there.
//!
//! ```text
//! reserve → create → apply → build? → test* → teardown
//! ```
//!
//! Fail-fast at step granularity. Teardown runs on every path out of the
//! pipeline, and again from `Drop` if the pipeline unwinds.

use std::path::Path;

use tracing::{info, instrument};

use crate::core::diff::validate_diff;
use crate::core::naming::workspace_name;
use crate::core::step_log::StepLog;
use crate::core::types::{Operation, OperationResult, PatchProposal, StepOutcome, VerificationResult};
use crate::io::config::TargetRepoConfig;
use crate::io::process::{CommandRunner, RunControl};
use crate::io::transcript::Transcript;
use crate::io::workspace::{Workspace, WorkspaceLayout, generate_run_id};
use crate::step::{cancelled_step, error_step, run_step};

pub const VALIDATE_STEP: &str = "Validate Proposal";
pub const CREATE_WORKSPACE_STEP: &str = "Create Workspace";

/// Inputs for one verification run.
#[derive(Debug, Clone, Copy)]
pub struct VerifyRequest<'a> {
    pub proposal: &'a PatchProposal,
    pub repo: &'a TargetRepoConfig,
    /// Primary repository; never modified by verification.
    pub repo_root: &'a Path,
    pub layout: &'a WorkspaceLayout,
    /// Patch identity (usually the patch file stem), used in the workspace name.
    pub patch_stem: &'a str,
}

/// Run the verification pipeline. Never fails: every problem becomes a step.
///
/// Only the configured build and test commands run; the proposal's own
/// `test_commands` are informational.
#[instrument(skip_all, fields(patch = request.patch_stem))]
pub fn verify(
    runner: &dyn CommandRunner,
    transcript: &mut dyn Transcript,
    request: &VerifyRequest<'_>,
    control: &RunControl,
) -> VerificationResult {
    let diff = request.proposal.diff.as_str();
    if let Err(err) = validate_diff(diff) {
        transcript.line(&format!("error: {err}"));
        return OperationResult::refused(Operation::Verify, error_step(VALIDATE_STEP, &err));
    }

    let name = workspace_name(request.patch_stem, diff, &generate_run_id());
    let mut workspace = match Workspace::reserve(runner, request.layout, request.repo_root, &name, control) {
        Ok(workspace) => workspace,
        Err(err) => {
            transcript.line(&format!("error: {err}"));
            return OperationResult::refused(Operation::Verify, error_step(CREATE_WORKSPACE_STEP, &err));
        }
    };

    let mut log = StepLog::new();
    match workspace.create(control, transcript) {
        Ok(()) => run_steps(runner, transcript, &workspace, request, control, &mut log),
        Err(err) => {
            transcript.line(&format!("error: {err}"));
            log.record(error_step(CREATE_WORKSPACE_STEP, &err));
        }
    }
    workspace.teardown(transcript);

    let result = log.finish(Operation::Verify);
    info!(status = ?result.status, steps = result.steps.len(), "verification finished");
    result
}

fn run_steps(
    runner: &dyn CommandRunner,
    transcript: &mut dyn Transcript,
    workspace: &Workspace<'_>,
    request: &VerifyRequest<'_>,
    control: &RunControl,
    log: &mut StepLog,
) {
    let apply = if control.cancel.is_cancelled() {
        cancelled_step("Apply Patch")
    } else {
        workspace.apply_patch(&request.proposal.diff, control, transcript)
    };
    if !log.record(apply) {
        return;
    }

    if let Some(build) = &request.repo.build_command {
        let step = run_step(
            runner,
            transcript,
            control,
            &format!("Build: {}", build.label()),
            &build.to_spec(),
            workspace.path(),
            StepOutcome::Exited,
        );
        if !log.record(step) {
            return;
        }
    }

    for test in &request.repo.test_commands {
        let step = run_step(
            runner,
            transcript,
            control,
            &format!("Test: {}", test.label()),
            &test.to_spec(),
            workspace.path(),
            StepOutcome::Exited,
        );
        if !log.record(step) {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Status;
    use crate::io::config::CommandLine;
    use crate::test_support::{ADD_IMPORT, FakeRunner};

    struct Fixture {
        temp: tempfile::TempDir,
        layout: WorkspaceLayout,
        proposal: PatchProposal,
    }

    impl Fixture {
        fn new(diff: &str) -> Self {
            let temp = tempfile::tempdir().expect("tempdir");
            let layout = WorkspaceLayout {
                worktrees_dir: temp.path().join("worktrees"),
                locks_dir: temp.path().join("locks"),
            };
            let proposal = PatchProposal {
                diff: diff.to_string(),
                ..PatchProposal::default()
            };
            Self {
                temp,
                layout,
                proposal,
            }
        }

        fn run(&self, runner: &FakeRunner, repo: &TargetRepoConfig) -> VerificationResult {
            let request = VerifyRequest {
                proposal: &self.proposal,
                repo,
                repo_root: self.temp.path(),
                layout: &self.layout,
                patch_stem: "suggested_patch",
            };
            verify(runner, &mut Vec::new(), &request, &RunControl::default())
        }

        fn assert_clean(&self, runner: &FakeRunner) {
            assert!(runner.issued("git worktree prune"));
            let leftover_locks = std::fs::read_dir(&self.layout.locks_dir)
                .map(|entries| entries.count())
                .unwrap_or(0);
            assert_eq!(leftover_locks, 0);
        }
    }

    fn repo(build: Option<&str>, tests: &[&str]) -> TargetRepoConfig {
        TargetRepoConfig {
            build_command: build.map(CommandLine::from),
            test_commands: tests.iter().copied().map(CommandLine::from).collect(),
        }
    }

    fn names(result: &VerificationResult) -> Vec<&str> {
        result.steps.iter().map(|step| step.name.as_str()).collect()
    }

    #[test]
    fn passing_patch_records_apply_and_tests() {
        let fixture = Fixture::new(ADD_IMPORT);
        let runner = FakeRunner::new();
        let result = fixture.run(&runner, &repo(None, &["pytest -q"]));

        assert_eq!(result.status, Status::Pass);
        assert_eq!(names(&result), vec!["Apply Patch", "Test: pytest -q"]);
        fixture.assert_clean(&runner);
    }

    #[test]
    fn rejected_patch_stops_before_tests() {
        let fixture = Fixture::new(ADD_IMPORT);
        let runner = FakeRunner::new().exit("git apply", 1, "error: patch failed: src/app.py:1");
        let result = fixture.run(&runner, &repo(Some("make build"), &["pytest -q"]));

        assert_eq!(result.status, Status::Fail);
        assert_eq!(names(&result), vec!["Apply Patch"]);
        assert_eq!(result.steps[0].outcome, StepOutcome::PatchRejected);
        assert!(result.steps[0].log.contains("patch failed"));
        assert!(!runner.issued("make build"));
        assert!(!runner.issued("pytest"));
        fixture.assert_clean(&runner);
    }

    #[test]
    fn failing_build_skips_tests() {
        let fixture = Fixture::new(ADD_IMPORT);
        let runner = FakeRunner::new().exit("make build", 2, "compile error");
        let result = fixture.run(&runner, &repo(Some("make build"), &["pytest -q"]));

        assert_eq!(names(&result), vec!["Apply Patch", "Build: make build"]);
        assert_eq!(result.steps[1].exit_code, 2);
        assert!(!runner.issued("pytest"));
        fixture.assert_clean(&runner);
    }

    #[test]
    fn later_tests_do_not_run_after_a_failure() {
        let fixture = Fixture::new(ADD_IMPORT);
        let runner = FakeRunner::new().exit("lint", 1, "E501");
        let result = fixture.run(&runner, &repo(None, &["unit", "lint", "integration"]));

        assert_eq!(names(&result), vec!["Apply Patch", "Test: unit", "Test: lint"]);
        assert!(!runner.issued("integration"));
    }

    #[test]
    fn timed_out_test_fails_and_still_cleans_up() {
        let fixture = Fixture::new(ADD_IMPORT);
        let runner = FakeRunner::new().timeout("pytest");
        let result = fixture.run(&runner, &repo(None, &["pytest -q"]));

        assert_eq!(result.status, Status::Fail);
        assert_eq!(result.steps[1].outcome, StepOutcome::Timeout);
        fixture.assert_clean(&runner);
    }

    #[test]
    fn invalid_diff_touches_nothing() {
        let fixture = Fixture::new("   \n");
        let runner = FakeRunner::new();
        let result = fixture.run(&runner, &repo(None, &["pytest -q"]));

        assert_eq!(result.status, Status::Fail);
        assert_eq!(names(&result), vec![VALIDATE_STEP]);
        assert_eq!(result.steps[0].outcome, StepOutcome::InvalidInput);
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn workspace_failure_is_recorded_and_cleaned() {
        let fixture = Fixture::new(ADD_IMPORT);
        let runner = FakeRunner::new().exit("git worktree add", 128, "fatal: not a git repository");
        let result = fixture.run(&runner, &repo(None, &["pytest -q"]));

        assert_eq!(names(&result), vec![CREATE_WORKSPACE_STEP]);
        assert_eq!(result.steps[0].outcome, StepOutcome::WorkspaceFailure);
        assert_eq!(result.steps[0].exit_code, 128);
        assert!(!runner.issued("git apply"));
        fixture.assert_clean(&runner);
    }

    #[test]
    fn commands_run_inside_the_workspace() {
        let fixture = Fixture::new(ADD_IMPORT);
        let runner = FakeRunner::new();
        fixture.run(&runner, &repo(None, &["pytest -q"]));

        let calls = runner.calls();
        let test_call = calls
            .iter()
            .find(|call| call.command.contains("pytest"))
            .expect("test call");
        assert!(test_call.workdir.starts_with(&fixture.layout.worktrees_dir));
        let apply_call = calls
            .iter()
            .find(|call| call.command.starts_with("git apply"))
            .expect("apply call");
        assert_eq!(apply_call.workdir, test_call.workdir);
        assert_eq!(apply_call.stdin.as_deref(), Some(ADD_IMPORT));
    }
}
