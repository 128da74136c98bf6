//! Running one recorded step.
//!
//! Every gate and pipeline executes its commands through [`run_step`], which
//! prints the section banner, streams output to the transcript and turns the
//! outcome (or a spawn error) into a [`Step`].

use std::path::Path;

use tracing::{debug, warn};

use crate::core::types::{Step, StepOutcome};
use crate::error::{AtlasError, CANCELLED_EXIT_CODE};
use crate::io::process::{CommandRunner, CommandSpec, RunControl};
use crate::io::transcript::{Transcript, banner};

/// Execute `spec` in `workdir` as the step `name`.
///
/// `failure_outcome` classifies an ordinary non-zero exit. A run that was
/// cancelled before this step starts is recorded without spawning anything.
pub fn run_step(
    runner: &dyn CommandRunner,
    transcript: &mut dyn Transcript,
    control: &RunControl,
    name: &str,
    spec: &CommandSpec,
    workdir: &Path,
    failure_outcome: StepOutcome,
) -> Step {
    banner(transcript, name);
    if control.cancel.is_cancelled() {
        transcript.line("[cancelled before start]");
        return cancelled_step(name);
    }
    transcript.line(&format!("$ {spec}"));
    let step = match runner.run(spec, workdir, control, &mut |line| transcript.line(line)) {
        Ok(outcome) => outcome.into_step(name, failure_outcome),
        Err(err) => {
            transcript.line(&format!("error: {err}"));
            error_step(name, &err)
        }
    };
    if step.passed() {
        debug!(step = name, duration_ms = step.duration_ms, "step passed");
    } else {
        warn!(step = name, exit_code = step.exit_code, outcome = ?step.outcome, "step failed");
    }
    step
}

/// Step recording an error that happened instead of a command run.
pub fn error_step(name: &str, err: &AtlasError) -> Step {
    Step::synthetic(name, err.step_outcome(), err.step_exit_code(), format!("{err}\n"))
}

pub fn cancelled_step(name: &str) -> Step {
    Step::synthetic(
        name,
        StepOutcome::Cancelled,
        CANCELLED_EXIT_CODE,
        "[cancelled before start]\n",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SPAWN_FAILURE_EXIT_CODE;
    use crate::test_support::FakeRunner;

    #[test]
    fn records_exit_code_and_log() {
        let runner = FakeRunner::new().exit("pytest", 2, "1 failed");
        let mut lines = Vec::new();
        let step = run_step(
            &runner,
            &mut lines,
            &RunControl::default(),
            "Test: pytest -q",
            &CommandSpec::shell("pytest -q"),
            Path::new("."),
            StepOutcome::Exited,
        );
        assert_eq!(step.exit_code, 2);
        assert_eq!(step.log, "1 failed\n");
        assert_eq!(lines[0], "--- Test: pytest -q ---");
        assert!(lines.contains(&"1 failed".to_string()));
    }

    #[test]
    fn spawn_error_becomes_spawn_failure_step() {
        let runner = FakeRunner::new().spawn_failure("make");
        let step = run_step(
            &runner,
            &mut Vec::new(),
            &RunControl::default(),
            "Build: make",
            &CommandSpec::new("make"),
            Path::new("."),
            StepOutcome::Exited,
        );
        assert_eq!(step.outcome, StepOutcome::SpawnFailure);
        assert_eq!(step.exit_code, SPAWN_FAILURE_EXIT_CODE);
        assert!(step.log.contains("make"));
    }

    #[test]
    fn cancelled_run_never_spawns() {
        let runner = FakeRunner::new();
        let control = RunControl::default();
        control.cancel.cancel();
        let step = run_step(
            &runner,
            &mut Vec::new(),
            &control,
            "Commit",
            &CommandSpec::new("git").arg("commit"),
            Path::new("."),
            StepOutcome::Exited,
        );
        assert_eq!(step.outcome, StepOutcome::Cancelled);
        assert!(runner.calls().is_empty());
    }
}
