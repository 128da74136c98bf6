//! Disposable verification workspaces.
//!
//! A workspace is a detached `git worktree` of the primary repository: it
//! shares the object store, so creation is cheap, and nothing done inside it
//! touches the primary working tree.
//!
//! Lifecycle: [`Workspace::reserve`] takes an exclusive lock on the name,
//! [`Workspace::create`] registers the worktree, [`Workspace::teardown`]
//! removes both. Teardown is idempotent, tolerates a workspace that was never
//! created, and runs again from `Drop` if a caller skipped it.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use rand::{Rng, distributions::Alphanumeric};
use tracing::{debug, info, instrument, warn};

use crate::core::types::{Step, StepOutcome};
use crate::error::{AtlasError, AtlasResult};
use crate::io::git::{self, Git};
use crate::io::process::{CommandRunner, RunControl};
use crate::io::transcript::{NullTranscript, Transcript, banner};

/// Where workspaces and their locks live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceLayout {
    /// Parent directory for worktree checkouts (outside the primary tree).
    pub worktrees_dir: PathBuf,
    /// Directory for lock files, shared by every run against one repository.
    pub locks_dir: PathBuf,
}

impl WorkspaceLayout {
    /// Default layout: locks under `<git-common-dir>/atlas/locks`, checkouts
    /// under `worktrees_dir` or `<tmp>/atlas-worktrees`.
    pub fn resolve(git: &Git, worktrees_dir: Option<&Path>) -> Result<Self> {
        let common = git.common_dir().context("resolve git common dir")?;
        let worktrees_dir = match worktrees_dir {
            Some(dir) => dir.to_path_buf(),
            None => std::env::temp_dir().join("atlas-worktrees"),
        };
        Ok(Self {
            worktrees_dir,
            locks_dir: common.join("atlas").join("locks"),
        })
    }
}

/// Exclusive lock file, created with `create_new` and removed on release.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    released: bool,
}

impl LockFile {
    /// Acquire `<dir>/<name>.lock`. Fails with `WorkspaceLocked` if another
    /// run holds it.
    pub fn acquire(dir: &Path, name: &str) -> AtlasResult<Self> {
        let path = dir.join(format!("{name}.lock"));
        fs::create_dir_all(dir).map_err(|err| AtlasError::WorkspaceCreateFailed {
            name: name.to_string(),
            exit_code: None,
            reason: format!("create lock dir {}: {err}", dir.display()),
        })?;
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let stamp = format!(
                    "pid={}\nacquired_at={}\n",
                    std::process::id(),
                    Utc::now().to_rfc3339()
                );
                if let Err(err) = file.write_all(stamp.as_bytes()) {
                    warn!(err = %err, path = %path.display(), "failed to stamp lock file");
                }
                debug!(path = %path.display(), "lock acquired");
                Ok(Self {
                    path,
                    released: false,
                })
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Err(AtlasError::WorkspaceLocked {
                name: name.to_string(),
                lock_path: path,
            }),
            Err(err) => Err(AtlasError::WorkspaceCreateFailed {
                name: name.to_string(),
                exit_code: None,
                reason: format!("create lock {}: {err}", path.display()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "lock released"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(err = %err, path = %self.path.display(), "failed to release lock"),
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        self.release();
    }
}

/// Random lowercase alphanumeric run id.
pub fn generate_run_id() -> String {
    let mut rng = rand::thread_rng();
    std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase()
}

/// An isolated checkout owned by one verification run.
pub struct Workspace<'r> {
    runner: &'r dyn CommandRunner,
    repo_root: PathBuf,
    name: String,
    path: PathBuf,
    /// Limits for teardown commands.
    control: RunControl,
    lock: Option<LockFile>,
    registered: bool,
    torn_down: bool,
}

impl<'r> Workspace<'r> {
    /// Lock `name` for this run. No git state is touched yet.
    pub fn reserve(
        runner: &'r dyn CommandRunner,
        layout: &WorkspaceLayout,
        repo_root: &Path,
        name: &str,
        control: &RunControl,
    ) -> AtlasResult<Self> {
        let lock = LockFile::acquire(&layout.locks_dir, name)?;
        Ok(Self {
            runner,
            repo_root: repo_root.to_path_buf(),
            name: name.to_string(),
            path: layout.worktrees_dir.join(name),
            control: control.cleanup(),
            lock: Some(lock),
            registered: false,
            torn_down: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Register the worktree. A stale directory with the same name (left by a
    /// crashed run, since the name is locked) is cleared first.
    #[instrument(skip_all, fields(name = %self.name))]
    pub fn create(&mut self, control: &RunControl, transcript: &mut dyn Transcript) -> AtlasResult<()> {
        if self.path.exists() {
            warn!(path = %self.path.display(), "clearing stale workspace");
            self.remove_worktree(transcript);
            if self.path.exists() {
                return Err(AtlasError::WorkspaceExists {
                    path: self.path.clone(),
                });
            }
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|err| AtlasError::WorkspaceCreateFailed {
                name: self.name.clone(),
                exit_code: None,
                reason: format!("create {}: {err}", parent.display()),
            })?;
        }

        banner(transcript, &format!("Creating workspace: {}", self.name));
        // From here on teardown must unregister, even if `add` fails halfway.
        self.registered = true;
        let spec = git::worktree_add_spec(&self.path);
        let outcome = self
            .runner
            .run(&spec, &self.repo_root, control, &mut |line| transcript.line(line))
            .map_err(|err| AtlasError::WorkspaceCreateFailed {
                name: self.name.clone(),
                exit_code: None,
                reason: err.to_string(),
            })?;
        if !outcome.success() {
            return Err(AtlasError::WorkspaceCreateFailed {
                name: self.name.clone(),
                exit_code: outcome.exit_code,
                reason: outcome.transcript.trim().to_string(),
            });
        }
        info!(path = %self.path.display(), "workspace created");
        Ok(())
    }

    /// Apply `diff` inside the workspace. A rejection is reported with the
    /// tool's own diagnostics in the step log.
    pub fn apply_patch(&self, diff: &str, control: &RunControl, transcript: &mut dyn Transcript) -> Step {
        const NAME: &str = "Apply Patch";
        banner(transcript, "Applying patch");
        let spec = git::apply_spec(diff);
        match self
            .runner
            .run(&spec, &self.path, control, &mut |line| transcript.line(line))
        {
            Ok(outcome) => outcome.into_step(NAME, StepOutcome::PatchRejected),
            Err(err) => Step::synthetic(NAME, err.step_outcome(), err.step_exit_code(), format!("{err}\n")),
        }
    }

    /// Best-effort, idempotent teardown. Never fails; problems are logged.
    #[instrument(skip_all, fields(name = %self.name))]
    pub fn teardown(&mut self, transcript: &mut dyn Transcript) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        banner(transcript, &format!("Cleaning up workspace: {}", self.name));
        if self.registered {
            self.remove_worktree(transcript);
        } else if self.path.exists() {
            remove_dir(&self.path);
        }
        if let Some(mut lock) = self.lock.take() {
            lock.release();
        }
        debug!("workspace torn down");
    }

    fn remove_worktree(&self, transcript: &mut dyn Transcript) {
        let cleanup = &self.control;
        let remove = git::worktree_remove_spec(&self.path);
        match self
            .runner
            .run(&remove, &self.repo_root, cleanup, &mut |line| transcript.line(line))
        {
            Ok(outcome) if !outcome.success() => {
                debug!(exit_code = ?outcome.exit_code, "worktree remove failed; falling back to rm");
            }
            Ok(_) => {}
            Err(err) => warn!(err = %err, "worktree remove could not run"),
        }
        if self.path.exists() {
            remove_dir(&self.path);
        }
        // Drops the admin entry (and its lock) under .git/worktrees.
        let prune = git::worktree_prune_spec();
        match self
            .runner
            .run(&prune, &self.repo_root, cleanup, &mut |line| transcript.line(line))
        {
            Ok(outcome) if !outcome.success() => {
                warn!(exit_code = ?outcome.exit_code, "worktree prune failed");
            }
            Ok(_) => {}
            Err(err) => warn!(err = %err, "worktree prune could not run"),
        }
    }
}

impl Drop for Workspace<'_> {
    fn drop(&mut self) {
        if !self.torn_down {
            warn!(name = %self.name, "workspace dropped without teardown; cleaning up");
            self.teardown(&mut NullTranscript);
        }
    }
}

fn remove_dir(path: &Path) {
    if let Err(err) = fs::remove_dir_all(path) {
        warn!(err = %err, path = %path.display(), "failed to remove workspace directory");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeRunner;

    fn layout(root: &Path) -> WorkspaceLayout {
        WorkspaceLayout {
            worktrees_dir: root.join("worktrees"),
            locks_dir: root.join("locks"),
        }
    }

    #[test]
    fn run_ids_are_short_and_lowercase() {
        let id = generate_run_id();
        assert_eq!(id.len(), 6);
        assert!(id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn lock_is_exclusive_until_released() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut first = LockFile::acquire(temp.path(), "ws").expect("first");
        let second = LockFile::acquire(temp.path(), "ws");
        assert!(matches!(second, Err(AtlasError::WorkspaceLocked { .. })));
        first.release();
        first.release();
        assert!(!first.path().exists());
        LockFile::acquire(temp.path(), "ws").expect("reacquire");
    }

    #[test]
    fn reserving_a_held_name_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = FakeRunner::new();
        let control = RunControl::default();
        let layout = layout(temp.path());
        let _held = Workspace::reserve(&runner, &layout, temp.path(), "ws", &control).expect("reserve");
        let again = Workspace::reserve(&runner, &layout, temp.path(), "ws", &control);
        assert!(matches!(again, Err(AtlasError::WorkspaceLocked { .. })));
    }

    #[test]
    fn teardown_is_idempotent_and_releases_lock() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = FakeRunner::new();
        let control = RunControl::default();
        let layout = layout(temp.path());
        let mut ws = Workspace::reserve(&runner, &layout, temp.path(), "ws", &control).expect("reserve");
        let mut transcript = Vec::new();
        ws.create(&control, &mut transcript).expect("create");
        ws.teardown(&mut transcript);
        ws.teardown(&mut transcript);

        assert_eq!(runner.count("git worktree remove"), 1);
        assert_eq!(runner.count("git worktree prune"), 1);
        assert!(!layout.locks_dir.join("ws.lock").exists());
    }

    #[test]
    fn failed_create_still_unregisters_on_teardown() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = FakeRunner::new().exit("git worktree add", 128, "fatal: invalid reference: HEAD");
        let control = RunControl::default();
        let layout = layout(temp.path());
        let mut ws = Workspace::reserve(&runner, &layout, temp.path(), "ws", &control).expect("reserve");
        let mut transcript = Vec::new();
        let err = ws.create(&control, &mut transcript).expect_err("create fails");
        assert!(matches!(
            err,
            AtlasError::WorkspaceCreateFailed {
                exit_code: Some(128),
                ..
            }
        ));
        ws.teardown(&mut transcript);
        assert!(runner.issued("git worktree prune"));
        assert!(!layout.locks_dir.join("ws.lock").exists());
    }

    #[test]
    fn drop_without_teardown_cleans_up() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = FakeRunner::new();
        let control = RunControl::default();
        let layout = layout(temp.path());
        {
            let mut ws = Workspace::reserve(&runner, &layout, temp.path(), "ws", &control).expect("reserve");
            ws.create(&control, &mut Vec::new()).expect("create");
        }
        assert!(runner.issued("git worktree prune"));
        assert!(!layout.locks_dir.join("ws.lock").exists());
    }

    #[test]
    fn stale_directory_is_cleared_before_create() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = FakeRunner::new();
        let control = RunControl::default();
        let layout = layout(temp.path());
        let stale = layout.worktrees_dir.join("ws");
        fs::create_dir_all(&stale).expect("stale dir");
        fs::write(stale.join("leftover.txt"), "x").expect("leftover");

        let mut ws = Workspace::reserve(&runner, &layout, temp.path(), "ws", &control).expect("reserve");
        ws.create(&control, &mut Vec::new()).expect("create");
        assert!(!stale.join("leftover.txt").exists());
        ws.teardown(&mut Vec::new());
    }
}
