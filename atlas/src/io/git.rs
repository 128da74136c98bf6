//! Git adapter.
//!
//! Two kinds of git invocation live here:
//!
//! - **Queries** ([`Git`]): short read-only calls (`rev-parse`, `log`) run
//!   directly and parsed.
//! - **Steps** (the `*_spec` builders): state-changing commands handed to a
//!   [`CommandRunner`](crate::io::process::CommandRunner) so their output is
//!   streamed and recorded. Every user-controlled value (paths, messages,
//!   hashes) is passed as its own argument or on stdin.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

use crate::core::history::{COMMIT_MARKER, LOG_FORMAT, parse_log_records};
use crate::core::types::CommitRef;
use crate::io::process::CommandSpec;

/// Wrapper for executing git queries in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// Absolute path of the repository's top-level directory.
    pub fn toplevel(&self) -> Result<PathBuf> {
        let out = self.run_capture(&["rev-parse", "--show-toplevel"])?;
        Ok(PathBuf::from(out.trim()))
    }

    /// Absolute path of the git directory shared by all worktrees.
    pub fn common_dir(&self) -> Result<PathBuf> {
        let out = self.run_capture(&["rev-parse", "--git-common-dir"])?;
        let path = PathBuf::from(out.trim());
        if path.is_absolute() {
            Ok(path)
        } else {
            Ok(self.workdir.join(path))
        }
    }

    /// Commits whose subject carries the system marker, most recent first.
    #[instrument(skip_all, fields(limit))]
    pub fn marked_commits(&self, limit: usize) -> Result<Vec<CommitRef>> {
        let grep = format!("--grep=^{COMMIT_MARKER}");
        let out = self.run_capture(&["log", &grep, LOG_FORMAT])?;
        let commits = parse_log_records(&out, limit);
        debug!(count = commits.len(), "marked commits");
        Ok(commits)
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn git() -> CommandSpec {
    CommandSpec::new("git")
}

/// `git apply` reading the diff from stdin. Atomic: a rejected diff changes
/// nothing.
pub fn apply_spec(diff: &str) -> CommandSpec {
    git()
        .args(["apply", "--verbose", "--whitespace=nowarn", "-"])
        .stdin(diff)
}

/// Stage exactly `paths` (additions, modifications and deletions).
pub fn stage_spec(paths: &[String]) -> CommandSpec {
    git().args(["add", "-A", "--"]).args(paths.iter().cloned())
}

/// Commit exactly `paths` with `message` read from stdin. Other staged
/// entries stay in the index and out of the commit.
pub fn commit_spec(message: &str, paths: &[String]) -> CommandSpec {
    git()
        .args(["commit", "-F", "-", "--only", "--"])
        .args(paths.iter().cloned())
        .stdin(message)
}

/// Push the current branch to its upstream without prompting for credentials.
pub fn push_spec() -> CommandSpec {
    git().arg("push").env("GIT_TERMINAL_PROMPT", "0")
}

/// Non-interactive revert. `hash` must already be validated as hex.
pub fn revert_spec(hash: &str) -> CommandSpec {
    git().args(["revert", "--no-edit", hash])
}

pub fn revert_abort_spec() -> CommandSpec {
    git().args(["revert", "--abort"])
}

/// Detached checkout of `HEAD` at `path`, sharing the object store.
pub fn worktree_add_spec(path: &Path) -> CommandSpec {
    git()
        .args(["worktree", "add", "--detach"])
        .arg(path.to_string_lossy())
        .arg("HEAD")
}

/// Remove a worktree even if it is dirty or locked.
pub fn worktree_remove_spec(path: &Path) -> CommandSpec {
    git()
        .args(["worktree", "remove", "--force", "--force"])
        .arg(path.to_string_lossy())
}

pub fn worktree_prune_spec() -> CommandSpec {
    git().args(["worktree", "prune"])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_passes_diff_on_stdin() {
        let spec = apply_spec("diff --git a/x b/x\n");
        assert_eq!(spec.args.last().map(String::as_str), Some("-"));
        assert_eq!(spec.stdin.as_deref(), Some(b"diff --git a/x b/x\n".as_slice()));
    }

    #[test]
    fn hostile_values_stay_single_arguments() {
        let paths = vec!["a b.txt".to_string(), "$(rm -rf ~).py".to_string()];
        let spec = stage_spec(&paths);
        assert_eq!(spec.args, vec!["add", "-A", "--", "a b.txt", "$(rm -rf ~).py"]);

        let spec = commit_spec("atlas: \"quoted\" `tick`", &paths);
        assert_eq!(spec.args, vec!["commit", "-F", "-", "--only", "--", "a b.txt", "$(rm -rf ~).py"]);
        assert_eq!(spec.stdin.as_deref(), Some(b"atlas: \"quoted\" `tick`".as_slice()));
    }

    #[test]
    fn push_never_prompts() {
        let spec = push_spec();
        assert!(
            spec.env
                .contains(&("GIT_TERMINAL_PROMPT".to_string(), "0".to_string()))
        );
    }

    #[test]
    fn reads_toplevel_and_common_dir_of_real_repo() {
        let repo = crate::test_support::TestRepo::new().expect("repo");
        let git = Git::new(repo.path().join("src"));
        let toplevel = git.toplevel().expect("toplevel");
        assert_eq!(toplevel.file_name(), repo.path().file_name());
        assert!(git.common_dir().expect("common dir").ends_with(".git"));
    }
}
