//! Test-only helpers: a scripted command runner, a throwaway git repository
//! and diff fixtures.

use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::error::{AtlasError, AtlasResult};
use crate::io::process::{CommandOutcome, CommandRunner, CommandSpec, RunControl};

/// Adds `import sys` to `src/app.py` of a [`TestRepo`].
pub const ADD_IMPORT: &str = "diff --git a/src/app.py b/src/app.py\n\
--- a/src/app.py\n\
+++ b/src/app.py\n\
@@ -1,3 +1,4 @@\n \
import os\n\
+import sys\n \
\n \
def main():\n";

/// Context lines that do not match [`TestRepo`]'s `src/app.py`.
pub const STALE_CONTEXT: &str = "diff --git a/src/app.py b/src/app.py\n\
--- a/src/app.py\n\
+++ b/src/app.py\n\
@@ -1,3 +1,4 @@\n \
import json\n\
+import sys\n \
\n \
def run():\n";

/// Creates a new file `docs/NOTES.md`.
pub const NEW_FILE: &str = "diff --git a/docs/NOTES.md b/docs/NOTES.md\n\
new file mode 100644\n\
--- /dev/null\n\
+++ b/docs/NOTES.md\n\
@@ -0,0 +1 @@\n\
+notes\n";

const INITIAL_APP: &str = "import os\n\ndef main():\n    return 0\n";

#[derive(Debug, Clone)]
enum Scripted {
    Exit { code: i32, output: String },
    SpawnFailure,
    Timeout,
}

#[derive(Debug, Clone)]
struct Rule {
    pattern: String,
    response: Scripted,
}

/// A single command the fake runner was asked to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    /// Shell-escaped rendering of the command.
    pub command: String,
    pub workdir: PathBuf,
    pub stdin: Option<String>,
}

/// Scripted [`CommandRunner`].
///
/// Responses are matched by substring against the rendered command, first
/// rule wins. Unmatched commands exit 0 with no output.
#[derive(Debug, Default)]
pub struct FakeRunner {
    rules: Vec<Rule>,
    calls: RefCell<Vec<RecordedCall>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands containing `pattern` exit with `code` after printing `output`.
    pub fn exit(mut self, pattern: &str, code: i32, output: &str) -> Self {
        self.rules.push(Rule {
            pattern: pattern.to_string(),
            response: Scripted::Exit {
                code,
                output: output.to_string(),
            },
        });
        self
    }

    /// Commands containing `pattern` cannot be spawned.
    pub fn spawn_failure(mut self, pattern: &str) -> Self {
        self.rules.push(Rule {
            pattern: pattern.to_string(),
            response: Scripted::SpawnFailure,
        });
        self
    }

    /// Commands containing `pattern` run past their deadline.
    pub fn timeout(mut self, pattern: &str) -> Self {
        self.rules.push(Rule {
            pattern: pattern.to_string(),
            response: Scripted::Timeout,
        });
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.borrow().clone()
    }

    /// Rendered commands, in execution order.
    pub fn commands(&self) -> Vec<String> {
        self.calls.borrow().iter().map(|call| call.command.clone()).collect()
    }

    pub fn issued(&self, pattern: &str) -> bool {
        self.count(pattern) > 0
    }

    pub fn count(&self, pattern: &str) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|call| call.command.contains(pattern))
            .count()
    }

    /// Position of the first command containing `pattern`.
    pub fn position(&self, pattern: &str) -> Option<usize> {
        self.calls
            .borrow()
            .iter()
            .position(|call| call.command.contains(pattern))
    }
}

impl CommandRunner for FakeRunner {
    fn run(
        &self,
        spec: &CommandSpec,
        workdir: &Path,
        control: &RunControl,
        on_line: &mut dyn FnMut(&str),
    ) -> AtlasResult<CommandOutcome> {
        let command = spec.to_string();
        self.calls.borrow_mut().push(RecordedCall {
            command: command.clone(),
            workdir: workdir.to_path_buf(),
            stdin: spec
                .stdin
                .as_ref()
                .map(|bytes| String::from_utf8_lossy(bytes).to_string()),
        });
        let response = self
            .rules
            .iter()
            .find(|rule| command.contains(&rule.pattern))
            .map(|rule| rule.response.clone())
            .unwrap_or(Scripted::Exit {
                code: 0,
                output: String::new(),
            });

        let mut outcome = CommandOutcome {
            exit_code: Some(0),
            transcript: String::new(),
            truncated_bytes: 0,
            timed_out: false,
            cancelled: control.cancel.is_cancelled(),
            duration: Duration::from_millis(1),
        };
        match response {
            Scripted::Exit { code, output } => {
                for line in output.lines() {
                    on_line(line);
                    outcome.transcript.push_str(line);
                    outcome.transcript.push('\n');
                }
                outcome.exit_code = Some(code);
            }
            Scripted::SpawnFailure => {
                return Err(AtlasError::Spawn {
                    command,
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "No such file or directory"),
                });
            }
            Scripted::Timeout => {
                outcome.exit_code = None;
                outcome.timed_out = true;
                outcome.duration = control.timeout;
            }
        }
        Ok(outcome)
    }
}

/// Throwaway git repository with one commit containing `src/app.py`.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp repo")?;
        let repo = Self { dir };
        repo.git(&["init", "-q"])?;
        repo.git(&["config", "user.email", "atlas@example.com"])?;
        repo.git(&["config", "user.name", "Atlas Test"])?;
        repo.git(&["config", "commit.gpgsign", "false"])?;
        repo.write("src/app.py", INITIAL_APP)?;
        repo.git(&["add", "-A"])?;
        repo.git(&["commit", "-q", "-m", "initial"])?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, rel: &str, contents: &str) -> Result<()> {
        let path = self.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }

    pub fn read(&self, rel: &str) -> Result<String> {
        let path = self.path().join(rel);
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    /// Stage everything and commit with `message`; returns the new HEAD.
    pub fn commit_all(&self, message: &str) -> Result<String> {
        self.git(&["add", "-A"])?;
        self.git(&["commit", "-q", "-m", message])?;
        self.head()
    }

    pub fn head(&self) -> Result<String> {
        Ok(self.git(&["rev-parse", "HEAD"])?.trim().to_string())
    }

    /// Number of registered worktrees, the primary one included.
    pub fn worktree_count(&self) -> Result<usize> {
        let out = self.git(&["worktree", "list", "--porcelain"])?;
        Ok(out.lines().filter(|line| line.starts_with("worktree ")).count())
    }

    /// Run git in the repository and return stdout.
    pub fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(self.path())
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !output.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}
