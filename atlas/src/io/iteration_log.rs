//! Append-only JSONL logs under the logs directory.
//!
//! - `performance.jsonl`: one entry per LLM call (latency, token counts).
//! - `iterations.jsonl`: the prompt and parsed proposal of each LLM call.
//! - `operations.jsonl`: one summary per verify/apply/rollback.
//!
//! The sink is observational. Write failures are logged and swallowed; they
//! never change an operation's result.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::types::{Operation, OperationResult, PatchProposal, Status, StepOutcome};
use crate::io::git::Git;

pub const PERFORMANCE_LOG: &str = "performance.jsonl";
pub const ITERATIONS_LOG: &str = "iterations.jsonl";
pub const OPERATIONS_LOG: &str = "operations.jsonl";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceEntry {
    pub timestamp: String,
    pub model: String,
    pub response_time_ms: f64,
    pub prompt_tokens: u64,
    pub response_tokens: u64,
    pub tokens_per_second: f64,
    pub confidence_score: f64,
}

impl PerformanceEntry {
    pub fn new(
        model: &str,
        total_duration_ns: u64,
        prompt_tokens: u64,
        response_tokens: u64,
        confidence_score: f64,
        now: DateTime<Utc>,
    ) -> Self {
        let secs = total_duration_ns as f64 / 1e9;
        let tokens_per_second = if secs > 0.0 {
            response_tokens as f64 / secs
        } else {
            0.0
        };
        Self {
            timestamp: now.to_rfc3339(),
            model: model.to_string(),
            response_time_ms: total_duration_ns as f64 / 1e6,
            prompt_tokens,
            response_tokens,
            tokens_per_second,
            confidence_score,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationEntry {
    pub timestamp: String,
    pub model: String,
    pub prompt: String,
    pub response: PatchProposal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSummary {
    pub name: String,
    pub exit_code: i32,
    pub outcome: StepOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationEntry {
    pub timestamp: String,
    pub operation: Operation,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub steps: Vec<StepSummary>,
}

impl OperationEntry {
    /// Summary of `result`: step names and exit codes, no transcripts.
    pub fn from_result(result: &OperationResult, now: DateTime<Utc>) -> Self {
        Self {
            timestamp: now.to_rfc3339(),
            operation: result.operation,
            status: result.status,
            target: None,
            patch: None,
            commit: None,
            reason: None,
            steps: result
                .steps
                .iter()
                .map(|step| StepSummary {
                    name: step.name.clone(),
                    exit_code: step.exit_code,
                    outcome: step.outcome,
                })
                .collect(),
        }
    }
}

/// Directory of JSONL logs.
#[derive(Debug, Clone)]
pub struct LogSink {
    dir: PathBuf,
}

impl LogSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `configured`, or `<git-common-dir>/atlas/logs`.
    pub fn resolve(git: &Git, configured: Option<&Path>) -> Result<Self> {
        match configured {
            Some(dir) => Ok(Self::new(dir)),
            None => {
                let common = git.common_dir().context("resolve git common dir")?;
                Ok(Self::new(common.join("atlas").join("logs")))
            }
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record_performance(&self, entry: &PerformanceEntry) {
        self.append_logged(PERFORMANCE_LOG, entry);
    }

    pub fn record_iteration(&self, entry: &IterationEntry) {
        self.append_logged(ITERATIONS_LOG, entry);
    }

    pub fn record_operation(&self, entry: &OperationEntry) {
        self.append_logged(OPERATIONS_LOG, entry);
    }

    fn append_logged<T: Serialize>(&self, file: &str, value: &T) {
        if let Err(err) = self.append(file, value) {
            warn!(err = %format!("{err:#}"), file, "failed to append log entry");
        }
    }

    fn append<T: Serialize>(&self, file: &str, value: &T) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create log dir {}", self.dir.display()))?;
        let path = self.dir.join(file);
        let mut line = serde_json::to_string(value).context("serialize log entry")?;
        line.push('\n');
        let mut handle = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        handle
            .write_all(line.as_bytes())
            .with_context(|| format!("append {}", path.display()))?;
        debug!(path = %path.display(), "log entry appended");
        Ok(())
    }
}
