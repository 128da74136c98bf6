//! Error taxonomy for the patch lifecycle.
//!
//! Pipelines never let these escape to the caller: each one is folded into a
//! [`Step`](crate::core::types::Step) with the matching [`StepOutcome`] and the
//! run ends with `status = fail`. Only errors raised before a pipeline starts
//! (config, unreadable inputs) reach `main`.

use std::path::PathBuf;

use crate::core::types::StepOutcome;

/// Conventional exit code recorded for a step that could not be spawned.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 127;
/// Conventional exit code recorded for a step killed by its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;
/// Conventional exit code recorded for a step killed by cancellation.
pub const CANCELLED_EXIT_CODE: i32 = 130;

#[derive(Debug, thiserror::Error)]
pub enum AtlasError {
    /// The child process could not be started at all.
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("workspace already exists and could not be cleared: {}", path.display())]
    WorkspaceExists { path: PathBuf },

    #[error("workspace {name} is locked by another run ({})", lock_path.display())]
    WorkspaceLocked { name: String, lock_path: PathBuf },

    #[error("failed to create workspace {name}: {reason}")]
    WorkspaceCreateFailed {
        name: String,
        exit_code: Option<i32>,
        reason: String,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid proposal: {0}")]
    InvalidProposal(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not authorized: {0}")]
    NotAuthorized(String),
}

impl AtlasError {
    /// Outcome recorded on the step that surfaced this error.
    pub fn step_outcome(&self) -> StepOutcome {
        match self {
            AtlasError::Spawn { .. } => StepOutcome::SpawnFailure,
            AtlasError::WorkspaceExists { .. }
            | AtlasError::WorkspaceLocked { .. }
            | AtlasError::WorkspaceCreateFailed { .. } => StepOutcome::WorkspaceFailure,
            AtlasError::Config(_)
            | AtlasError::InvalidProposal(_)
            | AtlasError::InvalidInput(_) => StepOutcome::InvalidInput,
            AtlasError::NotAuthorized(_) => StepOutcome::NotAuthorized,
        }
    }

    /// Exit code recorded on the step that surfaced this error.
    pub fn step_exit_code(&self) -> i32 {
        match self {
            AtlasError::Spawn { .. } => SPAWN_FAILURE_EXIT_CODE,
            AtlasError::WorkspaceCreateFailed {
                exit_code: Some(code),
                ..
            } if *code != 0 => *code,
            _ => 1,
        }
    }
}

pub type AtlasResult<T> = std::result::Result<T, AtlasError>;
