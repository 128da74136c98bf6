//! Publish gating.
//!
//! The gates refuse any push the safety configuration does not allow. The
//! confirmation phrase check is the caller's half of the contract: the CLI
//! runs [`authorize_push`] before asking a gate to publish.

use serde::{Deserialize, Serialize};

use crate::error::{AtlasError, AtlasResult};

pub const APPLY_CONFIRMATION: &str = "I authorize push to master";
pub const ROLLBACK_CONFIRMATION: &str = "I authorize rollback and push";

/// Safety flags loaded once per process. Never mutated by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Allow `verify --auto-apply` to commit a passing patch without a
    /// separate `apply` invocation.
    pub enable_auto_apply: bool,
    /// Allow any publish (push) at all.
    pub enable_master_push: bool,
    /// Require the exact confirmation phrase before a publish.
    pub require_manual_confirmation: bool,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            enable_auto_apply: false,
            enable_master_push: false,
            require_manual_confirmation: true,
        }
    }
}

/// Gate-side check: publishing is only possible with `enable_master_push`.
pub fn ensure_push_enabled(safety: &SafetyConfig) -> AtlasResult<()> {
    if !safety.enable_master_push {
        return Err(AtlasError::NotAuthorized(
            "push requested but safety.enable_master_push is false".to_string(),
        ));
    }
    Ok(())
}

/// Caller-side check run before requesting a push.
///
/// `phrase` is the confirmation the operation demands; `supplied` is what the
/// operator typed. Matching is exact.
pub fn authorize_push(
    safety: &SafetyConfig,
    phrase: &str,
    supplied: Option<&str>,
) -> AtlasResult<()> {
    ensure_push_enabled(safety)?;
    if !safety.require_manual_confirmation {
        return Ok(());
    }
    match supplied {
        Some(text) if text == phrase => Ok(()),
        Some(_) => Err(AtlasError::NotAuthorized(format!(
            "confirmation phrase does not match (expected `{phrase}`)"
        ))),
        None => Err(AtlasError::NotAuthorized(format!(
            "manual confirmation required: pass --confirm \"{phrase}\""
        ))),
    }
}

/// `verify --auto-apply` is only allowed when the safety config opts in.
pub fn ensure_auto_apply_enabled(safety: &SafetyConfig) -> AtlasResult<()> {
    if !safety.enable_auto_apply {
        return Err(AtlasError::NotAuthorized(
            "auto-apply requested but safety.enable_auto_apply is false".to_string(),
        ));
    }
    Ok(())
}
