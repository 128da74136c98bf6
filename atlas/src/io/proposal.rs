//! Proposal files on disk.
//!
//! A proposal reaches `verify`/`apply` either as a `.json` [`PatchProposal`]
//! or as a raw diff with an optional sidecar `<stem>_metadata.json` written
//! by `propose`. The file stem is the patch identity.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::types::PatchProposal;

/// Provenance written next to a proposed diff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalMetadata {
    pub timestamp: String,
    pub patch_id: String,
    #[serde(default)]
    pub confidence_score: f64,
    #[serde(default)]
    pub explanation: String,
    #[serde(default)]
    pub affected_files: Vec<String>,
    #[serde(default)]
    pub test_commands: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_log_source: Option<String>,
}

impl ProposalMetadata {
    pub fn new(proposal: &PatchProposal, error_log_source: Option<&Path>, now: DateTime<Utc>) -> Self {
        Self {
            timestamp: now.to_rfc3339(),
            patch_id: patch_id(now),
            confidence_score: proposal.confidence_score,
            explanation: proposal.explanation.clone(),
            affected_files: proposal.affected_files.clone(),
            test_commands: proposal.test_commands.clone(),
            error_log_source: error_log_source.map(|p| p.display().to_string()),
        }
    }
}

/// `atlas-patch-YYYYmmdd-HHMMSS`.
pub fn patch_id(now: DateTime<Utc>) -> String {
    format!("atlas-patch-{}", now.format("%Y%m%d-%H%M%S"))
}

#[derive(Debug, Clone)]
pub struct LoadedProposal {
    pub proposal: PatchProposal,
    /// File stem, used as the patch identity.
    pub stem: String,
    pub metadata: Option<ProposalMetadata>,
}

/// Sidecar path for a diff file: `<dir>/<stem>_metadata.json`.
pub fn metadata_path(diff_path: &Path) -> PathBuf {
    let stem = file_stem(diff_path);
    diff_path.with_file_name(format!("{stem}_metadata.json"))
}

pub fn load_proposal(path: &Path) -> Result<LoadedProposal> {
    let stem = file_stem(path);
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;

    if path.extension().is_some_and(|ext| ext == "json") {
        let proposal: PatchProposal = serde_json::from_str(&contents)
            .with_context(|| format!("parse proposal {}", path.display()))?;
        return Ok(LoadedProposal {
            proposal,
            stem,
            metadata: None,
        });
    }

    let metadata = load_metadata(&metadata_path(path));
    let mut proposal = PatchProposal {
        diff: contents,
        ..PatchProposal::default()
    };
    if let Some(meta) = &metadata {
        proposal.confidence_score = meta.confidence_score;
        proposal.explanation = meta.explanation.clone();
        proposal.affected_files = meta.affected_files.clone();
        proposal.test_commands = meta.test_commands.clone();
    }
    Ok(LoadedProposal {
        proposal,
        stem,
        metadata,
    })
}

/// A malformed sidecar is ignored: the diff alone is a complete proposal.
fn load_metadata(path: &Path) -> Option<ProposalMetadata> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) => {
            debug!(err = %err, path = %path.display(), "no proposal metadata");
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(meta) => Some(meta),
        Err(err) => {
            warn!(err = %err, path = %path.display(), "ignoring malformed proposal metadata");
            None
        }
    }
}

/// Write the diff to `diff_path` and the sidecar next to it. Returns the
/// sidecar path.
pub fn save_proposal(diff_path: &Path, proposal: &PatchProposal, metadata: &ProposalMetadata) -> Result<PathBuf> {
    if let Some(parent) = diff_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    }
    fs::write(diff_path, &proposal.diff).with_context(|| format!("write {}", diff_path.display()))?;
    let meta_path = metadata_path(diff_path);
    let mut buf = serde_json::to_string_pretty(metadata).context("serialize proposal metadata")?;
    buf.push('\n');
    fs::write(&meta_path, buf).with_context(|| format!("write {}", meta_path.display()))?;
    Ok(meta_path)
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| "patch".to_string())
}
