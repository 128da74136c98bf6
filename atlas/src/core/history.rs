//! Commit marker and `git log` record parsing.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::CommitRef;
use crate::error::{AtlasError, AtlasResult};

/// Subject prefix that marks commits made by this system.
pub const COMMIT_MARKER: &str = "atlas:";

/// Field separator in the `git log` format (ASCII unit separator).
pub const FIELD_SEP: char = '\u{1f}';
/// Record separator in the `git log` format (ASCII record separator).
pub const RECORD_SEP: char = '\u{1e}';

/// `--format` argument matching [`parse_log_records`].
pub const LOG_FORMAT: &str = "--format=%H%x1f%an%x1f%aI%x1f%s%x1e";

static COMMIT_HASH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-fA-F]{4,64}$").expect("commit hash regex is valid"));

/// Ensure `message` starts with the marker so history can find the commit.
pub fn marked_message(message: &str) -> String {
    let trimmed = message.trim();
    if trimmed.starts_with(COMMIT_MARKER) {
        trimmed.to_string()
    } else {
        format!("{COMMIT_MARKER} {trimmed}")
    }
}

/// Commit hashes must be hex so they can never be read as a git option.
pub fn validate_commit_hash(hash: &str) -> AtlasResult<()> {
    if COMMIT_HASH_RE.is_match(hash) {
        Ok(())
    } else {
        Err(AtlasError::InvalidInput(format!(
            "not a commit hash: `{hash}` (expected 4-64 hex characters)"
        )))
    }
}

/// Parse `git log` output produced with [`LOG_FORMAT`], keeping only marked
/// subjects, in input order, capped at `limit`.
pub fn parse_log_records(raw: &str, limit: usize) -> Vec<CommitRef> {
    raw.split(RECORD_SEP)
        .filter_map(parse_record)
        .filter(|commit| commit.subject.starts_with(COMMIT_MARKER))
        .take(limit)
        .collect()
}

fn parse_record(record: &str) -> Option<CommitRef> {
    let record = record.trim_matches(|c: char| c == '\n' || c == '\r');
    if record.is_empty() {
        return None;
    }
    let mut fields = record.splitn(4, FIELD_SEP);
    let hash = fields.next()?.trim();
    let author = fields.next()?;
    let date = fields.next()?;
    let subject = fields.next()?;
    if hash.is_empty() {
        return None;
    }
    Some(CommitRef {
        hash: hash.to_string(),
        author: author.to_string(),
        date: date.to_string(),
        subject: subject.to_string(),
    })
}
