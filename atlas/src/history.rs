//! History query: commits made by this system, for rollback target selection.

use std::path::Path;

use anyhow::{Context, Result};

use crate::core::types::CommitRef;
use crate::io::git::Git;

pub const DEFAULT_HISTORY_LIMIT: usize = 20;

/// Commits whose subject starts with the `atlas:` marker, most recent first,
/// capped at `limit`.
pub fn list_atlas_commits(repo_root: &Path, limit: usize) -> Result<Vec<CommitRef>> {
    Git::new(repo_root)
        .marked_commits(limit)
        .context("list atlas commits")
}

/// One line per commit: short hash, date, author, subject.
pub fn render_table(commits: &[CommitRef]) -> String {
    if commits.is_empty() {
        return "No atlas commits found.\n".to_string();
    }
    let mut out = String::new();
    for commit in commits {
        let short = commit.hash.get(..8).unwrap_or(&commit.hash);
        out.push_str(&format!(
            "{short}  {}  {:<16}  {}\n",
            commit.date, commit.author, commit.subject
        ));
    }
    out
}
