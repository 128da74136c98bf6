//! Deterministic naming for verification workspaces.

use sha2::{Digest, Sha256};

pub const WORKSPACE_PREFIX: &str = "atlas-verify";
const MAX_STEM_LEN: usize = 40;

/// First 8 hex chars of the SHA-256 of the diff text.
pub fn patch_digest(diff: &str) -> String {
    let digest = Sha256::digest(diff.as_bytes());
    hex::encode(digest)[..8].to_string()
}

/// Reduce a patch file stem to `[a-z0-9-]`, collapsing runs of other chars.
pub fn sanitize_stem(stem: &str) -> String {
    let mut out = String::new();
    let mut last_dash = true;
    for ch in stem.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
        if out.len() >= MAX_STEM_LEN {
            break;
        }
    }
    let trimmed = out.trim_end_matches('-');
    if trimmed.is_empty() {
        "patch".to_string()
    } else {
        trimmed.to_string()
    }
}

/// `atlas-verify-<stem>-<digest>-<run_id>`.
///
/// The stem and digest tie the name to the patch; `run_id` keeps concurrent
/// runs of the same patch from sharing a workspace.
pub fn workspace_name(patch_stem: &str, diff: &str, run_id: &str) -> String {
    format!(
        "{WORKSPACE_PREFIX}-{}-{}-{}",
        sanitize_stem(patch_stem),
        patch_digest(diff),
        run_id
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_unsafe_characters() {
        assert_eq!(sanitize_stem("Fix Import (v2)"), "fix-import-v2");
        assert_eq!(sanitize_stem("../../etc/passwd"), "etc-passwd");
        assert_eq!(sanitize_stem("--"), "patch");
    }

    #[test]
    fn caps_stem_length() {
        let long = "a".repeat(200);
        assert_eq!(sanitize_stem(&long).len(), MAX_STEM_LEN);
    }

    #[test]
    fn name_is_stable_for_same_inputs() {
        let a = workspace_name("suggested_patch", "diff", "abc123");
        let b = workspace_name("suggested_patch", "diff", "abc123");
        assert_eq!(a, b);
        assert!(a.starts_with("atlas-verify-suggested-patch-"));
        assert!(a.ends_with("-abc123"));
    }

    #[test]
    fn different_run_ids_never_collide() {
        let a = workspace_name("p", "diff", "run001");
        let b = workspace_name("p", "diff", "run002");
        assert_ne!(a, b);
    }

    #[test]
    fn digest_tracks_diff_content() {
        assert_ne!(patch_digest("a"), patch_digest("b"));
        assert_eq!(patch_digest("a").len(), 8);
    }
}
