//! Unified-diff inspection.
//!
//! Only headers are inspected; hunks are left to `git apply`.

use std::collections::BTreeSet;

use crate::error::{AtlasError, AtlasResult};

/// Reject diffs that `git apply` could never act on.
pub fn validate_diff(diff: &str) -> AtlasResult<()> {
    if diff.trim().is_empty() {
        return Err(AtlasError::InvalidProposal("diff is empty".to_string()));
    }
    if touched_paths(diff).is_empty() {
        return Err(AtlasError::InvalidProposal(
            "diff has no file headers (expected `diff --git` or `---`/`+++` lines)".to_string(),
        ));
    }
    Ok(())
}

/// Repository-relative paths created, modified, renamed or deleted by `diff`.
///
/// Both sides of a rename are returned so staging records the deletion too.
/// Sorted and de-duplicated. Quoted paths (`"a/caf\303\251.py"`) are decoded.
/// When `diff --git` headers are present they are authoritative, and a header
/// that cannot be split falls back to the `---`/`+++` pair of its section.
/// Otherwise a `---` line counts only when a `+++` line follows it, so removed
/// lines that happen to start with `-- ` are not mistaken for headers.
pub fn touched_paths(diff: &str) -> Vec<String> {
    let lines: Vec<&str> = diff.lines().collect();
    let git_style = lines.iter().any(|line| line.starts_with("diff --git "));
    let mut paths = BTreeSet::new();
    // In git style, `---`/`+++` are only read for a section whose header failed.
    let mut want_pair = !git_style;
    for (idx, line) in lines.iter().enumerate() {
        if let Some(rest) = line.strip_prefix("diff --git ") {
            match split_git_header(rest) {
                Some((old, new)) => {
                    paths.insert(old);
                    paths.insert(new);
                    want_pair = false;
                }
                None => want_pair = true,
            }
        } else if want_pair
            && let Some(old) = line.strip_prefix("--- ")
            && let Some(new) = lines.get(idx + 1).and_then(|next| next.strip_prefix("+++ "))
        {
            paths.extend(header_path(old));
            paths.extend(header_path(new));
            want_pair = !git_style;
        }
    }
    paths.into_iter().collect()
}

/// Split `a/<old> b/<new>` from a `diff --git` header. Either side may be
/// quoted.
fn split_git_header(rest: &str) -> Option<(String, String)> {
    let rest = rest.trim();
    let (old, new) = if rest.starts_with('"') {
        let (old, tail) = take_quoted(rest)?;
        (old, parse_side(tail.trim_start())?)
    } else if rest.ends_with('"') {
        let idx = rest.rfind(" \"b/")?;
        (rest[..idx].to_string(), parse_side(&rest[idx + 1..])?)
    } else {
        // Paths may contain spaces, so split at the last " b/".
        let idx = rest.rfind(" b/")?;
        (rest[..idx].to_string(), rest[idx + 1..].to_string())
    };
    let old = old.strip_prefix("a/")?.to_string();
    let new = new.strip_prefix("b/")?.to_string();
    if old.is_empty() || new.is_empty() {
        return None;
    }
    Some((old, new))
}

/// One whole header side: a quoted string, or the raw remainder.
fn parse_side(side: &str) -> Option<String> {
    if side.starts_with('"') {
        let (path, tail) = take_quoted(side)?;
        tail.trim().is_empty().then_some(path)
    } else {
        Some(side.to_string())
    }
}

fn header_path(rest: &str) -> Option<String> {
    let rest = rest.trim_end();
    let raw = if rest.starts_with('"') {
        take_quoted(rest)?.0
    } else {
        // Drop a trailing timestamp (`--- a/x\t2024-01-01 ...`).
        rest.split('\t').next()?.trim().to_string()
    };
    if raw == "/dev/null" {
        return None;
    }
    let path = raw
        .strip_prefix("a/")
        .or_else(|| raw.strip_prefix("b/"))
        .unwrap_or(&raw);
    if path.is_empty() {
        return None;
    }
    Some(path.to_string())
}

/// Decode a C-style quoted string at the start of `input` (git's
/// `core.quotePath` form). Returns the decoded text and what follows the
/// closing quote.
fn take_quoted(input: &str) -> Option<(String, &str)> {
    let body = input.strip_prefix('"')?;
    let bytes = body.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => {
                let text = String::from_utf8(out).ok()?;
                return Some((text, &body[i + 1..]));
            }
            b'\\' => {
                let esc = *bytes.get(i + 1)?;
                i += 2;
                let decoded = match esc {
                    b'a' => 0x07,
                    b'b' => 0x08,
                    b't' => b'\t',
                    b'n' => b'\n',
                    b'v' => 0x0b,
                    b'f' => 0x0c,
                    b'r' => b'\r',
                    b'"' | b'\\' => esc,
                    b'0'..=b'3' => {
                        let digits = bytes.get(i - 1..i + 2)?;
                        if !digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                            return None;
                        }
                        i += 2;
                        digits.iter().fold(0u8, |acc, d| acc * 8 + (d - b'0'))
                    }
                    _ => return None,
                };
                out.push(decoded);
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADD_IMPORT: &str = "diff --git a/src/app.py b/src/app.py\n--- a/src/app.py\n+++ b/src/app.py\n@@ -1,3 +1,4 @@\n import os\n+import sys\n \n def main():\n";

    #[test]
    fn collects_paths_from_git_headers() {
        assert_eq!(touched_paths(ADD_IMPORT), vec!["src/app.py"]);
    }

    #[test]
    fn collects_both_sides_of_rename() {
        let diff = "diff --git a/old name.txt b/new name.txt\nsimilarity index 100%\nrename from old name.txt\nrename to new name.txt\n";
        assert_eq!(touched_paths(diff), vec!["new name.txt", "old name.txt"]);
    }

    #[test]
    fn ignores_dev_null_for_new_files() {
        let diff = "--- /dev/null\n+++ b/docs/NEW.md\n@@ -0,0 +1 @@\n+hello\n";
        assert_eq!(touched_paths(diff), vec!["docs/NEW.md"]);
    }

    #[test]
    fn strips_plain_diff_timestamps() {
        let diff = "--- a/lib.c\t2024-01-01 00:00:00\n+++ b/lib.c\t2024-01-02 00:00:00\n";
        assert_eq!(touched_paths(diff), vec!["lib.c"]);
    }

    #[test]
    fn removed_sql_comments_are_not_headers() {
        let diff = "--- a/schema.sql\n+++ b/schema.sql\n@@ -1,2 +1,1 @@\n--- legacy column\n CREATE TABLE t (id INT);\n";
        assert_eq!(touched_paths(diff), vec!["schema.sql"]);
    }

    #[test]
    fn decodes_quoted_git_headers() {
        let diff = "diff --git \"a/caf\\303\\251.py\" \"b/caf\\303\\251.py\"\n--- \"a/caf\\303\\251.py\"\n+++ \"b/caf\\303\\251.py\"\n@@ -1 +1 @@\n-x = 1\n+x = 2\n";
        assert_eq!(touched_paths(diff), vec!["café.py"]);
        validate_diff(diff).expect("quoted diff is valid");
    }

    #[test]
    fn decodes_escapes_and_mixed_quoting() {
        let diff = "diff --git \"a/tab\\there \\\"q\\\".txt\" b/plain.txt\nrename from x\nrename to y\n";
        assert_eq!(touched_paths(diff), vec!["plain.txt", "tab\there \"q\".txt"]);
    }

    #[test]
    fn mixed_diff_keeps_every_file() {
        let diff = format!(
            "{ADD_IMPORT}diff --git \"a/caf\\303\\251.py\" \"b/caf\\303\\251.py\"\n--- \"a/caf\\303\\251.py\"\n+++ \"b/caf\\303\\251.py\"\n@@ -1 +1 @@\n-x = 1\n+x = 2\n"
        );
        assert_eq!(touched_paths(&diff), vec!["café.py", "src/app.py"]);
    }

    #[test]
    fn unsplittable_header_falls_back_to_file_lines() {
        let diff = "diff --git \"a/broken\n--- \"a/caf\\303\\251.py\"\n+++ \"b/caf\\303\\251.py\"\n@@ -1 +1 @@\n-x\n+y\n";
        assert_eq!(touched_paths(diff), vec!["café.py"]);
    }

    #[test]
    fn rejects_empty_and_headerless_diffs() {
        assert!(matches!(
            validate_diff("  \n"),
            Err(AtlasError::InvalidProposal(_))
        ));
        assert!(matches!(
            validate_diff("just some prose"),
            Err(AtlasError::InvalidProposal(_))
        ));
        validate_diff(ADD_IMPORT).expect("valid diff");
    }
}
