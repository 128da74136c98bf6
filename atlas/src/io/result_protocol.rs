//! Final-result wire format.
//!
//! Every operation ends with exactly one line `ATLAS_JSON_RESULT:<json>` on
//! stdout, after cleanup. No transcript line may start with the marker, so a
//! caller can skip everything else and still get a complete result.

use std::borrow::Cow;
use std::fs;
use std::io::{BufRead, Write};
use std::path::Path;

use anyhow::{Context, Result, anyhow};

use crate::core::types::OperationResult;

pub const RESULT_MARKER: &str = "ATLAS_JSON_RESULT:";

/// Prefix applied to transcript lines that would otherwise look like a result.
const ESCAPE_PREFIX: &str = "| ";

/// Serialize the single result line (without trailing newline).
pub fn encode_result_line(result: &OperationResult) -> Result<String> {
    let json = serde_json::to_string(result).context("serialize result")?;
    Ok(format!("{RESULT_MARKER}{json}"))
}

/// Write the result line and flush.
pub fn emit_result<W: Write>(writer: &mut W, result: &OperationResult) -> Result<()> {
    let line = encode_result_line(result)?;
    writeln!(writer, "{line}").context("write result line")?;
    writer.flush().context("flush result line")?;
    Ok(())
}

/// Atomically write the result JSON to `path` (temp file + rename).
pub fn write_result_file(path: &Path, result: &OperationResult) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(result).context("serialize result")?;
    buf.push('\n');
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf).with_context(|| format!("write temp result {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace result {}", path.display()))?;
    Ok(())
}

/// Escape a transcript line that starts with the result marker.
pub fn sanitize_transcript_line(line: &str) -> Cow<'_, str> {
    if line.starts_with(RESULT_MARKER) {
        Cow::Owned(format!("{ESCAPE_PREFIX}{line}"))
    } else {
        Cow::Borrowed(line)
    }
}

/// Parse one line. `None` if it is not a result line.
pub fn parse_result_line(line: &str) -> Option<Result<OperationResult>> {
    let payload = line.trim_end_matches(['\n', '\r']).strip_prefix(RESULT_MARKER)?;
    Some(serde_json::from_str(payload).context("parse result payload"))
}

/// Read a captured stream and return its final result, rejecting streams with
/// zero or several result lines.
pub fn extract_result<R: BufRead>(reader: R) -> Result<OperationResult> {
    let mut found = None;
    for line in reader.lines() {
        let line = line.context("read stream")?;
        if let Some(parsed) = parse_result_line(&line) {
            if found.is_some() {
                return Err(anyhow!("stream contains more than one result line"));
            }
            found = Some(parsed?);
        }
    }
    found.ok_or_else(|| anyhow!("stream ended without a result line"))
}
