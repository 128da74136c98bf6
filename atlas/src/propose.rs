//! `atlas propose`: ask the proposer for a patch and save it for review.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, warn};

use crate::core::diff::validate_diff;
use crate::core::types::PatchProposal;
use crate::io::iteration_log::{IterationEntry, LogSink, PerformanceEntry};
use crate::io::llm::{ProposeRequest, Proposer};
use crate::io::proposal::{ProposalMetadata, save_proposal};
use crate::io::transcript::{Transcript, banner};

#[derive(Debug, Clone, Copy)]
pub struct ProposeOptions<'a> {
    pub error_log: &'a Path,
    /// Where the diff is written; the sidecar goes next to it.
    pub output: &'a Path,
    pub dry_run: bool,
    pub target: Option<&'a str>,
    pub low_confidence_threshold: f64,
}

#[derive(Debug, Clone)]
pub struct ProposeOutcome {
    pub proposal: PatchProposal,
    pub low_confidence: bool,
    /// `(diff, sidecar)` paths, absent on a dry run.
    pub saved: Option<(PathBuf, PathBuf)>,
}

pub fn propose(
    proposer: &dyn Proposer,
    sink: &LogSink,
    transcript: &mut dyn Transcript,
    options: &ProposeOptions<'_>,
) -> Result<ProposeOutcome> {
    let error_log = fs::read_to_string(options.error_log)
        .with_context(|| format!("read error log {}", options.error_log.display()))?;

    banner(transcript, "Analyzing error log");
    let response = proposer.propose(&ProposeRequest {
        error_log: &error_log,
        target: options.target,
    })?;
    let proposal = response.proposal;

    let now = Utc::now();
    sink.record_performance(&PerformanceEntry::new(
        &response.model,
        response.metrics.total_duration_ns,
        response.metrics.prompt_tokens,
        response.metrics.response_tokens,
        proposal.confidence_score,
        now,
    ));
    sink.record_iteration(&IterationEntry {
        timestamp: now.to_rfc3339(),
        model: response.model.clone(),
        prompt: response.prompt,
        response: proposal.clone(),
    });

    banner(transcript, "Patch proposed");
    transcript.line(&format!("Confidence: {:.2}", proposal.confidence_score));
    transcript.line(&format!("Affected files: {}", proposal.affected_files.join(", ")));
    transcript.line("Explanation:");
    for line in proposal.explanation.lines() {
        transcript.line(line);
    }

    let low_confidence = proposal.confidence_score < options.low_confidence_threshold;
    if low_confidence {
        warn!(confidence = proposal.confidence_score, "low confidence proposal");
        transcript.line(&format!(
            "Warning: low confidence ({:.2} < {:.2}); review carefully.",
            proposal.confidence_score, options.low_confidence_threshold
        ));
    }
    if let Err(err) = validate_diff(&proposal.diff) {
        transcript.line(&format!("Warning: {err}"));
    }

    let saved = if options.dry_run {
        transcript.line("Dry run: nothing written.");
        None
    } else {
        let metadata = ProposalMetadata::new(&proposal, Some(options.error_log), now);
        let meta_path = save_proposal(options.output, &proposal, &metadata)?;
        transcript.line(&format!("Patch saved to: {}", options.output.display()));
        transcript.line(&format!("Metadata saved to: {}", meta_path.display()));
        transcript.line(&format!("Next: atlas verify --patch {}", options.output.display()));
        info!(patch_id = %metadata.patch_id, "proposal saved");
        Some((options.output.to_path_buf(), meta_path))
    };

    Ok(ProposeOutcome {
        proposal,
        low_confidence,
        saved,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::iteration_log::{ITERATIONS_LOG, PERFORMANCE_LOG};
    use crate::io::llm::{LlmMetrics, ProposalResponse};
    use crate::io::proposal::load_proposal;
    use crate::test_support::ADD_IMPORT;

    struct CannedProposer {
        confidence: f64,
    }

    impl Proposer for CannedProposer {
        fn propose(&self, request: &ProposeRequest<'_>) -> Result<ProposalResponse> {
            assert!(request.error_log.contains("NameError"));
            Ok(ProposalResponse {
                proposal: PatchProposal {
                    diff: ADD_IMPORT.to_string(),
                    confidence_score: self.confidence,
                    explanation: "import sys".to_string(),
                    affected_files: vec!["src/app.py".to_string()],
                    test_commands: vec!["pytest -q".to_string()],
                },
                model: "canned".to_string(),
                prompt: "prompt".to_string(),
                metrics: LlmMetrics {
                    total_duration_ns: 1_000_000_000,
                    prompt_tokens: 10,
                    response_tokens: 20,
                },
            })
        }
    }

    fn options<'a>(log: &'a Path, out: &'a Path, dry_run: bool) -> ProposeOptions<'a> {
        ProposeOptions {
            error_log: log,
            output: out,
            dry_run,
            target: None,
            low_confidence_threshold: 0.6,
        }
    }

    #[test]
    fn saves_diff_metadata_and_logs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = temp.path().join("ci.log");
        fs::write(&log, "NameError: name 'sys' is not defined\n").expect("write log");
        let out = temp.path().join("suggested_patch.diff");
        let sink = LogSink::new(temp.path().join("logs"));
        let mut lines = Vec::new();

        let outcome = propose(&CannedProposer { confidence: 0.9 }, &sink, &mut lines, &options(&log, &out, false))
            .expect("propose");

        assert!(!outcome.low_confidence);
        let loaded = load_proposal(&out).expect("load saved patch");
        assert_eq!(loaded.proposal.diff, ADD_IMPORT);
        assert!(loaded.metadata.expect("metadata").patch_id.starts_with("atlas-patch-"));
        assert!(sink.dir().join(PERFORMANCE_LOG).exists());
        assert!(sink.dir().join(ITERATIONS_LOG).exists());
        assert!(lines.iter().any(|l| l.starts_with("Patch saved to:")));
    }

    #[test]
    fn dry_run_writes_nothing_and_flags_low_confidence() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = temp.path().join("ci.log");
        fs::write(&log, "NameError\n").expect("write log");
        let out = temp.path().join("suggested_patch.diff");
        let sink = LogSink::new(temp.path().join("logs"));
        let mut lines = Vec::new();

        let outcome = propose(&CannedProposer { confidence: 0.3 }, &sink, &mut lines, &options(&log, &out, true))
            .expect("propose");

        assert!(outcome.low_confidence);
        assert!(outcome.saved.is_none());
        assert!(!out.exists());
        assert!(lines.iter().any(|l| l.contains("low confidence")));
    }
}
