//! Propose collaborator: turns a CI error log into a [`PatchProposal`].
//!
//! [`Proposer`] is the seam; [`OllamaProposer`] talks to an Ollama-compatible
//! chat endpoint. The model must answer with one JSON object, which is checked
//! against the embedded proposal schema before it is trusted.

use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::validator_for;
use minijinja::{Environment, context};
use serde_json::{Value, json};
use tracing::{debug, info, instrument};

use crate::core::types::PatchProposal;
use crate::io::config::LlmConfig;

const SYSTEM_PROMPT: &str = include_str!("prompts/propose_system.md");
const USER_TEMPLATE: &str = include_str!("prompts/propose.md");
pub const PROPOSAL_SCHEMA: &str = include_str!("../../schemas/patch_proposal.schema.json");

/// Only the tail of a long log is sent; failures are usually at the end.
pub const MAX_LOG_BYTES: usize = 16_000;

#[derive(Debug, Clone, Copy)]
pub struct ProposeRequest<'a> {
    pub error_log: &'a str,
    /// Name of the configured target repository, for context.
    pub target: Option<&'a str>,
}

/// Timing and token counts reported by the endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LlmMetrics {
    pub total_duration_ns: u64,
    pub prompt_tokens: u64,
    pub response_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct ProposalResponse {
    pub proposal: PatchProposal,
    pub model: String,
    /// Rendered user prompt, kept for the iterations log.
    pub prompt: String,
    pub metrics: LlmMetrics,
}

pub trait Proposer {
    fn propose(&self, request: &ProposeRequest<'_>) -> Result<ProposalResponse>;
}

/// Render the user prompt for `request`.
pub fn render_prompt(request: &ProposeRequest<'_>) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("propose", USER_TEMPLATE)
        .context("load propose template")?;
    let (error_log, truncated) = log_tail(request.error_log.trim(), MAX_LOG_BYTES);
    let rendered = env.get_template("propose")?.render(context! {
        target => request.target,
        error_log => error_log,
        truncated => truncated,
        max_log_bytes => MAX_LOG_BYTES,
    })?;
    Ok(rendered)
}

/// Last `max` bytes of `log`, cut at a char boundary.
fn log_tail(log: &str, max: usize) -> (&str, bool) {
    if log.len() <= max {
        return (log, false);
    }
    let mut start = log.len() - max;
    while !log.is_char_boundary(start) {
        start += 1;
    }
    (&log[start..], true)
}

/// Parse an Ollama `/api/chat` response body into a validated proposal.
pub fn parse_chat_response(body: &Value) -> Result<(PatchProposal, LlmMetrics)> {
    let content = body
        .pointer("/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("unexpected response format: missing message.content"))?;
    let proposal = parse_proposal_json(content)?;
    let count = |key: &str| body.get(key).and_then(Value::as_u64).unwrap_or(0);
    let metrics = LlmMetrics {
        total_duration_ns: count("total_duration"),
        prompt_tokens: count("prompt_eval_count"),
        response_tokens: count("eval_count"),
    };
    Ok((proposal, metrics))
}

/// Validate model output against the proposal schema and deserialize it.
pub fn parse_proposal_json(content: &str) -> Result<PatchProposal> {
    let value: Value = serde_json::from_str(strip_fences(content))
        .context("model did not return valid JSON")?;
    let schema: Value = serde_json::from_str(PROPOSAL_SCHEMA).context("parse proposal schema")?;
    let validator = validator_for(&schema).map_err(|err| anyhow!("invalid proposal schema: {err}"))?;
    if !validator.is_valid(&value) {
        let messages = validator
            .iter_errors(&value)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        bail!("proposal schema validation failed: {}", messages.join("; "));
    }
    serde_json::from_value(value).context("deserialize proposal")
}

/// Models sometimes wrap JSON in a markdown fence despite instructions.
fn strip_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

/// Blocking client for an Ollama-compatible chat endpoint.
pub struct OllamaProposer {
    config: LlmConfig,
    client: reqwest::blocking::Client,
}

impl OllamaProposer {
    /// Fails when the endpoint is disabled in config.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        if !config.enabled {
            bail!("LLM endpoint is disabled (set [llm].enabled = true)");
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("atlas/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build http client")?;
        Ok(Self {
            config: config.clone(),
            client,
        })
    }
}

impl Proposer for OllamaProposer {
    #[instrument(skip_all, fields(model = %self.config.model, url = %self.config.url))]
    fn propose(&self, request: &ProposeRequest<'_>) -> Result<ProposalResponse> {
        let prompt = render_prompt(request)?;
        let payload = json!({
            "model": self.config.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": prompt},
            ],
            "stream": false,
            "format": "json",
        });
        debug!(prompt_bytes = prompt.len(), "sending proposal request");
        let started = Instant::now();
        let body: Value = self
            .client
            .post(&self.config.url)
            .json(&payload)
            .send()
            .with_context(|| format!("LLM endpoint unreachable: {}", self.config.url))?
            .error_for_status()
            .context("LLM endpoint returned an error status")?
            .json()
            .context("LLM endpoint returned a non-JSON body")?;
        let (proposal, mut metrics) = parse_chat_response(&body)?;
        if metrics.total_duration_ns == 0 {
            metrics.total_duration_ns = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);
        }
        info!(confidence = proposal.confidence_score, "proposal received");
        Ok(ProposalResponse {
            proposal,
            model: self.config.model.clone(),
            prompt,
            metrics,
        })
    }
}
