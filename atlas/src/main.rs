//! Atlas CLI.
//!
//! stdout carries the live transcript followed by exactly one
//! `ATLAS_JSON_RESULT:` line for verify/apply/rollback. Diagnostics go to
//! stderr (`RUST_LOG`).

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use atlas::core::safety::{
    APPLY_CONFIRMATION, ROLLBACK_CONFIRMATION, authorize_push, ensure_auto_apply_enabled,
};
use atlas::core::types::{Operation, OperationResult, Step, StepOutcome};
use atlas::error::AtlasError;
use atlas::exit_codes;
use atlas::history::{DEFAULT_HISTORY_LIMIT, list_atlas_commits, render_table};
use atlas::io::config::{AtlasConfig, CONFIG_FILE_NAME, load_config};
use atlas::io::git::Git;
use atlas::io::iteration_log::{LogSink, OperationEntry};
use atlas::io::llm::OllamaProposer;
use atlas::io::process::{ProcessRunner, RunControl};
use atlas::io::proposal::{LoadedProposal, load_proposal};
use atlas::io::result_protocol::{emit_result, write_result_file};
use atlas::io::transcript::{NullTranscript, Transcript, WriterTranscript};
use atlas::io::workspace::{LockFile, WorkspaceLayout};
use atlas::logging;
use atlas::step::error_step;
use atlas::{apply, propose, rollback, verify};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use tracing::warn;

/// Lock held by apply and rollback on the primary working tree.
const PRIMARY_LOCK: &str = "primary";

#[derive(Parser)]
#[command(
    name = "atlas",
    version,
    about = "Patch lifecycle orchestrator: propose, verify, apply, rollback"
)]
struct Cli {
    /// Repository to operate on (defaults to the one containing the cwd).
    #[arg(long, global = true)]
    repo: Option<PathBuf>,
    /// Config file (defaults to `<repo>/atlas.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ask the LLM for a patch that fixes a CI failure.
    Propose {
        /// CI/CD error log to analyze.
        #[arg(long)]
        error_log: PathBuf,
        /// Where to write the proposed diff.
        #[arg(long, default_value = "suggested_patch.diff")]
        output: PathBuf,
        /// Show the proposal without writing files.
        #[arg(long)]
        dry_run: bool,
        /// Print the proposal as JSON instead of a transcript.
        #[arg(long)]
        json: bool,
        #[arg(long)]
        target: Option<String>,
    },
    /// Apply a patch in a disposable worktree and run the build and tests.
    Verify {
        #[command(flatten)]
        patch: PatchArgs,
        /// Target repository from `[target_repos]`.
        #[arg(long)]
        target: Option<String>,
        /// Commit the patch locally if verification passes.
        #[arg(long)]
        auto_apply: bool,
        /// Commit message used with `--auto-apply`.
        #[arg(long)]
        message: Option<String>,
        #[command(flatten)]
        output: OutputArgs,
    },
    /// Commit a verified patch to the primary working tree.
    Apply {
        #[command(flatten)]
        patch: PatchArgs,
        #[arg(long)]
        message: Option<String>,
        #[command(flatten)]
        publish: PublishArgs,
        #[command(flatten)]
        output: OutputArgs,
    },
    /// Revert a commit.
    Rollback {
        /// Commit hash to revert.
        #[arg(long)]
        commit: String,
        /// Why the commit is being reverted.
        #[arg(long)]
        reason: Option<String>,
        #[command(flatten)]
        publish: PublishArgs,
        #[command(flatten)]
        output: OutputArgs,
    },
    /// List commits made by atlas, most recent first.
    History {
        #[arg(long, default_value_t = DEFAULT_HISTORY_LIMIT)]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args)]
struct PatchArgs {
    /// Diff file (with optional `<stem>_metadata.json`) or proposal JSON.
    #[arg(long)]
    patch: PathBuf,
}

#[derive(Args)]
struct PublishArgs {
    /// Push to the remote after committing.
    #[arg(long)]
    push: bool,
    /// Confirmation phrase, required for a push when confirmation is enabled.
    #[arg(long)]
    confirm: Option<String>,
}

#[derive(Args)]
struct OutputArgs {
    /// Also write the final result JSON to this file.
    #[arg(long)]
    result_file: Option<PathBuf>,
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_codes::FAIL
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Propose {
            ref error_log,
            ref output,
            dry_run,
            json,
            ref target,
        } => {
            let ctx = Session::load(&cli)?;
            cmd_propose(&ctx, error_log, output, dry_run, json, target.as_deref())
        }
        Command::History { limit, json } => {
            let root = resolve_root(cli.repo.as_deref())?;
            cmd_history(&root, limit, json)
        }
        Command::Verify {
            ref patch,
            ref target,
            auto_apply,
            ref message,
            ref output,
        } => {
            let operation = if auto_apply {
                Operation::VerifyAndApply
            } else {
                Operation::Verify
            };
            let mut transcript = WriterTranscript::stdout();
            let result = Session::load(&cli).and_then(|ctx| {
                cmd_verify(
                    &ctx,
                    &mut transcript,
                    &patch.patch,
                    target.as_deref(),
                    auto_apply,
                    message.as_deref(),
                )
            });
            finish(operation, result, output)
        }
        Command::Apply {
            ref patch,
            ref message,
            ref publish,
            ref output,
        } => {
            let mut transcript = WriterTranscript::stdout();
            let result = Session::load(&cli)
                .and_then(|ctx| cmd_apply(&ctx, &mut transcript, &patch.patch, message.as_deref(), publish));
            finish(Operation::Apply, result, output)
        }
        Command::Rollback {
            ref commit,
            ref reason,
            ref publish,
            ref output,
        } => {
            let mut transcript = WriterTranscript::stdout();
            let result = Session::load(&cli)
                .and_then(|ctx| cmd_rollback(&ctx, &mut transcript, commit, reason.as_deref(), publish));
            finish(Operation::Rollback, result, output)
        }
    }
}

/// Everything an operation needs from the environment.
struct Session {
    repo_root: PathBuf,
    git: Git,
    config: AtlasConfig,
    control: RunControl,
    sink: LogSink,
}

impl Session {
    fn load(cli: &Cli) -> Result<Self> {
        let repo_root = resolve_root(cli.repo.as_deref())?;
        let git = Git::new(&repo_root);
        let config_path = cli
            .config
            .clone()
            .unwrap_or_else(|| repo_root.join(CONFIG_FILE_NAME));
        let config = load_config(&config_path)?;
        let control = config.limits.run_control();
        let sink = LogSink::resolve(&git, config.logs.dir.as_deref())?;
        Ok(Self {
            repo_root,
            git,
            config,
            control,
            sink,
        })
    }

    fn layout(&self) -> Result<WorkspaceLayout> {
        WorkspaceLayout::resolve(&self.git, self.config.workspace.dir.as_deref())
    }

    fn record(&self, result: &OperationResult, fill: impl FnOnce(&mut OperationEntry)) {
        let mut entry = OperationEntry::from_result(result, Utc::now());
        fill(&mut entry);
        self.sink.record_operation(&entry);
    }
}

fn resolve_root(repo: Option<&Path>) -> Result<PathBuf> {
    let start = match repo {
        Some(path) => path.to_path_buf(),
        None => std::env::current_dir().context("resolve current directory")?,
    };
    Git::new(&start)
        .toplevel()
        .with_context(|| format!("{} is not inside a git repository", start.display()))
}

/// Emit the single result line (and optional result file), map to exit code.
/// Errors raised before a pipeline could run still produce a result.
fn finish(operation: Operation, result: Result<OperationResult>, output: &OutputArgs) -> Result<i32> {
    let result = result.unwrap_or_else(|err| {
        eprintln!("error: {err:#}");
        OperationResult::refused(
            operation,
            Step::synthetic("Prepare", StepOutcome::InvalidInput, 1, format!("{err:#}\n")),
        )
    });
    // A failed result file only warns; the marker line is still emitted.
    if let Some(path) = &output.result_file
        && let Err(err) = write_result_file(path, &result)
    {
        warn!(path = %path.display(), err = %format!("{err:#}"), "result file not written");
        eprintln!("warning: {err:#}");
    }
    let mut stdout = io::stdout().lock();
    stdout.flush().context("flush transcript")?;
    emit_result(&mut stdout, &result)?;
    Ok(if result.passed() {
        exit_codes::OK
    } else {
        exit_codes::FAIL
    })
}

fn refused(operation: Operation, name: &str, err: &AtlasError, transcript: &mut dyn Transcript) -> OperationResult {
    transcript.line(&format!("error: {err}"));
    OperationResult::refused(operation, error_step(name, err))
}

fn load_patch(path: &Path, transcript: &mut dyn Transcript) -> Result<LoadedProposal> {
    let loaded = load_proposal(path)?;
    transcript.line(&format!("Patch: {} ({})", path.display(), loaded.stem));
    if let Some(meta) = &loaded.metadata {
        transcript.line(&format!(
            "Patch id: {} (confidence {:.2})",
            meta.patch_id, meta.confidence_score
        ));
    }
    Ok(loaded)
}

fn default_message(loaded: &LoadedProposal) -> String {
    match &loaded.metadata {
        Some(meta) => format!("apply {}", meta.patch_id),
        None => format!("apply {}", loaded.stem),
    }
}

fn cmd_propose(
    ctx: &Session,
    error_log: &Path,
    output: &Path,
    dry_run: bool,
    json: bool,
    target: Option<&str>,
) -> Result<i32> {
    let proposer = OllamaProposer::new(&ctx.config.llm)?;
    let options = propose::ProposeOptions {
        error_log,
        output,
        dry_run,
        target,
        low_confidence_threshold: ctx.config.llm.low_confidence_threshold,
    };
    if json {
        let outcome = propose::propose(&proposer, &ctx.sink, &mut NullTranscript, &options)?;
        let mut stdout = io::stdout().lock();
        serde_json::to_writer(&mut stdout, &outcome.proposal).context("write proposal json")?;
        writeln!(stdout).context("write proposal json")?;
    } else {
        propose::propose(&proposer, &ctx.sink, &mut WriterTranscript::stdout(), &options)?;
    }
    Ok(exit_codes::OK)
}

fn cmd_history(root: &Path, limit: usize, json: bool) -> Result<i32> {
    let commits = list_atlas_commits(root, limit)?;
    let mut stdout = io::stdout().lock();
    if json {
        serde_json::to_writer_pretty(&mut stdout, &commits).context("write history json")?;
        writeln!(stdout).context("write history")?;
    } else {
        stdout
            .write_all(render_table(&commits).as_bytes())
            .context("write history")?;
    }
    Ok(exit_codes::OK)
}

fn cmd_verify(
    ctx: &Session,
    transcript: &mut dyn Transcript,
    patch: &Path,
    target: Option<&str>,
    auto_apply: bool,
    message: Option<&str>,
) -> Result<OperationResult> {
    let safety = &ctx.config.safety;
    if auto_apply && let Err(err) = ensure_auto_apply_enabled(safety) {
        return Ok(refused(Operation::VerifyAndApply, "Authorize Auto-Apply", &err, transcript));
    }
    let (target_name, repo) = ctx.config.select_target(target)?;
    let loaded = load_patch(patch, transcript)?;
    let layout = ctx.layout()?;
    transcript.line(&format!("Target: {target_name}"));

    let runner = ProcessRunner;
    let request = verify::VerifyRequest {
        proposal: &loaded.proposal,
        repo,
        repo_root: &ctx.repo_root,
        layout: &layout,
        patch_stem: &loaded.stem,
    };
    let verified = verify::verify(&runner, transcript, &request, &ctx.control);
    ctx.record(&verified, |entry| {
        entry.target = Some(target_name.to_string());
        entry.patch = Some(loaded.stem.clone());
    });
    if !auto_apply {
        return Ok(verified);
    }
    if !verified.passed() {
        return Ok(OperationResult {
            operation: Operation::VerifyAndApply,
            ..verified
        });
    }

    let message = message.map_or_else(|| default_message(&loaded), str::to_string);
    let applied = with_primary_lock(&layout, Operation::Apply, transcript, |transcript| {
        apply::apply(
            &runner,
            transcript,
            &apply::ApplyRequest {
                repo_root: &ctx.repo_root,
                diff: &loaded.proposal.diff,
                commit_message: &message,
                push: false,
            },
            safety,
            &ctx.control,
        )
    });
    ctx.record(&applied, |entry| entry.patch = Some(loaded.stem.clone()));
    Ok(verified.chain(applied, Operation::VerifyAndApply))
}

fn cmd_apply(
    ctx: &Session,
    transcript: &mut dyn Transcript,
    patch: &Path,
    message: Option<&str>,
    publish: &PublishArgs,
) -> Result<OperationResult> {
    let safety = &ctx.config.safety;
    if publish.push
        && let Err(err) = authorize_push(safety, APPLY_CONFIRMATION, publish.confirm.as_deref())
    {
        return Ok(refused(Operation::Apply, "Authorize Push", &err, transcript));
    }
    let loaded = load_patch(patch, transcript)?;
    let layout = ctx.layout()?;
    let message = message.map_or_else(|| default_message(&loaded), str::to_string);

    let result = with_primary_lock(&layout, Operation::Apply, transcript, |transcript| {
        apply::apply(
            &ProcessRunner,
            transcript,
            &apply::ApplyRequest {
                repo_root: &ctx.repo_root,
                diff: &loaded.proposal.diff,
                commit_message: &message,
                push: publish.push,
            },
            safety,
            &ctx.control,
        )
    });
    ctx.record(&result, |entry| entry.patch = Some(loaded.stem.clone()));
    Ok(result)
}

fn cmd_rollback(
    ctx: &Session,
    transcript: &mut dyn Transcript,
    commit: &str,
    reason: Option<&str>,
    publish: &PublishArgs,
) -> Result<OperationResult> {
    let safety = &ctx.config.safety;
    if publish.push
        && let Err(err) = authorize_push(safety, ROLLBACK_CONFIRMATION, publish.confirm.as_deref())
    {
        return Ok(refused(Operation::Rollback, "Authorize Push", &err, transcript));
    }
    let layout = ctx.layout()?;
    let result = with_primary_lock(&layout, Operation::Rollback, transcript, |transcript| {
        rollback::rollback(
            &ProcessRunner,
            transcript,
            &rollback::RollbackRequest {
                repo_root: &ctx.repo_root,
                commit_hash: commit,
                push: publish.push,
                reason,
            },
            safety,
            &ctx.control,
        )
    });
    ctx.record(&result, |entry| {
        entry.commit = Some(commit.to_string());
        entry.reason = reason.map(str::to_string);
    });
    Ok(result)
}

/// Run `body` while holding the primary-tree lock.
fn with_primary_lock(
    layout: &WorkspaceLayout,
    operation: Operation,
    transcript: &mut dyn Transcript,
    body: impl FnOnce(&mut dyn Transcript) -> OperationResult,
) -> OperationResult {
    match LockFile::acquire(&layout.locks_dir, PRIMARY_LOCK) {
        Ok(_lock) => body(transcript),
        Err(err) => refused(operation, "Lock Repository", &err, transcript),
    }
}
