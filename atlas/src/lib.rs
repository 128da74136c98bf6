//! Atlas: a patch lifecycle orchestrator.
//!
//! A candidate diff moves through four independent entry points:
//!
//! - **propose** ([`propose`]): ask an LLM collaborator for a patch.
//! - **verify** ([`verify`]): apply it in a disposable git worktree, then run
//!   the configured build and tests there.
//! - **apply** ([`apply`]): commit it to the primary working tree, pushing only
//!   when the safety configuration allows.
//! - **rollback** ([`rollback`]): revert a commit, under the same rules.
//!
//! The crate keeps a strict split:
//!
//! - **[`core`]**: Pure, deterministic logic (types, fail-fast step log, diff
//!   inspection, naming, safety rules). No I/O.
//! - **[`io`]**: Side-effecting operations (process execution, git,
//!   workspaces, config, logs, HTTP). [`io::process::CommandRunner`] is the
//!   seam tests replace.
//!
//! Every verify/apply/rollback returns an [`core::types::OperationResult`]
//! instead of an error; the CLI prints it as the single result line defined in
//! [`io::result_protocol`].

pub mod apply;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod history;
pub mod io;
pub mod logging;
pub mod propose;
pub mod rollback;
pub mod step;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod verify;
