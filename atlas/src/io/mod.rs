//! Side-effecting adapters: processes, git, workspaces, files and HTTP.

pub mod config;
pub mod git;
pub mod iteration_log;
pub mod llm;
pub mod process;
pub mod proposal;
pub mod result_protocol;
pub mod transcript;
pub mod workspace;
