//! I/O adapters: containers, child processes, git, configuration, prompts,
//! and the run log.

pub mod config;
pub mod container;
pub mod git;
pub mod process;
pub mod prompt;
pub mod run_log;
