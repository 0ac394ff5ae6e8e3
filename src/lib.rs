//! Engine for farming repository improvement tasks out to containerized
//! coding agents: analyze a remote repository into a task list, solve each
//! task in an isolated container, and land the patches as per-task branches.

pub mod agents;
pub mod committer;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod scheduler;
pub mod test_support;
