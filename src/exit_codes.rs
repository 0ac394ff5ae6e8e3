//! Stable exit codes for taskfarm commands.

/// Run completed (individual task failures do not change the exit code).
pub const OK: i32 = 0;
/// Configuration invalid or repository remote unresolvable.
pub const CONFIG: i32 = 1;
/// Analyzer stage aborted; nothing was scheduled.
pub const ANALYZER: i32 = 2;
/// Scheduler stage aborted.
pub const SCHEDULER: i32 = 3;
/// Committer stage aborted; see the run log for solver results.
pub const COMMITTER: i32 = 4;
