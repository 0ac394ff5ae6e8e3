//! Run-wide wiring: analyzer, scheduler, committer, run report.
//!
//! The orchestrator owns the cancellation token and the guarantee that a run
//! report is written before exit, on abort paths included.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use crate::agents::analyzer;
use crate::committer::{CommitSummary, PatchCommitter};
use crate::core::types::{Task, TaskResult, TaskStatus};
use crate::io::config::Config;
use crate::io::container::ContainerRuntime;
use crate::io::git::{Git, to_ssh_url};
use crate::io::run_log;
use crate::scheduler::{self, CancelToken};

/// Stage a run failed in, for exit-code mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Config,
    Analyzer,
    Scheduler,
    Committer,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Config => "config",
            Stage::Analyzer => "analyzer",
            Stage::Scheduler => "scheduler",
            Stage::Committer => "committer",
        }
    }
}

/// A run abort, tagged with the failing stage.
#[derive(Debug)]
pub struct RunError {
    pub stage: Stage,
    pub error: anyhow::Error,
}

impl RunError {
    fn new(stage: Stage, error: anyhow::Error) -> Self {
        Self { stage, error }
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} stage failed: {:#}", self.stage.as_str(), self.error)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Stop after analysis; no solvers, no commits.
    pub dry_run: bool,
    /// Run-log directory override (defaults to the user logs directory).
    pub log_dir: Option<PathBuf>,
}

/// What a completed (or dry) run produced.
#[derive(Debug)]
pub struct RunOutcome {
    pub tasks: Vec<Task>,
    pub results: Vec<TaskResult>,
    pub summary: Option<CommitSummary>,
    pub log_path: Option<PathBuf>,
    pub max_in_flight: usize,
    pub cancelled: bool,
}

/// Drive one full run against the repository at `workdir`.
pub fn run<R: ContainerRuntime + 'static>(
    runtime: Arc<R>,
    cfg: &Config,
    workdir: &Path,
    options: &RunOptions,
    cancel: &CancelToken,
) -> Result<RunOutcome, RunError> {
    let git_url = derive_remote_url(cfg, workdir)
        .map_err(|err| RunError::new(Stage::Config, err))?;
    info!(git_url = %git_url, "orchestrating run");

    let tasks = match analyzer::analyze(&*runtime, cfg, &git_url) {
        Ok(tasks) => tasks,
        Err(err) => {
            // Nothing to schedule, but the report is still owed.
            let _ = write_log(options, &[]);
            return Err(RunError::new(Stage::Analyzer, err));
        }
    };

    if options.dry_run {
        info!(tasks = tasks.len(), "dry run, stopping after analysis");
        return Ok(RunOutcome {
            tasks,
            results: Vec::new(),
            summary: None,
            log_path: None,
            max_in_flight: 0,
            cancelled: cancel.is_cancelled(),
        });
    }

    let outcome = scheduler::run_tasks(runtime, cfg, &git_url, tasks.clone(), cancel);
    let log_path = write_log(options, &outcome.results);
    let cancelled = cancel.is_cancelled();

    let summary = if cancelled {
        // Terminal results are preserved in the log; no branch surgery on an
        // interrupted run.
        info!("run cancelled, skipping patch committer");
        None
    } else {
        let successes: Vec<TaskResult> = outcome
            .results
            .iter()
            .filter(|result| result.status == TaskStatus::Success)
            .cloned()
            .collect();
        let committer = PatchCommitter::new(workdir, cfg.recovery)
            .map_err(|err| RunError::new(Stage::Committer, err))?;
        let summary = committer
            .apply_results(&successes)
            .map_err(|err| RunError::new(Stage::Committer, err))?;
        Some(summary)
    };

    Ok(RunOutcome {
        tasks,
        results: outcome.results,
        summary,
        log_path,
        max_in_flight: outcome.max_in_flight,
        cancelled,
    })
}

/// Remote URL of the host repository, honoring `use_ssh_remote`.
fn derive_remote_url(cfg: &Config, workdir: &Path) -> anyhow::Result<String> {
    let url = Git::new(workdir)
        .remote_url()
        .context("derive repository remote")?;
    Ok(if cfg.use_ssh_remote {
        to_ssh_url(&url)
    } else {
        url
    })
}

fn write_log(options: &RunOptions, results: &[TaskResult]) -> Option<PathBuf> {
    let dir = options
        .log_dir
        .clone()
        .or_else(run_log::default_log_dir)?;
    match run_log::write_run_log(&dir, results) {
        Ok(path) => Some(path),
        Err(err) => {
            warn!(error = %format!("{err:#}"), "run log write failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{REPORT_PATH, TASKS_PATH};
    use crate::test_support::{ScriptedBehavior, ScriptedRuntime, TestRepo};

    fn analyzer_behavior(tasks_json: &str) -> ScriptedBehavior {
        ScriptedBehavior::for_name("analyzer").with_file(TASKS_PATH, tasks_json)
    }

    #[test]
    fn zero_tasks_completes_with_empty_summary() {
        let repo = TestRepo::new().expect("repo");
        let temp_logs = tempfile::tempdir().expect("logs dir");
        let runtime = Arc::new(ScriptedRuntime::new(vec![analyzer_behavior("[]")]));
        let cfg = Config {
            min_tasks: 0,
            ..Config::default()
        };

        let head_before = repo.head_sha().expect("head");
        let outcome = run(
            runtime,
            &cfg,
            repo.path(),
            &RunOptions {
                dry_run: false,
                log_dir: Some(temp_logs.path().to_path_buf()),
            },
            &CancelToken::new(),
        )
        .expect("run");

        assert!(outcome.results.is_empty());
        let summary = outcome.summary.expect("summary");
        assert_eq!(summary.total, 0);
        assert!(outcome.log_path.expect("log path").exists());
        assert_eq!(repo.head_sha().expect("head"), head_before);
    }

    #[test]
    fn dry_run_stops_after_analysis() {
        let repo = TestRepo::new().expect("repo");
        let runtime = Arc::new(ScriptedRuntime::new(vec![analyzer_behavior(
            r#"[{"id":"a","title":"t","description":"d"}]"#,
        )]));

        let outcome = run(
            Arc::clone(&runtime),
            &Config::default(),
            repo.path(),
            &RunOptions {
                dry_run: true,
                log_dir: None,
            },
            &CancelToken::new(),
        )
        .expect("run");

        assert_eq!(outcome.tasks.len(), 1);
        assert!(outcome.results.is_empty());
        assert!(outcome.summary.is_none());
        // Only the analyzer container ever started.
        assert_eq!(runtime.started().len(), 1);
    }

    #[test]
    fn analyzer_failure_aborts_with_stage() {
        let repo = TestRepo::new().expect("repo");
        let temp_logs = tempfile::tempdir().expect("logs dir");
        let behavior = ScriptedBehavior::for_name("analyzer").failing_on("git clone");
        let runtime = Arc::new(ScriptedRuntime::new(vec![behavior]));

        let err = run(
            runtime,
            &Config::default(),
            repo.path(),
            &RunOptions {
                dry_run: false,
                log_dir: Some(temp_logs.path().to_path_buf()),
            },
            &CancelToken::new(),
        )
        .unwrap_err();

        assert_eq!(err.stage, Stage::Analyzer);
        // The abort still flushed a (empty) run report.
        let entries: Vec<_> = std::fs::read_dir(temp_logs.path())
            .expect("read dir")
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn missing_remote_is_a_config_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::process::Command::new("git")
            .args(["init", "-q"])
            .current_dir(temp.path())
            .status()
            .expect("git init");
        let runtime = Arc::new(ScriptedRuntime::new(Vec::new()));

        let err = run(
            runtime,
            &Config::default(),
            temp.path(),
            &RunOptions::default(),
            &CancelToken::new(),
        )
        .unwrap_err();
        assert_eq!(err.stage, Stage::Config);
    }

    #[test]
    fn full_run_commits_successful_patches() {
        let repo = TestRepo::new().expect("repo");
        let temp_logs = tempfile::tempdir().expect("logs dir");
        let patch = crate::test_support::new_file_patch("improvement.txt", "better");
        let report =
            r#"{"taskId":"a","title":"a title","description":"d","status":"success","report":"done"}"#;
        let runtime = Arc::new(ScriptedRuntime::new(vec![
            analyzer_behavior(r#"[{"id":"a","title":"a title","description":"d"}]"#),
            ScriptedBehavior::for_name("task-a")
                .with_file(REPORT_PATH, report)
                .with_file(crate::agents::DIFF_PATH, &patch),
        ]));

        let head_before = repo.head_sha().expect("head");
        let outcome = run(
            runtime,
            &Config::default(),
            repo.path(),
            &RunOptions {
                dry_run: false,
                log_dir: Some(temp_logs.path().to_path_buf()),
            },
            &CancelToken::new(),
        )
        .expect("run");

        let summary = outcome.summary.expect("summary");
        assert_eq!(summary.successful, 1);
        let record = &summary.records[0];
        let branch = record.branch.as_deref().expect("branch created");
        assert!(branch.starts_with("task-a-"));
        assert!(repo.git().branch_exists(branch).expect("branch exists"));
        // The tree is back where the run started.
        assert_eq!(repo.head_sha().expect("head"), head_before);
        assert!(!repo.file_exists("improvement.txt"));
    }
}
