//! Shared data model for a taskfarm run.
//!
//! These types are the stable contracts between the analyzer, scheduler,
//! solvers, and committer. Wire-facing structs use the camelCase names the
//! agents are instructed to emit.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// An atomic instruction for a coding agent, produced by the analyzer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique within a run. Assigned by the analyzer when the agent omits it.
    #[serde(default)]
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// 1..=5, higher is more urgent.
    #[serde(default = "default_priority")]
    pub priority: u8,
    /// Ids of tasks that must not start before this one reaches a terminal
    /// state (weak ordering hint).
    #[serde(default)]
    pub following_tasks: Vec<String>,
}

fn default_priority() -> u8 {
    3
}

/// Terminal and non-terminal states of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    NotStarted,
    Success,
    Skipped,
    Failure,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskStatus::NotStarted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::NotStarted => "not_started",
            TaskStatus::Success => "success",
            TaskStatus::Skipped => "skipped",
            TaskStatus::Failure => "failure",
        }
    }
}

/// The outcome of solving one [`Task`].
///
/// Created in `NotStarted` by the scheduler, mutated only by the owning
/// solver until terminal, then immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    #[serde(flatten)]
    pub task: Task,
    pub status: TaskStatus,
    /// Agent-produced summary, empty until terminal.
    #[serde(default)]
    pub report: String,
    /// Unix millis at transition to a terminal state, 0 otherwise.
    #[serde(default)]
    pub completed_at_ms: i64,
    /// Unified-diff text. Non-empty only for successes that changed files.
    #[serde(default)]
    pub patch: String,
}

impl TaskResult {
    pub fn not_started(task: Task) -> Self {
        Self {
            task,
            status: TaskStatus::NotStarted,
            report: String::new(),
            completed_at_ms: 0,
            patch: String::new(),
        }
    }

    /// Transition to a terminal state, stamping the completion time.
    pub fn finish(mut self, status: TaskStatus, report: impl Into<String>) -> Self {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.report = report.into();
        self.completed_at_ms = Utc::now().timestamp_millis();
        self
    }

    pub fn failure(task: Task, report: impl Into<String>) -> Self {
        Self::not_started(task).finish(TaskStatus::Failure, report)
    }
}

/// Outcome classification for one command batch inside a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Success,
    Failure,
    Timeout,
}

/// The captured outcome of running commands inside a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub status: CommandStatus,
    /// Accumulated stdout, each command prefixed by a `$ <command>` line.
    pub output: String,
    /// Stderr plus a reason string; empty on success.
    pub error_detail: String,
}

impl CommandResult {
    pub fn success(output: String) -> Self {
        Self {
            status: CommandStatus::Success,
            output,
            error_detail: String::new(),
        }
    }

    pub fn failure(output: String, error_detail: impl Into<String>) -> Self {
        Self {
            status: CommandStatus::Failure,
            output,
            error_detail: error_detail.into(),
        }
    }

    pub fn timeout(output: String, error_detail: impl Into<String>) -> Self {
        Self {
            status: CommandStatus::Timeout,
            output,
            error_detail: error_detail.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == CommandStatus::Success
    }
}

/// Final report an agent writes in solver role (`/app/finalReport.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentReport {
    pub task_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: AgentReportStatus,
    #[serde(default)]
    pub report: String,
}

/// Status vocabulary the solver-role agent is allowed to declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentReportStatus {
    Success,
    Skipped,
    Failed,
}

impl From<AgentReportStatus> for TaskStatus {
    fn from(status: AgentReportStatus) -> Self {
        match status {
            AgentReportStatus::Success => TaskStatus::Success,
            AgentReportStatus::Skipped => TaskStatus::Skipped,
            AgentReportStatus::Failed => TaskStatus::Failure,
        }
    }
}
