//! Task solver: one container per task, driven through the solver role.

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::parse::extract_object_as;
use crate::core::types::{AgentReport, CommandStatus, Task, TaskResult, TaskStatus};
use crate::io::config::Config;
use crate::io::container::{
    Container, ContainerRegistry, ContainerRuntime, StartRequest, random_suffix,
};
use crate::io::prompt::PromptEngine;

use super::{
    DIFF_HARNESS, DIFF_HARNESS_PATH, DIFF_PATH, REPORT_PATH, Role, SOLVER_PROMPT_PATH, build_plan,
    copy_host_credentials,
};

/// Solver-scoped failures. The scheduler converts these into failure
/// task results; they never reach sibling solvers.
#[derive(Debug, Error)]
pub enum SolverError {
    #[error("solver environment setup failed: {0}")]
    Environment(String),
    #[error("agent final report unreadable: {0}")]
    Report(String),
}

/// Solve one task in a dedicated container and return its terminal result.
///
/// The container is registered for cancellation while the solver owns it and
/// is shut down on every exit path.
#[instrument(skip_all, fields(task_id = %task.id))]
pub fn solve(
    runtime: &dyn ContainerRuntime,
    cfg: &Config,
    git_url: &str,
    task: Task,
    registry: &ContainerRegistry,
) -> Result<TaskResult> {
    let request = StartRequest {
        image: cfg.image.clone(),
        name: format!(
            "taskfarm-task-{}-{}",
            sanitize_name(&task.id),
            random_suffix(6)
        ),
        memory_mb: cfg.container_memory_mb,
        cpus: cfg.container_cpus,
        env: cfg.proxy.container_env(),
    };
    info!(container = %request.name, "starting solver container");
    let container = runtime.start(&request).context("start solver container")?;
    registry.register(&task.id, container.name());
    let task_id = task.id.clone();

    let result = run_solver(&*container, cfg, git_url, task);

    registry.deregister(&task_id);
    container.shutdown();
    result
}

fn run_solver(
    container: &dyn Container,
    cfg: &Config,
    git_url: &str,
    task: Task,
) -> Result<TaskResult> {
    copy_host_credentials(container, cfg.use_ssh_remote);

    let prompt = PromptEngine::new().render_solver(&task, &cfg.work_style, &cfg.coding_style)?;
    container
        .copy_in_file(&prompt, SOLVER_PROMPT_PATH)
        .context("stage solver prompt")?;
    container
        .copy_in_file(DIFF_HARNESS, DIFF_HARNESS_PATH)
        .context("stage diff harness")?;

    let plan = build_plan(cfg, Role::Solver, git_url);
    let timeout = cfg.container_timeout();

    // Long installs stream so output buffers never fill up.
    for command in &plan.provisioning {
        let step = container.exec_streaming(command, timeout)?;
        if !step.is_success() {
            return Err(SolverError::Environment(step.error_detail).into());
        }
    }

    debug!("invoking solver agent");
    let run = container.exec_streaming(&plan.invocation, timeout)?;
    match run.status {
        CommandStatus::Success => {}
        CommandStatus::Timeout => {
            warn!(task_id = %task.id, "solver agent timed out");
            return Ok(TaskResult::failure(
                task,
                format!("agent run hit timeout: {}", run.error_detail),
            ));
        }
        CommandStatus::Failure => {
            return Ok(TaskResult::failure(
                task,
                format!("agent invocation failed: {}", run.error_detail),
            ));
        }
    }

    let raw = container
        .copy_out_file(REPORT_PATH)
        .map_err(|err| SolverError::Report(format!("{err:#}")))?;
    let report: AgentReport =
        extract_object_as(&raw).map_err(|err| SolverError::Report(err.to_string()))?;

    let status = TaskStatus::from(report.status);
    let patch = if status == TaskStatus::Success {
        // Absent or empty patch with a success report is a no-op success.
        container.copy_out_file(DIFF_PATH).unwrap_or_default()
    } else {
        String::new()
    };

    debug!(status = ?status, patch_bytes = patch.len(), "solver finished");
    let mut result = TaskResult::not_started(task).finish(status, report.report);
    result.patch = patch;
    Ok(result)
}

/// Container names accept `[a-zA-Z0-9_.-]`; anything else becomes `-`.
fn sanitize_name(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}
