//! Repository analyzer: one container in analyzer role, producing the task
//! list for the whole run.

use anyhow::{Context, Result, anyhow};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::parse::extract_array_as;
use crate::core::types::{CommandStatus, Task};
use crate::io::config::Config;
use crate::io::container::{Container, ContainerRuntime, StartRequest, random_suffix};
use crate::io::prompt::{AnalyzerPromptInputs, PromptEngine};

use super::{ANALYZER_PROMPT_PATH, Role, TASKS_PATH, build_plan, copy_host_credentials};

/// Analyzer failures. All are fatal to the run; there is nothing to schedule.
#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("analyzer agent timed out: {0}")]
    Timeout(String),
    #[error("task list validation failed: {0}")]
    Validation(String),
}

/// Analyze the remote repository and return the ordered task list.
#[instrument(skip_all, fields(git_url))]
pub fn analyze(runtime: &dyn ContainerRuntime, cfg: &Config, git_url: &str) -> Result<Vec<Task>> {
    let request = StartRequest {
        image: cfg.image.clone(),
        name: format!("taskfarm-analyzer-{}", random_suffix(6)),
        memory_mb: cfg.container_memory_mb,
        cpus: cfg.container_cpus,
        env: cfg.proxy.container_env(),
    };
    info!(image = %request.image, "starting analyzer container");
    let container = runtime.start(&request).context("start analyzer container")?;

    let result = run_analysis(&*container, cfg, git_url);
    container.shutdown();
    result
}

fn run_analysis(container: &dyn Container, cfg: &Config, git_url: &str) -> Result<Vec<Task>> {
    copy_host_credentials(container, cfg.use_ssh_remote);

    let prompt = PromptEngine::new().render_analyzer(&AnalyzerPromptInputs {
        git_url: git_url.to_string(),
        min_tasks: cfg.min_tasks,
        max_tasks: cfg.max_tasks,
        work_style: cfg.work_style.clone(),
        coding_style: cfg.coding_style.clone(),
    })?;
    container
        .copy_in_file(&prompt, ANALYZER_PROMPT_PATH)
        .context("stage analyzer prompt")?;

    let plan = build_plan(cfg, Role::Analyzer, git_url);
    let timeout = cfg.container_timeout();

    let setup = container.exec_blocking(&plan.provisioning, timeout)?;
    ensure_success(&setup.status, &setup.error_detail, "provisioning")?;

    debug!("invoking analyzer agent");
    let run = container.exec_streaming(&plan.invocation, timeout)?;
    ensure_success(&run.status, &run.error_detail, "agent invocation")?;

    let raw = container
        .copy_out_file(TASKS_PATH)
        .context("read analyzer task list")?;
    let tasks: Vec<Task> = extract_array_as(&raw)?;
    validate_tasks(tasks, cfg)
}

fn ensure_success(status: &CommandStatus, detail: &str, stage: &str) -> Result<()> {
    match status {
        CommandStatus::Success => Ok(()),
        CommandStatus::Timeout => Err(AnalyzerError::Timeout(detail.to_string()).into()),
        CommandStatus::Failure => Err(anyhow!("analyzer {stage} failed: {detail}")),
    }
}

/// Enforce the task-list contract: bounded count, non-empty fields, unique
/// ids. Missing ids are assigned deterministically; duplicates are never
/// silently merged.
fn validate_tasks(mut tasks: Vec<Task>, cfg: &Config) -> Result<Vec<Task>> {
    if tasks.len() > cfg.max_tasks as usize {
        return Err(AnalyzerError::Validation(format!(
            "agent produced {} tasks, more than max_tasks {}",
            tasks.len(),
            cfg.max_tasks
        ))
        .into());
    }
    if tasks.len() < cfg.min_tasks as usize {
        // Benign by decision: a short list still yields useful branches.
        warn!(
            produced = tasks.len(),
            min_tasks = cfg.min_tasks,
            "agent produced fewer tasks than min_tasks"
        );
    }

    let mut seen = std::collections::HashSet::new();
    for (index, task) in tasks.iter_mut().enumerate() {
        if task.id.trim().is_empty() {
            task.id = format!("task-{}", index + 1);
        }
        if !seen.insert(task.id.clone()) {
            return Err(
                AnalyzerError::Validation(format!("duplicate task id '{}'", task.id)).into(),
            );
        }
        if task.title.trim().is_empty() {
            return Err(
                AnalyzerError::Validation(format!("task '{}' has an empty title", task.id)).into(),
            );
        }
        if task.description.trim().is_empty() {
            return Err(AnalyzerError::Validation(format!(
                "task '{}' has an empty description",
                task.id
            ))
            .into());
        }
        task.priority = task.priority.clamp(1, 5);
    }
    info!(tasks = tasks.len(), "analyzer task list validated");
    Ok(tasks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedBehavior, ScriptedRuntime};

    fn config() -> Config {
        Config {
            min_tasks: 1,
            max_tasks: 3,
            ..Config::default()
        }
    }

    fn runtime_with_tasks(json: &str) -> ScriptedRuntime {
        ScriptedRuntime::new(vec![
            ScriptedBehavior::for_name("analyzer").with_file(TASKS_PATH, json),
        ])
    }

    #[test]
    fn parses_tasks_wrapped_in_prose() {
        let runtime = runtime_with_tasks(
            "The analysis is complete.\n\
             [{\"id\":\"a\",\"title\":\"Fix\",\"description\":\"do it\",\"priority\":9}]\n\
             Good luck!",
        );
        let tasks = analyze(&runtime, &config(), "https://example.com/r.git").expect("analyze");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, "a");
        assert_eq!(tasks[0].priority, 5, "priority is clamped into 1..=5");
        assert!(runtime.all_removed(), "analyzer container must be shut down");
    }

    #[test]
    fn assigns_deterministic_ids_when_omitted() {
        let runtime = runtime_with_tasks(
            r#"[{"title":"A","description":"d"},{"title":"B","description":"d"}]"#,
        );
        let tasks = analyze(&runtime, &config(), "https://example.com/r.git").expect("analyze");
        assert_eq!(tasks[0].id, "task-1");
        assert_eq!(tasks[1].id, "task-2");
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let runtime = runtime_with_tasks(
            r#"[{"id":"x","title":"A","description":"d"},{"id":"x","title":"B","description":"d"}]"#,
        );
        let err = analyze(&runtime, &config(), "https://example.com/r.git").unwrap_err();
        let validation = err.downcast_ref::<AnalyzerError>().expect("typed error");
        assert!(matches!(validation, AnalyzerError::Validation(_)));
    }

    #[test]
    fn too_many_tasks_is_a_validation_error() {
        let runtime = runtime_with_tasks(
            r#"[
                {"id":"1","title":"t","description":"d"},
                {"id":"2","title":"t","description":"d"},
                {"id":"3","title":"t","description":"d"},
                {"id":"4","title":"t","description":"d"}
            ]"#,
        );
        let err = analyze(&runtime, &config(), "https://example.com/r.git").unwrap_err();
        assert!(err.to_string().contains("validation"));
    }

    #[test]
    fn fewer_than_min_tasks_is_benign() {
        let runtime = runtime_with_tasks("[]");
        let tasks = analyze(&runtime, &config(), "https://example.com/r.git").expect("analyze");
        assert!(tasks.is_empty());
    }

    #[test]
    fn agent_timeout_is_classified() {
        let behavior = ScriptedBehavior::for_name("analyzer")
            .with_file(TASKS_PATH, "[]")
            .timing_out_on("cd /app/repo");
        let runtime = ScriptedRuntime::new(vec![behavior]);
        let err = analyze(&runtime, &config(), "https://example.com/r.git").unwrap_err();
        let typed = err.downcast_ref::<AnalyzerError>().expect("typed error");
        assert!(matches!(typed, AnalyzerError::Timeout(_)));
        assert!(runtime.all_removed(), "container removed on the error path");
    }

    #[test]
    fn prompt_is_staged_before_invocation() {
        let runtime = runtime_with_tasks("[]");
        analyze(&runtime, &config(), "https://example.com/r.git").expect("analyze");
        assert!(
            runtime
                .copied_in()
                .iter()
                .any(|(_, path)| path == ANALYZER_PROMPT_PATH)
        );
    }
}
