//! Prompt rendering for the analyzer and solver roles.

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::types::Task;

const ANALYZER_TEMPLATE: &str = include_str!("prompts/analyzer.md");
const SOLVER_TEMPLATE: &str = include_str!("prompts/solver.md");

/// Inputs for the analyzer prompt.
#[derive(Debug, Clone, Serialize)]
pub struct AnalyzerPromptInputs {
    pub git_url: String,
    pub min_tasks: u32,
    pub max_tasks: u32,
    pub work_style: String,
    pub coding_style: String,
}

/// Task context for the solver template.
#[derive(Debug, Clone, Serialize)]
struct TaskContext {
    id: String,
    title: String,
    description: String,
}

impl TaskContext {
    fn from_task(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            title: task.title.clone(),
            description: task.description.clone(),
        }
    }
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("analyzer", ANALYZER_TEMPLATE)
            .expect("analyzer template should be valid");
        env.add_template("solver", SOLVER_TEMPLATE)
            .expect("solver template should be valid");
        Self { env }
    }

    pub fn render_analyzer(&self, inputs: &AnalyzerPromptInputs) -> Result<String> {
        let template = self.env.get_template("analyzer")?;
        let rendered = template.render(context! {
            git_url => inputs.git_url,
            min_tasks => inputs.min_tasks,
            max_tasks => inputs.max_tasks,
            work_style => non_empty(&inputs.work_style),
            coding_style => non_empty(&inputs.coding_style),
        })?;
        Ok(rendered)
    }

    pub fn render_solver(
        &self,
        task: &Task,
        work_style: &str,
        coding_style: &str,
    ) -> Result<String> {
        let template = self.env.get_template("solver")?;
        let rendered = template.render(context! {
            task => TaskContext::from_task(task),
            work_style => non_empty(work_style),
            coding_style => non_empty(coding_style),
        })?;
        Ok(rendered)
    }
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}
