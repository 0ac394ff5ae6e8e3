//! Test-only helpers: scripted container runtimes and real-git repositories.
//!
//! `ScriptedRuntime` implements the container seam without Docker; behaviors
//! are matched against container names, so scheduler tests can script one
//! outcome per task. `TestRepo` builds disposable git repositories for
//! committer and orchestrator tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::core::types::{CommandResult, Task};
use crate::io::container::{Container, ContainerRuntime, StartRequest};
use crate::io::git::Git;

/// Create a deterministic task with default fields.
pub fn task(id: &str) -> Task {
    Task {
        id: id.to_string(),
        title: format!("{id} title"),
        description: format!("{id} description"),
        priority: 3,
        following_tasks: Vec::new(),
    }
}

/// Create a deterministic task with explicit successors.
pub fn task_with_following(id: &str, following: &[&str]) -> Task {
    let mut task = task(id);
    task.following_tasks = following.iter().map(|s| s.to_string()).collect();
    task
}

/// A unified diff that creates `path` with a single line of content.
pub fn new_file_patch(path: &str, line: &str) -> String {
    format!(
        "diff --git a/{path} b/{path}\n\
         new file mode 100644\n\
         --- /dev/null\n\
         +++ b/{path}\n\
         @@ -0,0 +1 @@\n\
         +{line}\n"
    )
}

/// Scripted behavior for containers whose name contains `key`.
#[derive(Debug, Clone, Default)]
pub struct ScriptedBehavior {
    /// Substring matched against the container name; empty matches all.
    pub key: String,
    /// Responses for `copy_out_file`, keyed by container path.
    pub files: HashMap<String, String>,
    /// Sleep per exec call, to keep containers observably live.
    pub exec_delay: Duration,
    /// Commands containing this substring return a failure result.
    pub fail_exec_containing: Option<String>,
    /// Commands containing this substring return a timeout result.
    pub timeout_exec_containing: Option<String>,
    /// Fail `start` outright for matching names.
    pub fail_start: bool,
}

impl ScriptedBehavior {
    pub fn for_name(key: &str) -> Self {
        Self {
            key: key.to_string(),
            ..Self::default()
        }
    }

    pub fn with_file(mut self, path: &str, contents: &str) -> Self {
        self.files.insert(path.to_string(), contents.to_string());
        self
    }

    pub fn with_exec_delay(mut self, delay: Duration) -> Self {
        self.exec_delay = delay;
        self
    }

    pub fn timing_out_on(mut self, needle: &str) -> Self {
        self.timeout_exec_containing = Some(needle.to_string());
        self
    }

    pub fn failing_on(mut self, needle: &str) -> Self {
        self.fail_exec_containing = Some(needle.to_string());
        self
    }
}

#[derive(Debug, Default)]
struct ScriptedState {
    started: Vec<String>,
    removed: Vec<String>,
    copied_in: Vec<(String, String)>,
    live: usize,
    max_live: usize,
}

/// Container runtime that runs entirely in memory.
#[derive(Debug, Default)]
pub struct ScriptedRuntime {
    behaviors: Vec<ScriptedBehavior>,
    state: Arc<Mutex<ScriptedState>>,
}

impl ScriptedRuntime {
    pub fn new(behaviors: Vec<ScriptedBehavior>) -> Self {
        Self {
            behaviors,
            state: Arc::new(Mutex::new(ScriptedState::default())),
        }
    }

    /// Names of every container ever started.
    pub fn started(&self) -> Vec<String> {
        self.state.lock().expect("state lock").started.clone()
    }

    /// Names of every container removed (shutdown or force).
    pub fn removed(&self) -> Vec<String> {
        self.state.lock().expect("state lock").removed.clone()
    }

    /// Container paths that received a `copy_in_file`.
    pub fn copied_in(&self) -> Vec<(String, String)> {
        self.state.lock().expect("state lock").copied_in.clone()
    }

    /// High-water mark of simultaneously live containers.
    pub fn max_live(&self) -> usize {
        self.state.lock().expect("state lock").max_live
    }

    /// True when every started container has been removed.
    pub fn all_removed(&self) -> bool {
        let state = self.state.lock().expect("state lock");
        state.live == 0 && state.removed.len() >= state.started.len()
    }

    fn behavior_for(&self, name: &str) -> ScriptedBehavior {
        self.behaviors
            .iter()
            .find(|b| b.key.is_empty() || name.contains(&b.key))
            .cloned()
            .unwrap_or_default()
    }
}

impl ContainerRuntime for ScriptedRuntime {
    fn start(&self, req: &StartRequest) -> Result<Box<dyn Container>> {
        let behavior = self.behavior_for(&req.name);
        if behavior.fail_start {
            return Err(anyhow!("scripted start failure for {}", req.name));
        }
        {
            let mut state = self.state.lock().expect("state lock");
            state.started.push(req.name.clone());
            state.live += 1;
            state.max_live = state.max_live.max(state.live);
        }
        Ok(Box::new(ScriptedContainer {
            name: req.name.clone(),
            behavior,
            state: Arc::clone(&self.state),
        }))
    }

    fn force_remove(&self, name: &str) {
        self.state
            .lock()
            .expect("state lock")
            .removed
            .push(name.to_string());
    }
}

struct ScriptedContainer {
    name: String,
    behavior: ScriptedBehavior,
    state: Arc<Mutex<ScriptedState>>,
}

impl ScriptedContainer {
    fn exec_one(&self, command: &str) -> CommandResult {
        if !self.behavior.exec_delay.is_zero() {
            thread::sleep(self.behavior.exec_delay);
        }
        if let Some(needle) = &self.behavior.timeout_exec_containing
            && command.contains(needle.as_str())
        {
            return CommandResult::timeout(
                format!("$ {command}\n"),
                format!("command timed out: {command}"),
            );
        }
        if let Some(needle) = &self.behavior.fail_exec_containing
            && command.contains(needle.as_str())
        {
            return CommandResult::failure(
                format!("$ {command}\n"),
                format!("command exited with Some(1): {command}"),
            );
        }
        CommandResult::success(format!("$ {command}\n"))
    }
}

impl Container for ScriptedContainer {
    fn name(&self) -> &str {
        &self.name
    }

    fn exec_blocking(&self, commands: &[String], _timeout: Duration) -> Result<CommandResult> {
        let mut output = String::new();
        for command in commands {
            let step = self.exec_one(command);
            output.push_str(&step.output);
            if !step.is_success() {
                return Ok(CommandResult {
                    status: step.status,
                    output,
                    error_detail: step.error_detail,
                });
            }
        }
        Ok(CommandResult::success(output))
    }

    fn exec_streaming(&self, command: &str, _timeout: Duration) -> Result<CommandResult> {
        Ok(self.exec_one(command))
    }

    fn copy_in_file(&self, _contents: &str, container_path: &str) -> Result<()> {
        self.state
            .lock()
            .expect("state lock")
            .copied_in
            .push((self.name.clone(), container_path.to_string()));
        Ok(())
    }

    fn copy_in_tree(&self, local_path: &Path, _dest_dir: &str) -> Result<()> {
        if !local_path.exists() {
            return Err(anyhow!("local path does not exist: {}", local_path.display()));
        }
        Ok(())
    }

    fn copy_out_file(&self, container_path: &str) -> Result<String> {
        self.behavior
            .files
            .get(container_path)
            .cloned()
            .ok_or_else(|| anyhow!("no such file in container: {container_path}"))
    }

    fn shutdown(&self) {
        let mut state = self.state.lock().expect("state lock");
        state.removed.push(self.name.clone());
        state.live = state.live.saturating_sub(1);
    }
}

/// A disposable git repository with one initial commit.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = TempDir::new().context("create temp repo dir")?;
        let repo = Self { dir };
        repo.git_raw(&["init", "-q", "-b", "main"])?;
        repo.git_raw(&["config", "user.email", "test@example.com"])?;
        repo.git_raw(&["config", "user.name", "Test"])?;
        repo.git_raw(&[
            "config",
            "remote.origin.url",
            "https://example.com/origin/repo.git",
        ])?;
        repo.write_file("README.md", "# test repo\n")?;
        repo.git_raw(&["add", "-A"])?;
        repo.git_raw(&["commit", "-q", "-m", "initial commit"])?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn git(&self) -> Git {
        Git::new(self.path())
    }

    pub fn write_file(&self, rel: &str, contents: &str) -> Result<()> {
        let path = self.path().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("create parent dirs")?;
        }
        std::fs::write(&path, contents).with_context(|| format!("write {rel}"))
    }

    pub fn read_file(&self, rel: &str) -> Result<String> {
        std::fs::read_to_string(self.path().join(rel)).with_context(|| format!("read {rel}"))
    }

    pub fn file_exists(&self, rel: &str) -> bool {
        self.path().join(rel).exists()
    }

    pub fn head_sha(&self) -> Result<String> {
        self.git().head_sha()
    }

    fn git_raw(&self, args: &[&str]) -> Result<()> {
        let status = std::process::Command::new("git")
            .args(args)
            .current_dir(self.path())
            .status()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !status.success() {
            return Err(anyhow!("git {} failed", args.join(" ")));
        }
        Ok(())
    }
}
