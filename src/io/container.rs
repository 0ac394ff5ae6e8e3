//! Container handle over the `docker` CLI.
//!
//! One [`Container`] owns exactly one running container for its lifetime and
//! is never shared between callers; two concurrent `exec` calls on the same
//! handle are forbidden by convention. The [`ContainerRuntime`] trait is the
//! seam that lets the scheduler and solvers run against a scripted fake in
//! tests.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rand::{Rng, distr::Alphanumeric};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::core::types::CommandResult;
use crate::io::process::run_with_timeout;

/// Internal timeout for control-plane docker calls (start, cp, rm).
const CONTROL_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("container start failed: {0}")]
    Start(String),
    #[error("local path does not exist: {0}")]
    LocalPathMissing(PathBuf),
    #[error("copy {direction} container failed: {detail}")]
    Copy {
        direction: &'static str,
        detail: String,
    },
}

/// Everything needed to create one container.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub image: String,
    pub name: String,
    pub memory_mb: u64,
    pub cpus: f64,
    /// Environment passed at creation time (proxy variables).
    pub env: Vec<(String, String)>,
}

/// The operations a started container exposes. See the module docs for the
/// ownership convention.
pub trait Container: Send {
    fn name(&self) -> &str;

    /// Run `commands` in order, stopping at the first non-zero exit. The
    /// timeout bounds the whole batch (zero = unbounded).
    fn exec_blocking(&self, commands: &[String], timeout: Duration) -> Result<CommandResult>;

    /// Run one long-lived command, draining stdout and stderr concurrently.
    fn exec_streaming(&self, command: &str, timeout: Duration) -> Result<CommandResult>;

    /// Materialize `contents` at `container_path`, creating parents, staging
    /// through a temporary path so the destination appears atomically.
    fn copy_in_file(&self, contents: &str, container_path: &str) -> Result<()>;

    /// Recursively copy a host directory (or single file) into the container.
    fn copy_in_tree(&self, local_path: &Path, dest_dir: &str) -> Result<()>;

    /// Read a container file into host memory.
    fn copy_out_file(&self, container_path: &str) -> Result<String>;

    /// Forcibly remove the container. Idempotent; safe after a failed start.
    fn shutdown(&self);
}

/// Names of live task-owned containers, shared with the cancellation path.
///
/// Solvers register their container after start and deregister at shutdown;
/// cancellation snapshots the registry and force-removes every entry, which
/// makes each in-flight exec return a failure promptly.
#[derive(Debug, Clone, Default)]
pub struct ContainerRegistry {
    inner: Arc<Mutex<HashMap<String, String>>>,
}

impl ContainerRegistry {
    pub fn register(&self, task_id: &str, container_name: &str) {
        self.inner
            .lock()
            .expect("registry lock")
            .insert(task_id.to_string(), container_name.to_string());
    }

    pub fn deregister(&self, task_id: &str) {
        self.inner.lock().expect("registry lock").remove(task_id);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.inner
            .lock()
            .expect("registry lock")
            .values()
            .cloned()
            .collect()
    }
}

/// Factory seam for containers.
pub trait ContainerRuntime: Send + Sync {
    fn start(&self, req: &StartRequest) -> Result<Box<dyn Container>>;

    /// Remove a container by name from outside its owner. Used by the
    /// cancellation path, where the owning solver is mid-exec.
    fn force_remove(&self, name: &str);
}

/// Runtime backed by the host `docker` daemon.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    output_limit_bytes: usize,
}

impl DockerRuntime {
    pub fn new(output_limit_bytes: usize) -> Self {
        Self { output_limit_bytes }
    }
}

impl ContainerRuntime for DockerRuntime {
    #[instrument(skip_all, fields(image = %req.image, name = %req.name))]
    fn start(&self, req: &StartRequest) -> Result<Box<dyn Container>> {
        let name = match try_start(req) {
            Ok(()) => req.name.clone(),
            Err(stderr) if stderr.contains("is already in use") => {
                // Duplicate-name collision from an earlier run; retry once
                // under a suffixed name.
                let retry_name = format!("{}-{}", req.name, random_suffix(6));
                debug!(retry_name = %retry_name, "container name taken, retrying");
                let retry = StartRequest {
                    name: retry_name.clone(),
                    ..req.clone()
                };
                try_start(&retry).map_err(ContainerError::Start)?;
                retry_name
            }
            Err(stderr) => return Err(ContainerError::Start(stderr).into()),
        };
        debug!(name = %name, "container started");
        Ok(Box::new(DockerContainer {
            name,
            output_limit_bytes: self.output_limit_bytes,
        }))
    }

    fn force_remove(&self, name: &str) {
        remove_container(name);
    }
}

fn try_start(req: &StartRequest) -> std::result::Result<(), String> {
    let args = build_run_args(req);
    let mut cmd = Command::new("docker");
    cmd.args(&args);
    let out = run_with_timeout(cmd, CONTROL_TIMEOUT, 64 * 1024)
        .map_err(|err| format!("spawn docker run: {err:#}"))?;
    if out.status.success() {
        Ok(())
    } else {
        Err(out.stderr_lossy().trim().to_string())
    }
}

/// Project a start request onto `docker run` arguments.
fn build_run_args(req: &StartRequest) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        req.name.clone(),
    ];
    if req.memory_mb > 0 {
        args.push("--memory".to_string());
        args.push(format!("{}m", req.memory_mb));
    }
    if req.cpus > 0.0 {
        args.push("--cpus".to_string());
        args.push(req.cpus.to_string());
    }
    for (key, value) in &req.env {
        args.push("-e".to_string());
        args.push(format!("{key}={value}"));
    }
    args.push(req.image.clone());
    // Keep the container alive until shutdown removes it.
    args.push("sleep".to_string());
    args.push("infinity".to_string());
    args
}

fn remove_container(name: &str) {
    let mut cmd = Command::new("docker");
    cmd.args(["rm", "-f", name]);
    match run_with_timeout(cmd, CONTROL_TIMEOUT, 16 * 1024) {
        Ok(out) if out.status.success() => debug!(name, "container removed"),
        // Already gone or never started; removal is idempotent.
        Ok(out) => debug!(name, stderr = %out.stderr_lossy().trim(), "container remove skipped"),
        Err(err) => warn!(name, error = %format!("{err:#}"), "container remove failed"),
    }
}

struct DockerContainer {
    name: String,
    output_limit_bytes: usize,
}

impl DockerContainer {
    fn exec_once(&self, command: &str, timeout: Duration) -> Result<CommandResult> {
        let mut cmd = Command::new("docker");
        cmd.args(["exec", &self.name, "sh", "-lc", command]);
        let out = run_with_timeout(cmd, timeout, self.output_limit_bytes)
            .with_context(|| format!("docker exec in {}", self.name))?;

        let output = format!("$ {command}\n{}", out.stdout_lossy());
        if out.timed_out {
            return Ok(CommandResult::timeout(
                output,
                format!(
                    "command timed out after {}s: {}\n{}",
                    timeout.as_secs(),
                    command,
                    out.stderr_lossy()
                ),
            ));
        }
        if !out.status.success() {
            return Ok(CommandResult::failure(
                output,
                format!(
                    "command exited with {:?}: {}\n{}",
                    out.status.code(),
                    command,
                    out.stderr_lossy()
                ),
            ));
        }
        Ok(CommandResult::success(output))
    }

    fn exec_control(&self, command: &str, direction: &'static str) -> Result<()> {
        let result = self.exec_once(command, CONTROL_TIMEOUT)?;
        if !result.is_success() {
            return Err(ContainerError::Copy {
                direction,
                detail: result.error_detail,
            }
            .into());
        }
        Ok(())
    }
}

impl Container for DockerContainer {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip_all, fields(name = %self.name, commands = commands.len()))]
    fn exec_blocking(&self, commands: &[String], timeout: Duration) -> Result<CommandResult> {
        let deadline = deadline_from(timeout);
        let mut output = String::new();

        for command in commands {
            // The docker daemon intermittently rejects exec requests issued
            // immediately after `run -d` returns; a short randomized delay
            // before each invocation is the documented contract (no retry).
            readiness_delay();

            let remaining = match remaining_budget(deadline) {
                Some(remaining) => remaining,
                None => {
                    return Ok(CommandResult::timeout(
                        output,
                        format!("batch timed out before: {command}"),
                    ));
                }
            };
            let step = self.exec_once(command, remaining)?;
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

    #[instrument(skip_all, fields(name = %self.name))]
    fn exec_streaming(&self, command: &str, timeout: Duration) -> Result<CommandResult> {
        readiness_delay();
        self.exec_once(command, timeout)
    }

    fn copy_in_file(&self, contents: &str, container_path: &str) -> Result<()> {
        let staging = tempfile::NamedTempFile::new().context("create staging file")?;
        fs::write(staging.path(), contents).context("write staging file")?;

        if let Some(parent) = container_parent(container_path) {
            self.exec_control(&format!("mkdir -p {}", shlex::try_quote(parent)?), "into")?;
        }
        let tmp_dest = format!("{container_path}.tmp");
        docker_cp(
            &staging.path().display().to_string(),
            &format!("{}:{tmp_dest}", self.name),
            "into",
        )?;
        self.exec_control(
            &format!(
                "mv {} {}",
                shlex::try_quote(&tmp_dest)?,
                shlex::try_quote(container_path)?
            ),
            "into",
        )
    }

    fn copy_in_tree(&self, local_path: &Path, dest_dir: &str) -> Result<()> {
        if !local_path.exists() {
            return Err(ContainerError::LocalPathMissing(local_path.to_path_buf()).into());
        }
        self.exec_control(&format!("mkdir -p {}", shlex::try_quote(dest_dir)?), "into")?;
        let source = if local_path.is_dir() {
            // Trailing `/.` copies directory contents, preserving attributes.
            format!("{}/.", local_path.display())
        } else {
            local_path.display().to_string()
        };
        docker_cp(&source, &format!("{}:{dest_dir}", self.name), "into")
    }

    fn copy_out_file(&self, container_path: &str) -> Result<String> {
        // The staging directory is removed when `staging` drops.
        let staging = tempfile::tempdir().context("create staging dir")?;
        let host_path = staging.path().join("out");
        docker_cp(
            &format!("{}:{container_path}", self.name),
            &host_path.display().to_string(),
            "out of",
        )?;
        fs::read_to_string(&host_path).with_context(|| format!("read staged {container_path}"))
    }

    fn shutdown(&self) {
        remove_container(&self.name);
    }
}

fn docker_cp(source: &str, dest: &str, direction: &'static str) -> Result<()> {
    let mut cmd = Command::new("docker");
    cmd.args(["cp", "-a", source, dest]);
    let out = run_with_timeout(cmd, CONTROL_TIMEOUT, 16 * 1024).context("spawn docker cp")?;
    if !out.status.success() {
        return Err(ContainerError::Copy {
            direction,
            detail: out.stderr_lossy().trim().to_string(),
        }
        .into());
    }
    Ok(())
}

/// Parent directory of an absolute container path, if any.
fn container_parent(path: &str) -> Option<&str> {
    match path.rsplit_once('/') {
        Some(("", _)) | None => None,
        Some((parent, _)) => Some(parent),
    }
}

fn deadline_from(timeout: Duration) -> Option<Instant> {
    (!timeout.is_zero()).then(|| Instant::now() + timeout)
}

/// Remaining budget until `deadline`; `None` when already exceeded.
/// `Some(Duration::ZERO)` from an unbounded deadline means "no timeout".
fn remaining_budget(deadline: Option<Instant>) -> Option<Duration> {
    match deadline {
        None => Some(Duration::ZERO),
        Some(deadline) => {
            let now = Instant::now();
            if now >= deadline {
                None
            } else {
                Some(deadline - now)
            }
        }
    }
}

fn readiness_delay() {
    let millis = rand::rng().random_range(100..=2000);
    thread::sleep(Duration::from_millis(millis));
}

pub fn random_suffix(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}
