//! Capacity-bounded, dependency-aware task dispatch.
//!
//! The scheduler drains the analyzer's task queue through solver threads, at
//! most `max_parallel_containers` at once. Queue state is owned by the
//! scheduler's own driver loop; solvers communicate only through the
//! completion channel.

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::agents::solver;
use crate::core::types::{Task, TaskResult};
use crate::io::config::Config;
use crate::io::container::{ContainerRegistry, ContainerRuntime};

/// Cooperative cancellation flag shared between the orchestrator, the signal
/// handler, and the scheduler.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything the scheduler learned from one drain of the queue.
#[derive(Debug)]
pub struct SchedulerOutcome {
    /// One terminal result per input task, in analyzer order.
    pub results: Vec<TaskResult>,
    /// High-water mark of simultaneously active solvers.
    pub max_in_flight: usize,
}

/// Drain `tasks` through solvers, at most `max_parallel_containers` at once.
///
/// Dispatch preserves analyzer order except where `following_tasks` blocks a
/// task: a task with predecessors is dispatched only after at least one of
/// them reaches a terminal state. Every input task yields exactly one
/// terminal result; solver errors are converted to failures here and never
/// propagate to siblings.
#[instrument(skip_all, fields(tasks = tasks.len(), cap = cfg.max_parallel_containers))]
pub fn run_tasks<R: ContainerRuntime + 'static>(
    runtime: Arc<R>,
    cfg: &Config,
    git_url: &str,
    tasks: Vec<Task>,
    cancel: &CancelToken,
) -> SchedulerOutcome {
    let total = tasks.len();
    let cap = cfg.max_parallel_containers as usize;
    let predecessors = predecessor_map(&tasks);
    let registry = ContainerRegistry::default();

    let (tx, rx) = mpsc::channel::<(usize, TaskResult)>();
    let mut pending: VecDeque<(usize, Task)> = tasks.into_iter().enumerate().collect();
    let mut active: HashMap<String, JoinHandle<()>> = HashMap::new();
    let mut terminal_ids: HashSet<String> = HashSet::new();
    let mut completed: Vec<(usize, TaskResult)> = Vec::new();
    let mut max_in_flight = 0usize;
    let mut cancel_swept = false;

    while completed.len() < total {
        if cancel.is_cancelled() {
            if !cancel_swept {
                cancel_swept = true;
                info!("cancellation requested, killing active containers");
                for name in registry.snapshot() {
                    runtime.force_remove(&name);
                }
            }
            while let Some((index, task)) = pending.pop_front() {
                terminal_ids.insert(task.id.clone());
                completed.push((index, TaskResult::failure(task, "cancelled before dispatch")));
            }
        } else {
            while active.len() < cap {
                let eligible = pending
                    .iter()
                    .position(|(_, task)| is_eligible(task, &predecessors, &terminal_ids));
                let Some(position) = eligible else { break };
                let (index, task) = pending.remove(position).expect("position in bounds");
                debug!(task_id = %task.id, "dispatching solver");
                let handle = spawn_solver(
                    Arc::clone(&runtime),
                    cfg.clone(),
                    git_url.to_string(),
                    index,
                    task.clone(),
                    registry.clone(),
                    tx.clone(),
                );
                active.insert(task.id, handle);
                max_in_flight = max_in_flight.max(active.len());
            }
            if active.is_empty() && !pending.is_empty() {
                warn!(
                    stranded = pending.len(),
                    "no dispatchable task and nothing active, failing the remainder"
                );
                while let Some((index, task)) = pending.pop_front() {
                    terminal_ids.insert(task.id.clone());
                    completed.push((
                        index,
                        TaskResult::failure(task, "dependency cycle: no runnable predecessor"),
                    ));
                }
            }
        }

        if active.is_empty() {
            continue;
        }
        match rx.recv_timeout(Duration::from_millis(25)) {
            Ok((index, result)) => {
                if let Some(handle) = active.remove(&result.task.id) {
                    let _ = handle.join();
                }
                terminal_ids.insert(result.task.id.clone());
                debug!(task_id = %result.task.id, status = ?result.status, "solver finished");
                completed.push((index, result));
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    completed.sort_by_key(|(index, _)| *index);
    SchedulerOutcome {
        results: completed.into_iter().map(|(_, result)| result).collect(),
        max_in_flight,
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_solver<R: ContainerRuntime + 'static>(
    runtime: Arc<R>,
    cfg: Config,
    git_url: String,
    index: usize,
    task: Task,
    registry: ContainerRegistry,
    tx: mpsc::Sender<(usize, TaskResult)>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let fallback = task.clone();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            solver::solve(&*runtime, &cfg, &git_url, task, &registry)
        }));
        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => TaskResult::failure(fallback, format!("{err:#}")),
            Err(_) => TaskResult::failure(fallback, "solver panicked".to_string()),
        };
        // The receiver only disappears if the scheduler is gone; nothing
        // left to report to in that case.
        let _ = tx.send((index, result));
    })
}

/// Invert `following_tasks` into a predecessor map, dropping edges that
/// reference ids outside this run.
fn predecessor_map(tasks: &[Task]) -> HashMap<String, Vec<String>> {
    let ids: HashSet<&str> = tasks.iter().map(|task| task.id.as_str()).collect();
    let mut predecessors: HashMap<String, Vec<String>> = HashMap::new();
    for task in tasks {
        for successor in &task.following_tasks {
            if successor != &task.id && ids.contains(successor.as_str()) {
                predecessors
                    .entry(successor.clone())
                    .or_default()
                    .push(task.id.clone());
            }
        }
    }
    predecessors
}

fn is_eligible(
    task: &Task,
    predecessors: &HashMap<String, Vec<String>>,
    terminal: &HashSet<String>,
) -> bool {
    match predecessors.get(&task.id) {
        None => true,
        Some(preds) => preds.iter().any(|pred| terminal.contains(pred)),
    }
}
