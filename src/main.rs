//! taskfarm binary: thin CLI over the orchestrator.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::warn;

use taskfarm::core::types::TaskStatus;
use taskfarm::io::config::{self, Config, PROJECT_FILE};
use taskfarm::io::container::DockerRuntime;
use taskfarm::orchestrator::{self, RunError, RunOptions, RunOutcome, Stage};
use taskfarm::scheduler::CancelToken;
use taskfarm::{exit_codes, logging};

#[derive(Parser)]
#[command(
    name = "taskfarm",
    version,
    about = "Farm repository improvement tasks out to containerized coding agents"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Analyze the repository, solve tasks in containers, commit patches.
    Run {
        /// Stop after analysis and print the task list.
        #[arg(long)]
        dry_run: bool,
        /// Host repository to operate on.
        #[arg(long, default_value = ".")]
        workdir: PathBuf,
        /// Project config file (defaults to ./taskfarm.toml).
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print the effective merged configuration.
    Config {
        /// Project config file (defaults to ./taskfarm.toml).
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() {
    logging::init();
    std::process::exit(run());
}

fn run() -> i32 {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            dry_run,
            workdir,
            config,
        } => cmd_run(dry_run, workdir, config),
        Command::Config { config } => cmd_config(config),
    }
}

fn load(project_override: Option<PathBuf>) -> Result<Config, i32> {
    let global = config::global_config_path();
    let project = project_override.unwrap_or_else(|| PathBuf::from(PROJECT_FILE));
    config::load_config(global.as_deref(), Some(&project)).map_err(|err| {
        eprintln!("configuration invalid: {err:#}");
        exit_codes::CONFIG
    })
}

fn cmd_run(dry_run: bool, workdir: PathBuf, config: Option<PathBuf>) -> i32 {
    let cfg = match load(config) {
        Ok(cfg) => cfg,
        Err(code) => return code,
    };

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        eprintln!("interrupt received, cancelling run");
        handler_token.cancel();
    }) {
        warn!(error = %err, "could not install interrupt handler");
    }

    let runtime = Arc::new(DockerRuntime::new(cfg.output_limit_bytes));
    let options = RunOptions {
        dry_run,
        log_dir: None,
    };
    match orchestrator::run(runtime, &cfg, &workdir, &options, &cancel) {
        Ok(outcome) => {
            print_outcome(&outcome, dry_run);
            exit_codes::OK
        }
        Err(err) => {
            eprintln!("{err}");
            stage_exit_code(&err)
        }
    }
}

fn cmd_config(config: Option<PathBuf>) -> i32 {
    let cfg = match load(config) {
        Ok(cfg) => cfg,
        Err(code) => return code,
    };
    match toml::to_string_pretty(&cfg) {
        Ok(rendered) => {
            println!("{rendered}");
            exit_codes::OK
        }
        Err(err) => {
            eprintln!("could not render configuration: {err}");
            exit_codes::CONFIG
        }
    }
}

fn stage_exit_code(err: &RunError) -> i32 {
    match err.stage {
        Stage::Config => exit_codes::CONFIG,
        Stage::Analyzer => exit_codes::ANALYZER,
        Stage::Scheduler => exit_codes::SCHEDULER,
        Stage::Committer => exit_codes::COMMITTER,
    }
}

fn print_outcome(outcome: &RunOutcome, dry_run: bool) {
    if dry_run {
        for task in &outcome.tasks {
            println!(
                "{} [p{}] {}: {}",
                task.id, task.priority, task.title, task.description
            );
        }
        eprintln!("dry run: {} task(s), nothing dispatched", outcome.tasks.len());
        return;
    }

    for result in &outcome.results {
        let glyph = match result.status {
            TaskStatus::Success => "✓",
            TaskStatus::Skipped => "-",
            _ => "✗",
        };
        eprintln!("{glyph} {}: {}", result.task.id, result.task.title);
    }
    let successful = outcome
        .results
        .iter()
        .filter(|r| r.status == TaskStatus::Success)
        .count();
    eprintln!(
        "run finished: {} task(s), successful={}, failed={}{}",
        outcome.results.len(),
        successful,
        outcome.results.len() - successful,
        if outcome.cancelled { " (cancelled)" } else { "" }
    );
    if let Some(summary) = &outcome.summary {
        for record in &summary.records {
            if let Some(branch) = &record.branch {
                eprintln!("branch {branch} <- task {}", record.task_id);
            }
        }
        eprintln!(
            "committed: total={}, successful={}, failed={}",
            summary.total, summary.successful, summary.failed
        );
    }
    if let Some(path) = &outcome.log_path {
        eprintln!("run log: {}", path.display());
    }
}
