//! Patch committer: one branch per successful task, rooted at a stable
//! anchor commit.
//!
//! The anchor is the repository HEAD at construction. Every task branch is
//! created from it in detached state, the patch applied with whitespace
//! tolerance, and the tree returned to the anchor, so branches never see one
//! another's changes. Recovery policies make a dirty starting tree workable.

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, info, instrument, warn};

use crate::core::types::{TaskResult, TaskStatus};
use crate::io::config::RecoveryConfig;
use crate::io::git::{Git, StatusEntry};

const REPORT_TRUNCATE_CHARS: usize = 500;

/// Per-task record in the committer summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    pub task_id: String,
    pub title: String,
    /// Branch created for this task; `None` for no-op successes and failures.
    pub branch: Option<String>,
    pub success: bool,
    pub no_op: bool,
    pub error: Option<String>,
}

/// Aggregated outcome of one committer batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub records: Vec<CommitRecord>,
}

/// Applies task patches as branches of the host repository.
pub struct PatchCommitter {
    git: Git,
    anchor: String,
    original_branch: Option<String>,
    policy: RecoveryConfig,
}

impl PatchCommitter {
    /// Capture the anchor commit (current HEAD) and the branch to restore.
    pub fn new(workdir: &Path, policy: RecoveryConfig) -> Result<Self> {
        let git = Git::new(workdir);
        let anchor = git.head_sha().context("resolve anchor commit")?;
        let original_branch = git.current_branch().context("resolve current branch")?;
        debug!(anchor = %anchor, branch = ?original_branch, "patch committer anchored");
        Ok(Self {
            git,
            anchor,
            original_branch,
            policy,
        })
    }

    pub fn anchor(&self) -> &str {
        &self.anchor
    }

    /// Process a batch of results, one branch per successful non-empty patch.
    ///
    /// Per-task failures are recorded in the summary; only repository-level
    /// problems (dirty beyond policy, unrecoverable checkout) abort.
    #[instrument(skip_all, fields(results = results.len()))]
    pub fn apply_results(&self, results: &[TaskResult]) -> Result<CommitSummary> {
        let stashed = self.prepare_worktree()?;

        let mut records = Vec::with_capacity(results.len());
        for result in results {
            records.push(self.commit_one(result));
        }

        self.restore_worktree(stashed)?;

        let successful = records.iter().filter(|r| r.success).count();
        let summary = CommitSummary {
            total: records.len(),
            successful,
            failed: records.len() - successful,
            records,
        };
        info!(
            total = summary.total,
            successful = summary.successful,
            failed = summary.failed,
            "committer batch finished"
        );
        Ok(summary)
    }

    /// Bring the working tree to a clean state under the configured
    /// policies. Returns whether a stash was pushed.
    fn prepare_worktree(&self) -> Result<bool> {
        if self.policy.backup_branch {
            let name = format!("taskfarm-backup-{}", Utc::now().timestamp_millis());
            self.git
                .branch_at(&name, &self.anchor)
                .context("create backup branch")?;
            info!(branch = %name, "backup branch created");
        }

        let mut stashed = false;
        if !self.dirty_entries()?.is_empty() {
            if self.policy.auto_stash {
                stashed = self.git.stash_push(self.policy.stash_untracked)?;
                debug!(stashed, "auto-stash before batch");
            } else if self.policy.auto_commit {
                self.git
                    .commit_all("taskfarm: auto-commit working tree before patch run")?;
                debug!("auto-commit before batch");
            }
        }

        let remaining = self.dirty_entries()?;
        if !remaining.is_empty() {
            return Err(anyhow!(
                "working tree dirty beyond recovery policy:\n{}",
                format_entries(&remaining)
            ));
        }
        Ok(stashed)
    }

    /// Status entries that count as dirty under the policy.
    fn dirty_entries(&self) -> Result<Vec<StatusEntry>> {
        let entries = self.git.status_porcelain()?;
        Ok(entries
            .into_iter()
            .filter(|entry| !(self.policy.ignore_untracked && entry.is_untracked()))
            .collect())
    }

    fn commit_one(&self, result: &TaskResult) -> CommitRecord {
        let mut record = CommitRecord {
            task_id: result.task.id.clone(),
            title: result.task.title.clone(),
            branch: None,
            success: false,
            no_op: false,
            error: None,
        };

        if result.task.id.trim().is_empty() || result.task.title.trim().is_empty() {
            record.error = Some("result is missing id or title".to_string());
            return record;
        }
        if result.status != TaskStatus::Success {
            record.error = Some(format!(
                "task finished with status {}, nothing to commit",
                result.status.as_str()
            ));
            return record;
        }
        if result.patch.trim().is_empty() {
            debug!(task_id = %result.task.id, "empty patch, no-op success");
            record.success = true;
            record.no_op = true;
            return record;
        }

        match self.commit_patch(result) {
            Ok(Some(branch)) => {
                info!(task_id = %result.task.id, branch = %branch, "task branch committed");
                record.branch = Some(branch);
                record.success = true;
            }
            Ok(None) => {
                // Patch applied but produced no staged change.
                record.success = true;
                record.no_op = true;
            }
            Err(err) => {
                warn!(task_id = %result.task.id, error = %format!("{err:#}"), "task commit failed");
                record.error = Some(format!("{err:#}"));
            }
        }
        record
    }

    /// Steps 3..8 of the per-task procedure. Returns the branch name, or
    /// `None` when the applied patch staged nothing.
    fn commit_patch(&self, result: &TaskResult) -> Result<Option<String>> {
        self.git.checkout_detached(&self.anchor)?;
        self.git.reset_hard(&self.anchor)?;
        if !self.policy.ignore_untracked {
            self.git.clean_untracked()?;
        }

        let branch = format!(
            "task-{}-{}",
            sanitize_ref(&result.task.id),
            Utc::now().timestamp_millis()
        );
        self.git.checkout_new_branch(&branch)?;

        if let Err(err) = self.git.apply_patch(&result.patch) {
            self.abandon_branch(&branch);
            return Err(err.context("apply patch"));
        }

        self.git.add_all()?;
        let committed = self.git.commit_staged(&format_commit_message(result))?;
        self.git.checkout_detached(&self.anchor)?;
        if !committed {
            let _ = self.git.delete_branch(&branch);
            return Ok(None);
        }
        Ok(Some(branch))
    }

    /// Best-effort cleanup after a failed apply: back to the anchor, drop
    /// partial changes and the just-created branch.
    fn abandon_branch(&self, branch: &str) {
        for step in [
            self.git.checkout_detached(&self.anchor),
            self.git.reset_hard(&self.anchor),
            self.git.clean_untracked(),
            self.git.delete_branch(branch),
        ] {
            if let Err(err) = step {
                warn!(branch, error = %format!("{err:#}"), "cleanup step failed");
            }
        }
    }

    fn restore_worktree(&self, stashed: bool) -> Result<()> {
        match &self.original_branch {
            Some(branch) => self
                .git
                .checkout_branch(branch)
                .with_context(|| format!("restore branch {branch}"))?,
            None => self
                .git
                .checkout_detached(&self.anchor)
                .context("restore anchor")?,
        }
        if stashed {
            if let Err(err) = self.git.stash_pop() {
                warn!(error = %format!("{err:#}"), "stash pop failed, stash entry kept");
            }
        }
        Ok(())
    }
}

/// Structured commit message: glyph, task identity, description, report,
/// status, completion time.
pub fn format_commit_message(result: &TaskResult) -> String {
    let glyph = if result.status == TaskStatus::Success {
        "✓"
    } else {
        "✗"
    };
    let completed = DateTime::<Utc>::from_timestamp_millis(result.completed_at_ms)
        .filter(|_| result.completed_at_ms > 0)
        .map(|time| time.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_else(|| "N/A".to_string());
    format!(
        "{glyph} Task {id}: {title}\n\nTask Description: {description}\n\nReport: {report}\n\nStatus: {status}\nCompleted: {completed}\n",
        id = result.task.id,
        title = result.task.title,
        description = result.task.description,
        report = truncate_chars(&result.report, REPORT_TRUNCATE_CHARS),
        status = result.status.as_str(),
    )
}

fn truncate_chars(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let truncated: String = text.chars().take(limit).collect();
    format!("{truncated}…")
}

fn format_entries(entries: &[StatusEntry]) -> String {
    entries
        .iter()
        .map(|entry| format!("{} {}", entry.code, entry.path))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Branch names accept a conservative subset; anything else becomes `-`.
fn sanitize_ref(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    cleaned.trim_matches(['-', '.']).to_string()
}
