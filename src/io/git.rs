//! Git adapter for the patch committer.
//!
//! Branch surgery and state recovery must be deterministic, so we keep a
//! small, explicit wrapper around `git` subprocess calls instead of a
//! library binding.

use std::path::PathBuf;
use std::process::{Command, Output, Stdio};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    pub path: String,
}

impl StatusEntry {
    pub fn is_untracked(&self) -> bool {
        self.code == "??"
    }
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// Full SHA of the current HEAD.
    pub fn head_sha(&self) -> Result<String> {
        let out = self.invoke_checked(&["rev-parse", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// URL of the `origin` remote.
    pub fn remote_url(&self) -> Result<String> {
        let out = self.invoke_checked(&["config", "--get", "remote.origin.url"])?;
        let url = out.trim().to_string();
        if url.is_empty() {
            return Err(anyhow!("remote.origin.url is not configured"));
        }
        Ok(url)
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.invoke_checked(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Stash tracked changes; `include_untracked` also stashes new files.
    ///
    /// Returns false when there was nothing to stash.
    #[instrument(skip_all)]
    pub fn stash_push(&self, include_untracked: bool) -> Result<bool> {
        let mut args = vec!["stash", "push"];
        if include_untracked {
            args.push("--include-untracked");
        }
        let stdout = self.invoke_checked(&args)?;
        let stashed = !stdout.contains("No local changes to save");
        debug!(stashed, "stash push");
        Ok(stashed)
    }

    /// Pop the most recent stash entry.
    pub fn stash_pop(&self) -> Result<()> {
        self.invoke_checked(&["stash", "pop"])?;
        Ok(())
    }

    /// Checkout a commit in detached-HEAD state.
    #[instrument(skip_all, fields(commit))]
    pub fn checkout_detached(&self, commit: &str) -> Result<()> {
        debug!(commit, "checking out detached");
        self.invoke_checked(&["checkout", "--detach", commit])?;
        Ok(())
    }

    /// Create and checkout a new branch at the current HEAD.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_new_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "creating and checking out new branch");
        self.invoke_checked(&["checkout", "-b", branch])?;
        Ok(())
    }

    /// Create a branch pointing at `commit` without checking it out.
    pub fn branch_at(&self, branch: &str, commit: &str) -> Result<()> {
        self.invoke_checked(&["branch", branch, commit])?;
        Ok(())
    }

    /// Delete a local branch, discarding unmerged commits.
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        self.invoke_checked(&["branch", "-D", branch])?;
        Ok(())
    }

    /// Current branch name, or `None` on detached HEAD.
    pub fn current_branch(&self) -> Result<Option<String>> {
        let out = self.invoke_checked(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        Ok((name != "HEAD").then_some(name))
    }

    /// Checkout an existing branch.
    pub fn checkout_branch(&self, branch: &str) -> Result<()> {
        self.invoke_checked(&["checkout", branch])?;
        Ok(())
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let out = self.invoke(&[
            "show-ref",
            "--verify",
            "--quiet",
            &format!("refs/heads/{branch}"),
        ])?;
        Ok(out.status.success())
    }

    /// List local branch names.
    pub fn local_branches(&self) -> Result<Vec<String>> {
        let out = self.invoke_checked(&["branch", "--format=%(refname:short)"])?;
        Ok(out.lines().map(|l| l.trim().to_string()).collect())
    }

    /// Apply unified-diff text to the working tree with whitespace tolerance.
    #[instrument(skip_all)]
    pub fn apply_patch(&self, patch: &str) -> Result<()> {
        let mut child = Command::new("git")
            .args(["apply", "--whitespace=fix", "-"])
            .current_dir(&self.workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("spawn git apply")?;
        {
            use std::io::Write;
            let mut stdin = child.stdin.take().ok_or_else(|| anyhow!("stdin was not piped"))?;
            stdin.write_all(patch.as_bytes()).context("write patch")?;
        }
        let out = child.wait_with_output().context("wait git apply")?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(anyhow!("git apply failed: {}", stderr.trim()));
        }
        Ok(())
    }

    /// Hard-reset the working tree to `commit`.
    pub fn reset_hard(&self, commit: &str) -> Result<()> {
        self.invoke_checked(&["reset", "--hard", commit])?;
        Ok(())
    }

    /// Remove untracked files and directories.
    pub fn clean_untracked(&self) -> Result<()> {
        self.invoke_checked(&["clean", "-fd"])?;
        Ok(())
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.invoke_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let staged = self.invoke_checked(&["diff", "--cached", "--name-only"])?;
        Ok(!staged.trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.invoke_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    /// Commit everything (tracked and untracked) onto the current branch.
    pub fn commit_all(&self, message: &str) -> Result<bool> {
        self.add_all()?;
        self.commit_staged(message)
    }

    /// Spawn git and capture its output without interpreting the exit code.
    /// Callers that branch on status (probes like `show-ref`) use this.
    fn invoke(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("run git {}", args.join(" ")))
    }

    /// Spawn git, fail on non-zero exit, and return captured stdout.
    fn invoke_checked(&self, args: &[&str]) -> Result<String> {
        let out = self.invoke(args)?;
        if !out.status.success() {
            return Err(git_failure(args, &out));
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}

fn git_failure(args: &[&str], out: &Output) -> anyhow::Error {
    let stderr = String::from_utf8_lossy(&out.stderr);
    anyhow!(
        "git {} exited with {:?}: {}",
        args.join(" "),
        out.status.code(),
        stderr.trim()
    )
}

/// Split one `git status --porcelain=v1` line into its two-character XY
/// code and path. Rename entries report "old -> new"; only the destination
/// matters for cleanliness decisions.
fn parse_status_line(line: &str) -> Result<StatusEntry> {
    let (code, rest) = line
        .split_at_checked(2)
        .ok_or_else(|| anyhow!("porcelain line too short: '{line}'"))?;
    let mut path = rest.trim();
    if path.is_empty() {
        return Err(anyhow!("porcelain line missing path: '{line}'"));
    }
    if let Some((_, destination)) = path.split_once(" -> ") {
        path = destination.trim();
    }
    Ok(StatusEntry {
        code: code.to_string(),
        path: path.to_string(),
    })
}

/// Rewrite an HTTPS remote URL to its SSH form, e.g.
/// `https://host/org/repo.git` to `git@host:org/repo.git`.
pub fn to_ssh_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("https://").or_else(|| url.strip_prefix("http://")) else {
        return url.to_string();
    };
    match rest.split_once('/') {
        Some((host, path)) => format!("git@{host}:{path}"),
        None => url.to_string(),
    }
}
