//! Helpers for running host child processes with timeouts and bounded output.
//!
//! Stdout and stderr are drained on dedicated threads while the child runs;
//! reading them sequentially deadlocks once a pipe buffer fills, and agent
//! provisioning steps routinely produce megabytes.

use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use wait_timeout::ChildExt;

/// Effective timeout used when the caller passes zero ("no timeout").
const UNBOUNDED: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Captured child process output.
#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
}

impl ProcessOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Run a command to completion, killing it at `timeout` (zero = unbounded).
///
/// Both output streams are drained concurrently and each is capped at
/// `output_limit_bytes`; bytes beyond the cap are discarded while the pipe
/// keeps draining so the child never blocks on a full buffer.
pub fn run_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<ProcessOutput> {
    let timeout = if timeout.is_zero() { UNBOUNDED } else { timeout };

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd.spawn().context("spawn command")?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    let stdout = join_output(stdout_handle).context("join stdout")?;
    let stderr = join_output(stderr_handle).context("join stderr")?;

    Ok(ProcessOutput {
        status,
        stdout,
        stderr,
        timed_out,
    })
}

fn join_output(handle: thread::JoinHandle<Result<Vec<u8>>>) -> Result<Vec<u8>> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            buf.extend_from_slice(&chunk[..n.min(remaining)]);
        }
    }

    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_both_streams() {
        let out = run_with_timeout(sh("echo hello; echo oops >&2"), Duration::from_secs(5), 4096)
            .expect("run");
        assert!(out.status.success());
        assert_eq!(out.stdout_lossy().trim(), "hello");
        assert_eq!(out.stderr_lossy().trim(), "oops");
        assert!(!out.timed_out);
    }

    #[test]
    fn kills_on_timeout() {
        let out =
            run_with_timeout(sh("sleep 30"), Duration::from_millis(100), 4096).expect("run");
        assert!(out.timed_out);
        assert!(!out.status.success());
    }

    #[test]
    fn zero_timeout_means_unbounded() {
        let out = run_with_timeout(sh("echo fast"), Duration::ZERO, 4096).expect("run");
        assert!(!out.timed_out);
        assert_eq!(out.stdout_lossy().trim(), "fast");
    }

    #[test]
    fn output_beyond_limit_is_discarded_without_blocking() {
        // 1 MiB of output against a 1 KiB cap; the pipe must still drain.
        let out = run_with_timeout(
            sh("head -c 1048576 /dev/zero | tr '\\0' 'x'"),
            Duration::from_secs(30),
            1024,
        )
        .expect("run");
        assert!(out.status.success());
        assert_eq!(out.stdout.len(), 1024);
    }
}
