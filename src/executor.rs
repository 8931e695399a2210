//! Child process execution
//!
//! Spawns container-runtime invocations, captures their output under hard
//! caps, and enforces a wall-clock deadline with a best-effort kill. The two
//! stream drainers spawned here are the only internal concurrency in the
//! engine.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::{MAX_STREAM_CHARS, TRUNCATION_MARKER};

/// How long to wait for a stream drainer after the child is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Outcome of running one child process to completion or deadline.
///
/// `timed_out` implies `exit_code == -1`. Truncation flags are independent
/// of the timeout.
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

/// Seam for running external commands, so the pipeline can be driven with a
/// scripted runner in tests.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args` in `cwd`, capturing output until exit or
    /// until `timeout` expires.
    async fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: &Path,
        timeout: Duration,
    ) -> Result<ProcessOutcome>;
}

/// Production runner backed by real child processes.
pub struct ProcessExecutor;

#[async_trait]
impl CommandRunner for ProcessExecutor {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: &Path,
        timeout: Duration,
    ) -> Result<ProcessOutcome> {
        debug!("Spawning {} {:?} in {:?}", program, args, cwd);

        let mut child = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", program))?;

        let stdout_pipe = child.stdout.take().context("Child stdout was not piped")?;
        let stderr_pipe = child.stderr.take().context("Child stderr was not piped")?;

        // Drain both streams for the lifetime of the child so it never
        // blocks on a full pipe, even after the capture cap is hit.
        let stdout_task = spawn_drain(stdout_pipe);
        let stderr_task = spawn_drain(stderr_pipe);

        let (exit_code, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => {
                let status = status.context("Failed to wait for child process")?;
                (status.code().unwrap_or(-1), false)
            }
            Err(_) => {
                warn!(
                    "Child {} exceeded {:?} deadline, killing process tree",
                    program, timeout
                );
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill timed-out child: {}", e);
                }
                (-1, true)
            }
        };

        let (stdout, stdout_truncated) = join_drain(stdout_task, "stdout").await;
        let (stderr, stderr_truncated) = join_drain(stderr_task, "stderr").await;

        Ok(ProcessOutcome {
            exit_code,
            stdout,
            stderr,
            timed_out,
            stdout_truncated,
            stderr_truncated,
        })
    }
}

fn spawn_drain<R>(mut reader: R) -> JoinHandle<(String, bool)>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        // Retain at most 4 bytes per allowed character; everything past the
        // budget is read and discarded to keep the pipe flowing.
        let byte_budget = MAX_STREAM_CHARS * 4;
        let mut captured: Vec<u8> = Vec::new();
        let mut overflowed = false;
        let mut chunk = [0u8; 8192];

        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    if captured.len() < byte_budget {
                        let take = (byte_budget - captured.len()).min(n);
                        captured.extend_from_slice(&chunk[..take]);
                        if take < n {
                            overflowed = true;
                        }
                    } else {
                        overflowed = true;
                    }
                }
                Err(e) => {
                    debug!("Stream read ended with error: {}", e);
                    break;
                }
            }
        }

        finish_capture(captured, overflowed)
    })
}

/// Convert captured bytes to text, enforce the character cap, and append the
/// truncation marker as its own line if anything was cut.
fn finish_capture(captured: Vec<u8>, overflowed: bool) -> (String, bool) {
    let mut text = String::from_utf8_lossy(&captured).into_owned();
    let mut truncated = overflowed;

    if text.chars().count() > MAX_STREAM_CHARS {
        text = text.chars().take(MAX_STREAM_CHARS).collect();
        truncated = true;
    }
    if truncated {
        text.push('\n');
        text.push_str(TRUNCATION_MARKER);
    }
    (text, truncated)
}

async fn join_drain(task: JoinHandle<(String, bool)>, stream: &str) -> (String, bool) {
    match tokio::time::timeout(DRAIN_GRACE, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            warn!("Drain task for {} failed: {}", stream, e);
            (String::new(), true)
        }
        Err(_) => {
            warn!(
                "Drain task for {} did not finish within {:?}",
                stream, DRAIN_GRACE
            );
            (String::new(), true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn test_run_captures_stdout_and_stderr() {
        let outcome = ProcessExecutor
            .run(
                "sh",
                &sh("echo out; echo err >&2"),
                Path::new("."),
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        assert_eq!(outcome.exit_code, 0);
        assert!(!outcome.timed_out);
        assert_eq!(outcome.stdout.trim(), "out");
        assert_eq!(outcome.stderr.trim(), "err");
        assert!(!outcome.stdout_truncated);
        assert!(!outcome.stderr_truncated);
    }

    #[tokio::test]
    async fn test_run_propagates_exit_code() {
        let outcome = ProcessExecutor
            .run("sh", &sh("exit 7"), Path::new("."), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(outcome.exit_code, 7);
        assert!(!outcome.timed_out);
    }

    #[tokio::test]
    async fn test_run_kills_on_timeout() {
        let outcome = ProcessExecutor
            .run(
                "sh",
                &sh("sleep 30"),
                Path::new("."),
                Duration::from_millis(200),
            )
            .await
            .unwrap();

        assert!(outcome.timed_out);
        assert_eq!(outcome.exit_code, -1);
    }

    #[tokio::test]
    async fn test_run_truncates_flooded_stream() {
        // Well past the cap; the child must still exit promptly because the
        // drainer keeps reading after the cap.
        let outcome = ProcessExecutor
            .run(
                "sh",
                &sh("head -c 300000 /dev/zero | tr '\\0' a"),
                Path::new("."),
                Duration::from_secs(10),
            )
            .await
            .unwrap();

        assert_eq!(outcome.exit_code, 0);
        assert!(outcome.stdout_truncated);
        assert!(outcome.stdout.ends_with(TRUNCATION_MARKER));
        let body_chars = outcome.stdout.chars().count();
        assert!(body_chars <= MAX_STREAM_CHARS + TRUNCATION_MARKER.len() + 1);
    }

    #[tokio::test]
    async fn test_run_spawn_error_propagates() {
        let result = ProcessExecutor
            .run(
                "definitely-not-a-real-binary",
                &[],
                Path::new("."),
                Duration::from_secs(1),
            )
            .await;

        assert!(result.is_err());
    }

    #[test]
    fn test_finish_capture_under_cap() {
        let (text, truncated) = finish_capture(b"hello".to_vec(), false);
        assert_eq!(text, "hello");
        assert!(!truncated);
    }

    #[test]
    fn test_finish_capture_over_cap() {
        let big = vec![b'x'; MAX_STREAM_CHARS + 10];
        let (text, truncated) = finish_capture(big, false);
        assert!(truncated);
        assert!(text.ends_with(TRUNCATION_MARKER));
        assert_eq!(
            text.chars().count(),
            MAX_STREAM_CHARS + 1 + TRUNCATION_MARKER.chars().count()
        );
    }

    #[test]
    fn test_finish_capture_overflow_flag_forces_marker() {
        let (text, truncated) = finish_capture(b"partial".to_vec(), true);
        assert!(truncated);
        assert!(text.starts_with("partial"));
        assert!(text.ends_with(TRUNCATION_MARKER));
    }
}
