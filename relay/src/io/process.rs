//! Child process execution with hard deadlines and bounded output capture.
//!
//! Collaborator calls are not assumed to be interruptible: when the deadline
//! fires the child is killed best-effort and its eventual exit status is
//! discarded, so the loop never blocks on a misbehaving collaborator.

use std::io::{Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
///
/// `status` is `None` when the deadline fired; the post-kill exit status of
/// a cancelled child carries no signal worth keeping.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: Option<ExitStatus>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.map(|status| status.success()).unwrap_or(false)
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.status.and_then(|status| status.code())
    }
}

/// Run a command under a wall-clock deadline, capturing stdout/stderr
/// without risking pipe deadlocks.
///
/// Output is drained concurrently while the child runs; `output_limit_bytes`
/// bounds what is kept in memory (excess bytes are counted and discarded
/// while the pipe keeps draining).
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            error!(err = %err, "failed to spawn command");
            return Err(err).context("spawn command");
        }
    };

    // Stdin is fed from its own thread so a child that never drains it
    // cannot stall the deadline, and one that exits without reading it
    // (EPIPE) is judged by its exit status alone.
    let stdin_handle = match stdin {
        Some(input) => {
            let mut child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.to_vec();
            Some(thread::spawn(move || {
                if let Err(err) = child_stdin.write_all(&input) {
                    if err.kind() != std::io::ErrorKind::BrokenPipe {
                        warn!(err = %err, "stdin write failed");
                    }
                }
            }))
        }
        None => None,
    };

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

    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => Some(status),
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "deadline elapsed, cancelling child"
            );
            // Best effort: a child that survives the kill must not stall
            // the loop, and a reaped status after the kill is discarded.
            if let Err(err) = child.kill() {
                warn!(err = %err, "failed to kill timed out child");
            }
            if let Err(err) = child.wait() {
                warn!(err = %err, "failed to reap timed out child");
            }
            None
        }
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;
    if let Some(handle) = stdin_handle {
        // Unblocks once the child is reaped and the pipe closes.
        let _ = handle.join();
    }

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    let timed_out = status.is_none();
    debug!(exit_code = ?status.and_then(|s| s.code()), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut collected = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(collected.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            collected.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((collected, truncated))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", script]);
        cmd
    }

    #[test]
    fn captures_stdout_and_exit_code() {
        let output = run_command_with_timeout(
            sh("printf hello; exit 0"),
            None,
            Duration::from_secs(5),
            1_000,
        )
        .expect("run");
        assert!(output.success());
        assert_eq!(output.stdout, b"hello");
        assert_eq!(output.exit_code(), Some(0));
        assert!(!output.timed_out);
    }

    #[test]
    fn nonzero_exit_is_not_success() {
        let output = run_command_with_timeout(
            sh("printf oops >&2; exit 3"),
            None,
            Duration::from_secs(5),
            1_000,
        )
        .expect("run");
        assert!(!output.success());
        assert_eq!(output.exit_code(), Some(3));
        assert_eq!(output.stderr, b"oops");
    }

    #[test]
    fn deadline_kills_and_flags_timeout() {
        let output = run_command_with_timeout(
            sh("sleep 5"),
            None,
            Duration::from_millis(100),
            1_000,
        )
        .expect("run");
        assert!(output.timed_out);
        assert!(output.status.is_none());
        assert!(!output.success());
    }

    #[test]
    fn output_beyond_the_limit_is_counted_not_kept() {
        let output = run_command_with_timeout(
            sh("printf aaaaaaaaaa"),
            None,
            Duration::from_secs(5),
            4,
        )
        .expect("run");
        assert_eq!(output.stdout, b"aaaa");
        assert_eq!(output.stdout_truncated, 6);
    }

    #[test]
    fn stdin_reaches_the_child() {
        let output = run_command_with_timeout(
            sh("cat"),
            Some(b"ping"),
            Duration::from_secs(5),
            1_000,
        )
        .expect("run");
        assert_eq!(output.stdout, b"ping");
    }

    #[test]
    fn child_that_ignores_stdin_is_not_an_error() {
        // Larger than any pipe buffer, so an inline write would block or
        // break; the child's exit status must win regardless.
        let input = vec![b'x'; 1 << 20];
        let output = run_command_with_timeout(
            sh("exit 0"),
            Some(&input),
            Duration::from_secs(5),
            1_000,
        )
        .expect("run");
        assert!(output.success());
    }

    #[test]
    fn missing_binary_is_an_error() {
        let cmd = Command::new("relay-test-binary-that-does-not-exist");
        let result =
            run_command_with_timeout(cmd, None, Duration::from_secs(1), 1_000);
        assert!(result.is_err());
    }
}
