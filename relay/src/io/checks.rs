//! Check harness adapter for the configured test command.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::io::process::{CommandOutput, run_command_with_timeout};

/// Trailing output lines kept as findings when checks fail.
const MAX_FINDING_LINES: usize = 20;

#[derive(Debug, Clone)]
pub struct CheckRequest {
    pub workdir: PathBuf,
    pub log_path: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// Result of one check harness run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckReport {
    pub passed: bool,
    /// True when the run was cancelled at the deadline. Callers treat this
    /// differently from an ordinary failure.
    pub timed_out: bool,
    /// Trailing output lines, populated only on failure.
    pub findings: Vec<String>,
}

impl CheckReport {
    pub fn passing() -> Self {
        Self {
            passed: true,
            timed_out: false,
            findings: Vec::new(),
        }
    }
}

pub trait CheckHarness {
    fn run(&self, request: &CheckRequest) -> Result<CheckReport>;
}

/// Check harness that spawns a configured command, `just ci` by default.
pub struct CommandCheckHarness {
    command: Vec<String>,
}

impl CommandCheckHarness {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl CheckHarness for CommandCheckHarness {
    #[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs()))]
    fn run(&self, request: &CheckRequest) -> Result<CheckReport> {
        info!(workdir = %request.workdir.display(), command = ?self.command, "running checks");

        let Some((program, args)) = self.command.split_first() else {
            return Ok(CheckReport {
                passed: false,
                timed_out: false,
                findings: vec!["checks command is empty".to_string()],
            });
        };
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&request.workdir);

        let output = match run_command_with_timeout(
            cmd,
            None,
            request.timeout,
            request.output_limit_bytes,
        ) {
            Ok(output) => output,
            Err(err) => {
                // An unrunnable harness is a failed check, not an engine
                // fault; it flows through the normal remediation path.
                warn!(err = format!("{err:#}"), "checks could not be run");
                return Ok(CheckReport {
                    passed: false,
                    timed_out: false,
                    findings: vec![format!("checks could not be run: {err:#}")],
                });
            }
        };

        write_check_log(&request.log_path, &output, request.output_limit_bytes)?;

        if output.timed_out {
            warn!(
                timeout_secs = request.timeout.as_secs(),
                "checks deadline elapsed"
            );
            return Ok(CheckReport {
                passed: false,
                timed_out: true,
                findings: vec![format!(
                    "checks timed out after {}s",
                    request.timeout.as_secs()
                )],
            });
        }
        if output.success() {
            return Ok(CheckReport::passing());
        }

        Ok(CheckReport {
            passed: false,
            timed_out: false,
            findings: failure_findings(&output),
        })
    }
}

fn failure_findings(output: &CommandOutput) -> Vec<String> {
    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push('\n');
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    let mut findings = trailing_lines(&combined, MAX_FINDING_LINES);
    if findings.is_empty() {
        let code = output
            .exit_code()
            .map_or_else(|| "signal".to_string(), |code| code.to_string());
        findings.push(format!("checks failed with exit code {code}"));
    }
    findings
}

/// Last `max` non-blank lines of `text`, oldest first.
fn trailing_lines(text: &str, max: usize) -> Vec<String> {
    let mut lines: Vec<String> = text
        .lines()
        .rev()
        .filter(|line| !line.trim().is_empty())
        .take(max)
        .map(|line| line.trim_end().to_string())
        .collect();
    lines.reverse();
    lines
}

fn write_check_log(path: &Path, output: &CommandOutput, output_limit: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create check log dir {}", parent.display()))?;
    }
    let mut buf = String::new();
    buf.push_str("=== stdout ===\n");
    buf.push_str(&String::from_utf8_lossy(&output.stdout));
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(&String::from_utf8_lossy(&output.stderr));
    if output.timed_out {
        buf.push_str("\n[checks timed out]\n");
    }

    if buf.len() > output_limit {
        let mut end = output_limit;
        while !buf.is_char_boundary(end) {
            end -= 1;
        }
        let truncated = format!("{}\n[truncated {} bytes]\n", &buf[..end], buf.len() - end);
        fs::write(path, truncated)
            .with_context(|| format!("write check log {}", path.display()))?;
        return Ok(());
    }

    fs::write(path, buf).with_context(|| format!("write check log {}", path.display()))
}
