//! Collaborator abstraction for role invocation.
//!
//! The [`Collaborator`] trait decouples sprint orchestration from the
//! external command that plays a role. Tests use scripted collaborators
//! that write predetermined output without spawning processes.
//!
//! An invocation that runs but ends badly is a classified [`InvokeOutcome`],
//! not an `Err`: the decision engine routes timeouts and failures through
//! the normal retry path. `Err` is reserved for engine-side I/O problems.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::invariants;
use crate::handoff::{self, ArtifactPackage, Role, VerifierReport};
use crate::io::process::{CommandOutput, run_command_with_timeout};

/// Environment variable naming the file a collaborator must write.
pub const OUTPUT_PATH_ENV: &str = "RELAY_OUTPUT_PATH";
/// Environment variable naming the schema that constrains the output.
pub const OUTPUT_SCHEMA_ENV: &str = "RELAY_OUTPUT_SCHEMA_PATH";

/// Parameters for one collaborator invocation.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub role: Role,
    /// Working directory for the collaborator process.
    pub workdir: PathBuf,
    /// Input document, piped to the collaborator on stdin.
    pub input: Vec<u8>,
    /// Path to the JSON Schema that constrains the output document.
    pub output_schema_path: PathBuf,
    /// Path where the collaborator must write its output JSON.
    pub output_path: PathBuf,
    /// Path for the captured stdout/stderr log.
    pub log_path: PathBuf,
    /// Hard wall-clock deadline for the call.
    pub timeout: Duration,
    /// Truncate captured output beyond this many bytes.
    pub output_limit_bytes: usize,
}

/// How a collaborator invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvokeOutcome {
    Completed,
    TimedOut,
    Failed { detail: String },
}

/// Abstraction over role execution backends.
pub trait Collaborator {
    /// Run the role with the given request. On [`InvokeOutcome::Completed`]
    /// the output document is at `request.output_path`.
    fn invoke(&self, request: &InvokeRequest) -> Result<InvokeOutcome>;
}

/// Collaborator that spawns a configured command.
pub struct CommandCollaborator {
    command: Vec<String>,
}

impl CommandCollaborator {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl Collaborator for CommandCollaborator {
    #[instrument(skip_all, fields(role = request.role.as_str(), timeout_secs = request.timeout.as_secs()))]
    fn invoke(&self, request: &InvokeRequest) -> Result<InvokeOutcome> {
        info!(workdir = %request.workdir.display(), command = ?self.command, "invoking collaborator");

        let Some((program, args)) = self.command.split_first() else {
            return Err(anyhow!("collaborator command is empty"));
        };
        if !request.output_schema_path.exists() {
            return Err(anyhow!(
                "missing output schema {}",
                request.output_schema_path.display()
            ));
        }
        if let Some(parent) = request.output_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create output dir {}", parent.display()))?;
        }

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&request.workdir)
            .env(OUTPUT_PATH_ENV, &request.output_path)
            .env(OUTPUT_SCHEMA_ENV, &request.output_schema_path);

        let output = match run_command_with_timeout(
            cmd,
            Some(&request.input),
            request.timeout,
            request.output_limit_bytes,
        ) {
            Ok(output) => output,
            Err(err) => {
                // Collaborator misconfiguration (missing binary, broken
                // pipe) goes through the retry path like any other failure.
                warn!(err = format!("{err:#}"), "collaborator could not be run");
                return Ok(InvokeOutcome::Failed {
                    detail: format!("{err:#}"),
                });
            }
        };

        write_invoke_log(
            &request.log_path,
            request.role,
            &output,
            request.output_limit_bytes,
        )?;

        if output.timed_out {
            warn!(
                timeout_secs = request.timeout.as_secs(),
                "collaborator deadline elapsed"
            );
            return Ok(InvokeOutcome::TimedOut);
        }
        if !output.success() {
            let detail = failure_detail(&output);
            warn!(detail = %detail, "collaborator failed");
            return Ok(InvokeOutcome::Failed { detail });
        }

        debug!("collaborator completed");
        Ok(InvokeOutcome::Completed)
    }
}

fn failure_detail(output: &CommandOutput) -> String {
    let tail = stderr_tail(&output.stderr);
    match output.exit_code() {
        Some(code) if tail.is_empty() => format!("exit code {code}"),
        Some(code) => format!("exit code {code}: {tail}"),
        None if tail.is_empty() => "terminated by signal".to_string(),
        None => format!("terminated by signal: {tail}"),
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    const TAIL_BYTES: usize = 512;
    let start = stderr.len().saturating_sub(TAIL_BYTES);
    String::from_utf8_lossy(&stderr[start..]).trim().to_string()
}

fn write_invoke_log(
    path: &Path,
    role: Role,
    output: &CommandOutput,
    output_limit: usize,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create log dir {}", parent.display()))?;
    }
    let mut buf = String::new();
    buf.push_str("=== stdout ===\n");
    buf.push_str(&String::from_utf8_lossy(&output.stdout));
    if output.stdout_truncated > 0 {
        buf.push_str(&format!(
            "\n[{} stdout truncated {} bytes]\n",
            role.as_str(),
            output.stdout_truncated
        ));
    }
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(&String::from_utf8_lossy(&output.stderr));
    if output.stderr_truncated > 0 {
        buf.push_str(&format!(
            "\n[{} stderr truncated {} bytes]\n",
            role.as_str(),
            output.stderr_truncated
        ));
    }
    if output.timed_out {
        buf.push_str(&format!("\n[{} timed out]\n", role.as_str()));
    }

    if buf.len() > output_limit {
        let mut end = output_limit;
        while !buf.is_char_boundary(end) {
            end -= 1;
        }
        let truncated = format!(
            "{}\n[truncated {} bytes]\n",
            &buf[..end],
            buf.len() - end
        );
        fs::write(path, truncated)
            .with_context(|| format!("write collaborator log {}", path.display()))?;
        return Ok(());
    }

    fs::write(path, buf).with_context(|| format!("write collaborator log {}", path.display()))
}

/// A collaborator output document after boundary validation.
#[derive(Debug, Clone, PartialEq)]
pub enum Loaded<T> {
    Valid(T),
    /// Schema or invariant violations; the document must not be trusted.
    Invalid(Vec<String>),
}

/// Load and validate a builder's artifact package (schema + invariants).
pub fn load_artifact_package(path: &Path) -> Result<Loaded<ArtifactPackage>> {
    load_validated(
        path,
        handoff::artifact_package_schema_violations,
        invariants::validate_artifact_package,
    )
}

/// Load and validate a verifier's report (schema + invariants).
pub fn load_verifier_report(path: &Path) -> Result<Loaded<VerifierReport>> {
    load_validated(
        path,
        handoff::verifier_report_schema_violations,
        invariants::validate_verifier_report,
    )
}

fn load_validated<T, S, I>(path: &Path, schema_check: S, invariant_check: I) -> Result<Loaded<T>>
where
    T: DeserializeOwned,
    S: Fn(&Value) -> Result<Vec<String>>,
    I: Fn(&T) -> Vec<String>,
{
    if !path.exists() {
        return Ok(Loaded::Invalid(vec![format!(
            "missing collaborator output {}",
            path.display()
        )]));
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read collaborator output {}", path.display()))?;
    let value: Value = match serde_json::from_str(&contents) {
        Ok(value) => value,
        Err(err) => return Ok(Loaded::Invalid(vec![format!("invalid json: {err}")])),
    };
    let violations = schema_check(&value)?;
    if !violations.is_empty() {
        return Ok(Loaded::Invalid(violations));
    }
    let document: T = match serde_json::from_value(value) {
        Ok(document) => document,
        Err(err) => return Ok(Loaded::Invalid(vec![format!("deserialize: {err}")])),
    };
    let violations = invariant_check(&document);
    if !violations.is_empty() {
        return Ok(Loaded::Invalid(violations));
    }
    Ok(Loaded::Valid(document))
}
