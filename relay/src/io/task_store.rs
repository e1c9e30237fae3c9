//! Task manifest and resolution storage under `.relay/tasks/<id>/`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::handoff::DefectCapsule;

/// Persisted definition of a task (`task.json`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskSpec {
    pub task_id: String,
    /// Ordered roadmap items; one PASS advances one position.
    pub roadmap: Vec<String>,
    pub created_at: String,
}

/// Operator answer to an escalation (`resolution.json`). Consumed by the
/// next sprint and deleted once that sprint is in the ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Resolution {
    /// Guidance that replaces the baton synopsis for the re-entry sprint.
    pub synopsis: String,
    /// Optional corrected capsule carried instead of the last recorded one.
    pub defect_capsule: Option<DefectCapsule>,
    pub submitted_at: String,
}

/// Task ids become directory names, so the charset is restricted.
pub fn validate_task_id(task_id: &str) -> Result<()> {
    if task_id.is_empty() {
        bail!("task id must not be empty");
    }
    if task_id == "." || task_id == ".." {
        bail!("task id '{task_id}' is not a valid directory name");
    }
    if let Some(bad) = task_id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        bail!("task id '{task_id}' contains invalid character '{bad}'");
    }
    Ok(())
}

pub fn load_task(path: &Path) -> Result<TaskSpec> {
    debug!(path = %path.display(), "loading task manifest");
    let contents =
        fs::read_to_string(path).with_context(|| format!("read task {}", path.display()))?;
    let spec: TaskSpec = serde_json::from_str(&contents)
        .with_context(|| format!("parse task {}", path.display()))?;
    validate_spec(&spec)?;
    Ok(spec)
}

pub fn write_task(path: &Path, spec: &TaskSpec) -> Result<()> {
    debug!(path = %path.display(), task_id = %spec.task_id, "writing task manifest");
    validate_spec(spec)?;
    let mut buf = serde_json::to_string_pretty(spec)?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn validate_spec(spec: &TaskSpec) -> Result<()> {
    validate_task_id(&spec.task_id)?;
    if spec.roadmap.is_empty() {
        bail!("task '{}' has an empty roadmap", spec.task_id);
    }
    if let Some(idx) = spec.roadmap.iter().position(|item| item.trim().is_empty()) {
        bail!("task '{}' roadmap item {} is blank", spec.task_id, idx + 1);
    }
    Ok(())
}

/// Load a pending resolution. Absent file means no resolution was submitted.
pub fn load_resolution(path: &Path) -> Result<Option<Resolution>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read resolution {}", path.display()))?;
    let resolution: Resolution = serde_json::from_str(&contents)
        .with_context(|| format!("parse resolution {}", path.display()))?;
    if resolution.synopsis.trim().is_empty() {
        bail!("resolution {} has a blank synopsis", path.display());
    }
    Ok(Some(resolution))
}

pub fn write_resolution(path: &Path, resolution: &Resolution) -> Result<()> {
    debug!(path = %path.display(), "writing resolution");
    let mut buf = serde_json::to_string_pretty(resolution)?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Remove a consumed resolution. Missing file is fine.
pub fn clear_resolution(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    fs::remove_file(path).with_context(|| format!("remove resolution {}", path.display()))
}

/// Known task ids, sorted. A missing tasks directory means no tasks yet.
pub fn list_task_ids(tasks_dir: &Path) -> Result<Vec<String>> {
    if !tasks_dir.exists() {
        return Ok(Vec::new());
    }
    let mut ids = Vec::new();
    let entries = fs::read_dir(tasks_dir)
        .with_context(|| format!("read tasks dir {}", tasks_dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("read tasks dir {}", tasks_dir.display()))?;
        if !entry.path().is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            ids.push(name.to_string());
        }
    }
    ids.sort();
    Ok(ids)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
