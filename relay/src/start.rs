//! Task registration: the `relay start` entrypoint.

use std::path::Path;

use anyhow::{Result, anyhow};
use chrono::{SecondsFormat, Utc};
use tracing::{debug, info, instrument};

use crate::io::git::Git;
use crate::io::paths::scaffold_engine_dir;
use crate::io::task_store::{TaskSpec, load_task, validate_task_id, write_task};

/// Result of [`start_task`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOutcome {
    pub task_id: String,
    /// False when the task already existed with a matching roadmap.
    pub created: bool,
    pub roadmap_len: usize,
}

/// Register a task in `root`, scaffolding `.relay/` on first use.
///
/// Re-running with the same roadmap (or with none) is a no-op; a different
/// roadmap is rejected so a half-finished ledger never changes meaning
/// underneath its entries.
#[instrument(skip_all, fields(task_id = %task_id))]
pub fn start_task(root: &Path, task_id: &str, roadmap: &[String]) -> Result<StartOutcome> {
    validate_task_id(task_id)?;

    let git = Git::new(root);
    git.ensure_repository()?;
    // The start commit must not sweep up unrelated local work.
    git.ensure_clean_except_prefixes(&[".relay/"])?;

    let paths = scaffold_engine_dir(root)?;
    let manifest_path = paths.task_manifest(task_id);

    let (spec, created) = if manifest_path.exists() {
        let existing = load_task(&manifest_path)?;
        if !roadmap.is_empty() && existing.roadmap != roadmap {
            return Err(anyhow!(
                "task '{task_id}' already exists with a different roadmap \
                 ({} items on disk, {} given)",
                existing.roadmap.len(),
                roadmap.len()
            ));
        }
        debug!(task_id, "task already registered");
        (existing, false)
    } else {
        if roadmap.is_empty() {
            return Err(anyhow!(
                "task '{task_id}' is not registered; pass a roadmap to create it"
            ));
        }
        let spec = TaskSpec {
            task_id: task_id.to_string(),
            roadmap: roadmap.to_vec(),
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        };
        write_task(&manifest_path, &spec)?;
        (spec, true)
    };

    git.add_all()?;
    let _committed = git.commit_staged(&format!("chore(relay): start task {task_id}"))?;

    info!(task_id, roadmap_len = spec.roadmap.len(), created, "task ready");
    Ok(StartOutcome {
        task_id: task_id.to_string(),
        created,
        roadmap_len: spec.roadmap.len(),
    })
}
