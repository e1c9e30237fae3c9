//! Read-only task state views for `relay status` and `relay escalations`.
//!
//! Everything here is a fold over the ledger; no cached state exists to go
//! stale.

use std::path::Path;

use anyhow::Result;
use serde::Serialize;

use crate::core::decision::{EscalationReason, TaskState, TaskStatus};
use crate::core::fold::{escalation_trail, fold_task_state};
use crate::handoff::LedgerEntry;
use crate::io::config::EngineConfig;
use crate::io::ledger::read_entries;
use crate::io::paths::require_engine_dir;
use crate::io::task_store::{list_task_ids, load_task};

/// Folded state plus the manifest facts a status line needs.
#[derive(Debug, Clone, Serialize)]
pub struct StatusView {
    pub state: TaskState,
    pub roadmap_len: usize,
    /// Item under work; `None` once the task is complete.
    pub current_chunk: Option<String>,
}

/// Fold the ledger of one task into its current state.
pub fn task_status(root: &Path, task_id: &str, config: &EngineConfig) -> Result<StatusView> {
    let paths = require_engine_dir(root)?;
    let spec = load_task(&paths.task_manifest(task_id))?;
    let entries = read_entries(&paths.ledger_path(task_id), task_id)?;
    let state = fold_task_state(
        task_id,
        spec.roadmap.len(),
        &entries,
        &config.decision_policy(),
    );
    let current_chunk = spec.roadmap.get(state.roadmap_position).cloned();
    Ok(StatusView {
        state,
        roadmap_len: spec.roadmap.len(),
        current_chunk,
    })
}

/// One escalated task with its bounded context trail.
#[derive(Debug, Clone, Serialize)]
pub struct EscalationView {
    pub task_id: String,
    /// Sprint whose verdict tripped the escalation.
    pub sprint_id: u64,
    pub reason: EscalationReason,
    pub roadmap_chunk: String,
    /// Entries since the latest checkpoint, oldest first.
    pub trail: Vec<LedgerEntry>,
}

/// Escalated tasks across the engine directory, sorted by task id.
pub fn escalated_tasks(root: &Path, config: &EngineConfig) -> Result<Vec<EscalationView>> {
    let paths = require_engine_dir(root)?;
    let policy = config.decision_policy();
    let mut views = Vec::new();
    for task_id in list_task_ids(&paths.tasks_dir)? {
        let spec = load_task(&paths.task_manifest(&task_id))?;
        let entries = read_entries(&paths.ledger_path(&task_id), &task_id)?;
        let state = fold_task_state(&task_id, spec.roadmap.len(), &entries, &policy);
        if state.status != TaskStatus::Escalated {
            continue;
        }
        // Escalated implies a final entry whose replayed decision escalated,
        // so the trail is never empty.
        let Some(reason) = state.escalation_reason else {
            continue;
        };
        let trail = escalation_trail(&entries).to_vec();
        let roadmap_chunk = trail
            .last()
            .map(|entry| entry.roadmap_chunk.clone())
            .unwrap_or_default();
        views.push(EscalationView {
            task_id: state.task_id,
            sprint_id: state.current_sprint_id,
            reason,
            roadmap_chunk,
            trail,
        });
    }
    Ok(views)
}
