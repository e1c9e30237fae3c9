//! The coordination loop for `relay run`.
//!
//! Each cycle folds the ledger into task state, hands a fresh baton to the
//! builder/verifier pair, applies the retry policy to the verdict, and
//! appends exactly one ledger entry. The fold at the top of each cycle is
//! the only state authority, so a crash-resume and a warm iteration are
//! indistinguishable.

use std::path::Path;

use anyhow::{Result, anyhow};
use chrono::{SecondsFormat, Utc};
use tracing::{debug, info, warn};

use crate::core::decision::{Decision, EscalationReason, TaskStatus, decide};
use crate::core::fold::fold_task_state;
use crate::core::synopsis::clamp_to_budget;
use crate::handoff::{
    Baton, DefectCapsule, LedgerEntry, ResolvedDefect, SEED_SYNOPSIS, Verdict,
};
use crate::io::checks::CheckHarness;
use crate::io::collaborator::Collaborator;
use crate::io::config::EngineConfig;
use crate::io::git::Git;
use crate::io::ledger::{append_entry, read_entries};
use crate::io::paths::require_engine_dir;
use crate::io::recall::{RecallRecord, SimilarityStore, keywords_for};
use crate::io::sprint_log::{SprintPaths, write_engine_error_log};
use crate::io::task_store::{Resolution, clear_resolution, load_resolution, load_task};
use crate::sprint::{SprintContext, run_sprint};

/// Reason why [`run_task`] stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// Every roadmap item has a checkpoint.
    Complete,
    /// The task is paused for human attention.
    Escalated {
        sprint_id: u64,
        reason: EscalationReason,
    },
    /// The per-invocation sprint cap was reached.
    MaxSprints { executed: u64, max_sprints: u64 },
}

/// Summary of one loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub task_id: String,
    pub sprints_executed: u64,
    pub stop: LoopStop,
}

/// The effectful backends one loop invocation drives.
pub struct Collaborators<'a, B, V, H, S> {
    pub builder: &'a B,
    pub verifier: &'a V,
    pub checks: &'a H,
    pub recall: &'a S,
}

/// Run sprint cycles until the task completes, escalates without a pending
/// resolution, or hits the configured sprint cap.
///
/// Engine-side failures (ledger write exhaustion, unreadable state) stop
/// the loop with an error; everything a collaborator can get wrong has
/// already been folded into a verdict by [`run_sprint`].
pub fn run_task<B, V, H, S, F>(
    root: &Path,
    task_id: &str,
    config: &EngineConfig,
    collab: &Collaborators<'_, B, V, H, S>,
    mut on_sprint: F,
) -> Result<LoopOutcome>
where
    B: Collaborator,
    V: Collaborator,
    H: CheckHarness,
    S: SimilarityStore,
    F: FnMut(&LedgerEntry, &Decision),
{
    let paths = require_engine_dir(root)?;
    let spec = load_task(&paths.task_manifest(task_id))?;
    let git = Git::new(root);
    git.ensure_repository()?;

    let policy = config.decision_policy();
    let ledger_path = paths.ledger_path(task_id);
    let resolution_path = paths.resolution_path(task_id);
    let task_dir = paths.task_dir(task_id);

    let mut sprints_executed = 0u64;
    loop {
        let entries = read_entries(&ledger_path, task_id)?;
        let state = fold_task_state(task_id, spec.roadmap.len(), &entries, &policy);

        let resolution = match state.status {
            TaskStatus::Complete => {
                info!(task_id, sprints_executed, "task complete");
                return Ok(LoopOutcome {
                    task_id: task_id.to_string(),
                    sprints_executed,
                    stop: LoopStop::Complete,
                });
            }
            TaskStatus::Escalated => {
                let Some(resolution) = load_resolution(&resolution_path)? else {
                    let reason = state
                        .escalation_reason
                        .unwrap_or(EscalationReason::RetryLimit);
                    info!(task_id, %reason, "task escalated, awaiting resolution");
                    return Ok(LoopOutcome {
                        task_id: task_id.to_string(),
                        sprints_executed,
                        stop: LoopStop::Escalated {
                            sprint_id: state.current_sprint_id,
                            reason,
                        },
                    });
                };
                info!(task_id, "applying operator resolution");
                Some(resolution)
            }
            TaskStatus::Running => None,
        };

        if config.max_sprints > 0 && sprints_executed >= config.max_sprints {
            info!(task_id, max_sprints = config.max_sprints, "sprint cap reached");
            return Ok(LoopOutcome {
                task_id: task_id.to_string(),
                sprints_executed,
                stop: LoopStop::MaxSprints {
                    executed: sprints_executed,
                    max_sprints: config.max_sprints,
                },
            });
        }

        // Sprint ids are allocated off the ledger tail, so they stay
        // monotonic across restarts and are never reused.
        let sprint_id = state.current_sprint_id + 1;
        let roadmap_chunk = spec
            .roadmap
            .get(state.roadmap_position)
            .ok_or_else(|| {
                anyhow!(
                    "roadmap position {} out of range for task '{task_id}'",
                    state.roadmap_position
                )
            })?
            .clone();
        let baton = build_baton(
            task_id,
            sprint_id,
            &roadmap_chunk,
            &entries,
            resolution.as_ref(),
            config,
            collab.recall,
        )?;

        let sprint_paths = SprintPaths::new(&task_dir, sprint_id);
        let ctx = SprintContext {
            workdir: root,
            paths: &sprint_paths,
            config,
        };
        let result =
            match run_sprint(&ctx, &baton, collab.builder, collab.verifier, collab.checks) {
                Ok(result) => result,
                Err(err) => {
                    if let Err(log_err) = write_engine_error_log(&sprint_paths, &err) {
                        warn!(error = format!("{log_err:#}"), "engine error log write failed");
                    }
                    return Err(err);
                }
            };

        let defect_hash = result.verdict.capsule().map(|c| c.content_hash.clone());
        let decision = decide(
            result.verdict.kind(),
            defect_hash.as_deref(),
            state.remediation_count,
            state.last_defect_hash.as_deref(),
            state.tokens_spent + result.tokens_used,
            &policy,
        );

        let commit_ref = match &result.verdict {
            Verdict::Pass => Some(checkpoint(&git, task_id, sprint_id)?),
            Verdict::Fail(_) => None,
        };

        let entry = LedgerEntry {
            task_id: task_id.to_string(),
            sprint_id,
            role: result.role,
            roadmap_chunk,
            builder_summary: result.builder_summary.clone(),
            verdict: result.verdict.kind(),
            defect_capsule: result.verdict.capsule().cloned(),
            commit_ref,
            tokens_used: result.tokens_used,
            runtime_seconds: result.runtime_seconds,
            ended_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        };
        append_entry(&ledger_path, &entry, config.ledger_append_retries)?;

        // The resolution is consumed only once its sprint reached the
        // ledger; a crash before this point re-applies it on resume.
        if resolution.is_some() {
            clear_resolution(&resolution_path)?;
        }
        if entry.is_checkpoint() && state.remediation_count > 0 {
            record_resolved_defect(collab.recall, &entries, &entry);
        }

        sprints_executed += 1;
        on_sprint(&entry, &decision);
    }
}

/// Assemble the baton for the next sprint from the ledger tail, a pending
/// resolution, and the recall store.
fn build_baton<S: SimilarityStore>(
    task_id: &str,
    sprint_id: u64,
    roadmap_chunk: &str,
    entries: &[LedgerEntry],
    resolution: Option<&Resolution>,
    config: &EngineConfig,
    recall: &S,
) -> Result<Baton> {
    let source = match resolution {
        Some(resolution) => resolution.synopsis.clone(),
        None => entries
            .last()
            .map(|entry| entry.builder_summary.clone())
            .unwrap_or_else(|| SEED_SYNOPSIS.to_string()),
    };
    let clamped = clamp_to_budget(&source, config.synopsis_budget_tokens)?;
    if clamped.truncated {
        warn!(sprint_id, "baton synopsis over budget, truncated");
    }

    let defect_capsule = resolution
        .and_then(|resolution| resolution.defect_capsule.clone())
        .or_else(|| open_defect(entries).cloned());

    let prior_resolutions = match &defect_capsule {
        Some(capsule) if config.recall_k > 0 => {
            match recall.query(&keywords_for(capsule), config.recall_k) {
                Ok(hits) => hits,
                Err(err) => {
                    warn!(error = format!("{err:#}"), "recall query failed");
                    Vec::new()
                }
            }
        }
        _ => Vec::new(),
    };

    Ok(Baton {
        task_id: task_id.to_string(),
        sprint_id,
        roadmap_chunk: roadmap_chunk.to_string(),
        synopsis: clamped.text,
        defect_capsule,
        prior_resolutions,
    })
}

/// The defect still being remediated, if the previous sprint failed.
fn open_defect(entries: &[LedgerEntry]) -> Option<&DefectCapsule> {
    entries
        .last()
        .filter(|entry| !entry.is_checkpoint())
        .and_then(|entry| entry.defect_capsule.as_ref())
}

/// A pass that closes a remediation streak stores the fix for later
/// recall. Failures here are logged and swallowed; recall is advisory.
fn record_resolved_defect<S: SimilarityStore>(
    recall: &S,
    entries: &[LedgerEntry],
    closing: &LedgerEntry,
) {
    let Some(capsule) = open_defect(entries) else {
        return;
    };
    let record = RecallRecord {
        vector_key: capsule.vector_key.clone(),
        keywords: keywords_for(capsule),
        resolved: true,
        payload: ResolvedDefect {
            defect_type: capsule.defect_type.clone(),
            location: capsule.location.clone(),
            root_cause_synopsis: capsule.root_cause_synopsis.clone(),
            resolution_summary: closing.builder_summary.clone(),
        },
        recorded_at: closing.ended_at.clone(),
    };
    if let Err(err) = recall.put(&record) {
        warn!(error = format!("{err:#}"), "recall store write failed");
    }
}

/// Commit the working tree as the checkpoint for a passed sprint. With
/// nothing staged, the existing HEAD already is the checkpoint.
fn checkpoint(git: &Git, task_id: &str, sprint_id: u64) -> Result<String> {
    git.add_all()?;
    let committed = git.commit_staged(&format!(
        "chore(relay): checkpoint {task_id} sprint {sprint_id}"
    ))?;
    if !committed {
        debug!(sprint_id, "nothing staged, reusing HEAD as checkpoint");
    }
    git.head_sha()
}
