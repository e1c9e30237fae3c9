//! Reconstruct task state from the ledger.
//!
//! The ledger is the only authority: nothing here is persisted separately,
//! so a crash-resume and a warm loop iteration see identical state. The
//! fold replays [`decide`] over every entry with the state as it stood
//! before that entry, exactly as the loop did when the entry was written.

use crate::core::decision::{
    Decision, DecisionPolicy, TaskState, TaskStatus, decide,
};
use crate::handoff::LedgerEntry;

/// Fold an ordered ledger into the current [`TaskState`].
///
/// A task is complete once every roadmap item has a checkpoint. Otherwise
/// it is escalated exactly when the replayed decision for the final entry
/// escalates; appending any later entry clears the condition.
pub fn fold_task_state(
    task_id: &str,
    roadmap_len: usize,
    entries: &[LedgerEntry],
    policy: &DecisionPolicy,
) -> TaskState {
    let mut remediation_count: u32 = 0;
    let mut last_defect_hash: Option<String> = None;
    let mut tokens_spent: u64 = 0;
    let mut roadmap_position: usize = 0;
    let mut last_decision: Option<Decision> = None;

    for entry in entries {
        let defect_hash = entry
            .defect_capsule
            .as_ref()
            .map(|capsule| capsule.content_hash.as_str());
        tokens_spent += entry.tokens_used;
        let decision = decide(
            entry.verdict,
            defect_hash,
            remediation_count,
            last_defect_hash.as_deref(),
            tokens_spent,
            policy,
        );
        if entry.is_checkpoint() {
            remediation_count = 0;
            last_defect_hash = None;
            roadmap_position += 1;
        } else {
            remediation_count += 1;
            last_defect_hash = defect_hash.map(str::to_string);
        }
        last_decision = Some(decision);
    }

    let (status, escalation_reason) = if roadmap_position >= roadmap_len {
        (TaskStatus::Complete, None)
    } else {
        match last_decision {
            Some(Decision::Escalate(reason)) => (TaskStatus::Escalated, Some(reason)),
            _ => (TaskStatus::Running, None),
        }
    };

    TaskState {
        task_id: task_id.to_string(),
        current_sprint_id: entries.last().map(|entry| entry.sprint_id).unwrap_or(0),
        roadmap_position,
        remediation_count,
        last_defect_hash,
        tokens_spent,
        status,
        escalation_reason,
    }
}

/// Entries since the latest checkpoint (or the task start): the bounded
/// trail handed to a human on escalation.
pub fn escalation_trail(entries: &[LedgerEntry]) -> &[LedgerEntry] {
    let start = entries
        .iter()
        .rposition(LedgerEntry::is_checkpoint)
        .map(|index| index + 1)
        .unwrap_or(0);
    &entries[start..]
}
