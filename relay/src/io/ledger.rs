//! Append-only task ledger stored as JSONL.
//!
//! One line per completed sprint cycle. The ledger is the source of truth
//! for task state: readers fold over it, writers only append. A failed
//! append after bounded retries is a [`LedgerWriteError`], which callers
//! surface as a process fault rather than absorbing into the retry path.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, warn};

use crate::handoff::LedgerEntry;

/// Durable append failed after bounded retries.
#[derive(Debug, Clone)]
pub struct LedgerWriteError {
    pub task_id: String,
    pub sprint_id: u64,
    pub attempts: u32,
    pub detail: String,
}

impl fmt::Display for LedgerWriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ledger append failed for task '{}' sprint {} after {} attempts: {}",
            self.task_id, self.sprint_id, self.attempts, self.detail
        )
    }
}

impl std::error::Error for LedgerWriteError {}

/// Append one entry, fsyncing before returning. Retries up to
/// `max_attempts` times before giving up with a [`LedgerWriteError`].
pub fn append_entry(path: &Path, entry: &LedgerEntry, max_attempts: u32) -> Result<()> {
    let line = serde_json::to_string(entry).context("serialize ledger entry")?;
    let mut last_err = String::new();
    for attempt in 1..=max_attempts.max(1) {
        match try_append(path, &line) {
            Ok(()) => {
                debug!(
                    sprint_id = entry.sprint_id,
                    attempt, "ledger entry appended"
                );
                return Ok(());
            }
            Err(err) => {
                last_err = format!("{err:#}");
                warn!(attempt, err = %last_err, "ledger append attempt failed");
            }
        }
    }
    Err(anyhow!(LedgerWriteError {
        task_id: entry.task_id.clone(),
        sprint_id: entry.sprint_id,
        attempts: max_attempts.max(1),
        detail: last_err,
    }))
}

fn try_append(path: &Path, line: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open ledger {}", path.display()))?;
    file.write_all(format!("{line}\n").as_bytes())
        .with_context(|| format!("write ledger {}", path.display()))?;
    file.sync_all()
        .with_context(|| format!("sync ledger {}", path.display()))?;
    Ok(())
}

/// Read all entries for `task_id`, oldest first.
///
/// A missing ledger is an empty task. Entries must belong to the task and
/// carry strictly increasing sprint ids; anything else is corruption.
pub fn read_entries(path: &Path, task_id: &str) -> Result<Vec<LedgerEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read ledger {}", path.display()))?;
    let mut entries = Vec::new();
    let mut last_sprint_id = 0u64;
    for (idx, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let entry: LedgerEntry = serde_json::from_str(line)
            .with_context(|| format!("parse ledger {} line {}", path.display(), idx + 1))?;
        if entry.task_id != task_id {
            bail!(
                "ledger {} line {} belongs to task '{}', expected '{}'",
                path.display(),
                idx + 1,
                entry.task_id,
                task_id
            );
        }
        if entry.sprint_id <= last_sprint_id {
            bail!(
                "ledger {} line {} has sprint id {} after {}, ids must strictly increase",
                path.display(),
                idx + 1,
                entry.sprint_id,
                last_sprint_id
            );
        }
        last_sprint_id = entry.sprint_id;
        entries.push(entry);
    }
    Ok(entries)
}
