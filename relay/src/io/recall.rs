//! Resolution recall store backed by JSONL.
//!
//! Past resolved defects are stored with a keyword bag and surfaced to
//! later sprints that hit similar defects. Recall is advisory: lookup
//! failures degrade to an empty result at the call site, never a stopped
//! loop. A record scores as the share of its stored keywords that appear
//! in the query.

use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::handoff::{DefectCapsule, ResolvedDefect};

/// One stored recall entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecallRecord {
    /// Retrieval key, the capsule's content hash.
    pub vector_key: String,
    pub keywords: Vec<String>,
    pub resolved: bool,
    pub payload: ResolvedDefect,
    pub recorded_at: String,
}

/// Abstraction over the recall backend.
pub trait SimilarityStore {
    fn put(&self, record: &RecallRecord) -> Result<()>;
    /// Top `k` resolved payloads by keyword overlap, best first.
    fn query(&self, keywords: &[String], k: usize) -> Result<Vec<ResolvedDefect>>;
}

/// Keyword bag for a defect capsule: lowercased alphanumeric words from
/// the location, defect type, and synopsis, three characters or longer.
pub fn keywords_for(capsule: &DefectCapsule) -> Vec<String> {
    let mut words = BTreeSet::new();
    for field in [
        &capsule.location,
        &capsule.defect_type,
        &capsule.root_cause_synopsis,
    ] {
        for word in field.split(|c: char| !c.is_alphanumeric()) {
            if word.len() >= 3 {
                words.insert(word.to_lowercase());
            }
        }
    }
    words.into_iter().collect()
}

/// Recall store appending records to a JSONL file.
pub struct JsonlRecallStore {
    path: PathBuf,
}

impl JsonlRecallStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl SimilarityStore for JsonlRecallStore {
    fn put(&self, record: &RecallRecord) -> Result<()> {
        let line = serde_json::to_string(record).context("serialize recall record")?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open recall store {}", self.path.display()))?;
        writeln!(file, "{line}")
            .with_context(|| format!("write recall store {}", self.path.display()))?;
        debug!(vector_key = %record.vector_key, "recall record stored");
        Ok(())
    }

    fn query(&self, keywords: &[String], k: usize) -> Result<Vec<ResolvedDefect>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = std::fs::read_to_string(&self.path)
            .with_context(|| format!("read recall store {}", self.path.display()))?;
        let query: BTreeSet<&str> = keywords.iter().map(String::as_str).collect();

        let mut scored: Vec<(f64, usize, ResolvedDefect)> = Vec::new();
        for (idx, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: RecallRecord = match serde_json::from_str(line) {
                Ok(record) => record,
                Err(err) => {
                    warn!(line = idx + 1, err = %err, "skipping corrupt recall record");
                    continue;
                }
            };
            if !record.resolved {
                continue;
            }
            let score = overlap_score(&query, &record.keywords);
            if score > 0.0 {
                scored.push((score, idx, record.payload));
            }
        }

        // Best score first; ties go to the most recently stored record.
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(b.1.cmp(&a.1)));
        Ok(scored.into_iter().take(k).map(|(_, _, p)| p).collect())
    }
}

fn overlap_score(query: &BTreeSet<&str>, stored: &[String]) -> f64 {
    if stored.is_empty() {
        return 0.0;
    }
    let hits = stored
        .iter()
        .filter(|word| query.contains(word.as_str()))
        .count();
    hits as f64 / stored.len() as f64
}
