//! Handoff protocol: the schema-validated documents exchanged between the
//! engine and its collaborators, plus the durable ledger record.
//!
//! Collaborator-produced documents ([`ArtifactPackage`], [`VerifierReport`])
//! are validated against the embedded JSON Schemas before they are trusted;
//! engine-produced documents ([`Baton`], [`LedgerEntry`]) are constructed
//! locally and only serialized here.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use anyhow::{Context, Result};
use jsonschema::Draft;

/// Synopsis carried by the first baton of a fresh task.
pub const SEED_SYNOPSIS: &str = "Fresh start.";

/// Schema for builder output, written next to each sprint's baton so
/// collaborators can self-validate before responding.
pub const ARTIFACT_PACKAGE_SCHEMA: &str =
    include_str!("../schemas/artifact_package.schema.json");

/// Schema for verifier output.
pub const VERIFIER_REPORT_SCHEMA: &str =
    include_str!("../schemas/verifier_report.schema.json");

/// The collaborator role a sprint phase invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Builder,
    Verifier,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Builder => "builder",
            Role::Verifier => "verifier",
        }
    }
}

/// How a sprint phase ended, as recorded in sprint metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseOutcome {
    Completed,
    TimedOut,
    Failed,
}

/// How severe a reported defect is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Major,
    Minor,
    Style,
}

/// Structured failure report attached to every FAIL verdict.
///
/// `defect_id`, `content_hash`, and `vector_key` are engine-derived;
/// collaborators may omit them and [`DefectCapsule::finalize`] fills them in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefectCapsule {
    #[serde(default)]
    pub defect_id: String,
    pub severity: Severity,
    pub location: String,
    pub defect_type: String,
    pub root_cause_synopsis: String,
    #[serde(default)]
    pub fix_steps: Vec<String>,
    #[serde(default)]
    pub repro_steps: String,
    #[serde(default)]
    pub content_hash: String,
    #[serde(default)]
    pub vector_key: String,
}

impl DefectCapsule {
    /// Fill the engine-derived fields.
    ///
    /// The content hash is always recomputed locally so collaborator output
    /// cannot influence circuit-breaker comparisons.
    pub fn finalize(&mut self, task_id: &str, sprint_id: u64) {
        if self.defect_id.is_empty() {
            self.defect_id = format!("{task_id}-s{sprint_id}");
        }
        self.content_hash = self.compute_content_hash();
        if self.vector_key.is_empty() {
            self.vector_key = self.content_hash.clone();
        }
    }

    /// Stable hash over the identifying fields, excluding ids and timing, so
    /// a reworded-but-identical failure compares equal across sprints.
    pub fn compute_content_hash(&self) -> String {
        let normalized = format!(
            "{}\n{}\n{}",
            collapse_whitespace(&self.location),
            collapse_whitespace(&self.defect_type),
            collapse_whitespace(&self.root_cause_synopsis).to_lowercase(),
        );
        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        hex::encode(hasher.finalize())
    }
}

fn collapse_whitespace(text: &str) -> String {
    use std::sync::LazyLock;
    static WS_RE: LazyLock<regex::Regex> =
        LazyLock::new(|| regex::Regex::new(r"\s+").unwrap());
    WS_RE.replace_all(text.trim(), " ").into_owned()
}

/// A historically resolved defect retrieved from the recall store and
/// injected into a remediation baton.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedDefect {
    pub defect_type: String,
    pub location: String,
    pub root_cause_synopsis: String,
    pub resolution_summary: String,
}

/// Input to a builder sprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baton {
    pub task_id: String,
    pub sprint_id: u64,
    pub roadmap_chunk: String,
    /// Bounded distillation of task state; never the full history.
    pub synopsis: String,
    /// Present only on remediation sprints.
    pub defect_capsule: Option<DefectCapsule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prior_resolutions: Vec<ResolvedDefect>,
}

/// One file change inside an [`ArtifactPackage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchEntry {
    pub file: String,
    /// Empty, or a unified-diff-shaped fragment.
    pub diff: String,
}

/// Output of a builder sprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactPackage {
    pub changelog: Vec<String>,
    pub patch_bundle: Vec<PatchEntry>,
    pub next_steps: Vec<String>,
    /// Becomes the next baton's synopsis, subject to the token budget.
    pub builder_summary: String,
}

/// The verifier's qualitative call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Assessment {
    Pass,
    Fail,
}

/// Output of the verifier critique call. A `fail` assessment must carry a
/// defect capsule; the invariant checks reject reports that omit it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifierReport {
    pub assessment: Assessment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defect_capsule: Option<DefectCapsule>,
}

/// Input document for the verifier critique call: the artifact under review
/// together with the objective check findings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CritiqueRequest {
    pub task_id: String,
    pub sprint_id: u64,
    pub roadmap_chunk: String,
    pub artifact_package: ArtifactPackage,
    pub checks_passed: bool,
    pub check_findings: Vec<String>,
}

/// Verdict tag persisted in ledger entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerdictKind {
    Pass,
    Fail,
}

impl VerdictKind {
    pub fn as_str(self) -> &'static str {
        match self {
            VerdictKind::Pass => "pass",
            VerdictKind::Fail => "fail",
        }
    }
}

/// Outcome of one sprint cycle's verification. A FAIL always carries
/// exactly one defect capsule.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Pass,
    Fail(DefectCapsule),
}

impl Verdict {
    pub fn kind(&self) -> VerdictKind {
        match self {
            Verdict::Pass => VerdictKind::Pass,
            Verdict::Fail(_) => VerdictKind::Fail,
        }
    }

    pub fn capsule(&self) -> Option<&DefectCapsule> {
        match self {
            Verdict::Pass => None,
            Verdict::Fail(capsule) => Some(capsule),
        }
    }
}

/// One durable record per sprint cycle. Append-only; never mutated after
/// the ledger acknowledges it.
///
/// `role` records the phase that produced the verdict: `verifier` normally,
/// `builder` when the builder phase failed and the verifier never ran.
/// `commit_ref` is present exactly on PASS entries, which makes every PASS
/// a resumable checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub task_id: String,
    pub sprint_id: u64,
    pub role: Role,
    pub roadmap_chunk: String,
    pub builder_summary: String,
    pub verdict: VerdictKind,
    pub defect_capsule: Option<DefectCapsule>,
    pub commit_ref: Option<String>,
    pub tokens_used: u64,
    pub runtime_seconds: f64,
    pub ended_at: String,
}

impl LedgerEntry {
    pub fn is_checkpoint(&self) -> bool {
        self.commit_ref.is_some()
    }
}

/// Schema violations for a candidate artifact package document. Empty means
/// the document conforms.
pub fn artifact_package_schema_violations(instance: &Value) -> Result<Vec<String>> {
    schema_violations(ARTIFACT_PACKAGE_SCHEMA, instance)
}

/// Schema violations for a candidate verifier report document.
pub fn verifier_report_schema_violations(instance: &Value) -> Result<Vec<String>> {
    schema_violations(VERIFIER_REPORT_SCHEMA, instance)
}

fn schema_violations(schema_json: &str, instance: &Value) -> Result<Vec<String>> {
    let schema: Value =
        serde_json::from_str(schema_json).context("parse embedded schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile embedded schema")?;
    Ok(compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect())
}
