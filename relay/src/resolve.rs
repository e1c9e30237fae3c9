//! Operator resolution intake for `relay resolve`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{SecondsFormat, Utc};
use tracing::info;

use crate::core::decision::TaskStatus;
use crate::core::invariants::validate_defect_capsule;
use crate::handoff::DefectCapsule;
use crate::io::config::EngineConfig;
use crate::io::paths::require_engine_dir;
use crate::io::task_store::{Resolution, write_resolution};
use crate::status::task_status;

/// Record an operator resolution for an escalated task.
///
/// The next `relay run` applies it: the synopsis seeds the re-entry baton
/// and the optional capsule replaces the open defect. Submitting against a
/// running or complete task is rejected.
pub fn submit_resolution(
    root: &Path,
    task_id: &str,
    config: &EngineConfig,
    synopsis: &str,
    defect_file: Option<&Path>,
) -> Result<()> {
    if synopsis.trim().is_empty() {
        return Err(anyhow!("resolution synopsis must not be blank"));
    }

    let view = task_status(root, task_id, config)?;
    if view.state.status != TaskStatus::Escalated {
        return Err(anyhow!(
            "task '{task_id}' is {}; only escalated tasks take resolutions",
            view.state.status.as_str()
        ));
    }

    let defect_capsule = match defect_file {
        Some(path) => Some(load_capsule(path, task_id, view.state.current_sprint_id + 1)?),
        None => None,
    };

    let paths = require_engine_dir(root)?;
    let resolution = Resolution {
        synopsis: synopsis.to_string(),
        defect_capsule,
        submitted_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    };
    write_resolution(&paths.resolution_path(task_id), &resolution)?;

    info!(task_id, "resolution recorded");
    Ok(())
}

/// Parse, validate, and finalize an operator-authored capsule. The sprint
/// id is the re-entry sprint, which is fixed while the task is escalated.
fn load_capsule(path: &Path, task_id: &str, sprint_id: u64) -> Result<DefectCapsule> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read defect capsule {}", path.display()))?;
    let mut capsule: DefectCapsule = serde_json::from_str(&raw)
        .with_context(|| format!("parse defect capsule {}", path.display()))?;
    let violations = validate_defect_capsule(&capsule);
    if !violations.is_empty() {
        bail!(
            "defect capsule {} is invalid:\n- {}",
            path.display(),
            violations.join("\n- ")
        );
    }
    capsule.finalize(task_id, sprint_id);
    Ok(capsule)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handoff::{LedgerEntry, Role, Severity, VerdictKind};
    use crate::io::ledger::append_entry;
    use crate::io::paths::EnginePaths;
    use crate::io::task_store::load_resolution;
    use crate::test_support::TestRepo;

    fn fail_entry(sprint_id: u64, hash: &str) -> LedgerEntry {
        LedgerEntry {
            task_id: "demo".to_string(),
            sprint_id,
            role: Role::Verifier,
            roadmap_chunk: "parse".to_string(),
            builder_summary: "attempted".to_string(),
            verdict: VerdictKind::Fail,
            defect_capsule: Some(DefectCapsule {
                defect_id: format!("demo-s{sprint_id}"),
                severity: Severity::Major,
                location: "src/parse.rs:10".to_string(),
                defect_type: "TestFailure".to_string(),
                root_cause_synopsis: "golden case mismatch".to_string(),
                fix_steps: vec![],
                repro_steps: String::new(),
                content_hash: hash.to_string(),
                vector_key: hash.to_string(),
            }),
            commit_ref: None,
            tokens_used: 10,
            runtime_seconds: 1.0,
            ended_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    fn escalate(repo: &TestRepo) {
        repo.start_task("demo", &["parse"]).expect("start");
        let ledger = EnginePaths::new(repo.root()).ledger_path("demo");
        append_entry(&ledger, &fail_entry(1, "h1"), 3).expect("append");
        append_entry(&ledger, &fail_entry(2, "h1"), 3).expect("append");
    }

    /// Verifies a resolution for an escalated task lands on disk with a
    /// finalized capsule.
    #[test]
    fn resolution_is_written_and_capsule_finalized() {
        let repo = TestRepo::new().expect("repo");
        escalate(&repo);

        let capsule_path = repo.root().join("capsule.json");
        fs::write(
            &capsule_path,
            serde_json::json!({
                "severity": "critical",
                "location": "src/parse.rs:10",
                "defect_type": "LogicDrift",
                "root_cause_synopsis": "requirement misread, rewrite the branch",
                "fix_steps": ["invert the guard"],
                "repro_steps": "cargo test golden",
            })
            .to_string(),
        )
        .expect("write capsule");

        submit_resolution(
            repo.root(),
            "demo",
            &EngineConfig::default(),
            "Guard was inverted; invert it back and re-run the golden tests.",
            Some(&capsule_path),
        )
        .expect("resolve");

        let resolution =
            load_resolution(&EnginePaths::new(repo.root()).resolution_path("demo"))
                .expect("load")
                .expect("present");
        assert_eq!(
            resolution.synopsis,
            "Guard was inverted; invert it back and re-run the golden tests."
        );
        let capsule = resolution.defect_capsule.expect("capsule");
        assert_eq!(capsule.defect_id, "demo-s3");
        assert!(!capsule.content_hash.is_empty());
        assert_eq!(capsule.vector_key, capsule.content_hash);
    }

    /// Verifies only escalated tasks take resolutions.
    #[test]
    fn running_task_rejects_resolutions() {
        let repo = TestRepo::new().expect("repo");
        repo.start_task("demo", &["parse"]).expect("start");

        let err = submit_resolution(
            repo.root(),
            "demo",
            &EngineConfig::default(),
            "premature",
            None,
        )
        .expect_err("should reject");
        assert!(err.to_string().contains("is running"));
    }

    /// Verifies a blank synopsis is rejected before any state is read.
    #[test]
    fn blank_synopsis_is_rejected() {
        let repo = TestRepo::new().expect("repo");
        escalate(&repo);

        let err =
            submit_resolution(repo.root(), "demo", &EngineConfig::default(), "   ", None)
                .expect_err("blank");
        assert!(err.to_string().contains("must not be blank"));
    }

    /// Verifies an invalid capsule file is rejected with its violations.
    #[test]
    fn invalid_capsule_is_rejected() {
        let repo = TestRepo::new().expect("repo");
        escalate(&repo);

        let capsule_path = repo.root().join("capsule.json");
        fs::write(
            &capsule_path,
            serde_json::json!({
                "severity": "major",
                "location": "  ",
                "defect_type": "TestFailure",
                "root_cause_synopsis": "",
                "fix_steps": [],
                "repro_steps": "",
            })
            .to_string(),
        )
        .expect("write capsule");

        let err = submit_resolution(
            repo.root(),
            "demo",
            &EngineConfig::default(),
            "use the attached capsule",
            Some(&capsule_path),
        )
        .expect_err("invalid capsule");
        assert!(err.to_string().contains("location: blank"));
    }
}
