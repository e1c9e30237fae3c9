//! Per-sprint artifact logging under `.relay/tasks/<id>/sprints/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::handoff::{
    ARTIFACT_PACKAGE_SCHEMA, Baton, PhaseOutcome, VERIFIER_REPORT_SCHEMA, VerdictKind,
};

/// Summary record written at the end of every sprint cycle.
#[derive(Debug, Clone, Serialize)]
pub struct SprintMeta {
    pub task_id: String,
    pub sprint_id: u64,
    pub builder_outcome: PhaseOutcome,
    pub verifier_outcome: Option<PhaseOutcome>,
    pub verdict: VerdictKind,
    pub checkpoint: bool,
    pub tokens_used: u64,
    pub runtime_seconds: f64,
    pub ended_at: String,
}

#[derive(Debug, Clone)]
pub struct SprintPaths {
    pub dir: PathBuf,
    pub baton_path: PathBuf,
    pub package_path: PathBuf,
    pub report_path: PathBuf,
    pub critique_input_path: PathBuf,
    pub builder_log_path: PathBuf,
    pub verifier_log_path: PathBuf,
    pub checks_log_path: PathBuf,
    pub engine_error_log_path: PathBuf,
    pub meta_path: PathBuf,
    pub artifact_schema_path: PathBuf,
    pub report_schema_path: PathBuf,
}

impl SprintPaths {
    pub fn new(task_dir: &Path, sprint_id: u64) -> Self {
        let dir = task_dir.join("sprints").join(sprint_id.to_string());
        Self {
            dir: dir.clone(),
            baton_path: dir.join("baton.json"),
            package_path: dir.join("artifact_package.json"),
            report_path: dir.join("verifier_report.json"),
            critique_input_path: dir.join("critique_request.json"),
            builder_log_path: dir.join("builder.log"),
            verifier_log_path: dir.join("verifier.log"),
            checks_log_path: dir.join("checks.log"),
            engine_error_log_path: dir.join("engine_error.log"),
            meta_path: dir.join("sprint.json"),
            artifact_schema_path: dir.join("artifact_package.schema.json"),
            report_schema_path: dir.join("verifier_report.schema.json"),
        }
    }
}

/// Create the sprint directory and write the baton plus the output schemas
/// collaborators validate against.
pub fn prepare_sprint_dir(paths: &SprintPaths, baton: &Baton) -> Result<()> {
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create sprint dir {}", paths.dir.display()))?;
    write_json(&paths.baton_path, baton)?;
    write_text(&paths.artifact_schema_path, ARTIFACT_PACKAGE_SCHEMA)?;
    write_text(&paths.report_schema_path, VERIFIER_REPORT_SCHEMA)?;
    Ok(())
}

pub fn write_sprint_meta(paths: &SprintPaths, meta: &SprintMeta) -> Result<()> {
    write_json(&paths.meta_path, meta)
}

/// Record an engine-side failure under the sprint directory. These never
/// reach collaborators; they surface to the operator instead.
pub fn write_engine_error_log(paths: &SprintPaths, err: &anyhow::Error) -> Result<()> {
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create sprint dir {}", paths.dir.display()))?;
    write_text(
        &paths.engine_error_log_path,
        &format!("engine error: {err:#}\n"),
    )
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_text(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sprint_paths_are_stable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = SprintPaths::new(temp.path(), 3);

        assert!(paths.dir.ends_with(Path::new("sprints/3")));
        assert!(paths.baton_path.ends_with("baton.json"));
        assert!(paths.package_path.ends_with("artifact_package.json"));
        assert!(paths.report_path.ends_with("verifier_report.json"));
        assert!(paths.meta_path.ends_with("sprint.json"));
        assert!(paths.engine_error_log_path.ends_with("engine_error.log"));
    }

    #[test]
    fn prepare_writes_baton_and_schemas() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = SprintPaths::new(temp.path(), 1);
        let baton = Baton {
            task_id: "demo".to_string(),
            sprint_id: 1,
            roadmap_chunk: "build the parser".to_string(),
            synopsis: "Fresh start.".to_string(),
            defect_capsule: None,
            prior_resolutions: Vec::new(),
        };

        prepare_sprint_dir(&paths, &baton).expect("prepare");

        let written = fs::read_to_string(&paths.baton_path).expect("read baton");
        assert!(written.contains("build the parser"));
        assert!(written.ends_with('\n'));
        assert!(paths.artifact_schema_path.is_file());
        assert!(paths.report_schema_path.is_file());
    }

    #[test]
    fn engine_errors_are_recorded_under_the_sprint_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = SprintPaths::new(temp.path(), 2);

        write_engine_error_log(&paths, &anyhow::anyhow!("ledger unavailable"))
            .expect("write error log");

        let log = fs::read_to_string(&paths.engine_error_log_path).expect("read log");
        assert!(log.contains("ledger unavailable"));
    }
}
