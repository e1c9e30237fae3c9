//! Filesystem layout for the `.relay/` engine directory.
//!
//! ```text
//! .relay/
//!   config.toml        committed engine configuration
//!   .gitignore         keeps transient state out of checkpoints
//!   recall.jsonl       resolution recall store
//!   tasks/<id>/
//!     task.json        manifest (roadmap)
//!     ledger.jsonl     append-only sprint ledger
//!     resolution.json  pending operator resolution, if any
//!     sprints/<n>/     per-sprint artifacts and logs
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::debug;

use crate::io::config::{EngineConfig, write_config};

/// Ledger, sprint logs, and the recall store are local working state; only
/// `config.toml` is meant for checkpoint commits.
const RELAY_GITIGNORE: &str = "recall.jsonl\ntasks/\n";

#[derive(Debug, Clone)]
pub struct EnginePaths {
    pub root: PathBuf,
    pub relay_dir: PathBuf,
    pub config_path: PathBuf,
    pub gitignore_path: PathBuf,
    pub recall_path: PathBuf,
    pub tasks_dir: PathBuf,
}

impl EnginePaths {
    pub fn new(root: &Path) -> Self {
        let relay_dir = root.join(".relay");
        Self {
            root: root.to_path_buf(),
            config_path: relay_dir.join("config.toml"),
            gitignore_path: relay_dir.join(".gitignore"),
            recall_path: relay_dir.join("recall.jsonl"),
            tasks_dir: relay_dir.join("tasks"),
            relay_dir,
        }
    }

    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        self.tasks_dir.join(task_id)
    }

    pub fn task_manifest(&self, task_id: &str) -> PathBuf {
        self.task_dir(task_id).join("task.json")
    }

    pub fn ledger_path(&self, task_id: &str) -> PathBuf {
        self.task_dir(task_id).join("ledger.jsonl")
    }

    pub fn resolution_path(&self, task_id: &str) -> PathBuf {
        self.task_dir(task_id).join("resolution.json")
    }
}

/// Create `.relay/` with its gitignore and a default config. Existing files
/// are left alone, so re-running start never clobbers local settings.
pub fn scaffold_engine_dir(root: &Path) -> Result<EnginePaths> {
    let paths = EnginePaths::new(root);
    fs::create_dir_all(&paths.tasks_dir)
        .with_context(|| format!("create {}", paths.tasks_dir.display()))?;
    if !paths.gitignore_path.exists() {
        fs::write(&paths.gitignore_path, RELAY_GITIGNORE)
            .with_context(|| format!("write {}", paths.gitignore_path.display()))?;
    }
    if !paths.config_path.exists() {
        write_config(&paths.config_path, &EngineConfig::default())?;
        debug!(path = %paths.config_path.display(), "default config written");
    }
    Ok(paths)
}

/// Paths for commands that need an initialized engine directory.
pub fn require_engine_dir(root: &Path) -> Result<EnginePaths> {
    let paths = EnginePaths::new(root);
    if !paths.relay_dir.exists() {
        bail!(
            "missing {} (run `relay start` first)",
            paths.relay_dir.display()
        );
    }
    Ok(paths)
}
