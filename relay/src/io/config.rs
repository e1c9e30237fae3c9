//! Engine configuration (`.relay/config.toml`).
//!
//! Every key is optional; a missing file yields the defaults. Durations are
//! seconds.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::decision::DecisionPolicy;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Hard wall-clock deadline for a builder sprint.
    pub builder_max_duration: u64,
    /// Hard wall-clock deadline for the verifier phase (checks + critique).
    pub verifier_max_duration: u64,
    /// Remediation attempts per roadmap item before escalation.
    pub max_retries: u32,
    /// Per-task token ceiling.
    pub token_budget: u64,
    /// Ceiling on synopsis and builder summary size.
    pub synopsis_budget_tokens: usize,
    /// Per-invocation sprint cap; 0 disables the cap.
    pub max_sprints: u64,
    /// Ledger append attempts before the engine faults.
    pub ledger_append_retries: u32,
    /// Resolved defects retrieved per recall query; 0 disables recall.
    pub recall_k: usize,
    pub collaborator_output_limit_bytes: usize,
    pub checks_output_limit_bytes: usize,
    pub builder: CollaboratorConfig,
    pub verifier: CollaboratorConfig,
    pub checks: ChecksConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollaboratorConfig {
    pub command: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChecksConfig {
    pub command: Vec<String>,
}

impl Default for ChecksConfig {
    fn default() -> Self {
        Self {
            command: vec!["just".to_string(), "ci".to_string()],
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            builder_max_duration: 20 * 60,
            verifier_max_duration: 10 * 60,
            max_retries: 2,
            token_budget: 100_000,
            synopsis_budget_tokens: 75,
            max_sprints: 0,
            ledger_append_retries: 3,
            recall_k: 3,
            collaborator_output_limit_bytes: 100_000,
            checks_output_limit_bytes: 100_000,
            builder: CollaboratorConfig {
                command: vec!["relay-builder".to_string()],
            },
            verifier: CollaboratorConfig {
                command: vec!["relay-verifier".to_string()],
            },
            checks: ChecksConfig::default(),
        }
    }
}

impl EngineConfig {
    /// The retry and budget knobs in the form [`decide`] consumes.
    ///
    /// [`decide`]: crate::core::decision::decide
    pub fn decision_policy(&self) -> DecisionPolicy {
        DecisionPolicy {
            max_retries: self.max_retries,
            token_budget: self.token_budget,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.builder_max_duration == 0 {
            return Err(anyhow!("builder_max_duration must be positive"));
        }
        if self.verifier_max_duration == 0 {
            return Err(anyhow!("verifier_max_duration must be positive"));
        }
        if self.token_budget == 0 {
            return Err(anyhow!("token_budget must be positive"));
        }
        if self.synopsis_budget_tokens == 0 {
            return Err(anyhow!("synopsis_budget_tokens must be positive"));
        }
        if self.ledger_append_retries == 0 {
            return Err(anyhow!("ledger_append_retries must be positive"));
        }
        if self.collaborator_output_limit_bytes == 0 {
            return Err(anyhow!("collaborator_output_limit_bytes must be positive"));
        }
        if self.checks_output_limit_bytes == 0 {
            return Err(anyhow!("checks_output_limit_bytes must be positive"));
        }
        if self.builder.command.is_empty() {
            return Err(anyhow!("builder.command must not be empty"));
        }
        if self.verifier.command.is_empty() {
            return Err(anyhow!("verifier.command must not be empty"));
        }
        if self.checks.command.is_empty() {
            return Err(anyhow!("checks.command must not be empty"));
        }
        Ok(())
    }
}

/// Load the config, falling back to defaults when the file is absent.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "config missing, using defaults");
        return Ok(EngineConfig::default());
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    let config: EngineConfig = toml::from_str(&contents)
        .with_context(|| format!("parse config {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("validate config {}", path.display()))?;
    Ok(config)
}

/// Write the config atomically.
pub fn write_config(path: &Path, config: &EngineConfig) -> Result<()> {
    config.validate().context("validate config before write")?;
    let contents = toml::to_string_pretty(config).context("serialize config")?;
    let tmp = path.with_extension("toml.tmp");
    fs::write(&tmp, contents).with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("rename {} into place", tmp.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().expect("defaults validate");
        assert_eq!(config.builder_max_duration, 1_200);
        assert_eq!(config.verifier_max_duration, 600);
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.token_budget, 100_000);
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = TempDir::new().expect("tempdir");
        let config = load_config(&dir.path().join("config.toml")).expect("load");
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn partial_file_keeps_remaining_defaults() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "max_retries = 5\n[checks]\ncommand = [\"cargo\", \"test\"]\n")
            .expect("write");
        let config = load_config(&path).expect("load");
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.checks.command, vec!["cargo", "test"]);
        assert_eq!(config.builder_max_duration, 1_200);
        assert_eq!(config.builder.command, vec!["relay-builder"]);
    }

    #[test]
    fn zero_duration_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "builder_max_duration = 0\n").expect("write");
        let err = load_config(&path).expect_err("zero duration");
        assert!(format!("{err:#}").contains("builder_max_duration"));
    }

    #[test]
    fn write_then_load_round_trips() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("config.toml");
        let mut config = EngineConfig::default();
        config.max_sprints = 7;
        config.builder.command = vec!["my-builder".to_string(), "--fast".to_string()];
        write_config(&path, &config).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, config);
    }
}
