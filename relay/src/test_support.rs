//! Test-only helpers: scripted collaborators, a scratch git repo, and
//! canned handoff documents.
//!
//! Compiled into unit tests directly and exported to integration tests
//! through the `test-support` feature.

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::io::checks::{CheckHarness, CheckReport, CheckRequest};
use crate::io::collaborator::{Collaborator, InvokeOutcome, InvokeRequest};
use crate::start::{StartOutcome, start_task};

/// Initialize a git repository at `root` with one commit so HEAD exists.
pub fn init_git_repo(root: &Path) {
    let run = |args: &[&str]| {
        let status = Command::new("git")
            .args(args)
            .current_dir(root)
            .status()
            .expect("run git");
        assert!(status.success(), "git {args:?} failed");
    };
    run(&["init", "--quiet"]);
    run(&["config", "user.email", "relay-tests@example.com"]);
    run(&["config", "user.name", "relay tests"]);
    fs::write(root.join("README.md"), "# scratch\n").expect("write README");
    run(&["add", "-A"]);
    run(&["commit", "--quiet", "-m", "chore: init"]);
}

/// Scratch git repository, deleted on drop.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = TempDir::new().context("create tempdir")?;
        init_git_repo(dir.path());
        Ok(Self { dir })
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Register a task with the given roadmap items.
    pub fn start_task(&self, task_id: &str, roadmap: &[&str]) -> Result<StartOutcome> {
        let roadmap: Vec<String> = roadmap.iter().map(|s| (*s).to_string()).collect();
        start_task(self.root(), task_id, &roadmap)
    }
}

/// Collaborator that replays a queue of (outcome, output document) pairs.
///
/// When an entry carries a document, it is written to the request's
/// `output_path` before the outcome is returned, just as a real
/// collaborator process would leave it behind.
pub struct ScriptedCollaborator {
    script: Mutex<VecDeque<(InvokeOutcome, Option<String>)>>,
}

impl ScriptedCollaborator {
    pub fn new(script: Vec<(InvokeOutcome, Option<String>)>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
        }
    }

    /// Single invocation that completes and writes `output`.
    pub fn completing(output: &str) -> Self {
        Self::new(vec![(InvokeOutcome::Completed, Some(output.to_string()))])
    }

    /// Entries not yet consumed.
    pub fn remaining(&self) -> usize {
        self.script.lock().expect("script mutex").len()
    }
}

impl Collaborator for ScriptedCollaborator {
    fn invoke(&self, request: &InvokeRequest) -> Result<InvokeOutcome> {
        let mut script = self
            .script
            .lock()
            .map_err(|_| anyhow!("script mutex poisoned"))?;
        let (outcome, output) = script.pop_front().ok_or_else(|| {
            anyhow!("collaborator script exhausted ({})", request.role.as_str())
        })?;
        if let Some(output) = output {
            if let Some(parent) = request.output_path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create {}", parent.display()))?;
            }
            fs::write(&request.output_path, output)
                .with_context(|| format!("write {}", request.output_path.display()))?;
        }
        Ok(outcome)
    }
}

/// Check harness that replays a queue of reports.
pub struct ScriptedHarness {
    script: Mutex<VecDeque<CheckReport>>,
}

impl ScriptedHarness {
    pub fn new(script: Vec<CheckReport>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
        }
    }

    /// `n` consecutive passing reports.
    pub fn passing(n: usize) -> Self {
        Self::new(vec![CheckReport::passing(); n])
    }

    /// Entries not yet consumed.
    pub fn remaining(&self) -> usize {
        self.script.lock().expect("script mutex").len()
    }
}

impl CheckHarness for ScriptedHarness {
    fn run(&self, _request: &CheckRequest) -> Result<CheckReport> {
        let mut script = self
            .script
            .lock()
            .map_err(|_| anyhow!("script mutex poisoned"))?;
        script
            .pop_front()
            .ok_or_else(|| anyhow!("check script exhausted"))
    }
}

/// Minimal artifact package document that passes schema and invariants.
pub fn artifact_package_json(summary: &str) -> String {
    serde_json::json!({
        "changelog": ["did the work"],
        "patch_bundle": [],
        "next_steps": [],
        "builder_summary": summary,
    })
    .to_string()
}

/// Verifier report with a pass assessment and no capsule.
pub fn pass_report_json() -> String {
    serde_json::json!({ "assessment": "pass" }).to_string()
}

/// Verifier report with a fail assessment and a populated capsule.
pub fn fail_report_json(location: &str, defect_type: &str, synopsis: &str) -> String {
    serde_json::json!({
        "assessment": "fail",
        "defect_capsule": {
            "severity": "major",
            "location": location,
            "defect_type": defect_type,
            "root_cause_synopsis": synopsis,
            "fix_steps": ["apply the fix"],
            "repro_steps": "rerun the failing check",
        },
    })
    .to_string()
}
