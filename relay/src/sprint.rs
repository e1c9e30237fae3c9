//! Orchestration for a single sprint cycle.
//!
//! A cycle hands the baton to the builder, verifies the result (objective
//! checks first, then the critique call), and folds both into one verdict.
//! Engine-side failures return `Err`; everything a collaborator can get
//! wrong becomes a FAIL verdict with a synthesized defect capsule so the
//! decision engine can route it like any other defect.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use tracing::{info, instrument, warn};

use crate::core::deadline::remaining_budget;
use crate::core::synopsis::{clamp_to_budget, count_tokens};
use crate::handoff::{
    ArtifactPackage, Assessment, Baton, CritiqueRequest, DefectCapsule, PhaseOutcome, Role,
    Severity, Verdict, VerifierReport,
};
use crate::io::checks::{CheckHarness, CheckReport, CheckRequest};
use crate::io::collaborator::{
    Collaborator, InvokeOutcome, InvokeRequest, Loaded, load_artifact_package,
    load_verifier_report,
};
use crate::io::config::EngineConfig;
use crate::io::sprint_log::{
    SprintMeta, SprintPaths, prepare_sprint_dir, write_json, write_sprint_meta,
};

/// Defect types the engine synthesizes itself.
pub const DEFECT_TIMEOUT: &str = "Timeout";
pub const DEFECT_VERIFIER_TIMEOUT: &str = "VerifierTimeout";
pub const DEFECT_COLLABORATOR_ERROR: &str = "CollaboratorError";
pub const DEFECT_SCHEMA_INVALID: &str = "SchemaInvalid";
pub const DEFECT_TEST_FAILURE: &str = "TestFailure";

/// Everything a sprint needs besides the collaborators themselves.
pub struct SprintContext<'a> {
    pub workdir: &'a Path,
    pub paths: &'a SprintPaths,
    pub config: &'a EngineConfig,
}

/// Outcome of one full sprint cycle.
#[derive(Debug, Clone)]
pub struct SprintResult {
    pub sprint_id: u64,
    /// Phase that produced the verdict: builder when the builder aborted,
    /// verifier otherwise.
    pub role: Role,
    pub builder_outcome: PhaseOutcome,
    pub verifier_outcome: Option<PhaseOutcome>,
    pub verdict: Verdict,
    /// Summary carried to the next baton, already clamped to budget.
    pub builder_summary: String,
    pub summary_truncated: bool,
    pub tokens_used: u64,
    pub runtime_seconds: f64,
}

enum BuilderPhase {
    Produced(ArtifactPackage),
    Aborted {
        outcome: PhaseOutcome,
        capsule: DefectCapsule,
    },
}

enum VerifierPhase {
    Critiqued {
        report: VerifierReport,
        checks: CheckReport,
    },
    Aborted {
        outcome: PhaseOutcome,
        capsule: DefectCapsule,
    },
}

/// Execute one sprint cycle for an already-prepared baton.
///
/// The caller owns sprint id allocation and the ledger append; this
/// function owns everything between baton and verdict.
#[instrument(skip_all, fields(task_id = %baton.task_id, sprint_id = baton.sprint_id))]
pub fn run_sprint<B, V, H>(
    ctx: &SprintContext<'_>,
    baton: &Baton,
    builder: &B,
    verifier: &V,
    harness: &H,
) -> Result<SprintResult>
where
    B: Collaborator,
    V: Collaborator,
    H: CheckHarness,
{
    let start = Instant::now();
    info!(roadmap_chunk = %baton.roadmap_chunk, "starting sprint");
    prepare_sprint_dir(ctx.paths, baton)?;

    let builder_phase = run_builder_phase(ctx, baton, builder)?;

    let (role, builder_outcome, verifier_outcome, verdict, summary_source, package_tokens) =
        match builder_phase {
            BuilderPhase::Aborted { outcome, capsule } => {
                // The builder produced nothing; the prior synopsis rides
                // along so the remediation sprint still has its context.
                (
                    Role::Builder,
                    outcome,
                    None,
                    Verdict::Fail(capsule),
                    baton.synopsis.clone(),
                    0,
                )
            }
            BuilderPhase::Produced(package) => {
                let package_tokens =
                    count_tokens(&serde_json::to_string(&package).context("serialize package")?)?;
                match run_verifier_phase(ctx, baton, &package, verifier, harness)? {
                    VerifierPhase::Critiqued { report, checks } => {
                        let verdict = combine_verdict(report, &checks);
                        (
                            Role::Verifier,
                            PhaseOutcome::Completed,
                            Some(PhaseOutcome::Completed),
                            verdict,
                            package.builder_summary,
                            package_tokens,
                        )
                    }
                    VerifierPhase::Aborted { outcome, capsule } => (
                        Role::Verifier,
                        PhaseOutcome::Completed,
                        Some(outcome),
                        Verdict::Fail(capsule),
                        package.builder_summary,
                        package_tokens,
                    ),
                }
            }
        };

    let verdict = finalize_verdict(verdict, baton, ctx.config)?;

    let clamped = clamp_to_budget(&summary_source, ctx.config.synopsis_budget_tokens)?;
    if clamped.truncated {
        warn!(
            tokens = clamped.tokens,
            budget = ctx.config.synopsis_budget_tokens,
            "builder summary over budget, truncated"
        );
    }

    let baton_tokens =
        count_tokens(&serde_json::to_string(baton).context("serialize baton")?)?;
    let tokens_used = (baton_tokens + package_tokens) as u64;

    let result = SprintResult {
        sprint_id: baton.sprint_id,
        role,
        builder_outcome,
        verifier_outcome,
        verdict,
        builder_summary: clamped.text,
        summary_truncated: clamped.truncated,
        tokens_used,
        runtime_seconds: start.elapsed().as_secs_f64(),
    };

    write_sprint_meta(
        ctx.paths,
        &SprintMeta {
            task_id: baton.task_id.clone(),
            sprint_id: baton.sprint_id,
            builder_outcome: result.builder_outcome,
            verifier_outcome: result.verifier_outcome,
            verdict: result.verdict.kind(),
            checkpoint: matches!(result.verdict, Verdict::Pass),
            tokens_used: result.tokens_used,
            runtime_seconds: result.runtime_seconds,
            ended_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        },
    )?;

    info!(
        role = result.role.as_str(),
        verdict = result.verdict.kind().as_str(),
        tokens_used = result.tokens_used,
        "sprint finished"
    );
    Ok(result)
}

fn run_builder_phase<B: Collaborator>(
    ctx: &SprintContext<'_>,
    baton: &Baton,
    builder: &B,
) -> Result<BuilderPhase> {
    let timeout = Duration::from_secs(ctx.config.builder_max_duration);
    let request = InvokeRequest {
        role: Role::Builder,
        workdir: ctx.workdir.to_path_buf(),
        input: serde_json::to_vec_pretty(baton).context("serialize baton")?,
        output_schema_path: ctx.paths.artifact_schema_path.clone(),
        output_path: ctx.paths.package_path.clone(),
        log_path: ctx.paths.builder_log_path.clone(),
        timeout,
        output_limit_bytes: ctx.config.collaborator_output_limit_bytes,
    };

    let phase = match builder.invoke(&request)? {
        InvokeOutcome::TimedOut => BuilderPhase::Aborted {
            outcome: PhaseOutcome::TimedOut,
            capsule: synthesized_capsule(
                Severity::Critical,
                "builder",
                DEFECT_TIMEOUT,
                format!("Builder exceeded its {}s budget.", timeout.as_secs()),
            ),
        },
        InvokeOutcome::Failed { detail } => BuilderPhase::Aborted {
            outcome: PhaseOutcome::Failed,
            capsule: synthesized_capsule(
                Severity::Critical,
                "builder",
                DEFECT_COLLABORATOR_ERROR,
                format!("Builder invocation failed: {detail}"),
            ),
        },
        InvokeOutcome::Completed => match load_artifact_package(&request.output_path)? {
            Loaded::Valid(package) => BuilderPhase::Produced(package),
            Loaded::Invalid(violations) => BuilderPhase::Aborted {
                outcome: PhaseOutcome::Completed,
                capsule: synthesized_capsule(
                    Severity::Major,
                    "builder",
                    DEFECT_SCHEMA_INVALID,
                    format!("Artifact package rejected: {}", violations.join("; ")),
                ),
            },
        },
    };
    Ok(phase)
}

fn run_verifier_phase<V: Collaborator, H: CheckHarness>(
    ctx: &SprintContext<'_>,
    baton: &Baton,
    package: &ArtifactPackage,
    verifier: &V,
    harness: &H,
) -> Result<VerifierPhase> {
    // Checks and critique share one verifier budget; a slow harness
    // shrinks the critique's slice.
    let budget = Duration::from_secs(ctx.config.verifier_max_duration);
    let deadline = Instant::now() + budget;

    let checks = harness.run(&CheckRequest {
        workdir: ctx.workdir.to_path_buf(),
        log_path: ctx.paths.checks_log_path.clone(),
        timeout: budget,
        output_limit_bytes: ctx.config.checks_output_limit_bytes,
    })?;
    if checks.timed_out {
        return Ok(VerifierPhase::Aborted {
            outcome: PhaseOutcome::TimedOut,
            capsule: synthesized_capsule(
                Severity::Critical,
                "checks",
                DEFECT_VERIFIER_TIMEOUT,
                format!("Checks did not finish within the {}s verifier budget.", budget.as_secs()),
            ),
        });
    }

    let Ok(critique_timeout) = remaining_budget(deadline) else {
        return Ok(VerifierPhase::Aborted {
            outcome: PhaseOutcome::TimedOut,
            capsule: synthesized_capsule(
                Severity::Critical,
                "verifier",
                DEFECT_VERIFIER_TIMEOUT,
                format!("Checks consumed the whole {}s verifier budget.", budget.as_secs()),
            ),
        });
    };

    let critique = CritiqueRequest {
        task_id: baton.task_id.clone(),
        sprint_id: baton.sprint_id,
        roadmap_chunk: baton.roadmap_chunk.clone(),
        artifact_package: package.clone(),
        checks_passed: checks.passed,
        check_findings: checks.findings.clone(),
    };
    write_json(&ctx.paths.critique_input_path, &critique)?;

    let request = InvokeRequest {
        role: Role::Verifier,
        workdir: ctx.workdir.to_path_buf(),
        input: serde_json::to_vec_pretty(&critique).context("serialize critique request")?,
        output_schema_path: ctx.paths.report_schema_path.clone(),
        output_path: ctx.paths.report_path.clone(),
        log_path: ctx.paths.verifier_log_path.clone(),
        timeout: critique_timeout,
        output_limit_bytes: ctx.config.collaborator_output_limit_bytes,
    };

    let phase = match verifier.invoke(&request)? {
        InvokeOutcome::TimedOut => VerifierPhase::Aborted {
            outcome: PhaseOutcome::TimedOut,
            capsule: synthesized_capsule(
                Severity::Critical,
                "verifier",
                DEFECT_VERIFIER_TIMEOUT,
                format!("Verifier critique exceeded its {}s slice.", critique_timeout.as_secs()),
            ),
        },
        InvokeOutcome::Failed { detail } => VerifierPhase::Aborted {
            outcome: PhaseOutcome::Failed,
            capsule: synthesized_capsule(
                Severity::Critical,
                "verifier",
                DEFECT_COLLABORATOR_ERROR,
                format!("Verifier invocation failed: {detail}"),
            ),
        },
        InvokeOutcome::Completed => match load_verifier_report(&request.output_path)? {
            Loaded::Valid(report) => VerifierPhase::Critiqued { report, checks },
            Loaded::Invalid(violations) => VerifierPhase::Aborted {
                outcome: PhaseOutcome::Completed,
                capsule: synthesized_capsule(
                    Severity::Major,
                    "verifier",
                    DEFECT_SCHEMA_INVALID,
                    format!("Verifier report rejected: {}", violations.join("; ")),
                ),
            },
        },
    };
    Ok(phase)
}

/// Fold the critique and the objective check result into one verdict.
/// Failing checks veto a pass assessment.
fn combine_verdict(report: VerifierReport, checks: &CheckReport) -> Verdict {
    match (report.assessment, checks.passed) {
        (Assessment::Pass, true) => Verdict::Pass,
        (Assessment::Pass, false) => Verdict::Fail(synthesized_capsule(
            Severity::Major,
            "checks",
            DEFECT_TEST_FAILURE,
            format!("Checks failed: {}", checks.findings.join("; ")),
        )),
        (Assessment::Fail, _) => match report.defect_capsule {
            Some(capsule) => Verdict::Fail(capsule),
            // The invariant layer rejects fail-without-capsule before it
            // gets here, but never trust that from a distance.
            None => Verdict::Fail(synthesized_capsule(
                Severity::Major,
                "verifier",
                DEFECT_SCHEMA_INVALID,
                "Fail assessment arrived without a defect capsule.".to_string(),
            )),
        },
    }
}

/// Clamp the capsule synopsis and fill the engine-derived fields. The hash
/// is computed after clamping so replays compare like with like.
fn finalize_verdict(verdict: Verdict, baton: &Baton, config: &EngineConfig) -> Result<Verdict> {
    match verdict {
        Verdict::Pass => Ok(Verdict::Pass),
        Verdict::Fail(mut capsule) => {
            let clamped =
                clamp_to_budget(&capsule.root_cause_synopsis, config.synopsis_budget_tokens)?;
            if clamped.truncated {
                warn!(
                    tokens = clamped.tokens,
                    "capsule synopsis over budget, truncated"
                );
                capsule.root_cause_synopsis = clamped.text;
            }
            capsule.finalize(&baton.task_id, baton.sprint_id);
            Ok(Verdict::Fail(capsule))
        }
    }
}

fn synthesized_capsule(
    severity: Severity,
    location: &str,
    defect_type: &str,
    synopsis: String,
) -> DefectCapsule {
    DefectCapsule {
        defect_id: String::new(),
        severity,
        location: location.to_string(),
        defect_type: defect_type.to_string(),
        root_cause_synopsis: synopsis,
        fix_steps: Vec::new(),
        repro_steps: String::new(),
        content_hash: String::new(),
        vector_key: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handoff::VerdictKind;
    use crate::test_support::{
        ScriptedCollaborator, ScriptedHarness, artifact_package_json, fail_report_json,
        pass_report_json,
    };

    fn baton(dir: &Path) -> (Baton, SprintPaths) {
        let paths = SprintPaths::new(dir, 1);
        let baton = Baton {
            task_id: "demo".to_string(),
            sprint_id: 1,
            roadmap_chunk: "build the parser".to_string(),
            synopsis: "Fresh start.".to_string(),
            defect_capsule: None,
            prior_resolutions: Vec::new(),
        };
        (baton, paths)
    }

    fn config() -> EngineConfig {
        EngineConfig {
            builder_max_duration: 5,
            verifier_max_duration: 5,
            ..EngineConfig::default()
        }
    }

    /// Verifies the clean path: valid package, passing checks, pass report.
    #[test]
    fn clean_sprint_passes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (baton, paths) = baton(temp.path());
        let config = config();
        let ctx = SprintContext {
            workdir: temp.path(),
            paths: &paths,
            config: &config,
        };

        let builder =
            ScriptedCollaborator::completing(&artifact_package_json("Parser built."));
        let verifier = ScriptedCollaborator::completing(&pass_report_json());
        let harness = ScriptedHarness::passing(1);

        let result = run_sprint(&ctx, &baton, &builder, &verifier, &harness).expect("sprint");

        assert_eq!(result.verdict, Verdict::Pass);
        assert_eq!(result.role, Role::Verifier);
        assert_eq!(result.builder_outcome, PhaseOutcome::Completed);
        assert_eq!(result.verifier_outcome, Some(PhaseOutcome::Completed));
        assert_eq!(result.builder_summary, "Parser built.");
        assert!(!result.summary_truncated);
        assert!(result.tokens_used > 0);
        assert!(paths.baton_path.is_file());
        assert!(paths.critique_input_path.is_file());
        assert!(paths.meta_path.is_file());
    }

    /// Verifies failing checks veto a pass assessment.
    #[test]
    fn failing_checks_synthesize_a_test_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (baton, paths) = baton(temp.path());
        let config = config();
        let ctx = SprintContext {
            workdir: temp.path(),
            paths: &paths,
            config: &config,
        };

        let builder = ScriptedCollaborator::completing(&artifact_package_json("Built."));
        let verifier = ScriptedCollaborator::completing(&pass_report_json());
        let harness = ScriptedHarness::new(vec![CheckReport {
            passed: false,
            timed_out: false,
            findings: vec!["assertion failed: parse_empty".to_string()],
        }]);

        let result = run_sprint(&ctx, &baton, &builder, &verifier, &harness).expect("sprint");

        let capsule = result.verdict.capsule().expect("capsule");
        assert_eq!(capsule.defect_type, DEFECT_TEST_FAILURE);
        assert_eq!(capsule.location, "checks");
        assert!(capsule.root_cause_synopsis.contains("parse_empty"));
        assert_eq!(capsule.defect_id, "demo-s1");
        assert!(!capsule.content_hash.is_empty());
    }

    /// Verifies a builder timeout becomes a Timeout capsule without
    /// invoking the verifier.
    #[test]
    fn builder_timeout_aborts_the_cycle() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (baton, paths) = baton(temp.path());
        let config = config();
        let ctx = SprintContext {
            workdir: temp.path(),
            paths: &paths,
            config: &config,
        };

        let builder = ScriptedCollaborator::new(vec![(InvokeOutcome::TimedOut, None)]);
        let verifier = ScriptedCollaborator::new(Vec::new());
        let harness = ScriptedHarness::passing(0);

        let result = run_sprint(&ctx, &baton, &builder, &verifier, &harness).expect("sprint");

        assert_eq!(result.role, Role::Builder);
        assert_eq!(result.builder_outcome, PhaseOutcome::TimedOut);
        assert_eq!(result.verifier_outcome, None);
        let capsule = result.verdict.capsule().expect("capsule");
        assert_eq!(capsule.defect_type, DEFECT_TIMEOUT);
        assert_eq!(capsule.location, "builder");
        // The prior synopsis rides along as the summary.
        assert_eq!(result.builder_summary, "Fresh start.");
        assert_eq!(verifier.remaining(), 0);
    }

    /// Verifies malformed builder output becomes a SchemaInvalid capsule.
    #[test]
    fn invalid_package_fails_schema_validation() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (baton, paths) = baton(temp.path());
        let config = config();
        let ctx = SprintContext {
            workdir: temp.path(),
            paths: &paths,
            config: &config,
        };

        let builder = ScriptedCollaborator::completing("{\"changelog\": []}");
        let verifier = ScriptedCollaborator::new(Vec::new());
        let harness = ScriptedHarness::passing(0);

        let result = run_sprint(&ctx, &baton, &builder, &verifier, &harness).expect("sprint");

        let capsule = result.verdict.capsule().expect("capsule");
        assert_eq!(capsule.defect_type, DEFECT_SCHEMA_INVALID);
        assert_eq!(result.builder_outcome, PhaseOutcome::Completed);
    }

    /// Verifies a verifier invocation failure becomes a CollaboratorError.
    #[test]
    fn verifier_failure_is_a_collaborator_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (baton, paths) = baton(temp.path());
        let config = config();
        let ctx = SprintContext {
            workdir: temp.path(),
            paths: &paths,
            config: &config,
        };

        let builder = ScriptedCollaborator::completing(&artifact_package_json("Built."));
        let verifier = ScriptedCollaborator::new(vec![(
            InvokeOutcome::Failed {
                detail: "exit code 3".to_string(),
            },
            None,
        )]);
        let harness = ScriptedHarness::passing(1);

        let result = run_sprint(&ctx, &baton, &builder, &verifier, &harness).expect("sprint");

        assert_eq!(result.verifier_outcome, Some(PhaseOutcome::Failed));
        let capsule = result.verdict.capsule().expect("capsule");
        assert_eq!(capsule.defect_type, DEFECT_COLLABORATOR_ERROR);
        assert_eq!(capsule.location, "verifier");
        assert!(capsule.root_cause_synopsis.contains("exit code 3"));
    }

    /// Verifies a check-harness timeout is a VerifierTimeout and the
    /// critique never runs.
    #[test]
    fn check_timeout_is_a_verifier_timeout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (baton, paths) = baton(temp.path());
        let config = config();
        let ctx = SprintContext {
            workdir: temp.path(),
            paths: &paths,
            config: &config,
        };

        let builder = ScriptedCollaborator::completing(&artifact_package_json("Built."));
        let verifier = ScriptedCollaborator::new(Vec::new());
        let harness = ScriptedHarness::new(vec![CheckReport {
            passed: false,
            timed_out: true,
            findings: vec!["checks timed out after 5s".to_string()],
        }]);

        let result = run_sprint(&ctx, &baton, &builder, &verifier, &harness).expect("sprint");

        let capsule = result.verdict.capsule().expect("capsule");
        assert_eq!(capsule.defect_type, DEFECT_VERIFIER_TIMEOUT);
        assert_eq!(capsule.location, "checks");
        assert_eq!(result.verifier_outcome, Some(PhaseOutcome::TimedOut));
        assert_eq!(verifier.remaining(), 0);
    }

    /// Verifies a fail report's capsule gets the engine-derived fields.
    #[test]
    fn fail_report_capsule_is_finalized() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (baton, paths) = baton(temp.path());
        let config = config();
        let ctx = SprintContext {
            workdir: temp.path(),
            paths: &paths,
            config: &config,
        };

        let builder = ScriptedCollaborator::completing(&artifact_package_json("Built."));
        let verifier = ScriptedCollaborator::completing(&fail_report_json(
            "src/parser.rs:42",
            "LogicError",
            "EOF branch returns the wrong token",
        ));
        let harness = ScriptedHarness::passing(1);

        let result = run_sprint(&ctx, &baton, &builder, &verifier, &harness).expect("sprint");

        assert_eq!(result.verdict.kind(), VerdictKind::Fail);
        let capsule = result.verdict.capsule().expect("capsule");
        assert_eq!(capsule.defect_id, "demo-s1");
        assert_eq!(capsule.content_hash, capsule.compute_content_hash());
        assert_eq!(capsule.vector_key, capsule.content_hash);
    }

    /// Verifies long builder summaries are truncated to the token budget.
    #[test]
    fn over_budget_summary_is_truncated() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (baton, paths) = baton(temp.path());
        let config = EngineConfig {
            synopsis_budget_tokens: 5,
            ..config()
        };
        let ctx = SprintContext {
            workdir: temp.path(),
            paths: &paths,
            config: &config,
        };

        let long_summary = "carefully rebuilt the tokenizer ".repeat(30);
        let builder = ScriptedCollaborator::completing(&artifact_package_json(&long_summary));
        let verifier = ScriptedCollaborator::completing(&pass_report_json());
        let harness = ScriptedHarness::passing(1);

        let result = run_sprint(&ctx, &baton, &builder, &verifier, &harness).expect("sprint");

        assert!(result.summary_truncated);
        assert!(result.builder_summary.len() < long_summary.len());
    }
}
