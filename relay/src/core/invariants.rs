//! Semantic checks applied after schema validation.
//!
//! Schemas catch shape problems; these catch content problems a schema
//! cannot express. Violations are collected as human-readable strings and
//! surfaced to the decision path as a `SchemaInvalid` defect, never as a
//! crash.

use crate::handoff::{ArtifactPackage, Assessment, DefectCapsule, VerifierReport};

/// Violations in a builder's artifact package. Empty means valid.
pub fn validate_artifact_package(package: &ArtifactPackage) -> Vec<String> {
    let mut violations = Vec::new();
    if package.builder_summary.trim().is_empty() {
        violations.push("builder_summary: blank".to_string());
    }
    for (index, entry) in package.changelog.iter().enumerate() {
        if entry.trim().is_empty() {
            violations.push(format!("changelog[{index}]: blank entry"));
        }
    }
    for (index, step) in package.next_steps.iter().enumerate() {
        if step.trim().is_empty() {
            violations.push(format!("next_steps[{index}]: blank entry"));
        }
    }
    for (index, patch) in package.patch_bundle.iter().enumerate() {
        if patch.file.trim().is_empty() {
            violations.push(format!("patch_bundle[{index}].file: blank"));
        }
        if !patch.diff.trim().is_empty() && !looks_like_unified_diff(&patch.diff) {
            violations.push(format!(
                "patch_bundle[{index}].diff ({}): not unified-diff-shaped",
                patch.file
            ));
        }
    }
    violations
}

/// Violations in a verifier's report. Empty means valid.
pub fn validate_verifier_report(report: &VerifierReport) -> Vec<String> {
    let mut violations = Vec::new();
    match (report.assessment, &report.defect_capsule) {
        (Assessment::Fail, None) => {
            violations.push("assessment is fail but no defect_capsule was provided".to_string());
        }
        (Assessment::Pass, Some(_)) => {
            violations.push("assessment is pass but a defect_capsule was provided".to_string());
        }
        (Assessment::Fail, Some(capsule)) => {
            violations.extend(validate_defect_capsule(capsule));
        }
        (Assessment::Pass, None) => {}
    }
    violations
}

/// Violations in a collaborator-authored defect capsule. Empty means valid.
pub fn validate_defect_capsule(capsule: &DefectCapsule) -> Vec<String> {
    let mut violations = Vec::new();
    if capsule.location.trim().is_empty() {
        violations.push("defect_capsule.location: blank".to_string());
    }
    if capsule.defect_type.trim().is_empty() {
        violations.push("defect_capsule.defect_type: blank".to_string());
    }
    if capsule.root_cause_synopsis.trim().is_empty() {
        violations.push("defect_capsule.root_cause_synopsis: blank".to_string());
    }
    for (index, step) in capsule.fix_steps.iter().enumerate() {
        if step.trim().is_empty() {
            violations.push(format!("defect_capsule.fix_steps[{index}]: blank entry"));
        }
    }
    violations
}

fn looks_like_unified_diff(diff: &str) -> bool {
    use std::sync::LazyLock;
    static DIFF_RE: LazyLock<regex::Regex> =
        LazyLock::new(|| regex::Regex::new(r"(?m)^(--- |\+\+\+ |@@ )").unwrap());
    DIFF_RE.is_match(diff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handoff::{PatchEntry, Severity};

    fn package() -> ArtifactPackage {
        ArtifactPackage {
            changelog: vec!["added parser".to_string()],
            patch_bundle: vec![],
            next_steps: vec!["wire cli".to_string()],
            builder_summary: "Parser added; cli wiring next.".to_string(),
        }
    }

    #[test]
    fn clean_package_has_no_violations() {
        assert!(validate_artifact_package(&package()).is_empty());
    }

    #[test]
    fn blank_summary_is_flagged() {
        let mut package = package();
        package.builder_summary = "   ".to_string();
        let violations = validate_artifact_package(&package);
        assert_eq!(violations, vec!["builder_summary: blank".to_string()]);
    }

    #[test]
    fn unified_diff_fragments_are_accepted() {
        let mut package = package();
        package.patch_bundle = vec![PatchEntry {
            file: "src/lib.rs".to_string(),
            diff: "--- a/src/lib.rs\n+++ b/src/lib.rs\n@@ -1 +1 @@\n-old\n+new\n"
                .to_string(),
        }];
        assert!(validate_artifact_package(&package).is_empty());

        package.patch_bundle[0].diff = "@@ -3,2 +3,3 @@\n context\n+added\n".to_string();
        assert!(validate_artifact_package(&package).is_empty());
    }

    #[test]
    fn prose_in_a_diff_field_is_flagged() {
        let mut package = package();
        package.patch_bundle = vec![PatchEntry {
            file: "src/lib.rs".to_string(),
            diff: "I rewrote the file to be better".to_string(),
        }];
        let violations = validate_artifact_package(&package);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("not unified-diff-shaped"));
    }

    #[test]
    fn empty_diff_is_allowed() {
        let mut package = package();
        package.patch_bundle = vec![PatchEntry {
            file: "src/lib.rs".to_string(),
            diff: String::new(),
        }];
        assert!(validate_artifact_package(&package).is_empty());
    }

    #[test]
    fn fail_report_without_capsule_is_flagged() {
        let report = VerifierReport {
            assessment: Assessment::Fail,
            defect_capsule: None,
        };
        let violations = validate_verifier_report(&report);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("no defect_capsule"));
    }

    #[test]
    fn pass_report_with_capsule_is_flagged() {
        let report = VerifierReport {
            assessment: Assessment::Pass,
            defect_capsule: Some(DefectCapsule {
                defect_id: String::new(),
                severity: Severity::Minor,
                location: "src/lib.rs:1".to_string(),
                defect_type: "LintError".to_string(),
                root_cause_synopsis: "unused import".to_string(),
                fix_steps: vec![],
                repro_steps: String::new(),
                content_hash: String::new(),
                vector_key: String::new(),
            }),
        };
        assert_eq!(validate_verifier_report(&report).len(), 1);
    }

    #[test]
    fn blank_capsule_fields_are_flagged() {
        let report = VerifierReport {
            assessment: Assessment::Fail,
            defect_capsule: Some(DefectCapsule {
                defect_id: String::new(),
                severity: Severity::Major,
                location: " ".to_string(),
                defect_type: "TestFailure".to_string(),
                root_cause_synopsis: String::new(),
                fix_steps: vec!["".to_string()],
                repro_steps: String::new(),
                content_hash: String::new(),
                vector_key: String::new(),
            }),
        };
        let violations = validate_verifier_report(&report);
        assert_eq!(violations.len(), 3);
    }
}
