//! Retry, circuit-breaker, and escalation policy.
//!
//! [`decide`] is a pure function of the verdict and the task state as it
//! stood before the verdict; the coordination loop applies the verdict to
//! the state afterwards. Keeping the two steps separate means the ledger
//! fold can replay decisions byte-for-byte on resume.

use serde::{Deserialize, Serialize};

use crate::handoff::VerdictKind;

/// Tunable knobs consulted by [`decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionPolicy {
    /// Remediation attempts per roadmap item before escalation.
    pub max_retries: u32,
    /// Per-task token ceiling; exceeding it escalates regardless of verdict.
    pub token_budget: u64,
}

/// Why a task was handed to a human.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    /// Two consecutive failures with identical content hashes.
    RepeatedDefect,
    /// The remediation attempt cap was reached.
    RetryLimit,
    /// The task token budget was exhausted.
    BudgetExceeded,
}

impl std::fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            EscalationReason::RepeatedDefect => "repeated_defect",
            EscalationReason::RetryLimit => "retry_limit",
            EscalationReason::BudgetExceeded => "budget_exceeded",
        })
    }
}

/// Next action after a sprint cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Checkpoint the item and move to the next roadmap position.
    Advance,
    /// Hand the defect back for another builder sprint.
    Retry,
    /// Pause the task for human attention.
    Escalate(EscalationReason),
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Advance => f.write_str("advance"),
            Decision::Retry => f.write_str("retry"),
            Decision::Escalate(reason) => write!(f, "escalate: {reason}"),
        }
    }
}

/// Lifecycle of a task as derived from its ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Running,
    Escalated,
    Complete,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Running => "running",
            TaskStatus::Escalated => "escalated",
            TaskStatus::Complete => "complete",
        }
    }
}

/// In-memory task state, reconstructable from the ledger at any time.
///
/// Owned exclusively by one coordination loop instance; never shared
/// across tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskState {
    pub task_id: String,
    pub current_sprint_id: u64,
    pub roadmap_position: usize,
    /// Consecutive failures since the latest checkpoint.
    pub remediation_count: u32,
    pub last_defect_hash: Option<String>,
    pub tokens_spent: u64,
    pub status: TaskStatus,
    pub escalation_reason: Option<EscalationReason>,
}

/// Map a sprint verdict onto the next action.
///
/// `remediation_count` and `last_defect_hash` describe the state before
/// this verdict; `tokens_spent` includes the sprint being decided, so the
/// budget check sees the spend that produced the verdict. `defect_hash` is
/// the content hash of this sprint's capsule when the verdict is a fail.
pub fn decide(
    verdict: VerdictKind,
    defect_hash: Option<&str>,
    remediation_count: u32,
    last_defect_hash: Option<&str>,
    tokens_spent: u64,
    policy: &DecisionPolicy,
) -> Decision {
    if tokens_spent > policy.token_budget {
        return Decision::Escalate(EscalationReason::BudgetExceeded);
    }
    match verdict {
        VerdictKind::Pass => Decision::Advance,
        VerdictKind::Fail => {
            if let (Some(hash), Some(prev)) = (defect_hash, last_defect_hash) {
                if hash == prev {
                    return Decision::Escalate(EscalationReason::RepeatedDefect);
                }
            }
            if remediation_count >= policy.max_retries {
                return Decision::Escalate(EscalationReason::RetryLimit);
            }
            Decision::Retry
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLICY: DecisionPolicy = DecisionPolicy {
        max_retries: 2,
        token_budget: 1_000,
    };

    #[test]
    fn pass_advances() {
        let decision = decide(VerdictKind::Pass, None, 1, Some("h1"), 10, &POLICY);
        assert_eq!(decision, Decision::Advance);
    }

    #[test]
    fn first_failure_retries() {
        let decision = decide(VerdictKind::Fail, Some("h1"), 0, None, 10, &POLICY);
        assert_eq!(decision, Decision::Retry);
    }

    #[test]
    fn repeated_hash_escalates_before_the_retry_cap() {
        let decision = decide(VerdictKind::Fail, Some("h1"), 1, Some("h1"), 10, &POLICY);
        assert_eq!(
            decision,
            Decision::Escalate(EscalationReason::RepeatedDefect)
        );
    }

    #[test]
    fn distinct_hash_retries_until_the_cap() {
        let decision = decide(VerdictKind::Fail, Some("h2"), 1, Some("h1"), 10, &POLICY);
        assert_eq!(decision, Decision::Retry);

        let decision = decide(VerdictKind::Fail, Some("h3"), 2, Some("h2"), 10, &POLICY);
        assert_eq!(decision, Decision::Escalate(EscalationReason::RetryLimit));
    }

    #[test]
    fn budget_overrides_even_a_pass() {
        let decision = decide(VerdictKind::Pass, None, 0, None, 1_001, &POLICY);
        assert_eq!(
            decision,
            Decision::Escalate(EscalationReason::BudgetExceeded)
        );
    }

    #[test]
    fn budget_at_the_ceiling_is_still_allowed() {
        let decision = decide(VerdictKind::Pass, None, 0, None, 1_000, &POLICY);
        assert_eq!(decision, Decision::Advance);
    }
}
