//! Wall-clock deadline bookkeeping for sprint phases.

use std::time::{Duration, Instant};

use anyhow::{Result, bail};

/// Time left until `deadline`, or an error once it has elapsed.
///
/// Verifier phases call this between the check harness and the critique so
/// a slow harness shrinks the critique's slice of the same deadline.
pub fn remaining_budget(deadline: Instant) -> Result<Duration> {
    let now = Instant::now();
    if now >= deadline {
        bail!("sprint deadline elapsed");
    }
    Ok(deadline - now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn future_deadline_has_budget_left() {
        let deadline = Instant::now() + Duration::from_secs(60);
        let remaining = remaining_budget(deadline).expect("budget");
        assert!(remaining <= Duration::from_secs(60));
        assert!(remaining > Duration::from_secs(50));
    }

    #[test]
    fn elapsed_deadline_errors() {
        let deadline = Instant::now() - Duration::from_millis(1);
        assert!(remaining_budget(deadline).is_err());
    }
}
