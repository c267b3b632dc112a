//! Delay schedule for readiness retries.

use rand::{rng, Rng};
use tokio::time::Duration;

/// Upper bound on a single readiness retry delay, regardless of doubling.
const MAX_STEP: Duration = Duration::from_secs(5);

/// Doubling delay sequence with a random spread, starting at the policy's
/// readiness step.
///
/// The spread keeps simultaneous readiness waits (e.g. several pools being
/// created for the same node) from hammering the server in lockstep.
#[derive(Debug)]
pub(crate) struct RetrySchedule {
    delay: Duration,
}

impl RetrySchedule {
    pub(crate) fn new(step: Duration) -> Self {
        Self {
            delay: step.min(MAX_STEP),
        }
    }

    /// Returns the next delay to sleep, then doubles the base (capped).
    pub(crate) fn next_delay(&mut self) -> Duration {
        let base = self.delay;
        self.delay = std::cmp::min(base.saturating_mul(2), MAX_STEP);
        add_spread(base, base / 4)
    }
}

fn add_spread(base: Duration, spread: Duration) -> Duration {
    if spread.is_zero() {
        return base;
    }
    let mut rng = rng();
    let spread = rng.random_range(0..spread.as_nanos());
    base.saturating_add(Duration::from_nanos(
        spread.try_into().expect("spread below 584 years"),
    ))
}
