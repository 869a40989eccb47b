//! Time budget for the deadline-bounded Build stage.
//!
//! The budget is whatever is left of the job ceiling, but never less than the
//! floor: a stage started very late in the window still gets a usable timeout,
//! even if that overruns the real external deadline.

use std::time::Duration;

/// Default hard ceiling for one job window (270 minutes).
pub const DEFAULT_CEILING: Duration = Duration::from_secs(270 * 60);

/// Default minimum budget handed to a bounded stage (10 minutes).
pub const DEFAULT_FLOOR: Duration = Duration::from_secs(10 * 60);

/// Job window limits used by [`remaining_secs`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetLimits {
    pub ceiling: Duration,
    pub floor: Duration,
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self {
            ceiling: DEFAULT_CEILING,
            floor: DEFAULT_FLOOR,
        }
    }
}

impl BudgetLimits {
    pub fn new(ceiling: Duration, floor: Duration) -> Self {
        Self { ceiling, floor }
    }

    /// Remaining budget in whole seconds for the given elapsed time.
    pub fn remaining_secs(&self, elapsed: Duration) -> u64 {
        remaining_secs(elapsed, self.ceiling, self.floor)
    }

    /// Remaining budget as a `Duration` (whole seconds).
    pub fn remaining(&self, elapsed: Duration) -> Duration {
        Duration::from_secs(self.remaining_secs(elapsed))
    }
}

/// `max(ceiling - elapsed, floor)` in whole seconds, floor-rounded.
///
/// The result is additionally capped at `ceiling`, so a floor configured above
/// the ceiling cannot produce a budget larger than the whole window.
pub fn remaining_secs(elapsed: Duration, ceiling: Duration, floor: Duration) -> u64 {
    let left = ceiling.saturating_sub(elapsed).as_secs();
    left.max(floor.as_secs()).min(ceiling.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: u64 = 60;

    #[test]
    fn fresh_job_gets_full_ceiling() {
        assert_eq!(
            remaining_secs(Duration::ZERO, DEFAULT_CEILING, DEFAULT_FLOOR),
            270 * MIN
        );
    }

    #[test]
    fn subtracts_elapsed_time() {
        let elapsed = Duration::from_secs(30 * MIN);
        assert_eq!(
            remaining_secs(elapsed, DEFAULT_CEILING, DEFAULT_FLOOR),
            240 * MIN
        );
    }

    #[test]
    fn rounds_fractional_seconds_down() {
        let elapsed = Duration::from_millis(1_500);
        assert_eq!(
            remaining_secs(elapsed, Duration::from_secs(100), Duration::from_secs(10)),
            98
        );
    }

    #[test]
    fn late_start_is_clamped_to_floor() {
        let elapsed = Duration::from_secs(265 * MIN);
        assert_eq!(
            remaining_secs(elapsed, DEFAULT_CEILING, DEFAULT_FLOOR),
            10 * MIN
        );
    }

    #[test]
    fn elapsed_past_ceiling_still_gets_floor() {
        let elapsed = Duration::from_secs(1_000 * MIN);
        assert_eq!(
            remaining_secs(elapsed, DEFAULT_CEILING, DEFAULT_FLOOR),
            10 * MIN
        );
    }

    #[test]
    fn floor_above_ceiling_is_capped() {
        let got = remaining_secs(
            Duration::ZERO,
            Duration::from_secs(60),
            Duration::from_secs(120),
        );
        assert_eq!(got, 60);
    }

    #[test]
    fn bounded_and_non_increasing_over_the_window() {
        let limits = BudgetLimits::default();
        let mut previous = u64::MAX;
        for step in 0..=400 {
            let elapsed = Duration::from_secs(step * 47);
            let got = limits.remaining_secs(elapsed);
            assert!(got >= limits.floor.as_secs(), "below floor at {step}");
            assert!(got <= limits.ceiling.as_secs(), "above ceiling at {step}");
            assert!(got <= previous, "increased at {step}");
            previous = got;
        }
    }

    #[test]
    fn remaining_duration_matches_seconds() {
        let limits = BudgetLimits::new(Duration::from_secs(600), Duration::from_secs(60));
        assert_eq!(
            limits.remaining(Duration::from_secs(100)),
            Duration::from_secs(500)
        );
    }
}
