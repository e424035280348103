// ── Failure streak, backoff, and circuit bookkeeping ──
//
// One tracker per protocol. Failures grow an exponential backoff delay
// and, past the configured threshold, open the circuit. Deadlines only
// ever merge forward via `max` so concurrent failures can never shorten
// an existing delay. A single success clears everything.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::SafetyConfig;

/// Compute the backoff delay for a given consecutive-failure streak.
///
/// `min(max, base * max(1, factor)^(streak-1))`, or zero when backoff
/// is disabled or the streak is empty.
pub fn compute_backoff(base: Duration, max: Duration, factor: f64, streak: u32) -> Duration {
    if base.is_zero() || max.is_zero() || streak == 0 {
        return Duration::ZERO;
    }
    let exponent = i32::try_from(streak - 1).unwrap_or(i32::MAX);
    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    let scaled = base.as_millis() as f64 * factor.max(1.0).powi(exponent);
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::as_conversions
    )]
    let millis = scaled.round().min(u64::MAX as f64) as u64;
    Duration::from_millis(millis).min(max)
}

/// Per-protocol failure counters. Process-scoped, never persisted.
#[derive(Debug, Default)]
pub(crate) struct FailureTracker {
    streak: u32,
    backoff_until: Option<Instant>,
    circuit_until: Option<Instant>,
}

impl FailureTracker {
    /// Deadline the next request must wait for, if any backoff is
    /// currently active.
    pub(crate) fn backoff_until(&self) -> Option<Instant> {
        self.backoff_until
    }

    /// Whether the circuit is open at `now`.
    pub(crate) fn circuit_open(&self, now: Instant) -> bool {
        self.circuit_until.is_some_and(|until| now < until)
    }

    /// Record a critical failure: grow the streak, extend backoff, and
    /// open the circuit once the threshold is crossed. Returns the new
    /// circuit deadline when the breaker is (still) open.
    pub(crate) fn record_critical_failure(
        &mut self,
        config: &SafetyConfig,
        now: Instant,
    ) -> Option<Instant> {
        self.streak = self.streak.saturating_add(1);

        let delay = compute_backoff(
            config.backoff_base,
            config.backoff_max,
            config.backoff_factor,
            self.streak,
        );
        if !delay.is_zero() {
            let candidate = now + delay;
            self.backoff_until = Some(self.backoff_until.map_or(candidate, |existing| {
                existing.max(candidate)
            }));
        }

        if config.circuit_breaker_threshold > 0 && self.streak >= config.circuit_breaker_threshold {
            let candidate = now + config.circuit_breaker_cooldown;
            self.circuit_until = Some(self.circuit_until.map_or(candidate, |existing| {
                existing.max(candidate)
            }));
        }
        self.circuit_until
    }

    /// A single success fully clears streak, backoff, and circuit.
    pub(crate) fn record_success(&mut self) {
        self.streak = 0;
        self.backoff_until = None;
        self.circuit_until = None;
    }

    /// Manual/reload reset -- identical clearing, kept separate for
    /// call-site clarity.
    pub(crate) fn reset(&mut self) {
        self.record_success();
    }

    /// Current consecutive-failure streak.
    pub(crate) fn streak(&self) -> u32 {
        self.streak
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn millis(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let base = millis(100);
        let max = millis(1000);
        assert_eq!(compute_backoff(base, max, 2.0, 1), millis(100));
        assert_eq!(compute_backoff(base, max, 2.0, 2), millis(200));
        assert_eq!(compute_backoff(base, max, 2.0, 3), millis(400));
        assert_eq!(compute_backoff(base, max, 2.0, 4), millis(800));
        // streak 5: min(1000, 100 * 2^4) = 1000
        assert_eq!(compute_backoff(base, max, 2.0, 5), millis(1000));
        assert_eq!(compute_backoff(base, max, 2.0, 12), millis(1000));
    }

    #[test]
    fn backoff_disabled_cases() {
        assert_eq!(compute_backoff(Duration::ZERO, millis(1000), 2.0, 3), Duration::ZERO);
        assert_eq!(compute_backoff(millis(100), Duration::ZERO, 2.0, 3), Duration::ZERO);
        assert_eq!(compute_backoff(millis(100), millis(1000), 2.0, 0), Duration::ZERO);
    }

    #[test]
    fn factor_floors_at_one() {
        // factor 0.5 would shrink delays; it must behave as 1.0.
        assert_eq!(compute_backoff(millis(100), millis(1000), 0.5, 4), millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn deadlines_only_merge_forward() {
        let config = SafetyConfig {
            backoff_base: millis(100),
            backoff_max: millis(10_000),
            backoff_factor: 2.0,
            circuit_breaker_threshold: 2,
            circuit_breaker_cooldown: millis(5000),
            ..SafetyConfig::default()
        };

        let mut tracker = FailureTracker::default();
        let now = Instant::now();

        assert!(tracker.record_critical_failure(&config, now).is_none());
        assert_eq!(tracker.backoff_until().unwrap(), now + millis(100));

        // Second failure at the same instant extends, never shortens.
        let circuit = tracker.record_critical_failure(&config, now);
        assert_eq!(tracker.backoff_until().unwrap(), now + millis(200));
        assert_eq!(circuit.unwrap(), now + millis(5000));

        // A stale failure with an earlier deadline cannot pull the
        // circuit closer.
        let circuit = tracker.record_critical_failure(&config, now - millis(4000));
        assert_eq!(circuit.unwrap(), now + millis(5000));
    }

    #[tokio::test(start_paused = true)]
    async fn success_clears_everything() {
        let config = SafetyConfig {
            circuit_breaker_threshold: 1,
            ..SafetyConfig::default()
        };

        let mut tracker = FailureTracker::default();
        tracker.record_critical_failure(&config, Instant::now());
        assert_eq!(tracker.streak(), 1);
        assert!(tracker.circuit_open(Instant::now()));

        tracker.record_success();
        assert_eq!(tracker.streak(), 0);
        assert!(tracker.backoff_until().is_none());
        assert!(!tracker.circuit_open(Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn circuit_opens_only_at_threshold() {
        let config = SafetyConfig {
            circuit_breaker_threshold: 3,
            ..SafetyConfig::default()
        };

        let mut tracker = FailureTracker::default();
        let now = Instant::now();
        tracker.record_critical_failure(&config, now);
        tracker.record_critical_failure(&config, now);
        assert!(!tracker.circuit_open(now));
        tracker.record_critical_failure(&config, now);
        assert!(tracker.circuit_open(now));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_threshold_disables_breaker() {
        let config = SafetyConfig {
            circuit_breaker_threshold: 0,
            ..SafetyConfig::default()
        };

        let mut tracker = FailureTracker::default();
        for _ in 0..10 {
            tracker.record_critical_failure(&config, Instant::now());
        }
        assert!(!tracker.circuit_open(Instant::now()));
    }
}
