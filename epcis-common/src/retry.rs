use std::cmp;
use std::time::Duration;

use rand::Rng;

/// Exponential backoff policy for subscription deliveries.
///
/// Interval for attempt `n` is `initial * coefficient^n`, jittered by
/// ±`jitter_ratio`, clamped to `maximum_interval`. A delivery target's
/// Retry-After preference wins over the computed interval when larger.
#[derive(Copy, Clone, Debug)]
pub struct RetryPolicy {
    backoff_coefficient: u32,
    initial_interval: Duration,
    maximum_interval: Duration,
    jitter_ratio: f64,
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(
        backoff_coefficient: u32,
        initial_interval: Duration,
        maximum_interval: Duration,
        jitter_ratio: f64,
        max_attempts: u32,
    ) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval,
            jitter_ratio,
            max_attempts,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether another attempt may be scheduled after `attempt` failures.
    pub fn can_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Time until the next retry after `attempt` failed attempts.
    pub fn retry_interval(
        &self,
        attempt: u32,
        preferred_retry_interval: Option<Duration>,
    ) -> Duration {
        let exponent = attempt.min(20);
        let candidate = self
            .initial_interval
            .saturating_mul(self.backoff_coefficient.saturating_pow(exponent));
        let candidate = cmp::min(candidate, self.maximum_interval);
        let jittered = self.jitter(candidate);

        match preferred_retry_interval {
            Some(preferred) => cmp::min(cmp::max(jittered, preferred), self.maximum_interval),
            None => jittered,
        }
    }

    fn jitter(&self, interval: Duration) -> Duration {
        if self.jitter_ratio <= 0.0 {
            return interval;
        }
        let spread = interval.as_secs_f64() * self.jitter_ratio;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((interval.as_secs_f64() + offset).max(0.0))
    }
}

impl Default for RetryPolicy {
    /// Base 1s, factor 2, jitter ±25%, capped at 5 minutes, 10 attempts.
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: Duration::from_secs(1),
            maximum_interval: Duration::from_secs(300),
            jitter_ratio: 0.25,
            max_attempts: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy::new(2, Duration::from_secs(1), Duration::from_secs(300), 0.0, 10)
    }

    #[test]
    fn interval_doubles_per_attempt() {
        let policy = no_jitter();
        assert_eq!(policy.retry_interval(0, None), Duration::from_secs(1));
        assert_eq!(policy.retry_interval(1, None), Duration::from_secs(2));
        assert_eq!(policy.retry_interval(5, None), Duration::from_secs(32));
    }

    #[test]
    fn interval_is_capped_at_maximum() {
        let policy = no_jitter();
        assert_eq!(policy.retry_interval(12, None), Duration::from_secs(300));
    }

    #[test]
    fn preferred_interval_wins_when_larger() {
        let policy = no_jitter();
        let preferred = Some(Duration::from_secs(120));
        assert_eq!(policy.retry_interval(0, preferred), Duration::from_secs(120));
        // But never beyond the maximum.
        let preferred = Some(Duration::from_secs(900));
        assert_eq!(policy.retry_interval(0, preferred), Duration::from_secs(300));
    }

    #[test]
    fn jitter_stays_within_ratio() {
        let policy =
            RetryPolicy::new(2, Duration::from_secs(4), Duration::from_secs(300), 0.25, 10);
        for _ in 0..100 {
            let interval = policy.retry_interval(0, None).as_secs_f64();
            assert!((3.0..=5.0).contains(&interval), "interval {interval}");
        }
    }

    #[test]
    fn attempts_are_bounded() {
        let policy = no_jitter();
        assert!(policy.can_retry(9));
        assert!(!policy.can_retry(10));
    }
}
