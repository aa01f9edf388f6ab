//! Retry policies with exponential backoff and jitter.
//!
//! Delays produced by [`Backoff`] grow exponentially, carry an upward jitter
//! to spread out reconnecting clients, never decrease from one attempt to the
//! next, and never exceed the configured cap.

use std::time::Duration;

use rand::Rng;

/// Shape of the delay curve between attempts.
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Multiplier applied after each attempt.
    pub multiplier: f64,
    /// Fraction of the nominal delay added as random jitter (0.0 - 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Policy without jitter, mostly useful in tests.
    #[must_use]
    pub const fn fixed_curve(
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
    ) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier,
            jitter: 0.0,
        }
    }

    /// Start a fresh delay sequence.
    #[must_use]
    pub fn start(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            nominal: self.initial_delay.min(self.max_delay),
            last: Duration::ZERO,
        }
    }
}

/// Request retry policy.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Always at least 1.
    pub max_attempts: u32,
    /// Delay curve between attempts.
    pub backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl RetryPolicy {
    /// Policy with a given attempt budget and default backoff.
    #[must_use]
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts.max(1),
            ..Default::default()
        }
    }

    /// Policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self::with_max_attempts(1)
    }
}

/// How many consecutive reconnect attempts the live channel may make.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconnectLimit {
    /// Keep reconnecting until closed.
    Unbounded,
    /// Give up after this many consecutive failed attempts.
    MaxAttempts(u32),
}

impl ReconnectLimit {
    /// Whether `attempts` consecutive failures exhaust the limit.
    #[must_use]
    pub const fn is_exhausted(self, attempts: u32) -> bool {
        match self {
            Self::Unbounded => false,
            Self::MaxAttempts(max) => attempts >= max,
        }
    }
}

/// Stateful delay sequence for one retry loop.
#[derive(Clone, Debug)]
pub struct Backoff {
    policy: BackoffPolicy,
    nominal: Duration,
    last: Duration,
}

impl Backoff {
    /// Next delay: exponential, jittered upward, non-decreasing, capped.
    pub fn next_delay(&mut self) -> Duration {
        let nominal = self.nominal.as_secs_f64();
        let jitter = self.policy.jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            1.0 + rand::thread_rng().gen_range(0.0..jitter)
        } else {
            1.0
        };

        let cap = self.policy.max_delay.as_secs_f64();
        let jittered = Duration::from_secs_f64((nominal * factor).min(cap));
        let delay = jittered.max(self.last).min(self.policy.max_delay);

        self.last = delay;
        self.nominal = Duration::from_secs_f64(
            (nominal * self.policy.multiplier.max(1.0)).min(cap),
        );
        delay
    }

    /// Forget previous delays, e.g. after a successful reconnect.
    pub fn reset(&mut self) {
        self.nominal = self.policy.initial_delay.min(self.policy.max_delay);
        self.last = Duration::ZERO;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_grow_until_cap() {
        let policy = BackoffPolicy::fixed_curve(
            Duration::from_millis(100),
            Duration::from_millis(500),
            2.0,
        );
        let mut backoff = policy.start();
        let delays: Vec<_> = (0..5).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
    }

    #[test]
    fn test_jittered_delays_are_non_decreasing_and_capped() {
        let policy = BackoffPolicy {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(300),
            multiplier: 1.5,
            jitter: 1.0,
        };
        for _ in 0..50 {
            let mut backoff = policy.start();
            let mut previous = Duration::ZERO;
            for _ in 0..20 {
                let delay = backoff.next_delay();
                assert!(delay >= previous, "{delay:?} < {previous:?}");
                assert!(delay <= policy.max_delay);
                previous = delay;
            }
        }
    }

    #[test]
    fn test_reset_restarts_curve() {
        let policy = BackoffPolicy::fixed_curve(
            Duration::from_millis(50),
            Duration::from_secs(1),
            3.0,
        );
        let mut backoff = policy.start();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(50));
    }

    #[test]
    fn test_max_attempts_never_zero() {
        assert_eq!(RetryPolicy::with_max_attempts(0).max_attempts, 1);
        assert_eq!(RetryPolicy::no_retry().max_attempts, 1);
    }

    #[test]
    fn test_reconnect_limit() {
        assert!(!ReconnectLimit::Unbounded.is_exhausted(u32::MAX));
        assert!(!ReconnectLimit::MaxAttempts(3).is_exhausted(2));
        assert!(ReconnectLimit::MaxAttempts(3).is_exhausted(3));
    }
}
