//! Reconnection control: exponential backoff with jitter and a bounded
//! retry budget.
//!
//! Pure state -- no timers, no sockets. The transport manager asks
//! [`ReconnectController::on_failure`] what to do and sleeps the
//! returned delay itself, so every transition here is testable by
//! direct invocation.

use std::time::Duration;

/// Backoff configuration for one source. Immutable per source instance.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry. Default: 1s.
    pub base_delay: Duration,

    /// Upper bound on the un-jittered delay. Default: 30s.
    pub max_delay: Duration,

    /// Consecutive failures tolerated before giving up.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            max_retries: 5,
        }
    }
}

impl RetryPolicy {
    /// Un-jittered delay for the given zero-based attempt:
    /// `min(max_delay, base_delay * 2^attempt)`.
    pub fn raw_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt));
        exp.min(self.max_delay)
    }

    /// Full delay: raw delay plus jitter in `[0, base_delay]`.
    ///
    /// The jitter cap is the *base* delay, not the computed delay, so
    /// late retries do not become more erratic than early ones. The
    /// jitter fraction is derived deterministically from the attempt
    /// number -- not cryptographically random, but enough spread to
    /// break up reconnection storms, and it keeps the bound testable.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.raw_delay(attempt) + self.base_delay.mul_f64(jitter_fraction(attempt))
    }
}

/// Deterministic jitter fraction in `[0, 1]`.
fn jitter_fraction(attempt: u32) -> f64 {
    0.5 * (1.0 + (f64::from(attempt) * 7.3).sin())
}

/// What the transport manager should do after a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule the next attempt after this delay.
    RetryAfter(Duration),
    /// Retry budget exhausted -- enter the terminal error state.
    GiveUp,
}

/// Per-source retry bookkeeping.
///
/// Owns the consecutive-failure count; resets on every successful
/// open and on manual reconnect.
#[derive(Debug)]
pub struct ReconnectController {
    policy: RetryPolicy,
    failures: u32,
}

impl ReconnectController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, failures: 0 }
    }

    /// Record a successful open. The next disconnect cycle starts
    /// from a zero failure count.
    pub fn on_connected(&mut self) {
        self.failures = 0;
    }

    /// Record a failure and decide whether to schedule another attempt.
    pub fn on_failure(&mut self) -> RetryDecision {
        self.failures += 1;
        if self.failures > self.policy.max_retries {
            RetryDecision::GiveUp
        } else {
            RetryDecision::RetryAfter(self.policy.delay(self.failures - 1))
        }
    }

    /// Manual reset (user-initiated reconnect).
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Consecutive failures in the current disconnect cycle.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base_ms: u64, max_ms: u64, retries: u32) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
            max_retries: retries,
        }
    }

    #[test]
    fn raw_delay_doubles_per_attempt() {
        let p = policy(1000, 30_000, 5);
        assert_eq!(p.raw_delay(0), Duration::from_millis(1000));
        assert_eq!(p.raw_delay(1), Duration::from_millis(2000));
        assert_eq!(p.raw_delay(2), Duration::from_millis(4000));
        assert_eq!(p.raw_delay(3), Duration::from_millis(8000));
    }

    #[test]
    fn raw_delay_caps_at_max() {
        let p = policy(1000, 10_000, 20);
        assert_eq!(p.raw_delay(4), Duration::from_millis(10_000));
        assert_eq!(p.raw_delay(10), Duration::from_millis(10_000));
        // No overflow even for absurd attempt counts.
        assert_eq!(p.raw_delay(40), Duration::from_millis(10_000));
    }

    #[test]
    fn jitter_is_bounded_by_base_delay() {
        let p = policy(1000, 30_000, 5);
        for attempt in 0..32 {
            let raw = p.raw_delay(attempt);
            let full = p.delay(attempt);
            assert!(full >= raw, "attempt {attempt}: jitter pushed delay below raw");
            assert!(
                full <= raw + p.base_delay,
                "attempt {attempt}: jitter exceeded base-delay bound ({full:?} > {:?})",
                raw + p.base_delay
            );
        }
    }

    #[test]
    fn controller_resets_on_connect() {
        let mut ctrl = ReconnectController::new(policy(100, 1000, 3));
        let _ = ctrl.on_failure();
        let _ = ctrl.on_failure();
        assert_eq!(ctrl.failures(), 2);

        ctrl.on_connected();
        assert_eq!(ctrl.failures(), 0);
    }

    #[test]
    fn controller_gives_up_after_budget() {
        let mut ctrl = ReconnectController::new(policy(1000, 30_000, 2));

        match ctrl.on_failure() {
            RetryDecision::RetryAfter(d) => {
                assert!(d >= Duration::from_millis(1000));
                assert!(d <= Duration::from_millis(2000));
            }
            RetryDecision::GiveUp => panic!("budget not yet exhausted"),
        }
        match ctrl.on_failure() {
            RetryDecision::RetryAfter(d) => {
                assert!(d >= Duration::from_millis(2000));
                assert!(d <= Duration::from_millis(3000));
            }
            RetryDecision::GiveUp => panic!("budget not yet exhausted"),
        }

        assert_eq!(ctrl.on_failure(), RetryDecision::GiveUp);
    }

    #[test]
    fn manual_reset_restores_budget() {
        let mut ctrl = ReconnectController::new(policy(100, 1000, 1));
        let _ = ctrl.on_failure();
        assert_eq!(ctrl.on_failure(), RetryDecision::GiveUp);

        ctrl.reset();
        assert!(matches!(ctrl.on_failure(), RetryDecision::RetryAfter(_)));
    }
}
