//! Per-model circuit breaker

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Externally visible breaker position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Calls flow normally
    Closed,
    /// Tripped; the model is excluded until the cooldown elapses
    Open,
    /// Cooldown elapsed; the next call is a trial
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Trip state for one model
///
/// Once opened, the breaker stays open for the full cooldown no matter what
/// successes are reported in between. Only a success observed after the
/// cooldown closes it.
#[derive(Debug, Clone, Default)]
pub struct CircuitBreaker {
    opened_at: Option<Instant>,
    failure_count: u32,
    last_failure: Option<Instant>,
    /// When the current half-open trial call was handed out
    trial_started: Option<Instant>,
}

impl CircuitBreaker {
    pub fn state(&self, now: Instant, cooldown: Duration) -> BreakerState {
        match self.opened_at {
            None => BreakerState::Closed,
            Some(at) if at.checked_add(cooldown).map_or(true, |end| now < end) => {
                BreakerState::Open
            }
            Some(_) => BreakerState::HalfOpen,
        }
    }

    pub fn is_open(&self, now: Instant, cooldown: Duration) -> bool {
        self.state(now, cooldown) == BreakerState::Open
    }

    /// Time left before the breaker leaves the open state
    pub fn remaining(&self, now: Instant, cooldown: Duration) -> Duration {
        self.opened_at
            .map(|at| {
                at.checked_add(cooldown)
                    .map_or(Duration::MAX, |end| end.saturating_duration_since(now))
            })
            .unwrap_or_default()
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn last_failure(&self) -> Option<Instant> {
        self.last_failure
    }

    /// Whether a half-open trial call is outstanding. A trial that never
    /// reports back expires after one cooldown.
    pub fn trial_in_flight(&self, now: Instant, cooldown: Duration) -> bool {
        self.state(now, cooldown) == BreakerState::HalfOpen
            && self
                .trial_started
                .is_some_and(|at| at.checked_add(cooldown).map_or(true, |end| now < end))
    }

    /// Hand out the single half-open trial. Returns false if another caller
    /// already holds it. Always succeeds outside the half-open state.
    pub fn try_claim_trial(&mut self, now: Instant, cooldown: Duration) -> bool {
        if self.state(now, cooldown) != BreakerState::HalfOpen {
            return true;
        }
        if self.trial_in_flight(now, cooldown) {
            return false;
        }
        self.trial_started = Some(now);
        true
    }

    /// Give back a trial that was claimed but never attempted
    pub fn release_trial(&mut self) {
        self.trial_started = None;
    }

    /// Register a failure. Returns true if this call tripped the breaker.
    pub fn record_failure(
        &mut self,
        now: Instant,
        consecutive_failures: u32,
        threshold: u32,
        cooldown: Duration,
    ) -> bool {
        self.failure_count += 1;
        self.last_failure = Some(now);
        self.trial_started = None;

        if consecutive_failures >= threshold && !self.is_open(now, cooldown) {
            self.opened_at = Some(now);
            return true;
        }
        false
    }

    /// Register a success. Returns true if this call closed the breaker.
    pub fn record_success(&mut self, now: Instant, cooldown: Duration) -> bool {
        self.trial_started = None;
        match self.state(now, cooldown) {
            BreakerState::Open => false,
            BreakerState::HalfOpen => {
                self.opened_at = None;
                self.failure_count = 0;
                true
            }
            BreakerState::Closed => {
                self.failure_count = 0;
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COOLDOWN: Duration = Duration::from_secs(60);

    #[test]
    fn test_trips_at_threshold() {
        let now = Instant::now();
        let mut breaker = CircuitBreaker::default();

        assert!(!breaker.record_failure(now, 1, 3, COOLDOWN));
        assert!(!breaker.record_failure(now, 2, 3, COOLDOWN));
        assert!(breaker.record_failure(now, 3, 3, COOLDOWN));
        assert_eq!(breaker.state(now, COOLDOWN), BreakerState::Open);
        assert_eq!(breaker.failure_count(), 3);
    }

    #[test]
    fn test_success_during_cooldown_keeps_breaker_open() {
        let now = Instant::now();
        let mut breaker = CircuitBreaker::default();
        breaker.record_failure(now, 3, 3, COOLDOWN);

        let later = now + Duration::from_secs(30);
        assert!(!breaker.record_success(later, COOLDOWN));
        assert!(breaker.is_open(later, COOLDOWN));
        assert_eq!(breaker.remaining(later, COOLDOWN), Duration::from_secs(30));
    }

    #[test]
    fn test_success_after_cooldown_closes() {
        let now = Instant::now();
        let mut breaker = CircuitBreaker::default();
        breaker.record_failure(now, 3, 3, COOLDOWN);

        let later = now + COOLDOWN;
        assert_eq!(breaker.state(later, COOLDOWN), BreakerState::HalfOpen);
        assert!(breaker.record_success(later, COOLDOWN));
        assert_eq!(breaker.state(later, COOLDOWN), BreakerState::Closed);
    }

    #[test]
    fn test_failure_in_half_open_reopens() {
        let now = Instant::now();
        let mut breaker = CircuitBreaker::default();
        breaker.record_failure(now, 3, 3, COOLDOWN);

        let later = now + COOLDOWN + Duration::from_secs(1);
        assert!(breaker.record_failure(later, 4, 3, COOLDOWN));
        assert!(breaker.is_open(later, COOLDOWN));
    }

    #[test]
    fn test_half_open_hands_out_one_trial() {
        let now = Instant::now();
        let mut breaker = CircuitBreaker::default();
        breaker.record_failure(now, 3, 3, COOLDOWN);

        let later = now + COOLDOWN;
        assert!(breaker.try_claim_trial(later, COOLDOWN));
        assert!(!breaker.try_claim_trial(later, COOLDOWN));
        assert!(breaker.trial_in_flight(later, COOLDOWN));

        breaker.release_trial();
        assert!(breaker.try_claim_trial(later, COOLDOWN));

        // An abandoned trial expires after one more cooldown
        let much_later = later + COOLDOWN;
        assert!(breaker.try_claim_trial(much_later, COOLDOWN));
    }

    #[test]
    fn test_huge_cooldown_does_not_overflow() {
        let now = Instant::now();
        let mut breaker = CircuitBreaker::default();
        breaker.record_failure(now, 3, 3, Duration::MAX);

        let later = now + Duration::from_secs(3600);
        assert_eq!(breaker.state(later, Duration::MAX), BreakerState::Open);
        assert_eq!(breaker.remaining(later, Duration::MAX), Duration::MAX);
        assert_eq!(breaker.last_failure(), Some(now));
    }
}
