//! Per-module circuit breaker
//!
//! ```text
//! Closed --(streak >= threshold)--> Open --(cooldown elapsed)--> HalfOpen
//!   ^                                 ^                             |
//!   +----------(trial success)--------|-----------------------------+
//!                                     +-------(trial failure)-------+
//! ```
//!
//! Time is the scheduler's simulation time, so a breaker behaves the same
//! under test as in production regardless of wall-clock speed.

use std::time::Duration;

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakerState {
    /// Dispatch allowed
    Closed,
    /// Dispatch blocked until the cooldown elapses
    Open,
    /// One trial dispatch allowed
    HalfOpen,
}

/// Failure tracker gating a module's dispatch
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: BreakerState,
    threshold: u32,
    cooldown: Duration,
    streak: u32,
    opened_at: Duration,
    trial_pending: bool,
    trips: u64,
}

impl CircuitBreaker {
    /// A closed breaker opening after `threshold` consecutive failures
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: BreakerState::Closed,
            threshold: threshold.max(1),
            cooldown,
            streak: 0,
            opened_at: Duration::ZERO,
            trial_pending: false,
            trips: 0,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Consecutive failures recorded while closed
    pub fn streak(&self) -> u32 {
        self.streak
    }

    /// Number of times the breaker has opened
    pub fn trips(&self) -> u64 {
        self.trips
    }

    /// Decide whether the module may run at simulation time `now`
    ///
    /// An open breaker whose cooldown has elapsed moves to half-open and
    /// grants exactly one trial. Further calls are refused until that trial
    /// is recorded.
    pub fn allow(&mut self, now: Duration) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                if now.saturating_sub(self.opened_at) < self.cooldown {
                    return false;
                }
                self.state = BreakerState::HalfOpen;
                self.trial_pending = true;
                true
            }
            BreakerState::HalfOpen => {
                if self.trial_pending {
                    return false;
                }
                self.trial_pending = true;
                true
            }
        }
    }

    /// Return a granted trial that was never dispatched
    pub fn cancel_trial(&mut self) {
        self.trial_pending = false;
    }

    /// Record a successful run; returns the new state if it changed
    pub fn record_success(&mut self) -> Option<BreakerState> {
        self.streak = 0;
        self.trial_pending = false;
        if self.state == BreakerState::Closed {
            return None;
        }
        self.state = BreakerState::Closed;
        Some(BreakerState::Closed)
    }

    /// Record a failed run at simulation time `now`; returns the new state if it changed
    ///
    /// A failed half-open trial reopens immediately without re-accruing a streak.
    pub fn record_failure(&mut self, now: Duration) -> Option<BreakerState> {
        self.trial_pending = false;
        match self.state {
            BreakerState::HalfOpen => {
                self.open(now);
                Some(BreakerState::Open)
            }
            BreakerState::Closed => {
                self.streak += 1;
                if self.streak >= self.threshold {
                    self.open(now);
                    Some(BreakerState::Open)
                } else {
                    None
                }
            }
            // a straggler result from before the breaker opened
            BreakerState::Open => None,
        }
    }

    /// Force the breaker closed and clear the streak
    pub fn reset(&mut self) {
        self.state = BreakerState::Closed;
        self.streak = 0;
        self.trial_pending = false;
    }

    fn open(&mut self, now: Duration) {
        self.state = BreakerState::Open;
        self.opened_at = now;
        self.streak = 0;
        self.trips += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_opens_at_threshold() {
        let mut breaker = CircuitBreaker::new(3, ms(100));
        assert!(breaker.allow(ms(0)));
        assert_eq!(breaker.record_failure(ms(0)), None);
        assert_eq!(breaker.record_failure(ms(10)), None);
        assert_eq!(breaker.streak(), 2);
        assert_eq!(breaker.record_failure(ms(20)), Some(BreakerState::Open));
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.trips(), 1);
    }

    #[test]
    fn test_success_resets_streak() {
        let mut breaker = CircuitBreaker::new(2, ms(100));
        breaker.record_failure(ms(0));
        assert_eq!(breaker.record_success(), None);
        assert_eq!(breaker.streak(), 0);
        assert_eq!(breaker.record_failure(ms(1)), None);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_blocked_until_cooldown_then_single_trial() {
        let mut breaker = CircuitBreaker::new(1, ms(100));
        breaker.record_failure(ms(50));

        assert!(!breaker.allow(ms(100)));
        assert!(!breaker.allow(ms(149)));
        assert!(breaker.allow(ms(150)));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(!breaker.allow(ms(151)));
    }

    #[test]
    fn test_trial_success_closes() {
        let mut breaker = CircuitBreaker::new(1, ms(10));
        breaker.record_failure(ms(0));
        assert!(breaker.allow(ms(10)));
        assert_eq!(breaker.record_success(), Some(BreakerState::Closed));
        assert_eq!(breaker.streak(), 0);
        assert!(breaker.allow(ms(11)));
    }

    #[test]
    fn test_trial_failure_reopens_immediately() {
        let mut breaker = CircuitBreaker::new(5, ms(10));
        for t in 0..5 {
            breaker.record_failure(ms(t));
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        assert!(breaker.allow(ms(20)));
        assert_eq!(breaker.record_failure(ms(20)), Some(BreakerState::Open));
        assert_eq!(breaker.trips(), 2);
        assert!(!breaker.allow(ms(25)));
        assert!(breaker.allow(ms(30)));
    }

    #[test]
    fn test_cancelled_trial_can_be_granted_again() {
        let mut breaker = CircuitBreaker::new(1, ms(10));
        breaker.record_failure(ms(0));
        assert!(breaker.allow(ms(10)));
        breaker.cancel_trial();
        assert!(breaker.allow(ms(11)));
        assert!(!breaker.allow(ms(12)));
    }

    #[test]
    fn test_manual_reset() {
        let mut breaker = CircuitBreaker::new(1, ms(1000));
        breaker.record_failure(ms(0));
        assert!(!breaker.allow(ms(1)));
        breaker.reset();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.allow(ms(2)));
    }
}
