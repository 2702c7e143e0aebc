//! Circuit breaker for the insert path
//!
//! Owned by the single sink consumer, so no locking: closed until ten
//! consecutive failures, then open for a minute, then a single half-open
//! probe decides between closing and re-opening.

use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::warn;

/// Consecutive failures before the breaker opens.
pub const FAILURE_THRESHOLD: u32 = 10;

/// How long an open breaker rejects attempts.
pub const COOLDOWN: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
#[error("circuit breaker is open")]
pub struct BreakerOpen;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Closed,
    Open { since: Instant },
    HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    consecutive_failures: u32,
    state: State,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(FAILURE_THRESHOLD, COOLDOWN)
    }
}

impl CircuitBreaker {
    #[must_use]
    pub const fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            consecutive_failures: 0,
            state: State::Closed,
        }
    }

    /// Asks permission for one attempt. An open breaker rejects until
    /// the cool-down elapses, then admits exactly one probe.
    pub fn try_acquire(&mut self) -> Result<(), BreakerOpen> {
        match self.state {
            State::Closed | State::HalfOpen => Ok(()),
            State::Open { since } => {
                if since.elapsed() < self.cooldown {
                    Err(BreakerOpen)
                } else {
                    self.state = State::HalfOpen;
                    Ok(())
                }
            }
        }
    }

    pub fn on_success(&mut self) {
        self.consecutive_failures = 0;
        self.state = State::Closed;
    }

    pub fn on_failure(&mut self) {
        self.consecutive_failures += 1;

        match self.state {
            State::HalfOpen => {
                warn!("half-open probe failed, re-opening circuit breaker");
                self.state = State::Open {
                    since: Instant::now(),
                };
            }
            State::Closed if self.consecutive_failures >= self.threshold => {
                warn!(
                    failures = self.consecutive_failures,
                    "opening circuit breaker"
                );
                self.state = State::Open {
                    since: Instant::now(),
                };
            }
            _ => {}
        }
    }

    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self.state, State::Open { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn opens_after_ten_consecutive_failures() {
        let mut breaker = CircuitBreaker::default();

        for _ in 0..9 {
            breaker.try_acquire().unwrap();
            breaker.on_failure();
        }
        assert!(!breaker.is_open());

        breaker.try_acquire().unwrap();
        breaker.on_failure();
        assert!(breaker.is_open());
        assert!(breaker.try_acquire().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_the_failure_count() {
        let mut breaker = CircuitBreaker::default();

        for _ in 0..9 {
            breaker.on_failure();
        }
        breaker.on_success();
        for _ in 0..9 {
            breaker.on_failure();
        }

        assert!(!breaker.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_probe_closes_on_success() {
        let mut breaker = CircuitBreaker::default();

        for _ in 0..10 {
            breaker.on_failure();
        }
        assert!(breaker.try_acquire().is_err());

        tokio::time::advance(COOLDOWN).await;

        breaker.try_acquire().unwrap();
        breaker.on_success();

        assert!(!breaker.is_open());
        breaker.try_acquire().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_probe_reopens_on_failure() {
        let mut breaker = CircuitBreaker::default();

        for _ in 0..10 {
            breaker.on_failure();
        }
        tokio::time::advance(COOLDOWN).await;

        breaker.try_acquire().unwrap();
        breaker.on_failure();

        assert!(breaker.is_open());
        assert!(breaker.try_acquire().is_err());

        // And the new open window runs a full cool-down again.
        tokio::time::advance(COOLDOWN / 2).await;
        assert!(breaker.try_acquire().is_err());
        tokio::time::advance(COOLDOWN).await;
        assert!(breaker.try_acquire().is_ok());
    }
}
