//! Adaptive concurrency control
//!
//! Holds the concurrency the scheduler may use right now and the
//! configured ceiling. A rate limit halves the current value on the
//! spot; recovery doubles it back once enough chunks have completed
//! cleanly and the upstream has been quiet long enough. Reads are cheap
//! and frequent; mutations are serialized behind one small lock that is
//! never held across I/O.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

/// Clean chunks required (since the last limit) before a recovery step.
pub const RECOVERY_SUCCESSES: u32 = 2;

/// Quiet time required since the last observed rate limit.
pub const STABLE_WINDOW: Duration = Duration::from_secs(15);

/// Minimum spacing between recovery steps.
pub const STEP_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug)]
struct State {
    current: usize,
    limited: bool,
    successes: u32,
    last_limit: Instant,
    last_step: Instant,
}

#[derive(Debug)]
pub struct RateGovernor {
    ceiling: usize,
    state: Mutex<State>,
}

impl RateGovernor {
    #[must_use]
    pub fn new(ceiling: usize) -> Self {
        let ceiling = ceiling.max(1);
        let now = Instant::now();

        Self {
            ceiling,
            state: Mutex::new(State {
                current: ceiling,
                limited: false,
                successes: 0,
                last_limit: now,
                last_step: now,
            }),
        }
    }

    /// Concurrency the scheduler is allowed to use right now.
    #[must_use]
    pub fn current(&self) -> usize {
        self.state.lock().current
    }

    #[must_use]
    pub const fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// A request observed a 429. Halve immediately and restart the
    /// recovery bookkeeping.
    pub fn on_rate_limited(&self) {
        let mut state = self.state.lock();

        let halved = (state.current / 2).max(1);
        if halved != state.current {
            info!(from = state.current, to = halved, "rate limited, halving concurrency");
        }

        state.current = halved;
        state.limited = true;
        state.successes = 0;
        state.last_limit = Instant::now();
    }

    /// A planned chunk completed without any request seeing a rate
    /// limit. While limited, enough of these plus enough quiet time
    /// doubles concurrency back toward the ceiling.
    pub fn on_chunk_success(&self) {
        let mut state = self.state.lock();

        if !state.limited {
            return;
        }

        state.successes += 1;

        let now = Instant::now();
        if state.successes < RECOVERY_SUCCESSES
            || now.duration_since(state.last_limit) < STABLE_WINDOW
            || now.duration_since(state.last_step) < STEP_INTERVAL
        {
            return;
        }

        let doubled = (state.current * 2).min(self.ceiling);
        debug!(from = state.current, to = doubled, "recovering concurrency");
        state.current = doubled;
        state.last_step = now;

        if state.current == self.ceiling {
            info!(ceiling = self.ceiling, "concurrency restored");
            state.limited = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::advance;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn halves_down_to_one() {
        let governor = RateGovernor::new(64);

        // log2(64) halvings bottom out at 1.
        for expected in [32, 16, 8, 4, 2, 1, 1] {
            governor.on_rate_limited();
            assert_eq!(governor.current(), expected);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_requires_successes_and_quiet_time() {
        let governor = RateGovernor::new(8);
        governor.on_rate_limited();
        assert_eq!(governor.current(), 4);

        // Successes alone do nothing before the stability window.
        governor.on_chunk_success();
        governor.on_chunk_success();
        assert_eq!(governor.current(), 4);

        advance(STABLE_WINDOW).await;
        governor.on_chunk_success();
        assert_eq!(governor.current(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn doubles_monotonically_back_to_the_ceiling() {
        let governor = RateGovernor::new(16);
        for _ in 0..4 {
            governor.on_rate_limited();
        }
        assert_eq!(governor.current(), 1);

        advance(STABLE_WINDOW).await;
        governor.on_chunk_success();
        governor.on_chunk_success();
        assert_eq!(governor.current(), 2);

        // Each further step waits out the step interval.
        governor.on_chunk_success();
        assert_eq!(governor.current(), 2);
        advance(STEP_INTERVAL).await;
        governor.on_chunk_success();
        assert_eq!(governor.current(), 4);
        advance(STEP_INTERVAL).await;
        governor.on_chunk_success();
        assert_eq!(governor.current(), 8);
        advance(STEP_INTERVAL).await;
        governor.on_chunk_success();
        assert_eq!(governor.current(), 16);
    }

    #[tokio::test(start_paused = true)]
    async fn new_limit_during_recovery_starts_over() {
        let governor = RateGovernor::new(8);
        governor.on_rate_limited();
        advance(STABLE_WINDOW).await;
        governor.on_chunk_success();

        governor.on_rate_limited();
        assert_eq!(governor.current(), 2);

        // The old successes no longer count.
        advance(STABLE_WINDOW).await;
        governor.on_chunk_success();
        assert_eq!(governor.current(), 2);
        governor.on_chunk_success();
        assert_eq!(governor.current(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn chunk_success_is_a_no_op_when_healthy() {
        let governor = RateGovernor::new(8);
        governor.on_chunk_success();
        governor.on_chunk_success();
        assert_eq!(governor.current(), 8);
    }
}
