//! Retry policies for upstream requests
//!
//! Transient failures and rate limits run on separate budgets: a request
//! that keeps hitting 429s burns rate-limit attempts with the slower
//! schedule without eating into its transient budget, and vice versa.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::FetchError;

/// Exponential backoff schedule.
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    pub initial: Duration,
    pub factor: u32,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Backoff {
    /// Schedule for timeouts, 5xx and connection resets.
    pub const TRANSIENT: Self = Self {
        initial: Duration::from_secs(1),
        factor: 2,
        cap: Duration::from_secs(30),
        max_attempts: 5,
    };

    /// Slower schedule for 429s. The cap is short so recovery probes
    /// keep flowing while the governor holds concurrency down.
    pub const RATE_LIMITED: Self = Self {
        initial: Duration::from_secs(1),
        factor: 2,
        cap: Duration::from_secs(5),
        max_attempts: 10,
    };

    /// Delay before retry number `attempt` (zero-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.factor.saturating_pow(attempt);
        self.initial.saturating_mul(factor).min(self.cap)
    }
}

/// A value that survived the retry loop, plus whether any attempt along
/// the way observed a rate limit. The flag feeds chunk accounting: a
/// batch that recovered from a 429 still taints its chunk.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub value: T,
    pub rate_limited: bool,
}

/// Drives `op` until it succeeds, its budget runs out, or shutdown is
/// requested. `on_rate_limit` fires at observation time, before the
/// backoff sleep, so the governor reacts while the request is still
/// being retried.
pub async fn with_retries<T, F, Fut>(
    cancel: &CancellationToken,
    on_rate_limit: impl Fn(),
    mut op: F,
) -> Result<RetryOutcome<T>, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut transient_attempts = 0_u32;
    let mut rate_attempts = 0_u32;
    let mut rate_limited = false;

    loop {
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }

        let err = match op().await {
            Ok(value) => {
                return Ok(RetryOutcome {
                    value,
                    rate_limited,
                })
            }
            Err(err) => err,
        };

        let delay = match &err {
            FetchError::RateLimited => {
                rate_limited = true;
                on_rate_limit();
                rate_attempts += 1;
                if rate_attempts >= Backoff::RATE_LIMITED.max_attempts {
                    warn!(attempts = rate_attempts, "rate-limit retry budget exhausted");
                    return Err(err);
                }
                Backoff::RATE_LIMITED.delay(rate_attempts - 1)
            }
            FetchError::Transient(reason) => {
                transient_attempts += 1;
                if transient_attempts >= Backoff::TRANSIENT.max_attempts {
                    warn!(
                        attempts = transient_attempts,
                        %reason,
                        "transient retry budget exhausted"
                    );
                    return Err(err);
                }
                Backoff::TRANSIENT.delay(transient_attempts - 1)
            }
            _ => return Err(err),
        };

        debug!(?delay, error = %err, "backing off before retry");

        tokio::select! {
            () = cancel.cancelled() => return Err(FetchError::Cancelled),
            () = tokio::time::sleep(delay) => {}
        }
    }
}
