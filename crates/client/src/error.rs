//! Failure classification for upstream log requests

use thiserror::Error;

/// What went wrong talking to a log, bucketed by how the caller should
/// react rather than by transport detail.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FetchError {
    /// Timeouts, 5xx, connection resets. Retried with the standard
    /// backoff up to the attempt budget.
    #[error("transient network failure: {0}")]
    Transient(String),

    /// Upstream said 429 (or equivalent). Retried on its own, slower
    /// backoff schedule; also reported to the rate governor.
    #[error("rate limited by upstream")]
    RateLimited,

    /// The requested range lies past the log head. Not a failure; the
    /// supervisor switches to polling.
    #[error("reached the end of the log")]
    EndOfLog,

    /// The response decoded but did not have the promised shape.
    #[error("malformed upstream response: {0}")]
    Malformed(String),

    /// Caller asked for more entries than the upstream accepts per
    /// request. A programming error, never sent upstream.
    #[error("requested {got} entries, the retrieve endpoint accepts at most {cap}")]
    BatchTooLarge { got: usize, cap: usize },

    /// Shutdown was requested while the request was pending or backing
    /// off.
    #[error("cancelled")]
    Cancelled,
}

impl FetchError {
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::RateLimited)
    }

    /// Maps a transport-level error onto a kind.
    #[must_use]
    pub fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Transient("request timed out".to_owned())
        } else if err.is_connect() {
            Self::Transient(format!("connection failed: {err}"))
        } else {
            Self::Transient(err.to_string())
        }
    }
}

/// Classifies a non-200 response by status and body.
///
/// 429s and bodies advertising "Too Many Requests" (some logs return
/// them behind 200-adjacent proxies with other statuses) are rate
/// limits; everything else is transient and subject to the retry
/// budget.
#[must_use]
pub fn classify_status(status: reqwest::StatusCode, body: &str) -> FetchError {
    if status.as_u16() == 429 || body.contains("429") || body.contains("Too Many Requests") {
        return FetchError::RateLimited;
    }

    FetchError::Transient(format!("unexpected status {status}: {}", snippet(body)))
}

/// First line of a body, bounded, for log/error context.
#[must_use]
pub fn snippet(body: &str) -> &str {
    let line = body.lines().next().unwrap_or_default();
    match line.char_indices().nth(120) {
        Some((cut, _)) => &line[..cut],
        None => line,
    }
}
