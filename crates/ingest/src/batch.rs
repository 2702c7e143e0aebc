//! Batch units moved between the scheduler, workers and assembler

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use treeline_client::FetchError;

/// What one worker fetched. `items` is in ascending index order and may
/// be shorter than planned when the log truncated the range.
#[derive(Clone, Debug)]
pub struct BatchOutcome<T> {
    pub items: Vec<T>,
    /// Any request behind this batch observed a rate limit, even one
    /// that was recovered within the retry budget.
    pub rate_limited: bool,
    /// The range ran past the log head.
    pub end_of_log: bool,
}

/// A completed batch on its way to the assembler. `batch_index` is the
/// dispatch sequence number ordering the emission.
#[derive(Clone, Debug)]
pub struct BatchResult<T> {
    pub batch_index: u64,
    pub start_index: u64,
    pub items: Vec<T>,
}

/// Fetch seam between the scheduler and a concrete log client. Mocked
/// in tests.
#[async_trait]
pub trait BatchSource: Send + Sync + 'static {
    type Item: Send + 'static;

    /// Fetches `count` items starting at index `start`, in order.
    async fn fetch(
        &self,
        start: u64,
        count: u64,
        cancel: &CancellationToken,
    ) -> Result<BatchOutcome<Self::Item>, FetchError>;
}
