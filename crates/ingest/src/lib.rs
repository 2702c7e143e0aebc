//! The ingest pipeline
//!
//! One process mirrors one log. Data flows
//!
//! ```text
//! log client -> range scheduler -> worker fan-out -> ordered assembler
//!            -> entry parser -> sink -> store
//! ```
//!
//! The [`governor::RateGovernor`] sits beside the scheduler and scales
//! its fan-out with observed 429s. A single
//! [`tokio_util::sync::CancellationToken`] threads through every task;
//! each blocking point selects on it, so shutdown drains in-flight
//! work and flushes the sink exactly once.

use std::time::Duration;

use thiserror::Error;

pub mod assembler;
pub mod batch;
pub mod governor;
pub mod resume;
pub mod scheduler;
pub mod sink;
pub mod source;
pub mod supervisor;

use treeline_client::FetchError;
use treeline_store::StoreError;

/// Bound on the row queue between the parser stage and the sink.
pub const SINK_QUEUE_CAPACITY: usize = 5_000;

/// Rows per store batch for the CT ingester.
pub const CT_DB_BATCH_SIZE: usize = 2_000;

/// Rows per store batch for the Rekor ingester.
pub const REKOR_DB_BATCH_SIZE: usize = 5_000;

/// Flush the sink batch at the latest this long after the last flush.
pub const DB_BATCH_TIMEOUT: Duration = Duration::from_secs(5);

/// How often the supervisor re-reads the log head once caught up.
pub const POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Fan-out ceiling for the CT ingester, which has no concurrency flag.
pub const CT_DEFAULT_CONCURRENCY: usize = 8;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IngestError {
    /// A row's inclusion proof named a different tree than the log
    /// announced. Fatal: the fetch loop unwinds and the process exits
    /// non-zero.
    #[error("checkpoint mismatch: {0}")]
    CheckpointMismatch(String),

    /// A sink batch could not be written within the retry budget.
    #[error("sink retries exhausted")]
    SinkExhausted(#[source] StoreError),

    #[error("log request failed")]
    Fetch(#[from] FetchError),

    #[error("store request failed")]
    Store(#[from] StoreError),
}
