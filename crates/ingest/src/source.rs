//! Concrete batch sources over the log clients
//!
//! These adapt the HTTP clients to the scheduler's [`BatchSource`]
//! seam, adding the per-request retry loops and reporting observed rate
//! limits to the governor at observation time.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use treeline_client::ct::{CtClient, CtLeaf};
use treeline_client::rekor::{RekorClient, RetrievedEntry};
use treeline_client::retry::with_retries;
use treeline_client::FetchError;

use crate::batch::{BatchOutcome, BatchSource};
use crate::governor::RateGovernor;

/// CT range fetcher. Logs truncate wide ranges, so one batch may take
/// several requests; the batch keeps its retry accounting per request.
pub struct CtSource {
    client: CtClient,
    governor: Arc<RateGovernor>,
}

impl CtSource {
    #[must_use]
    pub const fn new(client: CtClient, governor: Arc<RateGovernor>) -> Self {
        Self { client, governor }
    }
}

#[async_trait]
impl BatchSource for CtSource {
    type Item = CtLeaf;

    async fn fetch(
        &self,
        start: u64,
        count: u64,
        cancel: &CancellationToken,
    ) -> Result<BatchOutcome<CtLeaf>, FetchError> {
        let end = start + count - 1;
        let mut items: Vec<CtLeaf> = Vec::with_capacity(count as usize);
        let mut rate_limited = false;
        let mut end_of_log = false;

        while (start + items.len() as u64) <= end {
            let cursor = start + items.len() as u64;

            let outcome = with_retries(
                cancel,
                || self.governor.on_rate_limited(),
                || self.client.get_entries(cursor, end),
            )
            .await;

            match outcome {
                Ok(outcome) => {
                    rate_limited |= outcome.rate_limited;
                    if outcome.value.is_empty() {
                        end_of_log = true;
                        break;
                    }
                    items.extend(outcome.value);
                }
                Err(FetchError::EndOfLog) => {
                    end_of_log = true;
                    break;
                }
                Err(err) if items.is_empty() => return Err(err),
                Err(err) => {
                    // Keep what we have; the missing tail is logged and
                    // re-fetched on the next session.
                    warn!(cursor, end, error = %err, "range fetch lost its tail");
                    end_of_log = true;
                    break;
                }
            }
        }

        if end_of_log && items.is_empty() {
            return Err(FetchError::EndOfLog);
        }

        Ok(BatchOutcome {
            items,
            rate_limited,
            end_of_log,
        })
    }
}

/// Rekor batch fetcher. Items come back unordered keyed by entry id;
/// they are sorted by global index before emission.
pub struct RekorSource {
    client: RekorClient,
    governor: Arc<RateGovernor>,
}

impl RekorSource {
    #[must_use]
    pub const fn new(client: RekorClient, governor: Arc<RateGovernor>) -> Self {
        Self { client, governor }
    }
}

#[async_trait]
impl BatchSource for RekorSource {
    type Item = RetrievedEntry;

    async fn fetch(
        &self,
        start: u64,
        count: u64,
        cancel: &CancellationToken,
    ) -> Result<BatchOutcome<RetrievedEntry>, FetchError> {
        let indexes: Vec<u64> = (start..start + count).collect();

        let outcome = with_retries(
            cancel,
            || self.governor.on_rate_limited(),
            || self.client.retrieve(&indexes),
        )
        .await?;

        let mut items = outcome.value;
        items.sort_by_key(|item| item.entry.log_index);

        if items.len() < indexes.len() {
            warn!(
                requested = indexes.len(),
                received = items.len(),
                start,
                "retrieve returned fewer entries than asked"
            );
        }

        Ok(BatchOutcome {
            items,
            rate_limited: outcome.rate_limited,
            end_of_log: false,
        })
    }
}
