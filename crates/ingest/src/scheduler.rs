//! Chunk planning and worker fan-out
//!
//! A chunk is `current_concurrency x per_request` contiguous indices,
//! split into per-request sub-batches, each tagged with a strictly
//! increasing batch index and dispatched through a semaphore-bounded
//! fan-out. The next chunk is planned only after every sub-batch of the
//! previous one has been joined *and* released by the assembler, so the
//! reorder buffer stays one chunk deep.

use std::sync::Arc;

use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use treeline_client::FetchError;

use crate::batch::{BatchResult, BatchSource};
use crate::governor::RateGovernor;

/// One pull session: `[from, until)` against a head observed once.
#[derive(Clone, Copy, Debug)]
pub struct RangePlan {
    pub from: u64,
    pub until: u64,
    pub per_request: u64,
}

/// Why a schedule stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScheduleEnd {
    /// The plan's whole range was dispatched and drained.
    Completed,
    /// A worker ran past the log head.
    EndOfLog,
    /// Shutdown was requested.
    Cancelled,
}

enum WorkerEnd {
    Clean,
    RateLimited,
    EndOfLog,
    Failed,
    Cancelled,
}

/// Drives the plan to completion, feeding the assembler through
/// `batch_tx` and watching `emitted` for chunk drain.
pub async fn run_schedule<S: BatchSource>(
    source: Arc<S>,
    governor: Arc<RateGovernor>,
    plan: RangePlan,
    batch_tx: mpsc::Sender<BatchResult<S::Item>>,
    mut emitted: watch::Receiver<u64>,
    cancel: CancellationToken,
) -> ScheduleEnd {
    debug_assert!(plan.per_request > 0);

    let mut next_start = plan.from;
    let mut next_batch_index = 0_u64;

    while next_start < plan.until {
        if cancel.is_cancelled() {
            return ScheduleEnd::Cancelled;
        }

        let concurrency = governor.current().max(1);
        let chunk_until = plan
            .until
            .min(next_start + concurrency as u64 * plan.per_request);

        debug!(
            from = next_start,
            until = chunk_until,
            concurrency,
            "dispatching chunk"
        );

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut workers: JoinSet<WorkerEnd> = JoinSet::new();

        let mut batch_start = next_start;
        while batch_start < chunk_until {
            let start = batch_start;
            let count = plan.per_request.min(chunk_until - start);
            let batch_index = next_batch_index;
            next_batch_index += 1;
            batch_start += count;

            let source = Arc::clone(&source);
            let semaphore = Arc::clone(&semaphore);
            let tx = batch_tx.clone();
            let cancel = cancel.clone();

            let _handle = workers.spawn(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return WorkerEnd::Cancelled;
                };

                run_worker(source, start, count, batch_index, tx, cancel).await
            });
        }

        let mut chunk_clean = true;
        let mut end_of_log = false;
        let mut cancelled = false;

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(WorkerEnd::Clean) => {}
                Ok(WorkerEnd::RateLimited) => chunk_clean = false,
                Ok(WorkerEnd::Failed) => chunk_clean = false,
                Ok(WorkerEnd::EndOfLog) => end_of_log = true,
                Ok(WorkerEnd::Cancelled) => cancelled = true,
                Err(err) => {
                    warn!(error = %err, "fetch worker panicked");
                    chunk_clean = false;
                }
            }
        }

        if cancelled || cancel.is_cancelled() {
            return ScheduleEnd::Cancelled;
        }

        // Wait for the assembler to release everything dispatched so
        // far before planning more work.
        let drained = tokio::select! {
            () = cancel.cancelled() => None,
            drained = emitted.wait_for(|count| *count >= next_batch_index) => drained.ok().map(|_| ()),
        };
        if drained.is_none() {
            return ScheduleEnd::Cancelled;
        }

        if chunk_clean {
            governor.on_chunk_success();
        }

        if end_of_log {
            info!(at = chunk_until, "log head reached mid-chunk");
            return ScheduleEnd::EndOfLog;
        }

        next_start = chunk_until;
    }

    ScheduleEnd::Completed
}

async fn run_worker<S: BatchSource>(
    source: Arc<S>,
    start: u64,
    count: u64,
    batch_index: u64,
    tx: mpsc::Sender<BatchResult<S::Item>>,
    cancel: CancellationToken,
) -> WorkerEnd {
    let fetched = source.fetch(start, count, &cancel).await;

    let (items, rate_limited, end_of_log) = match fetched {
        Ok(outcome) => (outcome.items, outcome.rate_limited, outcome.end_of_log),
        Err(FetchError::EndOfLog) => (Vec::new(), false, true),
        Err(FetchError::Cancelled) => return WorkerEnd::Cancelled,
        Err(err) => {
            // Exhausted retries or a malformed response: drop this
            // range and keep the stream dense with an empty batch.
            warn!(start, count, batch_index, error = %err, "dropping failed batch");
            (Vec::new(), false, false)
        }
    };

    let failed = items.is_empty() && !end_of_log;

    let result = BatchResult {
        batch_index,
        start_index: start,
        items,
    };

    let sent = tokio::select! {
        () = cancel.cancelled() => None,
        sent = tx.send(result) => sent.ok(),
    };

    match sent {
        None => WorkerEnd::Cancelled,
        Some(()) if end_of_log => WorkerEnd::EndOfLog,
        Some(()) if failed => WorkerEnd::Failed,
        Some(()) if rate_limited => WorkerEnd::RateLimited,
        Some(()) => WorkerEnd::Clean,
    }
}
