//! The single-writer sink task
//!
//! Exactly one consumer drains the row queue, so all store writes are
//! serialized. Rows accumulate until the batch fills or the flush
//! timeout fires. Each flush runs under the circuit breaker with its
//! own retry budget; exhausting it is fatal to the process: an
//! operator has to look at the store.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use treeline_client::retry::Backoff;
use treeline_store::breaker::CircuitBreaker;
use treeline_store::{Row, RowWriter, StoreError};

use crate::{IngestError, DB_BATCH_TIMEOUT};

/// Retry schedule for one batch flush.
pub const FLUSH_BACKOFF: Backoff = Backoff {
    initial: Duration::from_secs(1),
    factor: 2,
    cap: Duration::from_secs(30),
    max_attempts: 5,
};

#[derive(Clone, Copy, Debug)]
pub struct SinkConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
}

impl SinkConfig {
    #[must_use]
    pub const fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            flush_interval: DB_BATCH_TIMEOUT,
        }
    }
}

/// Drains the row queue until it closes or shutdown is requested.
/// Returns the number of rows committed to the store.
///
/// On shutdown the queue is drained up to twice the batch size (enough
/// to not lose the in-flight window, bounded so a saturated queue
/// cannot stall the exit), then flushed once more.
pub async fn run_sink(
    mut rows_rx: mpsc::Receiver<Row>,
    writer: Arc<dyn RowWriter>,
    config: SinkConfig,
    cancel: CancellationToken,
) -> Result<u64, IngestError> {
    let mut breaker = CircuitBreaker::default();
    let mut batch: Vec<Row> = Vec::with_capacity(config.batch_size);
    let mut committed = 0_u64;
    let mut deadline = Instant::now() + config.flush_interval;

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let drain_cap = config.batch_size * 2;
                while batch.len() < drain_cap {
                    match rows_rx.try_recv() {
                        Ok(row) => batch.push(row),
                        Err(_) => break,
                    }
                }

                info!(residual = batch.len(), "sink draining for shutdown");
                committed += flush(&mut batch, &writer, &mut breaker).await?;
                return Ok(committed);
            }

            received = rows_rx.recv() => match received {
                Some(row) => {
                    batch.push(row);
                    if batch.len() >= config.batch_size {
                        committed += flush(&mut batch, &writer, &mut breaker).await?;
                        deadline = Instant::now() + config.flush_interval;
                    }
                }
                None => {
                    committed += flush(&mut batch, &writer, &mut breaker).await?;
                    debug!(committed, "row queue closed, sink exiting");
                    return Ok(committed);
                }
            },

            () = tokio::time::sleep_until(deadline) => {
                committed += flush(&mut batch, &writer, &mut breaker).await?;
                deadline = Instant::now() + config.flush_interval;
            }
        }
    }
}

async fn flush(
    batch: &mut Vec<Row>,
    writer: &Arc<dyn RowWriter>,
    breaker: &mut CircuitBreaker,
) -> Result<u64, IngestError> {
    if batch.is_empty() {
        return Ok(0);
    }

    let mut attempt = 0_u32;
    let mut last_error = StoreError::Transport("no attempt made".to_owned());

    loop {
        if breaker.try_acquire().is_ok() {
            match writer.write_rows(batch).await {
                Ok(()) => {
                    breaker.on_success();
                    let flushed = batch.len() as u64;
                    debug!(rows = flushed, "batch flushed");
                    batch.clear();
                    return Ok(flushed);
                }
                Err(err) => {
                    warn!(attempt, error = %err, "batch flush failed");
                    breaker.on_failure();
                    last_error = err;
                }
            }
        } else {
            warn!(attempt, "circuit breaker open, flush attempt rejected");
        }

        attempt += 1;
        if attempt >= FLUSH_BACKOFF.max_attempts {
            error!(rows = batch.len(), "batch is unrecoverable, giving up");
            return Err(IngestError::SinkExhausted(last_error));
        }

        tokio::time::sleep(FLUSH_BACKOFF.delay(attempt - 1)).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use treeline_store::SqlValue;

    use super::*;

    #[derive(Default)]
    struct RecordingWriter {
        batches: Mutex<Vec<usize>>,
        failures_remaining: AtomicU32,
    }

    impl RecordingWriter {
        fn failing(times: u32) -> Self {
            Self {
                batches: Mutex::new(Vec::new()),
                failures_remaining: AtomicU32::new(times),
            }
        }
    }

    #[async_trait]
    impl RowWriter for RecordingWriter {
        async fn write_rows(&self, rows: &[Row]) -> Result<(), StoreError> {
            if self
                .failures_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                    left.checked_sub(1)
                })
                .is_ok()
            {
                return Err(StoreError::Transport("injected".to_owned()));
            }

            self.batches.lock().push(rows.len());
            Ok(())
        }
    }

    fn row(index: u64) -> Row {
        vec![SqlValue::U64(index)]
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_when_the_batch_fills() {
        let writer = Arc::new(RecordingWriter::default());
        let (tx, rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let sink = tokio::spawn(run_sink(
            rx,
            Arc::clone(&writer) as Arc<dyn RowWriter>,
            SinkConfig {
                batch_size: 10,
                flush_interval: Duration::from_secs(5),
            },
            cancel,
        ));

        for index in 0..25 {
            tx.send(row(index)).await.unwrap();
        }
        drop(tx);

        let committed = sink.await.unwrap().unwrap();
        assert_eq!(committed, 25);
        // Two full batches, one residual flush at queue close.
        assert_eq!(*writer.batches.lock(), vec![10, 10, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_on_the_timeout() {
        let writer = Arc::new(RecordingWriter::default());
        let (tx, rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let sink = tokio::spawn(run_sink(
            rx,
            Arc::clone(&writer) as Arc<dyn RowWriter>,
            SinkConfig {
                batch_size: 1_000,
                flush_interval: Duration::from_secs(5),
            },
            cancel.clone(),
        ));

        tx.send(row(0)).await.unwrap();
        tx.send(row(1)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(*writer.batches.lock(), vec![2]);

        drop(tx);
        let committed = sink.await.unwrap().unwrap();
        assert_eq!(committed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_store_failures() {
        let writer = Arc::new(RecordingWriter::failing(2));
        let (tx, rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let sink = tokio::spawn(run_sink(
            rx,
            Arc::clone(&writer) as Arc<dyn RowWriter>,
            SinkConfig {
                batch_size: 1,
                flush_interval: Duration::from_secs(5),
            },
            cancel,
        ));

        tx.send(row(0)).await.unwrap();
        drop(tx);

        let committed = sink.await.unwrap().unwrap();
        assert_eq!(committed, 1);
        assert_eq!(*writer.batches.lock(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_are_fatal() {
        let writer = Arc::new(RecordingWriter::failing(u32::MAX));
        let (tx, rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let sink = tokio::spawn(run_sink(
            rx,
            Arc::clone(&writer) as Arc<dyn RowWriter>,
            SinkConfig {
                batch_size: 1,
                flush_interval: Duration::from_secs(5),
            },
            cancel,
        ));

        tx.send(row(0)).await.unwrap();

        let result = sink.await.unwrap();
        assert!(matches!(result, Err(IngestError::SinkExhausted(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_drains_a_bounded_residue() {
        let writer = Arc::new(RecordingWriter::default());
        let (tx, rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let sink = tokio::spawn(run_sink(
            rx,
            Arc::clone(&writer) as Arc<dyn RowWriter>,
            SinkConfig {
                batch_size: 4,
                flush_interval: Duration::from_secs(3600),
            },
            cancel.clone(),
        ));

        // Park rows in the queue without filling a batch boundary.
        for index in 0..3 {
            tx.send(row(index)).await.unwrap();
        }
        tokio::task::yield_now().await;

        cancel.cancel();
        let committed = sink.await.unwrap().unwrap();

        assert_eq!(committed, 3);
        assert_eq!(*writer.batches.lock(), vec![3]);
    }
}
