//! Per-log supervision
//!
//! `run_ct` and `run_rekor` share the same shape: resolve the resume
//! point, pull until caught up, then poll the head every 30 seconds and
//! pull again when it grows. Each pull session wires a fresh
//! scheduler -> assembler -> parser pipeline into the long-lived sink
//! task. Cancellation (signal or fatal invariant violation) drains the
//! sink before returning.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use treeline_client::ct::{CtClient, CtLeaf};
use treeline_client::rekor::{RekorClient, RetrievedEntry};
use treeline_client::retry::with_retries;
use treeline_client::FetchError;
use treeline_parser::ct as ct_parser;
use treeline_parser::rekor as rekor_parser;
use treeline_parser::rekor::RekorEntryInput;
use treeline_primitives::LogState;
use treeline_store::rows::{encode_ct_row, encode_rekor_row};
use treeline_store::{IndexLookup, Row, RowWriter, StoreError};

use crate::assembler::run_assembler;
use crate::batch::BatchResult;
use crate::governor::RateGovernor;
use crate::resume::resolve_start_index;
use crate::scheduler::{run_schedule, RangePlan, ScheduleEnd};
use crate::sink::{run_sink, SinkConfig};
use crate::source::{CtSource, RekorSource};
use crate::{
    IngestError, CT_DB_BATCH_SIZE, CT_DEFAULT_CONCURRENCY, POLL_INTERVAL, REKOR_DB_BATCH_SIZE,
    SINK_QUEUE_CAPACITY,
};

#[derive(Clone, Copy, Debug)]
pub struct CtIngestConfig {
    /// `-1` resumes from the stored high-water mark.
    pub start_index: i64,
    /// Leaves per `get-entries` request.
    pub batch_size: u64,
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub sink: SinkConfig,
}

impl CtIngestConfig {
    #[must_use]
    pub const fn new(start_index: i64, batch_size: u64) -> Self {
        Self {
            start_index,
            batch_size,
            concurrency: CT_DEFAULT_CONCURRENCY,
            poll_interval: POLL_INTERVAL,
            sink: SinkConfig::new(CT_DB_BATCH_SIZE),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RekorIngestConfig {
    /// `-1` resumes from the stored high-water mark (tree-local).
    pub start_index: i64,
    /// Entries per retrieve request, at most the upstream cap of 10.
    pub batch_size: u64,
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub sink: SinkConfig,
}

impl RekorIngestConfig {
    #[must_use]
    pub const fn new(start_index: i64, batch_size: u64, concurrency: usize) -> Self {
        Self {
            start_index,
            batch_size,
            concurrency,
            poll_interval: POLL_INTERVAL,
            sink: SinkConfig::new(REKOR_DB_BATCH_SIZE),
        }
    }
}

/// Mirrors one CT log until shutdown or a fatal failure.
pub async fn run_ct(
    client: CtClient,
    writer: Arc<dyn RowWriter>,
    lookup: Arc<dyn IndexLookup>,
    config: CtIngestConfig,
    cancel: CancellationToken,
) -> Result<(), IngestError> {
    let log_id = client.log_id().to_owned();
    let governor = Arc::new(RateGovernor::new(config.concurrency));

    let (rows_tx, rows_rx) = mpsc::channel::<Row>(SINK_QUEUE_CAPACITY);
    let sink = tokio::spawn(run_sink(rows_rx, writer, config.sink, cancel.clone()));

    let mut current = match resolve_start_index(lookup.as_ref(), &log_id, config.start_index).await
    {
        Ok(current) => current,
        Err(err) => return shutdown(cancel, rows_tx, sink, Err(err)).await,
    };
    info!(log_id, start = current, ceiling = config.concurrency, "ct ingest starting");

    let loop_result = loop {
        if cancel.is_cancelled() || sink.is_finished() {
            break Ok(());
        }

        let state = match fetch_state(&cancel, &governor, || client.state()).await {
            Ok(state) => state,
            Err(FetchError::Cancelled) => break Ok(()),
            Err(err) => {
                warn!(error = %err, "head fetch failed, will retry");
                if wait_poll(&cancel, config.poll_interval).await.is_break() {
                    break Ok(());
                }
                continue;
            }
        };

        if current >= state.tree_size {
            debug!(current, head = state.tree_size, "caught up, polling for new leaves");
            if wait_poll(&cancel, config.poll_interval).await.is_break() {
                break Ok(());
            }
            continue;
        }

        info!(from = current, head = state.tree_size, "pulling");

        let channel_cap = config.concurrency.max(2) * 2;
        let (batch_tx, batch_rx) = mpsc::channel(channel_cap);
        let (ordered_tx, ordered_rx) = mpsc::channel(channel_cap);
        let (emitted_tx, emitted_rx) = watch::channel(0_u64);

        let assembler = tokio::spawn(run_assembler(
            batch_rx,
            ordered_tx,
            emitted_tx,
            cancel.clone(),
        ));
        let parser = tokio::spawn(ct_parse_stage(
            log_id.clone(),
            current,
            ordered_rx,
            rows_tx.clone(),
            cancel.clone(),
        ));

        let end = run_schedule(
            Arc::new(CtSource::new(client.clone(), Arc::clone(&governor))),
            Arc::clone(&governor),
            RangePlan {
                from: current,
                until: state.tree_size,
                per_request: config.batch_size,
            },
            batch_tx,
            emitted_rx,
            cancel.clone(),
        )
        .await;

        let _assembled = assembler.await;
        let next = parser.await.unwrap_or(current);
        current = current.max(next);

        match end {
            ScheduleEnd::Cancelled => break Ok(()),
            ScheduleEnd::EndOfLog => {
                debug!(current, "head reached before the announced size");
            }
            ScheduleEnd::Completed => {}
        }
    };

    shutdown(cancel, rows_tx, sink, loop_result).await
}

/// Mirrors a Rekor log until shutdown or a fatal failure.
pub async fn run_rekor(
    client: RekorClient,
    writer: Arc<dyn RowWriter>,
    lookup: Arc<dyn IndexLookup>,
    config: RekorIngestConfig,
    cancel: CancellationToken,
) -> Result<(), IngestError> {
    let governor = Arc::new(RateGovernor::new(config.concurrency));

    let (rows_tx, rows_rx) = mpsc::channel::<Row>(SINK_QUEUE_CAPACITY);
    let sink = tokio::spawn(run_sink(rows_rx, writer, config.sink, cancel.clone()));

    let mut known_tree: Option<String> = None;
    let mut current_global = 0_u64;

    let loop_result = loop {
        if cancel.is_cancelled() || sink.is_finished() {
            break Ok(());
        }

        let state = match fetch_state(&cancel, &governor, || client.state()).await {
            Ok(state) => state,
            Err(FetchError::Cancelled) => break Ok(()),
            Err(err) => {
                warn!(error = %err, "tree info fetch failed, will retry");
                if wait_poll(&cancel, config.poll_interval).await.is_break() {
                    break Ok(());
                }
                continue;
            }
        };

        // Resumption is scoped to the active tree. On first contact, and
        // again if the log rotates trees underneath us, resolve
        // the tree-local high-water mark and map it to a global index.
        if known_tree.as_deref() != Some(state.tree_id.as_str()) {
            if known_tree.is_some() {
                warn!(
                    previous = known_tree.as_deref().unwrap_or_default(),
                    active = state.tree_id,
                    "active tree changed, re-resolving resume point"
                );
            }

            let requested = if known_tree.is_none() { config.start_index } else { -1 };
            let local = match resolve_start_index(lookup.as_ref(), &state.tree_id, requested).await
            {
                Ok(local) => local,
                Err(err) => break Err(err),
            };

            current_global = state.global_index(local);
            known_tree = Some(state.tree_id.clone());
            info!(
                tree_id = state.tree_id,
                local_start = local,
                global_start = current_global,
                ceiling = config.concurrency,
                "rekor ingest starting"
            );
        }

        let head = state.global_size();
        if current_global >= head {
            debug!(current_global, head, "caught up, polling for new leaves");
            if wait_poll(&cancel, config.poll_interval).await.is_break() {
                break Ok(());
            }
            continue;
        }

        info!(from = current_global, head, "pulling");

        let channel_cap = config.concurrency.max(2) * 2;
        let (batch_tx, batch_rx) = mpsc::channel(channel_cap);
        let (ordered_tx, ordered_rx) = mpsc::channel(channel_cap);
        let (emitted_tx, emitted_rx) = watch::channel(0_u64);

        let assembler = tokio::spawn(run_assembler(
            batch_rx,
            ordered_tx,
            emitted_tx,
            cancel.clone(),
        ));
        let parser = tokio::spawn(rekor_parse_stage(
            state.clone(),
            current_global,
            ordered_rx,
            rows_tx.clone(),
            cancel.clone(),
        ));

        let end = run_schedule(
            Arc::new(RekorSource::new(client.clone(), Arc::clone(&governor))),
            Arc::clone(&governor),
            RangePlan {
                from: current_global,
                until: head,
                per_request: config.batch_size,
            },
            batch_tx,
            emitted_rx,
            cancel.clone(),
        )
        .await;

        let _assembled = assembler.await;
        match parser.await {
            Ok(Ok(next)) => current_global = current_global.max(next),
            Ok(Err(err)) => break Err(err),
            Err(join_err) => {
                error!(error = %join_err, "parse stage failed");
                break Ok(());
            }
        }

        if matches!(end, ScheduleEnd::Cancelled) {
            break Ok(());
        }
    };

    shutdown(cancel, rows_tx, sink, loop_result).await
}

/// Parses ordered CT batches into sink rows. Returns the index after
/// the last leaf it saw.
pub async fn ct_parse_stage(
    log_id: String,
    session_start: u64,
    mut ordered_rx: mpsc::Receiver<BatchResult<CtLeaf>>,
    rows_tx: mpsc::Sender<Row>,
    cancel: CancellationToken,
) -> u64 {
    let mut next_index = session_start;

    loop {
        let batch = tokio::select! {
            () = cancel.cancelled() => return next_index,
            received = ordered_rx.recv() => match received {
                Some(batch) => batch,
                None => return next_index,
            },
        };

        for (offset, leaf) in batch.items.iter().enumerate() {
            let idx = batch.start_index + offset as u64;

            match ct_parser::parse_leaf(&log_id, idx, &leaf.leaf_input, Utc::now()) {
                Ok(entry) => {
                    let row = encode_ct_row(&entry);
                    let sent = tokio::select! {
                        () = cancel.cancelled() => None,
                        sent = rows_tx.send(row) => sent.ok(),
                    };
                    if sent.is_none() {
                        return next_index;
                    }
                }
                Err(err) => {
                    warn!(log_id, idx, error = %err, "dropping undecodable leaf");
                }
            }

            next_index = idx + 1;
        }
    }
}

/// Parses ordered Rekor batches into sink rows. A checkpoint naming the
/// wrong tree cancels the whole pipeline and surfaces as an error.
/// Returns the global index after the last entry it saw.
pub async fn rekor_parse_stage(
    state: LogState,
    session_start: u64,
    mut ordered_rx: mpsc::Receiver<BatchResult<RetrievedEntry>>,
    rows_tx: mpsc::Sender<Row>,
    cancel: CancellationToken,
) -> Result<u64, IngestError> {
    let mut next_global = session_start;

    loop {
        let batch = tokio::select! {
            () = cancel.cancelled() => return Ok(next_global),
            received = ordered_rx.recv() => match received {
                Some(batch) => batch,
                None => return Ok(next_global),
            },
        };

        for item in &batch.items {
            let global = item.entry.log_index;
            let proof = item.entry.verification.inclusion_proof.as_ref();

            let local_index = proof
                .map(|proof| proof.log_index)
                .or_else(|| state.local_index(global))
                .unwrap_or(global);

            let input = RekorEntryInput {
                expected_tree_id: &state.tree_id,
                local_index,
                uuid: &item.uuid,
                body_b64: &item.entry.body,
                integrated_time: item.entry.integrated_time,
                checkpoint: proof.map(|proof| proof.checkpoint.as_str()),
            };

            match rekor_parser::parse_entry(input, Utc::now()) {
                Ok(entry) => {
                    let row = encode_rekor_row(&entry);
                    let sent = tokio::select! {
                        () = cancel.cancelled() => None,
                        sent = rows_tx.send(row) => sent.ok(),
                    };
                    if sent.is_none() {
                        return Ok(next_global);
                    }
                }
                Err(err) if err.is_fatal() => {
                    error!(uuid = item.uuid, global, error = %err, "tree identity violated, unwinding");
                    cancel.cancel();
                    return Err(IngestError::CheckpointMismatch(err.to_string()));
                }
                Err(err) => {
                    warn!(uuid = item.uuid, global, error = %err, "dropping undecodable entry");
                }
            }

            next_global = global + 1;
        }
    }
}

async fn fetch_state<F, Fut>(
    cancel: &CancellationToken,
    governor: &Arc<RateGovernor>,
    op: F,
) -> Result<LogState, FetchError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<LogState, FetchError>>,
{
    let governor = Arc::clone(governor);
    with_retries(cancel, move || governor.on_rate_limited(), op)
        .await
        .map(|outcome| outcome.value)
}

async fn wait_poll(cancel: &CancellationToken, interval: Duration) -> ControlFlow<()> {
    tokio::select! {
        () = cancel.cancelled() => ControlFlow::Break(()),
        () = tokio::time::sleep(interval) => ControlFlow::Continue(()),
    }
}

/// Common tail: stop producing, let the sink drain, merge the results.
async fn shutdown(
    cancel: CancellationToken,
    rows_tx: mpsc::Sender<Row>,
    sink: tokio::task::JoinHandle<Result<u64, IngestError>>,
    loop_result: Result<(), IngestError>,
) -> Result<(), IngestError> {
    cancel.cancel();
    drop(rows_tx);

    let sink_result = match sink.await {
        Ok(Ok(committed)) => {
            info!(committed, "sink drained");
            Ok(())
        }
        Ok(Err(err)) => Err(err),
        Err(join_err) => Err(IngestError::Store(StoreError::Transport(format!(
            "sink task failed: {join_err}"
        )))),
    };

    loop_result.and(sink_result)
}

#[cfg(test)]
mod tests {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use treeline_client::rekor::{InclusionProof, RekorLogEntry, Verification};
    use treeline_primitives::InactiveShard;

    use super::*;

    fn rekor_entry(global: u64, local: u64, checkpoint: &str) -> RetrievedEntry {
        let body = serde_json::json!({
            "apiVersion": "0.0.1",
            "kind": "rekord",
            "spec": {}
        });

        RetrievedEntry {
            uuid: format!("uuid-{global}"),
            entry: RekorLogEntry {
                log_id: "c0d2".to_owned(),
                log_index: global,
                body: BASE64.encode(body.to_string()),
                integrated_time: 1_650_000_000,
                verification: Verification {
                    inclusion_proof: Some(InclusionProof {
                        log_index: local,
                        root_hash: "root".to_owned(),
                        tree_size: 5_000,
                        hashes: Vec::new(),
                        checkpoint: checkpoint.to_owned(),
                    }),
                    signed_entry_timestamp: "set".to_owned(),
                },
            },
        }
    }

    fn sharded_state() -> LogState {
        LogState {
            tree_id: "T2".to_owned(),
            tree_size: 5_000,
            inactive: vec![InactiveShard {
                tree_id: "T1".to_owned(),
                tree_size: 100,
            }],
        }
    }

    #[tokio::test]
    async fn rekor_stage_persists_tree_local_indices() {
        let (ordered_tx, ordered_rx) = mpsc::channel(8);
        let (rows_tx, mut rows_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let stage = tokio::spawn(rekor_parse_stage(
            sharded_state(),
            105,
            ordered_rx,
            rows_tx,
            cancel,
        ));

        // Global index 105 sits at local index 5 behind a 100-leaf
        // inactive shard.
        ordered_tx
            .send(BatchResult {
                batch_index: 0,
                start_index: 105,
                items: vec![rekor_entry(105, 5, "rekor.example - T2\n5000\nroot\n")],
            })
            .await
            .unwrap();
        drop(ordered_tx);

        let row = rows_rx.recv().await.unwrap();
        // tree_id, idx lead the fixed column order.
        assert_eq!(row[0], treeline_store::SqlValue::Str("T2".to_owned()));
        assert_eq!(row[1], treeline_store::SqlValue::U64(5));

        assert_eq!(stage.await.unwrap().unwrap(), 106);
    }

    #[tokio::test]
    async fn rekor_stage_aborts_on_checkpoint_mismatch() {
        let (ordered_tx, ordered_rx) = mpsc::channel(8);
        let (rows_tx, mut rows_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let stage = tokio::spawn(rekor_parse_stage(
            sharded_state(),
            100,
            ordered_rx,
            rows_tx,
            cancel.clone(),
        ));

        ordered_tx
            .send(BatchResult {
                batch_index: 0,
                start_index: 100,
                items: vec![
                    rekor_entry(100, 0, "rekor.example - T2\n5000\nroot\n"),
                    rekor_entry(101, 1, "rekor.example - T_OTHER\n5000\nroot\n"),
                ],
            })
            .await
            .unwrap();

        let result = stage.await.unwrap();
        assert!(matches!(result, Err(IngestError::CheckpointMismatch(_))));
        assert!(cancel.is_cancelled());

        // The row before the violation was emitted, the violating one
        // was not.
        let first = rows_rx.recv().await.unwrap();
        assert_eq!(first[1], treeline_store::SqlValue::U64(0));
        assert!(rows_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn ct_stage_skips_undecodable_leaves() {
        let (ordered_tx, ordered_rx) = mpsc::channel(8);
        let (rows_tx, mut rows_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let stage = tokio::spawn(ct_parse_stage(
            "ct.example.com/log".to_owned(),
            40,
            ordered_rx,
            rows_tx,
            cancel,
        ));

        // A framed leaf around garbage DER parses into a partial row; a
        // leaf that is not even base64 is dropped.
        let mut good = vec![0_u8, 0];
        good.extend_from_slice(&1_700_000_000_000_u64.to_be_bytes());
        good.extend_from_slice(&0_u16.to_be_bytes());
        good.extend_from_slice(&[0, 0, 3]);
        good.extend_from_slice(b"der");
        good.extend_from_slice(&[0, 0]);

        ordered_tx
            .send(BatchResult {
                batch_index: 0,
                start_index: 40,
                items: vec![
                    CtLeaf {
                        leaf_input: BASE64.encode(&good),
                        extra_data: String::new(),
                    },
                    CtLeaf {
                        leaf_input: "!!!".to_owned(),
                        extra_data: String::new(),
                    },
                ],
            })
            .await
            .unwrap();
        drop(ordered_tx);

        let row = rows_rx.recv().await.unwrap();
        assert_eq!(row[1], treeline_store::SqlValue::U64(40));
        assert!(rows_rx.recv().await.is_none());

        // The undecodable leaf still advances the cursor.
        assert_eq!(stage.await.unwrap(), 42);
    }
}
