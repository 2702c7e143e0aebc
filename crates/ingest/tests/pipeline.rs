//! End-to-end pipeline tests over mock log and store endpoints:
//! scheduler -> assembler -> parser stage -> sink.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use treeline_client::ct::CtLeaf;
use treeline_client::FetchError;
use treeline_ingest::assembler::run_assembler;
use treeline_ingest::batch::{BatchOutcome, BatchSource};
use treeline_ingest::governor::RateGovernor;
use treeline_ingest::resume::resolve_start_index;
use treeline_ingest::scheduler::{run_schedule, RangePlan, ScheduleEnd};
use treeline_ingest::sink::{run_sink, SinkConfig};
use treeline_ingest::supervisor::ct_parse_stage;
use treeline_store::{IndexLookup, Row, RowWriter, SqlValue, StoreError};

/// Deterministic CT log: every leaf is a framed x509 entry whose DER is
/// the index rendered as text, with the index doubling as the entry
/// timestamp.
struct FakeCtLog {
    head: u64,
}

fn leaf_input(index: u64) -> String {
    let der = format!("certificate #{index}");
    let mut leaf = vec![0_u8, 0];
    leaf.extend_from_slice(&(1_700_000_000_000 + index).to_be_bytes());
    leaf.extend_from_slice(&0_u16.to_be_bytes());
    leaf.extend_from_slice(&[0, 0, der.len() as u8]);
    leaf.extend_from_slice(der.as_bytes());
    leaf.extend_from_slice(&[0, 0]);
    BASE64.encode(leaf)
}

#[async_trait]
impl BatchSource for FakeCtLog {
    type Item = CtLeaf;

    async fn fetch(
        &self,
        start: u64,
        count: u64,
        _cancel: &CancellationToken,
    ) -> Result<BatchOutcome<CtLeaf>, FetchError> {
        if start >= self.head {
            return Err(FetchError::EndOfLog);
        }

        let until = (start + count).min(self.head);
        let items = (start..until)
            .map(|index| CtLeaf {
                leaf_input: leaf_input(index),
                extra_data: String::new(),
            })
            .collect();

        Ok(BatchOutcome {
            items,
            rate_limited: false,
            end_of_log: until < start + count,
        })
    }
}

/// Captures every committed row and serves max-index lookups from them.
#[derive(Default)]
struct MemoryStore {
    rows: Mutex<Vec<Row>>,
}

impl MemoryStore {
    fn indices(&self) -> Vec<u64> {
        self.rows
            .lock()
            .iter()
            .map(|row| match row[1] {
                SqlValue::U64(index) => index,
                ref other => panic!("index column held {other:?}"),
            })
            .collect()
    }
}

#[async_trait]
impl RowWriter for MemoryStore {
    async fn write_rows(&self, rows: &[Row]) -> Result<(), StoreError> {
        self.rows.lock().extend_from_slice(rows);
        Ok(())
    }
}

#[async_trait]
impl IndexLookup for MemoryStore {
    async fn max_index(&self, _log_id: &str) -> Result<Option<u64>, StoreError> {
        Ok(self.indices().into_iter().max())
    }
}

async fn mirror_range(
    store: Arc<MemoryStore>,
    head: u64,
    from: u64,
    per_request: u64,
    concurrency: usize,
) -> ScheduleEnd {
    let governor = Arc::new(RateGovernor::new(concurrency));
    let cancel = CancellationToken::new();

    let (batch_tx, batch_rx) = mpsc::channel(64);
    let (ordered_tx, ordered_rx) = mpsc::channel(64);
    let (emitted_tx, emitted_rx) = watch::channel(0);
    let (rows_tx, rows_rx) = mpsc::channel(5_000);

    let sink = tokio::spawn(run_sink(
        rows_rx,
        store as Arc<dyn RowWriter>,
        SinkConfig::new(100),
        cancel.clone(),
    ));
    let assembler = tokio::spawn(run_assembler(
        batch_rx,
        ordered_tx,
        emitted_tx,
        cancel.clone(),
    ));
    let parser = tokio::spawn(ct_parse_stage(
        "ct.example.com/log".to_owned(),
        from,
        ordered_rx,
        rows_tx,
        cancel.clone(),
    ));

    let end = run_schedule(
        Arc::new(FakeCtLog { head }),
        governor,
        RangePlan {
            from,
            until: head,
            per_request,
        },
        batch_tx,
        emitted_rx,
        cancel,
    )
    .await;

    assembler.await.unwrap();
    let _next = parser.await.unwrap();
    sink.await.unwrap().unwrap();

    end
}

#[tokio::test]
async fn catch_up_emits_every_index_in_order() {
    let store = Arc::new(MemoryStore::default());

    let end = mirror_range(Arc::clone(&store), 1_000, 0, 100, 4).await;

    assert_eq!(end, ScheduleEnd::Completed);

    let indices = store.indices();
    assert_eq!(indices.len(), 1_000);
    assert_eq!(indices, (0..1_000).collect::<Vec<_>>());
    assert_eq!(store.max_index("ct.example.com/log").await.unwrap(), Some(999));
}

#[tokio::test]
async fn restart_resumes_exactly_after_the_stored_max() {
    let store = Arc::new(MemoryStore::default());

    // First run covers a 42-leaf log.
    let _end = mirror_range(Arc::clone(&store), 42, 0, 10, 2).await;
    assert_eq!(store.indices().len(), 42);

    // The head grows to 50; a restart with -1 picks up at 42.
    let resumed = resolve_start_index(store.as_ref(), "ct.example.com/log", -1)
        .await
        .unwrap();
    assert_eq!(resumed, 42);

    let _end = mirror_range(Arc::clone(&store), 50, resumed, 10, 2).await;

    let indices = store.indices();
    assert_eq!(indices, (0..50).collect::<Vec<_>>());
}

#[tokio::test]
async fn rows_survive_certificate_parse_failures() {
    // Every "DER" in the fake log is garbage, yet every index lands in
    // the store with its hash and raw leaf.
    let store = Arc::new(MemoryStore::default());

    let _end = mirror_range(Arc::clone(&store), 25, 0, 5, 3).await;

    let rows = store.rows.lock();
    assert_eq!(rows.len(), 25);
    for row in rows.iter() {
        // cert_sha256 (column 6) is always present, raw leaf never
        // empty.
        assert!(matches!(row[6], SqlValue::Str(_)));
        assert!(matches!(row[5], SqlValue::Str(ref leaf) if !leaf.is_empty()));
    }
}
