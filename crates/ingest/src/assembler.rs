//! Ordered reassembly of out-of-order batches
//!
//! Workers finish in whatever order the network allows; the assembler
//! buffers their results in a dense `batch_index -> result` map and
//! releases them strictly by ascending batch index. Emitted entries are
//! dropped from the buffer immediately. The emission channel closes
//! exactly once, when this task returns, including under racing
//! cancellation.

use std::collections::BTreeMap;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::batch::BatchResult;

/// Runs until the worker channel closes or shutdown is requested.
///
/// `emitted` publishes the number of batches released so far; the
/// scheduler watches it to know when a chunk has fully drained.
pub async fn run_assembler<T: Send + 'static>(
    mut batch_rx: mpsc::Receiver<BatchResult<T>>,
    ordered_tx: mpsc::Sender<BatchResult<T>>,
    emitted: watch::Sender<u64>,
    cancel: CancellationToken,
) {
    let mut buffer: BTreeMap<u64, BatchResult<T>> = BTreeMap::new();
    let mut next_expected = 0_u64;

    loop {
        let result = tokio::select! {
            () = cancel.cancelled() => break,
            received = batch_rx.recv() => match received {
                Some(result) => result,
                None => break,
            },
        };

        if result.batch_index < next_expected || buffer.contains_key(&result.batch_index) {
            warn!(batch_index = result.batch_index, "dropping duplicate batch");
            continue;
        }

        let _previous = buffer.insert(result.batch_index, result);

        while let Some(batch) = buffer.remove(&next_expected) {
            let sent = tokio::select! {
                () = cancel.cancelled() => None,
                sent = ordered_tx.send(batch) => sent.ok(),
            };

            if sent.is_none() {
                debug!("assembler emission stopped");
                return;
            }

            next_expected += 1;
            let _ = emitted.send(next_expected);
        }
    }

    if !buffer.is_empty() {
        debug!(buffered = buffer.len(), "assembler exiting with undelivered batches");
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::*;

    fn batch(batch_index: u64, items: Vec<u32>) -> BatchResult<u32> {
        BatchResult {
            batch_index,
            start_index: batch_index * 10,
            items,
        }
    }

    #[tokio::test]
    async fn emits_in_batch_index_order() {
        let (batch_tx, batch_rx) = mpsc::channel(16);
        let (ordered_tx, mut ordered_rx) = mpsc::channel(16);
        let (emitted_tx, emitted_rx) = watch::channel(0);
        let cancel = CancellationToken::new();

        let assembler = tokio::spawn(run_assembler(batch_rx, ordered_tx, emitted_tx, cancel));

        // Reverse order of dispatch.
        for index in [3_u64, 2, 1, 0] {
            batch_tx.send(batch(index, vec![index as u32])).await.unwrap();
        }
        drop(batch_tx);

        let mut seen = Vec::new();
        while let Some(result) = ordered_rx.recv().await {
            seen.push(result.batch_index);
        }

        assert_eq!(seen, vec![0, 1, 2, 3]);
        assert_eq!(*emitted_rx.borrow(), 4);
        assembler.await.unwrap();
    }

    #[tokio::test]
    async fn holds_batches_until_the_gap_fills() {
        let (batch_tx, batch_rx) = mpsc::channel(16);
        let (ordered_tx, mut ordered_rx) = mpsc::channel(16);
        let (emitted_tx, emitted_rx) = watch::channel(0);
        let cancel = CancellationToken::new();

        let assembler = tokio::spawn(run_assembler(batch_rx, ordered_tx, emitted_tx, cancel));

        batch_tx.send(batch(1, vec![1])).await.unwrap();
        batch_tx.send(batch(2, vec![2])).await.unwrap();

        // Nothing can be released yet.
        tokio::task::yield_now().await;
        assert_eq!(*emitted_rx.borrow(), 0);

        batch_tx.send(batch(0, vec![0])).await.unwrap();

        assert_eq!(ordered_rx.recv().await.unwrap().batch_index, 0);
        assert_eq!(ordered_rx.recv().await.unwrap().batch_index, 1);
        assert_eq!(ordered_rx.recv().await.unwrap().batch_index, 2);

        drop(batch_tx);
        assembler.await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_stops_emission_and_closes_the_channel() {
        let (batch_tx, batch_rx) = mpsc::channel(16);
        let (ordered_tx, mut ordered_rx) = mpsc::channel(16);
        let (emitted_tx, _emitted_rx) = watch::channel(0);
        let cancel = CancellationToken::new();

        let assembler = tokio::spawn(run_assembler(
            batch_rx,
            ordered_tx,
            emitted_tx,
            cancel.clone(),
        ));

        batch_tx.send(batch(0, vec![0])).await.unwrap();
        assert_eq!(ordered_rx.recv().await.unwrap().batch_index, 0);

        cancel.cancel();
        assembler.await.unwrap();

        // The emission side is closed exactly once; the receiver sees
        // end-of-stream.
        assert!(ordered_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn duplicate_batches_are_dropped() {
        let (batch_tx, batch_rx) = mpsc::channel(16);
        let (ordered_tx, mut ordered_rx) = mpsc::channel(16);
        let (emitted_tx, _emitted_rx) = watch::channel(0);
        let cancel = CancellationToken::new();

        let assembler = tokio::spawn(run_assembler(batch_rx, ordered_tx, emitted_tx, cancel));

        batch_tx.send(batch(0, vec![1])).await.unwrap();
        batch_tx.send(batch(0, vec![2])).await.unwrap();
        drop(batch_tx);

        assert_eq!(ordered_rx.recv().await.unwrap().items, vec![1]);
        assert!(ordered_rx.recv().await.is_none());
        assembler.await.unwrap();
    }
}
