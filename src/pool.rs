//! Worker Pool (C3, `SPEC_FULL.md` §4.5).
//!
//! One pool per destination endpoint: a bounded `tokio::sync::mpsc` channel of capacity `N`
//! (the worker count) plays the role of the distilled spec's single-slot, sleep-polled queue —
//! `enqueue` is a blocking `send`, which is exactly the backpressure contract without a manual
//! mutex/condvar pair.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use mongodb::bson::Document;
use mongodb::options::{InsertManyOptions, WriteConcern};
use mongodb::Client;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::connection::{self, Endpoint};
use crate::error::{Error, Result};
use crate::namespace::Namespace;

/// An ordered, non-empty sequence of documents destined for the same destination namespace.
#[derive(Clone, Debug)]
pub struct WriteBatch(Vec<Document>);

impl WriteBatch {
    /// Build a batch from `documents`, or `None` if it is empty.
    pub fn new(documents: Vec<Document>) -> Option<Self> {
        if documents.is_empty() {
            None
        } else {
            Some(WriteBatch(documents))
        }
    }

    /// A batch holding a single document (the tailer's insert-during-`Catchup` case).
    pub fn single(document: Document) -> Self {
        WriteBatch(vec![document])
    }

    /// Number of documents in the batch.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the batch is empty. Always `false`: batches are never constructed empty.
    pub fn is_empty(&self) -> bool {
        false
    }

    fn into_documents(self) -> Vec<Document> {
        self.0
    }
}

struct WriteUnit {
    ns: Namespace,
    batch: WriteBatch,
}

/// A bounded set of writer tasks draining a single-producer queue of write batches, one pool
/// per destination endpoint.
pub struct WorkerPool {
    endpoint: Endpoint,
    threads: usize,
    sender: mpsc::Sender<WriteUnit>,
    receiver: Arc<Mutex<Option<mpsc::Receiver<WriteUnit>>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    pending: Arc<AtomicUsize>,
    notify: Arc<Notify>,
    failed_documents: Arc<AtomicUsize>,
    cancellation: CancellationToken,
}

impl WorkerPool {
    /// Build a pool of `threads` workers writing to `endpoint`, sharing `cancellation` with the
    /// rest of the pipeline.
    pub fn new(endpoint: Endpoint, threads: usize, cancellation: CancellationToken) -> Self {
        let (sender, receiver) = mpsc::channel(threads.max(1));

        WorkerPool {
            endpoint,
            threads: threads.max(1),
            sender,
            receiver: Arc::new(Mutex::new(Some(receiver))),
            handles: Mutex::new(Vec::new()),
            pending: Arc::new(AtomicUsize::new(0)),
            notify: Arc::new(Notify::new()),
            failed_documents: Arc::new(AtomicUsize::new(0)),
            cancellation,
        }
    }

    /// Number of documents a worker gave up on after the continue-on-error retry also failed.
    pub fn failed_documents(&self) -> usize {
        self.failed_documents.load(Ordering::SeqCst)
    }

    /// Enqueue `batch` for `ns`, blocking while the channel is full.
    ///
    /// Starts the worker tasks lazily on the first call. Backpressure falls directly out of the
    /// bounded channel: once `threads` batches are in flight, this `.await` simply does not
    /// resolve until a worker drains one.
    pub async fn enqueue(&self, ns: Namespace, batch: WriteBatch) -> Result<()> {
        self.ensure_started().await;

        self.pending.fetch_add(1, Ordering::SeqCst);

        if self.sender.send(WriteUnit { ns, batch }).await.is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::Shutdown);
        }

        Ok(())
    }

    /// Block until the queue is empty and no worker is mid-write.
    ///
    /// Required between `Clone` and `Catchup` (§4.3) to establish the happens-before edge that
    /// lets the tailer safely start re-applying mutations against a namespace.
    pub async fn drain(&self) {
        loop {
            if self.pending.load(Ordering::SeqCst) == 0 {
                return;
            }

            let notified = self.notify.notified();

            if self.pending.load(Ordering::SeqCst) == 0 {
                return;
            }

            notified.await;
        }
    }

    /// Signal every worker to stop at its next suspension point and join them all.
    pub async fn shutdown(self) {
        self.cancellation.cancel();

        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
    }

    async fn ensure_started(&self) {
        let mut handles = self.handles.lock().await;
        if !handles.is_empty() {
            return;
        }

        for id in 0..self.threads {
            let receiver = Arc::clone(&self.receiver);
            let endpoint = self.endpoint.clone();
            let pending = Arc::clone(&self.pending);
            let notify = Arc::clone(&self.notify);
            let failed = Arc::clone(&self.failed_documents);
            let cancellation = self.cancellation.clone();

            handles.push(tokio::spawn(async move {
                worker_loop(id, receiver, endpoint, pending, notify, failed, cancellation).await;
            }));
        }
    }
}

async fn worker_loop(
    id: usize,
    receiver: Arc<Mutex<Option<mpsc::Receiver<WriteUnit>>>>,
    endpoint: Endpoint,
    pending: Arc<AtomicUsize>,
    notify: Arc<Notify>,
    failed_documents: Arc<AtomicUsize>,
    cancellation: CancellationToken,
) {
    let client = match connection::connect(&endpoint).await {
        Ok(client) => client,
        Err(e) => {
            error!("worker {} failed to connect to {}: {}", id, endpoint.address, e);
            return;
        }
    };

    loop {
        let unit = {
            // Only one worker at a time holds the lock while awaiting `recv`, so fan-out across
            // the pool's N workers happens as the lock is released and reacquired.
            let mut guard = receiver.lock().await;
            let receiver = match guard.as_mut() {
                Some(r) => r,
                None => return,
            };

            tokio::select! {
                biased;
                _ = cancellation.cancelled() => None,
                item = receiver.recv() => item,
            }
        };

        let unit = match unit {
            Some(unit) => unit,
            None => break,
        };

        apply_batch(&client, &unit, &failed_documents).await;

        pending.fetch_sub(1, Ordering::SeqCst);
        notify.notify_waiters();
    }
}

async fn apply_batch(client: &Client, unit: &WriteUnit, failed_documents: &AtomicUsize) {
    let collection = client
        .database(unit.ns.db())
        .collection::<Document>(unit.ns.coll());

    let documents = unit.batch.clone().into_documents();

    let options = InsertManyOptions::builder()
        .ordered(false)
        .write_concern(WriteConcern::builder().w(mongodb::options::Acknowledgment::from(0)).build())
        .build();

    if let Err(e) = collection.insert_many(documents.clone(), options).await {
        warn!(
            "bulk insert into {} failed ({}), retrying with continue-on-error",
            unit.ns, e
        );

        for document in documents {
            if let Err(e) = collection.insert_one(document, None).await {
                if is_duplicate_key(&e) {
                    continue;
                }

                failed_documents.fetch_add(1, Ordering::SeqCst);
                error!("document write into {} failed permanently: {}", unit.ns, e);
            }
        }
    }
}

/// Whether a driver error is a duplicate-`_id` write error, which clone overlap makes routine
/// rather than exceptional (§4.3, §4.4).
fn is_duplicate_key(error: &mongodb::error::Error) -> bool {
    use mongodb::error::ErrorKind;

    match error.kind.as_ref() {
        ErrorKind::Write(mongodb::error::WriteFailure::WriteError(we)) => we.code == 11000,
        ErrorKind::BulkWrite(bw) => bw
            .write_errors
            .iter()
            .flatten()
            .any(|we| we.code == 11000),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_batch_rejects_empty_input() {
        assert!(WriteBatch::new(Vec::new()).is_none());
    }

    #[test]
    fn write_batch_accepts_non_empty_input() {
        let batch = WriteBatch::new(vec![Document::new()]).unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn drain_returns_immediately_when_never_enqueued() {
        let pool = WorkerPool::new(Endpoint::new("localhost:27017"), 2, CancellationToken::new());
        pool.drain().await;
    }
}
