//! Oplog Tailer (C5, `SPEC_FULL.md` §4.4).
//!
//! The low-level [`Oplog`]/[`OplogBuilder`] pair is the teacher crate's original tailable-cursor
//! stream over `local.oplog.rs`, kept almost unchanged; [`OplogTailer`] is built on top of it and
//! adds start-timestamp pinning, translation of each `Operation` into a destination mutation,
//! cursor-resumption-from-checkpoint, and periodic checkpoint persistence.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{ready, Stream, StreamExt};
use mongodb::bson::{doc, Document, Timestamp};
use mongodb::options::{
    CursorType, DeleteOptions, FindOneOptions, FindOptions, IndexOptions, UpdateModifications,
    UpdateOptions,
};
use mongodb::Client;
use mongodb::Cursor;
use mongodb::IndexModel;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::connection::{self, Endpoint};
use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::namespace::Namespace;
use crate::oper::Operation;
use crate::pool::{WorkerPool, WriteBatch};

/// A MongoDB replica set oplog exposed as a `Stream` of `Operation`s.
///
/// Iterating over this effectively never ends on a healthy replica set: the underlying cursor is
/// tailable and awaits new entries as they are written.
pub struct Oplog {
    cursor: Cursor<Document>,
}

impl Oplog {
    /// Creates an instance with default options.
    pub async fn new(client: &Client) -> Result<Oplog> {
        OplogBuilder::new().build(client).await
    }

    /// Builder to configure the oplog cursor.
    pub fn builder() -> OplogBuilder {
        OplogBuilder::new()
    }
}

impl Stream for Oplog {
    type Item = Result<Operation>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if let Some(res) = ready!(Pin::new(&mut this.cursor).poll_next(cx)) {
            match res {
                Ok(v) => match Operation::new(&v) {
                    Ok(o) => Some(Ok(o)).into(),
                    Err(e) => Some(Err(e)).into(),
                },
                Err(e) => Some(Err(e.into())).into(),
            }
        } else {
            // The cursor is over; on a tailable collection this typically means `oplog.rs` is
            // empty. See https://jira.mongodb.org/browse/SERVER-13955
            None.into()
        }
    }
}

/// A builder for an [`Oplog`].
#[derive(Clone, Default)]
pub struct OplogBuilder {
    filter: Option<Document>,
    batch_size: Option<u32>,
}

impl OplogBuilder {
    pub(crate) fn new() -> OplogBuilder {
        OplogBuilder::default()
    }

    /// Restrict the oplog to entries matching `filter`. Empty by default, so all operations are
    /// returned.
    pub fn filter(mut self, filter: Document) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Restrict the oplog to entries at or after `ts` (the Timestamp cursor's `oplogStart`, §3).
    pub fn after_timestamp(mut self, ts: Timestamp) -> Self {
        let bound = doc! { "ts": { "$gte": ts } };
        self.filter = Some(match self.filter.take() {
            Some(existing) => doc! { "$and": [existing, bound] },
            None => bound,
        });
        self
    }

    /// Set the `batch_size` option on the underlying cursor.
    pub fn batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// Execute the query and build the [`Oplog`] over `client`.
    pub async fn build(self, client: &Client) -> Result<Oplog> {
        let coll = client.database("local").collection("oplog.rs");

        let opts = FindOptions::builder()
            .no_cursor_timeout(true)
            .cursor_type(CursorType::TailableAwait)
            .batch_size(self.batch_size)
            .build();

        let cursor = coll.find(self.filter, opts).await?;

        Ok(Oplog { cursor })
    }
}

/// How the tailer should apply an insert: batched through the pool during `Catchup`, or directly
/// so `appliedThrough` advances on every op during `Steady` (§4.4).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyMode {
    /// Enqueue inserts as one-element batches; other op kinds are still applied synchronously.
    Catchup,
    /// Apply every op inline.
    Steady,
}

/// Thread-safe holder for the tailer's `appliedThrough` position (§3, §5).
///
/// A single atomic suffices: it is written only by the tailer and read by the checkpointer and
/// the orchestrator.
#[derive(Clone)]
pub struct AppliedThrough(Arc<AtomicU64>);

impl AppliedThrough {
    /// Initialise at `ts`.
    pub fn new(ts: Timestamp) -> Self {
        AppliedThrough(Arc::new(AtomicU64::new(pack(ts))))
    }

    /// Current position.
    pub fn get(&self) -> Timestamp {
        unpack(self.0.load(Ordering::SeqCst))
    }

    /// Advance to `ts`. Never rewinds: a `ts` older than the current position is ignored.
    pub fn advance(&self, ts: Timestamp) {
        let packed = pack(ts);
        let _ = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                if packed > current {
                    Some(packed)
                } else {
                    None
                }
            });
    }
}

fn pack(ts: Timestamp) -> u64 {
    (u64::from(ts.time) << 32) | u64::from(ts.increment)
}

fn unpack(packed: u64) -> Timestamp {
    Timestamp {
        time: (packed >> 32) as u32,
        increment: packed as u32,
    }
}

/// Recover the BSON `Timestamp` an `Operation` was converted from.
///
/// `Operation::new` folds a BSON timestamp's `(time, increment)` pair into a `DateTime<Utc>` by
/// using the timestamp's seconds as the datetime's seconds and its increment as the datetime's
/// nanosecond component (see `oper.rs`); this undoes that packing.
fn bson_timestamp(dt: DateTime<Utc>) -> Timestamp {
    Timestamp {
        time: dt.timestamp() as u32,
        increment: dt.timestamp_subsec_nanos(),
    }
}

/// The smallest increment strictly after `ts`, used to resume a broken cursor (§4.4).
fn epsilon_after(ts: Timestamp) -> Timestamp {
    match ts.increment.checked_add(1) {
        Some(increment) => Timestamp {
            time: ts.time,
            increment,
        },
        None => Timestamp {
            time: ts.time + 1,
            increment: 0,
        },
    }
}

const CHECKPOINT_EVERY_OPS: u64 = 1000;
const CHECKPOINT_EVERY: Duration = Duration::from_secs(10);

/// Follows the source's oplog from a pinned start position and reapplies each entry to the
/// destination.
pub struct OplogTailer {
    source: Endpoint,
    destination: Endpoint,
    filter: Filter,
    pool: Arc<WorkerPool>,
    checkpoints: Option<CheckpointStore>,
    source_id: String,
    oplog_end: Option<Timestamp>,
}

impl OplogTailer {
    /// Build a tailer for `source`, writing to `destination` (directly or via `pool`).
    pub fn new(
        source: Endpoint,
        destination: Endpoint,
        filter: Filter,
        pool: Arc<WorkerPool>,
        source_id: impl Into<String>,
        oplog_end: Option<Timestamp>,
    ) -> Self {
        OplogTailer {
            source,
            destination,
            filter,
            pool,
            checkpoints: None,
            source_id: source_id.into(),
            oplog_end,
        }
    }

    /// Persist checkpoints to `store` as tailing progresses.
    pub fn with_checkpoints(mut self, store: CheckpointStore) -> Self {
        self.checkpoints = Some(store);
        self
    }

    /// Earliest timestamp currently retained in the source oplog, used to detect roll-off.
    pub async fn oplog_window_start(source: &Client) -> Result<Option<Timestamp>> {
        let coll = source.database("local").collection::<Document>("oplog.rs");
        let opts = FindOneOptions::builder().sort(doc! { "$natural": 1 }).build();
        let earliest = coll.find_one(doc! {}, opts).await?;

        Ok(earliest.and_then(|d| d.get_timestamp("ts").ok()))
    }

    /// Follow the oplog from `start` until `cancellation` fires or `oplog_end` is reached.
    ///
    /// `steady` is read before applying every entry: while it is `false` inserts are batched
    /// through the pool (`Catchup`), once the orchestrator flips it to `true` every op is applied
    /// inline (`Steady`) so `appliedThrough` advances on each one (§4.2, §4.4).
    pub async fn run(
        &self,
        start: Timestamp,
        steady: Arc<std::sync::atomic::AtomicBool>,
        applied_through: AppliedThrough,
        cancellation: CancellationToken,
    ) -> Result<()> {
        let source_client = connection::connect(&self.source).await?;
        let destination_client = connection::connect(&self.destination).await?;

        let mut resume_from = start;
        let mut ops_since_checkpoint: u64 = 0;
        let mut last_checkpoint = tokio::time::Instant::now();

        'reconnect: loop {
            if cancellation.is_cancelled() {
                return Ok(());
            }

            if let Some(window_start) = Self::oplog_window_start(&source_client).await? {
                if resume_from < window_start {
                    return Err(Error::OplogRolledOff {
                        needed: format!("{:?}", resume_from),
                    });
                }
            }

            let mut oplog = Oplog::builder()
                .after_timestamp(resume_from)
                .build(&source_client)
                .await?;

            loop {
                tokio::select! {
                    biased;
                    _ = cancellation.cancelled() => {
                        return Ok(());
                    }
                    next = oplog.next() => {
                        match next {
                            Some(Ok(op)) => {
                                let ts = bson_timestamp(op.timestamp());

                                if let Some(end) = self.oplog_end {
                                    if ts > end {
                                        info!("reached configured oplog_end, stopping tail");
                                        return Ok(());
                                    }
                                }

                                let mode = if steady.load(Ordering::SeqCst) {
                                    ApplyMode::Steady
                                } else {
                                    ApplyMode::Catchup
                                };

                                self.apply(&destination_client, &op, mode).await?;

                                resume_from = ts;
                                applied_through.advance(ts);
                                ops_since_checkpoint += 1;

                                if ops_since_checkpoint >= CHECKPOINT_EVERY_OPS
                                    || last_checkpoint.elapsed() >= CHECKPOINT_EVERY
                                {
                                    self.checkpoint(ts).await?;
                                    ops_since_checkpoint = 0;
                                    last_checkpoint = tokio::time::Instant::now();
                                }
                            }
                            Some(Err(e)) => {
                                warn!("oplog cursor broke: {}, resuming from {:?}", e, resume_from);
                                resume_from = epsilon_after(resume_from);
                                continue 'reconnect;
                            }
                            None => {
                                warn!("oplog cursor ended, resuming from {:?}", resume_from);
                                resume_from = epsilon_after(resume_from);
                                continue 'reconnect;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn checkpoint(&self, applied_through: Timestamp) -> Result<()> {
        if let Some(store) = &self.checkpoints {
            store
                .save(&Checkpoint {
                    source_id: self.source_id.clone(),
                    applied_through,
                    phase: "Steady".into(),
                    updated_at: chrono::Utc::now(),
                })
                .await?;
        }

        Ok(())
    }

    async fn apply(&self, destination: &Client, op: &Operation, mode: ApplyMode) -> Result<()> {
        match op {
            Operation::Noop { .. } => Ok(()),
            Operation::Insert {
                namespace,
                document,
                ..
            } => self.apply_insert(destination, namespace, document.clone(), mode).await,
            Operation::Update {
                namespace,
                query,
                update,
                ..
            } => self.apply_update(destination, namespace, query, update).await,
            Operation::Delete {
                namespace, query, ..
            } => self.apply_delete(destination, namespace, query).await,
            Operation::Command {
                namespace, command, ..
            } => self.apply_command(destination, namespace, command).await,
            Operation::ApplyOps { operations, .. } => {
                for nested in operations {
                    // Applied inline regardless of mode: appliedThrough only advances once the
                    // whole group has landed (§4.4).
                    Box::pin(self.apply(destination, nested, ApplyMode::Steady)).await?;
                }
                Ok(())
            }
        }
    }

    async fn apply_insert(
        &self,
        destination: &Client,
        namespace: &str,
        document: Document,
        mode: ApplyMode,
    ) -> Result<()> {
        let ns = match Namespace::parse(namespace) {
            Some(ns) => ns,
            None => return Ok(()),
        };

        if !self.filter.accept(&ns) {
            return Ok(());
        }

        match mode {
            ApplyMode::Catchup => {
                self.pool
                    .enqueue(ns, WriteBatch::single(document))
                    .await
            }
            ApplyMode::Steady => {
                let coll = destination
                    .database(ns.db())
                    .collection::<Document>(ns.coll());

                match coll.insert_one(document, None).await {
                    Ok(_) => Ok(()),
                    Err(e) if is_duplicate_key(&e) => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    async fn apply_update(
        &self,
        destination: &Client,
        namespace: &str,
        query: &Document,
        update: &Document,
    ) -> Result<()> {
        let ns = match Namespace::parse(namespace) {
            Some(ns) => ns,
            None => return Ok(()),
        };

        if !self.filter.accept(&ns) {
            return Ok(());
        }

        let coll = destination
            .database(ns.db())
            .collection::<Document>(ns.coll());

        let is_modifier = update.keys().next().map(|k| k.starts_with('$')).unwrap_or(false);
        let is_by_id_only = query.len() == 1 && query.contains_key("_id");

        // Upsert only on a full-document replacement keyed by `_id`: this preserves semantics
        // when an update races ahead of its own insert due to clone/tail interleaving (§4.4).
        let upsert = !is_modifier && is_by_id_only;

        let options = UpdateOptions::builder().upsert(upsert).build();
        let modification = UpdateModifications::Document(update.clone());

        if is_modifier {
            coll.update_one(query.clone(), modification, options).await?;
        } else {
            coll.replace_one(query.clone(), update.clone(), options).await?;
        }

        Ok(())
    }

    async fn apply_delete(
        &self,
        destination: &Client,
        namespace: &str,
        query: &Document,
    ) -> Result<()> {
        let ns = match Namespace::parse(namespace) {
            Some(ns) => ns,
            None => return Ok(()),
        };

        if !self.filter.accept(&ns) {
            return Ok(());
        }

        let coll = destination
            .database(ns.db())
            .collection::<Document>(ns.coll());

        coll.delete_one(query.clone(), DeleteOptions::default())
            .await?;

        Ok(())
    }

    async fn apply_command(
        &self,
        destination: &Client,
        namespace: &str,
        command: &Document,
    ) -> Result<()> {
        let db_name = namespace.split('.').next().unwrap_or(namespace);
        let db = destination.database(db_name);

        if let Ok(name) = command.get_str("create") {
            // Clone and tail overlap (§4.2) and a resumed tailer re-reads the op at
            // `appliedThrough` inclusively, so the cloner may already have created this
            // collection; treat "already exists" the same way the cloner does (§4.3).
            match db.create_collection(name, None).await {
                Ok(()) => {}
                Err(e) if crate::cloner::is_namespace_exists(&e) => {}
                Err(e) => return Err(e.into()),
            }
        } else if let Ok(name) = command.get_str("drop") {
            db.collection::<Document>(name).drop(None).await?;
        } else if command.contains_key("dropDatabase") {
            db.drop(None).await?;
        } else if let Ok(from) = command.get_str("renameCollection") {
            match command.get_str("to") {
                Ok(to) => {
                    let drop_target = command.get_bool("dropTarget").unwrap_or(false);

                    destination
                        .database("admin")
                        .run_command(
                            doc! {
                                "renameCollection": from,
                                "to": to,
                                "dropTarget": drop_target,
                            },
                            None,
                        )
                        .await?;
                }
                Err(_) => {
                    warn!("renameCollection command missing 'to', skipping: {:?}", command);
                }
            }
        } else if let Ok(coll_name) = command.get_str("createIndexes") {
            self.apply_create_indexes(&db, coll_name, command).await?;
        } else if command.contains_key("collMod") {
            db.run_command(command.clone(), None).await?;
        } else {
            warn!("unknown command op on {}, skipping: {:?}", namespace, command);
        }

        Ok(())
    }

    /// Replay a `createIndexes` command op, since an index created on the source after the
    /// clone has finished is otherwise only ever seen here (§4.4).
    async fn apply_create_indexes(
        &self,
        db: &mongodb::Database,
        coll_name: &str,
        command: &Document,
    ) -> Result<()> {
        let specs = match command.get_array("indexes") {
            Ok(specs) => specs,
            Err(_) => {
                warn!("createIndexes command missing 'indexes', skipping: {:?}", command);
                return Ok(());
            }
        };

        let collection = db.collection::<Document>(coll_name);

        for spec in specs {
            let spec = match spec.as_document() {
                Some(spec) => spec,
                None => continue,
            };

            let model = match index_model_from_spec(spec) {
                Some(model) => model,
                None => continue,
            };

            if let Err(e) = collection.create_index(model, None).await {
                warn!(
                    "failed to replay createIndexes on {}.{}: {}",
                    db.name(),
                    coll_name,
                    e
                );
            }
        }

        Ok(())
    }
}

/// Build an `IndexModel` from one entry of a `createIndexes` command's `indexes` array,
/// preserving the options the cloner's own index replay preserves (§4.3, §4.4).
fn index_model_from_spec(spec: &Document) -> Option<IndexModel> {
    let keys = spec.get_document("key").ok()?.clone();

    let mut options = IndexOptions::builder();

    if let Ok(name) = spec.get_str("name") {
        options = options.name(name.to_string());
    }
    if let Ok(unique) = spec.get_bool("unique") {
        options = options.unique(unique);
    }
    if let Ok(sparse) = spec.get_bool("sparse") {
        options = options.sparse(sparse);
    }
    if let Ok(partial) = spec.get_document("partialFilterExpression") {
        options = options.partial_filter_expression(partial.clone());
    }
    if let Ok(ttl) = spec.get_i32("expireAfterSeconds") {
        options = options.expire_after(Duration::from_secs(ttl.max(0) as u64));
    }

    Some(IndexModel::builder().keys(keys).options(options.build()).build())
}

fn is_duplicate_key(error: &mongodb::error::Error) -> bool {
    use mongodb::error::ErrorKind;

    matches!(
        error.kind.as_ref(),
        ErrorKind::Write(mongodb::error::WriteFailure::WriteError(we)) if we.code == 11000
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applied_through_never_rewinds() {
        let applied = AppliedThrough::new(Timestamp {
            time: 100,
            increment: 5,
        });

        applied.advance(Timestamp {
            time: 50,
            increment: 0,
        });
        assert_eq!(applied.get().time, 100);

        applied.advance(Timestamp {
            time: 200,
            increment: 1,
        });
        assert_eq!(applied.get().time, 200);
        assert_eq!(applied.get().increment, 1);
    }

    #[test]
    fn epsilon_after_increments_within_same_second() {
        let ts = Timestamp {
            time: 10,
            increment: 4,
        };
        let next = epsilon_after(ts);
        assert_eq!(next.time, 10);
        assert_eq!(next.increment, 5);
    }

    #[test]
    fn epsilon_after_rolls_into_next_second_on_overflow() {
        let ts = Timestamp {
            time: 10,
            increment: u32::MAX,
        };
        let next = epsilon_after(ts);
        assert_eq!(next.time, 11);
        assert_eq!(next.increment, 0);
    }
}
