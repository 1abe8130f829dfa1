//! Cloner (C4, `SPEC_FULL.md` §4.3).
//!
//! Enumerates every in-scope namespace on the source, streams its documents through a
//! snapshot-capable cursor, batches them by count and by serialised size, and hands each full
//! batch to the destination's [`WorkerPool`]. Index definitions are replayed once the last
//! document of a namespace has been streamed.

use std::sync::Arc;

use futures::TryStreamExt;
use mongodb::bson::Document;
use mongodb::options::{FindOptions, ReadConcern};
use mongodb::{Client, IndexModel};
use tracing::{info, warn};

use crate::connection::{self, Endpoint};
use crate::error::Result;
use crate::filter::Filter;
use crate::namespace::Namespace;
use crate::pool::{WorkerPool, WriteBatch};

/// Max documents per write batch, per §4.3's default.
const DEFAULT_MAX_BATCH_DOCS: usize = 1000;
/// 16 MiB minus headroom for BSON/wire overhead, per §4.3's default.
const MAX_BATCH_BYTES: usize = 16 * 1024 * 1024 - 64 * 1024;

/// Streams existing documents and indexes from the source into the destination's worker pool.
pub struct Cloner {
    source: Endpoint,
    destination: Endpoint,
    filter: Filter,
    pool: Arc<WorkerPool>,
    max_batch_docs: usize,
    use_majority_reads: bool,
}

impl Cloner {
    /// Build a cloner reading from `source` and writing through `pool` (and directly to
    /// `destination` for collection/index creation).
    pub fn new(
        source: Endpoint,
        destination: Endpoint,
        filter: Filter,
        pool: Arc<WorkerPool>,
        batch_size: usize,
        use_majority_reads: bool,
    ) -> Self {
        Cloner {
            source,
            destination,
            filter,
            pool,
            max_batch_docs: batch_size.max(1).min(DEFAULT_MAX_BATCH_DOCS),
            use_majority_reads,
        }
    }

    /// Enumerate every in-scope namespace on the source and clone each one in turn.
    pub async fn clone_all(&self) -> Result<()> {
        let source = connection::connect(&self.source).await?;
        let destination = connection::connect(&self.destination).await?;

        for db_name in source.list_database_names(None, None).await? {
            for coll_name in source.database(&db_name).list_collection_names(None).await? {
                let ns = Namespace::new(db_name.clone(), coll_name);

                if !self.filter.accept(&ns) {
                    continue;
                }

                info!("cloning {}", ns);
                self.clone_namespace(&source, &destination, &ns).await?;
            }
        }

        Ok(())
    }

    async fn clone_namespace(&self, source: &Client, destination: &Client, ns: &Namespace) -> Result<()> {
        self.ensure_destination_collection(destination, ns).await?;

        let read_concern = if self.use_majority_reads {
            Some(ReadConcern::majority())
        } else {
            None
        };

        let options = FindOptions::builder()
            .no_cursor_timeout(true)
            .read_concern(read_concern)
            .build();

        let collection = source.database(ns.db()).collection::<Document>(ns.coll());
        let mut cursor = collection.find(None, options).await?;

        let mut batch: Vec<Document> = Vec::new();
        let mut batch_bytes = 0usize;
        let mut total = 0u64;

        while let Some(document) = cursor.try_next().await? {
            let size = mongodb::bson::to_vec(&document).map(|v| v.len()).unwrap_or(0);

            if !batch.is_empty()
                && (batch.len() >= self.max_batch_docs || batch_bytes + size > MAX_BATCH_BYTES)
            {
                self.flush(ns, std::mem::take(&mut batch)).await?;
                batch_bytes = 0;
            }

            batch_bytes += size;
            batch.push(document);
            total += 1;
        }

        if !batch.is_empty() {
            self.flush(ns, batch).await?;
        }

        info!("cloned {} documents from {}", total, ns);

        self.replay_indexes(source, destination, ns).await
    }

    async fn flush(&self, ns: &Namespace, documents: Vec<Document>) -> Result<()> {
        if let Some(batch) = WriteBatch::new(documents) {
            self.pool.enqueue(ns.clone(), batch).await?;
        }

        Ok(())
    }

    async fn ensure_destination_collection(&self, destination: &Client, ns: &Namespace) -> Result<()> {
        match destination.database(ns.db()).create_collection(ns.coll(), None).await {
            Ok(()) => Ok(()),
            Err(e) if is_namespace_exists(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn replay_indexes(&self, source: &Client, destination: &Client, ns: &Namespace) -> Result<()> {
        let source_collection = source.database(ns.db()).collection::<Document>(ns.coll());
        let mut indexes = source_collection.list_indexes(None).await?;

        let destination_collection = destination
            .database(ns.db())
            .collection::<Document>(ns.coll());

        while let Some(index) = indexes.try_next().await? {
            if is_id_index(&index) {
                continue;
            }

            if let Err(e) = destination_collection.create_index(index, None).await {
                warn!("failed to replay an index on {}, skipping it: {}", ns, e);
            }
        }

        Ok(())
    }
}

/// Whether `index` is the implicit `_id` index, which every collection gets for free and which
/// §4.3 says to skip when replaying.
fn is_id_index(index: &IndexModel) -> bool {
    let name_is_id = index
        .options
        .as_ref()
        .and_then(|o| o.name.as_ref())
        .map(|name| name == "_id_")
        .unwrap_or(false);

    let keys_are_id_only = index.keys.len() == 1 && index.keys.contains_key("_id");

    name_is_id || keys_are_id_only
}

pub(crate) fn is_namespace_exists(error: &mongodb::error::Error) -> bool {
    use mongodb::error::ErrorKind;

    matches!(
        error.kind.as_ref(),
        ErrorKind::Command(ce) if ce.code == 48
    )
}
