//! Checkpoint Store (A3, `SPEC_FULL.md` §4.7).
//!
//! A single control document per source-endpoint identity, namespace
//! `<replicator_db>.checkpoints` on the destination, letting the orchestrator resume tailing
//! without a fresh clone after a restart.

use chrono::{DateTime, Utc};
use mongodb::bson::{doc, Timestamp};
use mongodb::options::{FindOneOptions, UpdateOptions};
use mongodb::{Client, Collection};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Database on the destination holding the control collection; fixed per §4.7, not exposed as a
/// config flag.
const REPLICATOR_DB: &str = "_mongosync";
const CHECKPOINTS_COLLECTION: &str = "checkpoints";

/// A persisted `appliedThrough` position for one source endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Identity of the source endpoint (or shard) this checkpoint belongs to.
    pub source_id: String,
    /// The last oplog position known to be fully applied to the destination.
    pub applied_through: Timestamp,
    /// The pipeline phase at the time this checkpoint was written.
    pub phase: String,
    /// Wall-clock time the checkpoint was written.
    pub updated_at: DateTime<Utc>,
}

/// Handle onto the destination's `<replicator_db>.checkpoints` control collection.
pub struct CheckpointStore {
    collection: Collection<Checkpoint>,
}

impl CheckpointStore {
    /// Open the control collection on `client`.
    pub fn new(client: &Client) -> Self {
        CheckpointStore {
            collection: client
                .database(REPLICATOR_DB)
                .collection(CHECKPOINTS_COLLECTION),
        }
    }

    /// Read the checkpoint for `source_id`, if one has ever been written.
    pub async fn load(&self, source_id: &str) -> Result<Option<Checkpoint>> {
        let checkpoint = self
            .collection
            .find_one(doc! { "source_id": source_id }, FindOneOptions::default())
            .await?;

        Ok(checkpoint)
    }

    /// Persist `checkpoint`, replacing any prior checkpoint for the same `source_id`.
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let document = mongodb::bson::to_document(checkpoint)?;

        self.collection
            .update_one(
                doc! { "source_id": &checkpoint.source_id },
                doc! { "$set": document },
                UpdateOptions::builder().upsert(true).build(),
            )
            .await?;

        Ok(())
    }
}
