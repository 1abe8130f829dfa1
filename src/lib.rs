#![warn(missing_docs)]

//! `mongosync` is a one-way replication engine that copies data from a source MongoDB
//! deployment (standalone, replica set, or sharded cluster) to a destination deployment.
//!
//! It performs two logically distinct phases per source endpoint: an initial **clone** of
//! existing data, followed by a continuous **tail** of the source's oplog that applies
//! subsequent mutations to the destination. See [`Orchestrator`] for the top-level state
//! machine and [`oplog::OplogTailer`] for the phase that does the actual replication.
//!
//! The crate also exposes the lower-level [`Oplog`] stream this engine is built on: a `Stream`
//! of strongly typed [`Operation`]s over a replica set's `local.oplog.rs` collection, usable on
//! its own for anything that just wants to watch a replica set's mutation log.

pub use mongodb;
pub use mongodb::bson;

mod checkpoint;
mod cloner;
pub mod config;
pub mod connection;
mod error;
mod filter;
pub mod logging;
mod namespace;
mod oper;
pub mod oplog;
mod orchestrator;
mod pool;
mod shard;

pub use checkpoint::{Checkpoint, CheckpointStore};
pub use cloner::Cloner;
pub use config::Config;
pub use connection::Endpoint;
pub use error::{Error, Result};
pub use filter::Filter;
pub use namespace::Namespace;
pub use oper::Operation;
pub use oplog::{Oplog, OplogBuilder, OplogTailer};
pub use orchestrator::{Orchestrator, Phase, Pipeline};
pub use pool::{WorkerPool, WriteBatch};
pub use shard::ShardDescriptor;
