//! Orchestrator (C6, `SPEC_FULL.md` §4.2).
//!
//! Top-level state machine: selects the source topology, computes start/stop oplog positions,
//! runs the cloner, then the tailer. In sharded mode it fans out one independent pipeline per
//! shard, each connecting directly to that shard's primary.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mongodb::bson::{doc, Document, Timestamp};
use mongodb::options::FindOneOptions;
use mongodb::Client;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::cloner::Cloner;
use crate::config::Config;
use crate::connection::{self, Endpoint};
use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::oplog::{AppliedThrough, OplogTailer};
use crate::pool::WorkerPool;
use crate::shard;

/// Pipeline lifecycle phase (§4.2).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Pinning `oplogStart`, about to decide whether to clone or resume.
    Init,
    /// Streaming existing documents and indexes.
    Clone,
    /// Tailing the oplog from the clone's start point up to the live head observed at clone end.
    Catchup,
    /// Caught up; applying ops inline as they arrive.
    Steady,
    /// Stopped cleanly (`oplogEnd` reached, or cancellation observed).
    Stopped,
    /// An unrecoverable error occurred.
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Phase::Init => "Init",
            Phase::Clone => "Clone",
            Phase::Catchup => "Catchup",
            Phase::Steady => "Steady",
            Phase::Stopped => "Stopped",
            Phase::Failed => "Failed",
        };
        write!(f, "{}", name)
    }
}

/// Drives one source endpoint (a standalone, a replica set, or one shard of a sharded cluster)
/// through `Init → Clone → Catchup → Steady → Stopped`.
pub struct Pipeline {
    source: Endpoint,
    destination: Endpoint,
    filter: Filter,
    source_id: String,
    bg_thread_num: usize,
    batch_size: usize,
    use_majority_reads: bool,
    oplog_start_override: Option<Timestamp>,
    oplog_end: Option<Timestamp>,
}

impl Pipeline {
    /// Build a pipeline for one source endpoint.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Endpoint,
        destination: Endpoint,
        filter: Filter,
        source_id: impl Into<String>,
        bg_thread_num: usize,
        batch_size: usize,
        use_majority_reads: bool,
        oplog_start_override: Option<Timestamp>,
        oplog_end: Option<Timestamp>,
    ) -> Self {
        Pipeline {
            source,
            destination,
            filter,
            source_id: source_id.into(),
            bg_thread_num,
            batch_size,
            use_majority_reads,
            oplog_start_override,
            oplog_end,
        }
    }

    /// Run this pipeline to completion (`Stopped`) or until it hits an unrecoverable error.
    pub async fn run(&self, cancellation: CancellationToken) -> Result<Phase> {
        let mut phase = Phase::Init;
        info!("[{}] entering {}", self.source_id, phase);

        let source_client = connection::connect(&self.source).await?;
        let destination_client = connection::connect(&self.destination).await?;
        let checkpoints = CheckpointStore::new(&destination_client);

        let existing = checkpoints.load(&self.source_id).await?;
        let window_start = OplogTailer::oplog_window_start(&source_client).await?;

        let pool = Arc::new(WorkerPool::new(
            self.destination.clone(),
            self.bg_thread_num,
            cancellation.clone(),
        ));

        let (start_ts, mut catchup_target, skip_clone) = match &existing {
            Some(cp) if window_start.map_or(true, |w| w <= cp.applied_through) => {
                info!(
                    "[{}] resuming from checkpoint at {:?}, skipping Clone",
                    self.source_id, cp.applied_through
                );
                (cp.applied_through, cp.applied_through, true)
            }
            Some(_) => {
                warn!(
                    "[{}] checkpoint exists but has rolled off the source oplog; re-cloning",
                    self.source_id
                );
                let head = oplog_head(&source_client).await?;
                (head, head, false)
            }
            None => {
                let head = oplog_head(&source_client).await?;
                (head, head, false)
            }
        };

        let start_ts = self.oplog_start_override.unwrap_or(start_ts);

        if !skip_clone {
            phase = Phase::Clone;
            info!("[{}] entering {}", self.source_id, phase);

            let cloner = Cloner::new(
                self.source.clone(),
                self.destination.clone(),
                self.filter.clone(),
                Arc::clone(&pool),
                self.batch_size,
                self.use_majority_reads,
            );
            cloner.clone_all().await?;
            pool.drain().await;

            catchup_target = oplog_head(&source_client).await?;
        }

        phase = Phase::Catchup;
        info!(
            "[{}] entering {} (target {:?})",
            self.source_id, phase, catchup_target
        );

        let steady = Arc::new(AtomicBool::new(false));
        let applied_through = AppliedThrough::new(start_ts);

        let tailer = OplogTailer::new(
            self.source.clone(),
            self.destination.clone(),
            self.filter.clone(),
            Arc::clone(&pool),
            self.source_id.clone(),
            self.oplog_end,
        )
        .with_checkpoints(checkpoints);

        let watcher = {
            let steady = Arc::clone(&steady);
            let applied_through = applied_through.clone();
            let cancellation = cancellation.clone();
            let source_id = self.source_id.clone();

            tokio::spawn(async move {
                loop {
                    if cancellation.is_cancelled() {
                        return;
                    }
                    if applied_through.get() >= catchup_target {
                        steady.store(true, Ordering::SeqCst);
                        info!("[{}] caught up, entering Steady", source_id);
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            })
        };

        let result = tailer
            .run(start_ts, Arc::clone(&steady), applied_through, cancellation.clone())
            .await;

        drop(tailer);
        watcher.abort();

        match Arc::try_unwrap(pool) {
            Ok(pool) => pool.shutdown().await,
            Err(pool) => pool.drain().await,
        }

        match result {
            Ok(()) => {
                phase = Phase::Stopped;
                info!("[{}] entering {}", self.source_id, phase);
                Ok(phase)
            }
            Err(e) => {
                error!("[{}] pipeline failed: {}", self.source_id, e);
                Err(e)
            }
        }
    }
}

/// The source oplog's current head timestamp (§4.2's `T0`).
async fn oplog_head(client: &Client) -> Result<Timestamp> {
    let coll = client.database("local").collection::<Document>("oplog.rs");
    let opts = FindOneOptions::builder().sort(doc! { "$natural": -1 }).build();
    let latest = coll.find_one(doc! {}, opts).await?;

    match latest.and_then(|d| d.get_timestamp("ts").ok()) {
        Some(ts) => Ok(ts),
        None => Ok(Timestamp {
            time: 0,
            increment: 0,
        }),
    }
}

/// Top-level replication engine: selects topology and fans out one `Pipeline` per shard.
pub struct Orchestrator {
    config: Config,
}

impl Orchestrator {
    /// Build an orchestrator from a resolved [`Config`].
    pub fn new(config: Config) -> Self {
        Orchestrator { config }
    }

    /// Run until every pipeline stops, a pipeline fails, or `cancellation` fires.
    pub async fn run(&self, cancellation: CancellationToken) -> Result<()> {
        let filter = Filter::new(
            self.config
                .dbs
                .iter()
                .chain(self.config.colls.iter())
                .cloned()
                .collect(),
            Vec::new(),
        );

        let destination = Endpoint::new(self.config.dst_ip_port.clone()).with_credentials(
            self.config.dst_auth_db.clone(),
            self.config.dst_user.clone(),
            self.config.dst_passwd.clone(),
        );

        let oplog_start = self
            .config
            .oplog_start
            .map(|time| Timestamp { time, increment: 0 });
        let oplog_end = self
            .config
            .oplog_end
            .map(|time| Timestamp { time, increment: 0 });

        if self.config.is_mongos {
            self.run_sharded(filter, destination, oplog_start, oplog_end, cancellation)
                .await
        } else {
            let source = Endpoint::new(self.config.src_ip_port.clone())
                .with_credentials(
                    self.config.src_auth_db.clone(),
                    self.config.src_user.clone(),
                    self.config.src_passwd.clone(),
                )
                .with_slave_ok(true);

            let pipeline = Pipeline::new(
                source,
                destination,
                filter,
                "standalone",
                self.config.bg_thread_num,
                self.config.batch_size,
                self.config.src_use_mcr,
                oplog_start,
                oplog_end,
            );

            pipeline.run(cancellation).await?;
            Ok(())
        }
    }

    async fn run_sharded(
        &self,
        filter: Filter,
        destination: Endpoint,
        oplog_start: Option<Timestamp>,
        oplog_end: Option<Timestamp>,
        cancellation: CancellationToken,
    ) -> Result<()> {
        let router = Endpoint::new(self.config.src_ip_port.clone()).with_credentials(
            self.config.src_auth_db.clone(),
            self.config.src_user.clone(),
            self.config.src_passwd.clone(),
        );
        let router_client = connection::connect(&router).await?;

        let shards = shard::list_shards(&router_client).await?;
        info!("sharded source reports {} shards", shards.len());

        if shard::is_balancer_running(&router_client).await? {
            return Err(Error::TopologyPrecondition(
                "balancer is running; stop it before cloning a sharded source".into(),
            ));
        }

        let mut handles = Vec::with_capacity(shards.len());

        for descriptor in shards {
            let source = Endpoint::new(descriptor.seed_list())
                .with_credentials(
                    self.config.src_auth_db.clone(),
                    self.config.src_user.clone(),
                    self.config.src_passwd.clone(),
                )
                .with_slave_ok(true);

            let pipeline = Pipeline::new(
                source,
                destination.clone(),
                filter.clone(),
                format!("shard:{}", descriptor.id),
                self.config.bg_thread_num,
                self.config.batch_size,
                self.config.src_use_mcr,
                oplog_start,
                oplog_end,
            );

            let cancellation = cancellation.clone();
            handles.push(tokio::spawn(async move { pipeline.run(cancellation).await }));
        }

        let mut first_error = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(_phase)) => {}
                Ok(Err(e)) => {
                    cancellation.cancel();
                    first_error.get_or_insert(e);
                }
                Err(join_err) => {
                    cancellation.cancel();
                    first_error.get_or_insert(Error::Configuration(format!(
                        "shard pipeline task panicked: {}",
                        join_err
                    )));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
