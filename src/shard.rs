//! Sharded-topology helpers used by the Orchestrator (part of C6, `SPEC_FULL.md` §4.2).
//!
//! These talk to a `mongos` router to discover shard primaries and to verify the balancer
//! precondition before a clone begins; grounded on the original `MongoSync::GetShards` /
//! `MongoSync::IsBalancerRunning` calls.

use mongodb::bson::doc;
use mongodb::Client;
use serde::Deserialize;

use crate::error::Result;

/// One shard of a sharded source cluster.
#[derive(Clone, Debug, Deserialize)]
pub struct ShardDescriptor {
    /// Shard identifier as reported by `config.shards`.
    #[serde(rename = "_id")]
    pub id: String,
    /// The shard's replica set connection string, e.g. `rs0/host1:27017,host2:27017`.
    pub host: String,
}

impl ShardDescriptor {
    /// The `host:port` seed list this shard's replica set, stripped of its set name prefix if
    /// present, suitable for a direct (non-router) connection.
    pub fn seed_list(&self) -> &str {
        match self.host.split_once('/') {
            Some((_set_name, hosts)) => hosts,
            None => &self.host,
        }
    }
}

/// List the shards of a sharded cluster by querying `config.shards` through the router.
pub async fn list_shards(router: &Client) -> Result<Vec<ShardDescriptor>> {
    use futures::TryStreamExt;

    let collection = router
        .database("config")
        .collection::<ShardDescriptor>("shards");
    let cursor = collection.find(doc! {}, None).await?;

    Ok(cursor.try_collect().await?)
}

/// Whether the cluster balancer is currently enabled and active.
///
/// Moving chunks while a clone is underway can duplicate or lose documents (§4.2), so the
/// orchestrator must observe this as `false` before starting a sharded clone.
pub async fn is_balancer_running(router: &Client) -> Result<bool> {
    let settings = router
        .database("config")
        .collection::<mongodb::bson::Document>("settings");

    let balancer_doc = settings.find_one(doc! { "_id": "balancer" }, None).await?;

    let stopped = balancer_doc
        .as_ref()
        .and_then(|d| d.get_bool("stopped").ok())
        .unwrap_or(false);

    if stopped {
        return Ok(false);
    }

    let result = router
        .database("admin")
        .run_command(doc! { "balancerStatus": 1 }, None)
        .await?;

    Ok(result
        .get_bool("inBalancerRound")
        .unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_list_strips_replica_set_name() {
        let shard = ShardDescriptor {
            id: "shard0000".into(),
            host: "rs0/host1:27017,host2:27017".into(),
        };

        assert_eq!(shard.seed_list(), "host1:27017,host2:27017");
    }

    #[test]
    fn seed_list_passes_through_bare_host_list() {
        let shard = ShardDescriptor {
            id: "shard0000".into(),
            host: "host1:27017".into(),
        };

        assert_eq!(shard.seed_list(), "host1:27017");
    }
}
