//! Implementation of [Connector] for the `redis` client library.

use crate::backend::{self, Client, Connector, Mode, Target};

use anyhow::anyhow;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;

/// Builds real connections to Redis servers, single-node or clustered
/// depending on the target's mode.
///
/// The target's pass-through options are currently not interpreted; the
/// connection URL itself carries any parameters the `redis` crate
/// understands.
pub struct RedisConnector {}

/// One handle: a multiplexed single-node connection manager, or a cluster
/// connection that routes by slot.
pub enum RedisClient {
    Single(ConnectionManager),
    Cluster(ClusterConnection),
}

#[async_trait]
impl Client for RedisClient {
    async fn ping(&self) -> Result<(), backend::Error> {
        match self {
            RedisClient::Single(manager) => {
                let mut conn = manager.clone();
                let _: String = redis::cmd("PING")
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| backend::Error::Other(anyhow!(e)))?;
            }
            RedisClient::Cluster(cluster) => {
                let mut conn = cluster.clone();
                let _: String = redis::cmd("PING")
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| backend::Error::Other(anyhow!(e)))?;
            }
        }
        Ok(())
    }

    // Both handle types release their sockets on drop.
}

#[async_trait]
impl Connector for RedisConnector {
    type Client = RedisClient;

    async fn connect(&self, target: &Target) -> Result<Self::Client, backend::Error> {
        match &target.mode {
            Mode::Single => {
                let client = redis::Client::open(&*target.url)
                    .map_err(|e| backend::Error::Other(anyhow!(e)))?;
                let manager = ConnectionManager::new(client)
                    .await
                    .map_err(|e| backend::Error::Other(anyhow!(e)))?;
                Ok(RedisClient::Single(manager))
            }
            Mode::Cluster { seeds } => {
                let client = ClusterClient::new(seeds.clone())
                    .map_err(|e| backend::Error::Other(anyhow!(e)))?;
                let conn = client
                    .get_async_connection()
                    .await
                    .map_err(|e| backend::Error::Other(anyhow!(e)))?;
                Ok(RedisClient::Cluster(conn))
            }
        }
    }
}
