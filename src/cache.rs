use crate::config::RedisParams;
use crate::error::ChappsError;
use crate::SENTINEL_TIMEOUT_MS;
use log::{debug, warn};
use redis::aio::{ConnectionLike, ConnectionManager, MultiplexedConnection};
use redis::sentinel::{SentinelClient, SentinelServerType};
use redis::{Cmd, Pipeline, RedisFuture, Value};
use std::time::Duration;
use tokio::time::timeout;

/// Format a colon-joined Redis key for arbitrary policy data
pub fn rediskey(prefix: &str, parts: &[&str]) -> String {
    format!("{}:{}", prefix, parts.join(":"))
}

/// A handle provider over either a direct Redis server or a sentinel
/// quorum fronting a replicated dataset.
///
/// With sentinel configured, every resolution asks the quorum for the
/// current master (or a replica) under a short timeout; when discovery
/// fails we fall through to the directly-configured `server:port`.
pub struct CacheClient {
    backend: Backend,
}

enum Backend {
    Direct {
        manager: ConnectionManager,
    },
    Sentinel {
        nodes: Vec<String>,
        dataset: String,
        fallback: redis::Client,
    },
}

/// A live connection from [CacheClient], usable with `redis::pipe()` and
/// the `AsyncCommands` trait regardless of which backend produced it.
pub enum CacheConnection {
    Manager(ConnectionManager),
    Multiplexed(MultiplexedConnection),
}

impl ConnectionLike for CacheConnection {
    fn req_packed_command<'a>(&'a mut self, cmd: &'a Cmd) -> RedisFuture<'a, Value> {
        match self {
            CacheConnection::Manager(conn) => conn.req_packed_command(cmd),
            CacheConnection::Multiplexed(conn) => conn.req_packed_command(cmd),
        }
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        cmd: &'a Pipeline,
        offset: usize,
        count: usize,
    ) -> RedisFuture<'a, Vec<Value>> {
        match self {
            CacheConnection::Manager(conn) => conn.req_packed_commands(cmd, offset, count),
            CacheConnection::Multiplexed(conn) => conn.req_packed_commands(cmd, offset, count),
        }
    }

    fn get_db(&self) -> i64 {
        match self {
            CacheConnection::Manager(conn) => conn.get_db(),
            CacheConnection::Multiplexed(conn) => conn.get_db(),
        }
    }
}

impl CacheClient {
    pub async fn connect(params: &RedisParams) -> Result<Self, ChappsError> {
        let nodes = params.sentinel_nodes();
        if nodes.is_empty() {
            let client = redis::Client::open(params.url())?;
            let manager = ConnectionManager::new(client).await?;
            debug!("Connected to Redis at {}", params.url());
            return Ok(Self {
                backend: Backend::Direct { manager },
            });
        }
        let fallback = redis::Client::open(params.url())?;
        debug!(
            "Using Redis sentinel quorum [{}] for dataset {}",
            params.sentinel_servers, params.sentinel_dataset
        );
        Ok(Self {
            backend: Backend::Sentinel {
                nodes,
                dataset: params.sentinel_dataset.clone(),
                fallback,
            },
        })
    }

    /// Resolve a read-write handle on the current master
    pub async fn master(&self) -> Result<CacheConnection, ChappsError> {
        self.connection(SentinelServerType::Master).await
    }

    /// Resolve a read-only handle, preferring a replica when sentinel is in play
    pub async fn replica(&self) -> Result<CacheConnection, ChappsError> {
        self.connection(SentinelServerType::Replica).await
    }

    async fn connection(
        &self,
        server_type: SentinelServerType,
    ) -> Result<CacheConnection, ChappsError> {
        match &self.backend {
            Backend::Direct { manager } => Ok(CacheConnection::Manager(manager.clone())),
            Backend::Sentinel {
                nodes,
                dataset,
                fallback,
            } => {
                match Self::resolve(nodes, dataset, server_type).await {
                    Ok(conn) => Ok(conn),
                    Err(error) => {
                        warn!(
                            "Sentinel resolution failed ({error}), using configured server directly"
                        );
                        Ok(CacheConnection::Multiplexed(
                            fallback.get_multiplexed_async_connection().await?,
                        ))
                    }
                }
            }
        }
    }

    async fn resolve(
        nodes: &[String],
        dataset: &str,
        server_type: SentinelServerType,
    ) -> Result<CacheConnection, ChappsError> {
        let mut client = SentinelClient::build(
            nodes.to_vec(),
            dataset.to_string(),
            None,
            server_type,
        )?;
        let conn = timeout(
            Duration::from_millis(SENTINEL_TIMEOUT_MS),
            client.get_async_connection(),
        )
        .await
        .map_err(|_| {
            ChappsError::Generic(format!(
                "sentinel discovery timed out after {SENTINEL_TIMEOUT_MS}ms"
            ))
        })??;
        Ok(CacheConnection::Multiplexed(conn))
    }
}
