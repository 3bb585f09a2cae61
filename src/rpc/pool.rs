//! A pool of RPC connections over multiple endpoints, with chain-identity
//! cross-validation, health tracking and reconnection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::client::{JsonRpcClient, RpcClientError};
use super::safe::SafeRpcClient;
use super::types::BlockReference;
use crate::config::RpcRetryConfig;
use crate::context::events::{EventBus, IndexerEvent};

/// Identity of the chain observed at init, shared with the dictionary
/// validator and the project loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkMeta {
    /// Chain id reported by `status` (e.g. `mainnet`).
    pub chain: String,
    /// Header hash of the block at the genesis height.
    pub genesis_hash: String,
    /// First height of the chain.
    pub genesis_height: u64,
}

/// The chain identity a project declares; either field may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeclaredChain {
    /// Declared chain id.
    pub chain_id: Option<String>,
    /// Legacy declared genesis hash.
    pub genesis_hash: Option<String>,
}

/// Errors raised by the pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The endpoint list is empty.
    #[error("No RPC endpoints configured")]
    NoEndpoints,

    /// No endpoint could be probed successfully at init.
    #[error("All {0} RPC endpoints failed their initial probe")]
    AllEndpointsFailed(usize),

    /// Two endpoints, or an endpoint and the project manifest, disagree on
    /// chain identity.
    #[error("Chain mismatch on `{endpoint}`: expected {expected}, observed {observed}")]
    ChainMismatch {
        /// Endpoint that disagreed.
        endpoint: String,
        /// Identity recorded from the first healthy endpoint or manifest.
        expected: String,
        /// Identity the endpoint reported.
        observed: String,
    },

    /// Every member of the pool is currently quarantined.
    #[error("No healthy RPC endpoint available")]
    NoHealthyEndpoint,

    /// A client could not be constructed.
    #[error(transparent)]
    Client(#[from] RpcClientError),
}

struct Connection {
    client: Arc<JsonRpcClient>,
    healthy: bool,
}

/// A shared, indexed set of RPC connections.
///
/// `unsafe_api` hands out healthy connections round-robin for engine
/// internals; `safe_api` wraps one in a height-pinned view for handler
/// code. Failed members are quarantined and probed back to health with
/// exponential backoff, up to a configurable attempt budget.
pub struct ApiPool {
    connections: RwLock<Vec<Connection>>,
    meta: NetworkMeta,
    cursor: AtomicUsize,
    events: EventBus,
    max_reconnect_attempts: u32,
    shutdown: CancellationToken,
}

impl ApiPool {
    /// Connects to every endpoint, cross-validates chain identity, and
    /// returns the pool.
    ///
    /// The first endpoint to answer its probe fixes the pool's
    /// [`NetworkMeta`]; every later endpoint must agree with it, and the
    /// observed identity must agree with `declared`. Identity disagreement
    /// is fatal. Endpoints that merely fail their probe are quarantined.
    pub async fn connect(
        endpoints: &[Url],
        declared: &DeclaredChain,
        retry: RpcRetryConfig,
        max_reconnect_attempts: u32,
        events: EventBus,
        shutdown: CancellationToken,
    ) -> Result<Arc<Self>, PoolError> {
        if endpoints.is_empty() {
            return Err(PoolError::NoEndpoints);
        }

        let mut connections = Vec::with_capacity(endpoints.len());
        let mut meta: Option<NetworkMeta> = None;

        for endpoint in endpoints {
            let client = Arc::new(JsonRpcClient::new(endpoint.clone(), &retry)?);
            match Self::probe(&client, meta.as_ref()).await {
                Ok(observed) => {
                    if meta.is_none() {
                        tracing::info!(
                            endpoint = %endpoint,
                            chain = %observed.chain,
                            genesis_hash = %observed.genesis_hash,
                            "Recorded network identity from first healthy endpoint."
                        );
                        meta = Some(observed);
                    }
                    events.emit(IndexerEvent::ApiConnected { endpoint: endpoint.to_string() });
                    connections.push(Connection { client, healthy: true });
                }
                Err(e @ PoolError::ChainMismatch { .. }) => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        endpoint = %endpoint,
                        error = %e,
                        "Endpoint failed its initial probe; quarantining."
                    );
                    events.emit(IndexerEvent::ApiDisconnected { endpoint: endpoint.to_string() });
                    connections.push(Connection { client, healthy: false });
                }
            }
        }

        let meta = meta.ok_or(PoolError::AllEndpointsFailed(endpoints.len()))?;
        Self::check_declared(&meta, declared)?;

        let pool = Arc::new(Self {
            connections: RwLock::new(connections),
            meta,
            cursor: AtomicUsize::new(0),
            events,
            max_reconnect_attempts,
            shutdown,
        });

        // Quarantined-at-init members start their reconnect loops now.
        {
            let connections = pool.connections.read().await;
            for (index, connection) in connections.iter().enumerate() {
                if !connection.healthy {
                    pool.spawn_reconnect(index);
                }
            }
        }

        Ok(pool)
    }

    /// The network identity observed at init.
    pub fn network_meta(&self) -> &NetworkMeta {
        &self.meta
    }

    /// Returns a healthy connection, rotating across members.
    pub async fn unsafe_api(&self) -> Result<Arc<JsonRpcClient>, PoolError> {
        let connections = self.connections.read().await;
        let len = connections.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for offset in 0..len {
            let connection = &connections[(start + offset) % len];
            if connection.healthy {
                return Ok(Arc::clone(&connection.client));
            }
        }
        Err(PoolError::NoHealthyEndpoint)
    }

    /// Returns a height-pinned view for handler code.
    pub async fn safe_api(&self, height: u64) -> Result<SafeRpcClient, PoolError> {
        Ok(SafeRpcClient::new(self.unsafe_api().await?, height))
    }

    /// Quarantines the connection serving `endpoint` and begins probing it
    /// back to health.
    pub async fn report_failure(self: &Arc<Self>, endpoint: &Url) {
        let index = {
            let mut connections = self.connections.write().await;
            let Some(index) = connections
                .iter()
                .position(|c| c.healthy && c.client.endpoint() == endpoint)
            else {
                return;
            };
            connections[index].healthy = false;
            index
        };

        tracing::warn!(endpoint = %endpoint, "Quarantined failing RPC endpoint.");
        self.events.emit(IndexerEvent::ApiDisconnected { endpoint: endpoint.to_string() });
        self.spawn_reconnect(index);
    }

    fn spawn_reconnect(self: &Arc<Self>, index: usize) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            pool.reconnect_loop(index).await;
        });
    }

    async fn reconnect_loop(self: Arc<Self>, index: usize) {
        let client = {
            let connections = self.connections.read().await;
            Arc::clone(&connections[index].client)
        };
        let endpoint = client.endpoint().clone();

        for attempt in 1..=self.max_reconnect_attempts {
            let backoff = Duration::from_secs(1 << attempt.min(6));
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }

            match Self::probe(&client, Some(&self.meta)).await {
                Ok(_) => {
                    let mut connections = self.connections.write().await;
                    connections[index].healthy = true;
                    drop(connections);
                    tracing::info!(endpoint = %endpoint, attempt, "RPC endpoint reinstated.");
                    self.events.emit(IndexerEvent::ApiConnected { endpoint: endpoint.to_string() });
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        endpoint = %endpoint,
                        attempt,
                        max_attempts = self.max_reconnect_attempts,
                        error = %e,
                        "Reconnect probe failed."
                    );
                }
            }
        }

        tracing::error!(
            endpoint = %endpoint,
            "RPC endpoint evicted after exhausting reconnect attempts."
        );
    }

    /// Probes an endpoint and, when `expected` is given, verifies it serves
    /// the same chain.
    async fn probe(
        client: &JsonRpcClient,
        expected: Option<&NetworkMeta>,
    ) -> Result<NetworkMeta, PoolError> {
        let status = client.status().await?;

        let genesis_height = match expected {
            Some(meta) => meta.genesis_height,
            None => status.genesis_height,
        };
        let genesis_block = client.block(&BlockReference::height(genesis_height)).await?;

        if let Some(meta) = expected {
            if status.chain_id != meta.chain {
                return Err(PoolError::ChainMismatch {
                    endpoint: client.endpoint().to_string(),
                    expected: meta.chain.clone(),
                    observed: status.chain_id,
                });
            }
            if genesis_block.header.hash != meta.genesis_hash {
                return Err(PoolError::ChainMismatch {
                    endpoint: client.endpoint().to_string(),
                    expected: meta.genesis_hash.clone(),
                    observed: genesis_block.header.hash,
                });
            }
        }

        Ok(NetworkMeta {
            chain: status.chain_id,
            genesis_hash: genesis_block.header.hash,
            genesis_height,
        })
    }

    fn check_declared(meta: &NetworkMeta, declared: &DeclaredChain) -> Result<(), PoolError> {
        if let Some(chain_id) = &declared.chain_id {
            if chain_id != &meta.chain {
                return Err(PoolError::ChainMismatch {
                    endpoint: "<manifest>".into(),
                    expected: chain_id.clone(),
                    observed: meta.chain.clone(),
                });
            }
        }
        if let Some(genesis_hash) = &declared.genesis_hash {
            if genesis_hash != &meta.genesis_hash {
                return Err(PoolError::ChainMismatch {
                    endpoint: "<manifest>".into(),
                    expected: genesis_hash.clone(),
                    observed: meta.genesis_hash.clone(),
                });
            }
        }
        Ok(())
    }
}
