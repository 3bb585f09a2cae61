//! A typed JSON-RPC client for a single NEAR endpoint, with transient-error
//! retry via middleware.

use std::sync::atomic::{AtomicU64, Ordering};

use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, Jitter, RetryTransientMiddleware};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use super::types::{
    BlockId, BlockReference, BlockView, ChunkView, FinalExecutionOutcomeView, StatusResponse,
};
use crate::config::RpcRetryConfig;

/// Errors produced by the RPC client.
///
/// Transport and timeout failures surface as [`RpcClientError::Network`];
/// JSON-RPC level rejections as [`RpcClientError::Rpc`]. A request for a
/// block the chain does not serve (garbage-collected or never produced) is
/// split out as [`RpcClientError::UnknownBlock`] so callers can treat it as
/// a permanent, non-fatal miss.
#[derive(Debug, Error)]
pub enum RpcClientError {
    /// Transport failure, timeout, or a malformed response body.
    #[error("Network error calling `{method}`: {message}")]
    Network {
        /// RPC method that failed.
        method: String,
        /// Underlying failure description.
        message: String,
    },

    /// The endpoint returned a JSON-RPC error object.
    #[error("RPC error calling `{method}` (code {code}): {message}")]
    Rpc {
        /// RPC method that failed.
        method: String,
        /// JSON-RPC error code.
        code: i64,
        /// JSON-RPC error message.
        message: String,
    },

    /// The endpoint does not know the requested block.
    #[error("Block not available on endpoint: {0}")]
    UnknownBlock(String),
}

impl RpcClientError {
    fn network(method: &str, message: impl ToString) -> Self {
        Self::Network { method: method.to_string(), message: message.to_string() }
    }
}

#[derive(Serialize)]
struct RpcRequest<'a, P: Serialize> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: P,
}

#[derive(Deserialize)]
struct RpcErrorObject {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: serde_json::Value,
    #[serde(default)]
    cause: serde_json::Value,
}

#[derive(Deserialize)]
struct RpcResponse<R> {
    result: Option<R>,
    error: Option<RpcErrorObject>,
}

impl RpcErrorObject {
    /// NEAR reports a missing block either through the structured `cause`
    /// name or, on older nodes, a `data` string mentioning the lookup miss.
    fn is_unknown_block(&self) -> bool {
        let cause_name = self.cause.get("name").and_then(|n| n.as_str()).unwrap_or_default();
        cause_name == "UNKNOWN_BLOCK"
            || cause_name == "UNKNOWN_CHUNK"
            || self.data.as_str().is_some_and(|d| d.contains("DB Not Found"))
    }
}

/// A typed client bound to one NEAR JSON-RPC endpoint.
pub struct JsonRpcClient {
    endpoint: Url,
    http: ClientWithMiddleware,
    next_id: AtomicU64,
}

impl std::fmt::Debug for JsonRpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonRpcClient").field("endpoint", &self.endpoint.as_str()).finish()
    }
}

impl JsonRpcClient {
    /// Creates a client for `endpoint` using the given retry policy.
    pub fn new(endpoint: Url, retry: &RpcRetryConfig) -> Result<Self, RpcClientError> {
        let base_client = reqwest::Client::builder()
            .timeout(retry.request_timeout())
            .build()
            .map_err(|e| RpcClientError::network("<client init>", e))?;

        let retry_policy = ExponentialBackoff::builder()
            .jitter(Jitter::Full)
            .retry_bounds(
                std::time::Duration::from_millis(retry.initial_backoff_ms),
                std::time::Duration::from_secs(retry.max_backoff_secs),
            )
            .build_with_max_retries(retry.max_retries);

        let http = ClientBuilder::new(base_client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self { endpoint, http, next_id: AtomicU64::new(1) })
    }

    /// The endpoint this client talks to.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn call<P: Serialize, R: DeserializeOwned>(
        &self,
        method: &str,
        params: P,
    ) -> Result<R, RpcClientError> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        let response = self
            .http
            .post(self.endpoint.clone())
            .json(&request)
            .send()
            .await
            .map_err(|e| RpcClientError::network(method, e))?;

        let envelope: RpcResponse<R> =
            response.json().await.map_err(|e| RpcClientError::network(method, e))?;

        if let Some(error) = envelope.error {
            if error.is_unknown_block() {
                return Err(RpcClientError::UnknownBlock(error.message));
            }
            return Err(RpcClientError::Rpc {
                method: method.to_string(),
                code: error.code,
                message: error.message,
            });
        }

        envelope
            .result
            .ok_or_else(|| RpcClientError::network(method, "response carried neither result nor error"))
    }

    /// Fetches a block by height, hash, or finality.
    pub async fn block(&self, reference: &BlockReference) -> Result<BlockView, RpcClientError> {
        self.call("block", reference).await
    }

    /// Fetches a chunk by its hash.
    pub async fn chunk(&self, chunk_hash: &str) -> Result<ChunkView, RpcClientError> {
        self.call("chunk", serde_json::json!({ "chunk_id": chunk_hash })).await
    }

    /// Fetches the final execution outcome of a transaction, including the
    /// outcomes of all receipts it spawned.
    pub async fn tx_status_receipts(
        &self,
        tx_hash: &str,
        signer_id: &str,
    ) -> Result<FinalExecutionOutcomeView, RpcClientError> {
        self.call("EXPERIMENTAL_tx_status", serde_json::json!([tx_hash, signer_id])).await
    }

    /// Fetches node status: chain id, genesis height, sync state.
    pub async fn status(&self) -> Result<StatusResponse, RpcClientError> {
        self.call("status", serde_json::json!([])).await
    }

    /// Fetches the validator set at a block, or the latest when `None`.
    pub async fn validators(
        &self,
        block_id: Option<BlockId>,
    ) -> Result<serde_json::Value, RpcClientError> {
        self.call("validators", serde_json::json!([block_id])).await
    }

    /// Fetches the gas price at a block, or the latest when `None`.
    pub async fn gas_price(
        &self,
        block_id: Option<BlockId>,
    ) -> Result<serde_json::Value, RpcClientError> {
        self.call("gas_price", serde_json::json!([block_id])).await
    }
}
