//! A height-pinned view over an RPC connection, handed to mapping handlers.

use std::sync::Arc;

use super::client::{JsonRpcClient, RpcClientError};
use super::types::{BlockId, BlockReference, BlockView, ChunkView};

/// An RPC view pinned to a single block height.
///
/// Wherever the underlying client would accept a block reference, this view
/// substitutes its own height, so handler code observes the chain as of the
/// block being indexed. Valid only for the duration of one block indexing
/// step; handlers must not retain it.
#[derive(Debug, Clone)]
pub struct SafeRpcClient {
    inner: Arc<JsonRpcClient>,
    height: u64,
}

impl SafeRpcClient {
    /// Pins `inner` to `height`.
    pub fn new(inner: Arc<JsonRpcClient>, height: u64) -> Self {
        Self { inner, height }
    }

    /// The height this view is pinned to.
    pub fn height(&self) -> u64 {
        self.height
    }

    /// Fetches the block this view is pinned to.
    pub async fn block(&self) -> Result<BlockView, RpcClientError> {
        self.inner.block(&BlockReference::height(self.height)).await
    }

    /// Fetches a chunk by hash. Chunk hashes already identify a unique
    /// block, so no pinning applies.
    pub async fn chunk(&self, chunk_hash: &str) -> Result<ChunkView, RpcClientError> {
        self.inner.chunk(chunk_hash).await
    }

    /// Fetches the validator set as of the pinned height.
    pub async fn validators(&self) -> Result<serde_json::Value, RpcClientError> {
        self.inner.validators(Some(BlockId::Height(self.height))).await
    }

    /// Fetches the gas price as of the pinned height.
    pub async fn gas_price(&self) -> Result<serde_json::Value, RpcClientError> {
        self.inner.gas_price(Some(BlockId::Height(self.height))).await
    }
}
