//! Wire-level views of NEAR JSON-RPC responses.
//!
//! Only the fields the engine consumes are modeled; unknown fields are
//! ignored on deserialization so the client stays tolerant of node upgrades.

use serde::{Deserialize, Serialize};

/// Chain-head notion used when requesting a block without a concrete height.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Finality {
    /// The last block the network has irreversibly committed.
    Final,
    /// The speculative tip of the chain.
    Optimistic,
}

/// A concrete block identifier: height or hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BlockId {
    /// Block height.
    Height(u64),
    /// Base58 block hash.
    Hash(String),
}

/// The block reference shape accepted by the `block` RPC method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BlockReference {
    /// Request a specific block.
    BlockId {
        /// The block to fetch.
        block_id: BlockId,
    },
    /// Request the chain head at a finality level.
    Finality {
        /// Which head to fetch.
        finality: Finality,
    },
}

impl BlockReference {
    /// Reference to the block at `height`.
    pub fn height(height: u64) -> Self {
        Self::BlockId { block_id: BlockId::Height(height) }
    }

    /// Reference to the chain head at the given finality.
    pub fn finality(finality: Finality) -> Self {
        Self::Finality { finality }
    }
}

/// Header of a block as returned by the `block` method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeaderView {
    /// Block height.
    pub height: u64,
    /// Base58 hash of this block.
    pub hash: String,
    /// Hash of the previous block.
    pub prev_hash: String,
    /// Block production time in nanoseconds since the Unix epoch.
    pub timestamp: u64,
    /// Gas price at this block, in yoctoNEAR as a decimal string.
    pub gas_price: String,
}

/// Header of a chunk, embedded in [`BlockView::chunks`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkHeaderView {
    /// Base58 hash identifying the chunk.
    pub chunk_hash: String,
    /// Shard the chunk belongs to.
    pub shard_id: u64,
    /// Height at which the chunk was produced.
    #[serde(default)]
    pub height_created: u64,
}

/// A block as returned by the `block` method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockView {
    /// Account id of the block producer.
    pub author: String,
    /// The block header.
    pub header: BlockHeaderView,
    /// Chunk headers, one per shard, in shard order.
    pub chunks: Vec<ChunkHeaderView>,
}

/// A signed transaction embedded in a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransactionView {
    /// Transaction hash.
    pub hash: String,
    /// Account that signed the transaction.
    pub signer_id: String,
    /// Public key used to sign.
    #[serde(default)]
    pub public_key: String,
    /// Signer nonce.
    #[serde(default)]
    pub nonce: u64,
    /// Account the transaction is addressed to.
    pub receiver_id: String,
    /// Raw wire actions; decoded by the block assembler.
    pub actions: Vec<serde_json::Value>,
}

/// A chunk as returned by the `chunk` method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkView {
    /// Account id of the chunk producer.
    #[serde(default)]
    pub author: String,
    /// The chunk header.
    pub header: ChunkHeaderView,
    /// Transactions included in the chunk, in execution order.
    pub transactions: Vec<SignedTransactionView>,
    /// Incoming receipts, passed through to handlers undecoded.
    #[serde(default)]
    pub receipts: Vec<serde_json::Value>,
}

/// Result of executing a transaction or receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutcomeView {
    /// Log lines emitted during execution.
    #[serde(default)]
    pub logs: Vec<String>,
    /// Gas burnt by this execution step.
    pub gas_burnt: u64,
    /// Ids of receipts spawned by this execution.
    #[serde(default)]
    pub receipt_ids: Vec<String>,
}

/// An execution outcome together with the id it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutcomeWithIdView {
    /// Transaction or receipt id the outcome belongs to.
    pub id: String,
    /// Hash of the block the outcome was recorded in.
    #[serde(default)]
    pub block_hash: String,
    /// The outcome itself.
    pub outcome: ExecutionOutcomeView,
}

/// Response of the `tx` / `EXPERIMENTAL_tx_status` methods.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalExecutionOutcomeView {
    /// Terminal status of the whole transaction, passed through undecoded.
    #[serde(default)]
    pub status: serde_json::Value,
    /// Outcome of converting the transaction into its first receipt.
    pub transaction_outcome: ExecutionOutcomeWithIdView,
    /// Outcomes of all receipts spawned by the transaction.
    #[serde(default)]
    pub receipts_outcome: Vec<ExecutionOutcomeWithIdView>,
}

/// Sync portion of the `status` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSyncInfo {
    /// Hash of the node's latest block.
    pub latest_block_hash: String,
    /// Height of the node's latest block.
    pub latest_block_height: u64,
    /// Whether the node is still syncing.
    #[serde(default)]
    pub syncing: bool,
}

/// Response of the `status` method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Chain id the node is serving (e.g. `mainnet`).
    pub chain_id: String,
    /// First height of the chain; the block at this height anchors the
    /// canonical genesis hash used for endpoint cross-validation.
    pub genesis_height: u64,
    /// Protocol version the node runs.
    #[serde(default)]
    pub latest_protocol_version: u32,
    /// Node sync state.
    pub sync_info: StatusSyncInfo,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_reference_serializes_to_wire_shapes() {
        let by_height = serde_json::to_value(BlockReference::height(42)).unwrap();
        assert_eq!(by_height, serde_json::json!({ "block_id": 42 }));

        let by_finality = serde_json::to_value(BlockReference::finality(Finality::Final)).unwrap();
        assert_eq!(by_finality, serde_json::json!({ "finality": "final" }));

        let optimistic =
            serde_json::to_value(BlockReference::finality(Finality::Optimistic)).unwrap();
        assert_eq!(optimistic, serde_json::json!({ "finality": "optimistic" }));
    }

    #[test]
    fn block_view_deserializes_and_ignores_unknown_fields() {
        let raw = serde_json::json!({
            "author": "alice.near",
            "header": {
                "height": 100,
                "hash": "H1",
                "prev_hash": "H0",
                "timestamp": 1_700_000_000_000_000_000u64,
                "gas_price": "100000000",
                "epoch_id": "ignored"
            },
            "chunks": [
                { "chunk_hash": "C1", "shard_id": 0, "height_created": 100, "tx_root": "ignored" }
            ]
        });

        let block: BlockView = serde_json::from_value(raw).unwrap();
        assert_eq!(block.header.height, 100);
        assert_eq!(block.chunks.len(), 1);
        assert_eq!(block.chunks[0].chunk_hash, "C1");
    }

    #[test]
    fn outcome_defaults_apply_to_missing_fields() {
        let raw = serde_json::json!({
            "id": "tx1",
            "outcome": { "gas_burnt": 424242 }
        });

        let outcome: ExecutionOutcomeWithIdView = serde_json::from_value(raw).unwrap();
        assert_eq!(outcome.outcome.gas_burnt, 424242);
        assert!(outcome.outcome.logs.is_empty());
    }
}
