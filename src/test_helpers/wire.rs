//! Builders for wire-level RPC views, used by assembler and pool tests to
//! shape mock server responses.

use crate::rpc::types::{
    BlockHeaderView, BlockView, ChunkHeaderView, ChunkView, ExecutionOutcomeView,
    ExecutionOutcomeWithIdView, FinalExecutionOutcomeView, SignedTransactionView,
};

/// Builder for [`BlockView`] wire fixtures.
#[derive(Debug, Clone)]
pub struct BlockViewBuilder {
    block: BlockView,
}

impl Default for BlockViewBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockViewBuilder {
    /// A chunkless block at height 0.
    pub fn new() -> Self {
        Self {
            block: BlockView {
                author: "producer.near".into(),
                header: BlockHeaderView {
                    height: 0,
                    hash: "B0".into(),
                    prev_hash: "genesis".into(),
                    timestamp: 0,
                    gas_price: "100000000".into(),
                },
                chunks: Vec::new(),
            },
        }
    }

    /// Sets the height and derives placeholder hashes from it.
    pub fn height(mut self, height: u64) -> Self {
        self.block.header.height = height;
        self.block.header.hash = format!("B{height}");
        self.block.header.prev_hash =
            if height == 0 { "genesis".into() } else { format!("B{}", height - 1) };
        self
    }

    /// Sets the block hash.
    pub fn hash(mut self, hash: &str) -> Self {
        self.block.header.hash = hash.into();
        self
    }

    /// Sets the block timestamp in nanoseconds.
    pub fn timestamp(mut self, nanos: u64) -> Self {
        self.block.header.timestamp = nanos;
        self
    }

    /// Appends a chunk header.
    pub fn chunk(mut self, chunk_hash: &str, shard_id: u64) -> Self {
        self.block.chunks.push(ChunkHeaderView {
            chunk_hash: chunk_hash.into(),
            shard_id,
            height_created: self.block.header.height,
        });
        self
    }

    /// Builds the block view.
    pub fn build(self) -> BlockView {
        self.block
    }
}

/// Builder for [`SignedTransactionView`] wire fixtures.
#[derive(Debug, Clone)]
pub struct TransactionViewBuilder {
    tx: SignedTransactionView,
}

impl Default for TransactionViewBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionViewBuilder {
    /// A transaction with placeholder identities and no actions.
    pub fn new() -> Self {
        Self {
            tx: SignedTransactionView {
                hash: "tx-hash".into(),
                signer_id: "signer.near".into(),
                public_key: "ed25519:key".into(),
                nonce: 1,
                receiver_id: "receiver.near".into(),
                actions: Vec::new(),
            },
        }
    }

    /// Sets the transaction hash.
    pub fn hash(mut self, hash: &str) -> Self {
        self.tx.hash = hash.into();
        self
    }

    /// Sets the signer account.
    pub fn signer_id(mut self, signer_id: &str) -> Self {
        self.tx.signer_id = signer_id.into();
        self
    }

    /// Sets the receiver account.
    pub fn receiver_id(mut self, receiver_id: &str) -> Self {
        self.tx.receiver_id = receiver_id.into();
        self
    }

    /// Appends a raw wire action.
    pub fn action(mut self, action: serde_json::Value) -> Self {
        self.tx.actions.push(action);
        self
    }

    /// Builds the transaction view.
    pub fn build(self) -> SignedTransactionView {
        self.tx
    }
}

/// Builder for [`ChunkView`] wire fixtures.
#[derive(Debug, Clone)]
pub struct ChunkViewBuilder {
    chunk: ChunkView,
}

impl Default for ChunkViewBuilder {
    fn default() -> Self {
        Self::new("", 0)
    }
}

impl ChunkViewBuilder {
    /// An empty chunk.
    pub fn new(chunk_hash: &str, shard_id: u64) -> Self {
        Self {
            chunk: ChunkView {
                author: "producer.near".into(),
                header: ChunkHeaderView {
                    chunk_hash: chunk_hash.into(),
                    shard_id,
                    height_created: 0,
                },
                transactions: Vec::new(),
                receipts: Vec::new(),
            },
        }
    }

    /// Appends a transaction.
    pub fn transaction(mut self, tx: SignedTransactionView) -> Self {
        self.chunk.transactions.push(tx);
        self
    }

    /// Appends an undecoded receipt.
    pub fn receipt(mut self, receipt: serde_json::Value) -> Self {
        self.chunk.receipts.push(receipt);
        self
    }

    /// Builds the chunk view.
    pub fn build(self) -> ChunkView {
        self.chunk
    }
}

/// Builder for [`FinalExecutionOutcomeView`] wire fixtures.
#[derive(Debug, Clone)]
pub struct OutcomeBuilder {
    outcome: FinalExecutionOutcomeView,
}

impl OutcomeBuilder {
    /// An outcome for the given transaction id.
    pub fn new(tx_hash: &str) -> Self {
        Self {
            outcome: FinalExecutionOutcomeView {
                status: serde_json::json!({ "SuccessValue": "" }),
                transaction_outcome: ExecutionOutcomeWithIdView {
                    id: tx_hash.into(),
                    block_hash: String::new(),
                    outcome: ExecutionOutcomeView {
                        logs: Vec::new(),
                        gas_burnt: 0,
                        receipt_ids: Vec::new(),
                    },
                },
                receipts_outcome: Vec::new(),
            },
        }
    }

    /// Sets the gas burnt.
    pub fn gas_burnt(mut self, gas_burnt: u64) -> Self {
        self.outcome.transaction_outcome.outcome.gas_burnt = gas_burnt;
        self
    }

    /// Appends a log line.
    pub fn log(mut self, line: &str) -> Self {
        self.outcome.transaction_outcome.outcome.logs.push(line.into());
        self
    }

    /// Builds the outcome view.
    pub fn build(self) -> FinalExecutionOutcomeView {
        self.outcome
    }
}
