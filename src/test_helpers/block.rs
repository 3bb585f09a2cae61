//! Builders for unified blocks and transactions.

use crate::block::types::{
    ActionPayload, IndexedAction, IndexedBlock, IndexedTransaction, TransactionRef,
    TransactionResult,
};
use crate::rpc::types::BlockHeaderView;

/// Builder for [`IndexedTransaction`] test fixtures.
#[derive(Debug, Clone)]
pub struct IndexedTransactionBuilder {
    tx: IndexedTransaction,
}

impl Default for IndexedTransactionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexedTransactionBuilder {
    /// A transaction with placeholder identities and no actions.
    pub fn new() -> Self {
        Self {
            tx: IndexedTransaction {
                hash: "tx-hash".into(),
                signer_id: "signer.near".into(),
                receiver_id: "receiver.near".into(),
                actions: Vec::new(),
                gas_price: "0".into(),
                gas_used: 0,
                block_hash: "block-hash".into(),
                block_height: 0,
                timestamp: 0,
                result: TransactionResult::default(),
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

    /// Sets the gas burnt by the transaction.
    pub fn gas_used(mut self, gas_used: u64) -> Self {
        self.tx.gas_used = gas_used;
        self
    }

    /// Builds the transaction.
    pub fn build(self) -> IndexedTransaction {
        self.tx
    }
}

/// Builder for [`IndexedBlock`] test fixtures.
#[derive(Debug, Clone)]
pub struct IndexedBlockBuilder {
    block: IndexedBlock,
}

impl Default for IndexedBlockBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexedBlockBuilder {
    /// An empty block at height 0.
    pub fn new() -> Self {
        Self {
            block: IndexedBlock {
                author: "producer.near".into(),
                header: BlockHeaderView {
                    height: 0,
                    hash: "B0".into(),
                    prev_hash: "B-1".into(),
                    timestamp: 0,
                    gas_price: "0".into(),
                },
                chunks: Vec::new(),
                transactions: Vec::new(),
                actions: Vec::new(),
                receipts: Vec::new(),
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

    /// Sets the previous block hash.
    pub fn prev_hash(mut self, prev_hash: &str) -> Self {
        self.block.header.prev_hash = prev_hash.into();
        self
    }

    /// Sets the block timestamp in nanoseconds.
    pub fn timestamp(mut self, nanos: u64) -> Self {
        self.block.header.timestamp = nanos;
        self
    }

    /// Appends a transaction without actions.
    pub fn transaction(mut self, tx: IndexedTransaction) -> Self {
        self.block.transactions.push(tx);
        self
    }

    /// Appends a transaction and its decoded actions, wiring block
    /// coordinates and action ids the way the assembler would.
    pub fn transaction_with_actions(
        mut self,
        mut tx: IndexedTransaction,
        raw_actions: Vec<serde_json::Value>,
    ) -> Self {
        tx.block_height = self.block.header.height;
        tx.block_hash = self.block.header.hash.clone();
        tx.actions = raw_actions.clone();

        let reference = TransactionRef::from(&tx);
        for (id, raw) in raw_actions.iter().enumerate() {
            let payload =
                ActionPayload::from_wire(raw).expect("test fixture action must decode");
            self.block.actions.push(IndexedAction {
                id,
                payload,
                transaction: reference.clone(),
            });
        }
        self.block.transactions.push(tx);
        self
    }

    /// Builds the block.
    pub fn build(self) -> IndexedBlock {
        self.block
    }
}
