//! Materializes one unified block per height from the chain RPC: the block
//! itself, every chunk body, and the execution outcome of every
//! transaction.

use futures::{future, stream, FutureExt, StreamExt, TryStreamExt};
use thiserror::Error;

use super::types::{
    ActionPayload, IndexedAction, IndexedBlock, IndexedTransaction, InvalidActionError,
    TransactionRef, TransactionResult,
};
use crate::rpc::client::{JsonRpcClient, RpcClientError};
use crate::rpc::types::{BlockReference, ChunkView, SignedTransactionView};

/// Failures materializing a unified block.
#[derive(Debug, Error)]
pub enum AssemblyError {
    /// The chain permanently does not serve this height.
    #[error("Block {0} is not available on the chain")]
    BlockUnavailable(u64),

    /// A transient or remote RPC failure.
    #[error(transparent)]
    Rpc(#[from] RpcClientError),

    /// A wire action failed to decode.
    #[error(transparent)]
    InvalidAction(#[from] InvalidActionError),
}

/// Assembles unified blocks with bounded RPC fan-out.
///
/// Chunk bodies and transaction outcomes are fetched concurrently, but the
/// resulting `transactions` and `actions` arrays always follow
/// (chunk, in-chunk transaction, in-transaction action) order.
#[derive(Debug, Clone)]
pub struct BlockAssembler {
    concurrency: usize,
}

impl BlockAssembler {
    /// Creates an assembler performing at most `concurrency` simultaneous
    /// RPC calls per expansion step.
    pub fn new(concurrency: usize) -> Self {
        Self { concurrency: concurrency.max(1) }
    }

    /// Fetches and materializes the block at `height` through `api`.
    pub fn assemble<'a>(
        &'a self,
        api: &'a JsonRpcClient,
        height: u64,
    ) -> future::BoxFuture<'a, Result<IndexedBlock, AssemblyError>> {
        async move {
            let block = api.block(&BlockReference::height(height)).await.map_err(|e| match e {
                RpcClientError::UnknownBlock(_) => AssemblyError::BlockUnavailable(height),
                other => AssemblyError::Rpc(other),
            })?;

            let mut chunk_futures = Vec::with_capacity(block.chunks.len());
            for header in block.chunks.iter() {
                chunk_futures.push(api.chunk(&header.chunk_hash).boxed());
            }
            let chunks: Vec<ChunkView> = stream::iter(chunk_futures)
                .buffered(self.concurrency)
                .try_collect()
                .await
                .map_err(|e| match e {
                    RpcClientError::UnknownBlock(_) => AssemblyError::BlockUnavailable(height),
                    other => AssemblyError::Rpc(other),
                })?;

            // Flatten transactions across chunks, preserving chunk order, then
            // expand their outcomes with the same bounded fan-out. `buffered`
            // keeps results positionally aligned with the requests.
            let wire_transactions: Vec<&SignedTransactionView> =
                chunks.iter().flat_map(|chunk| chunk.transactions.iter()).collect();

            let mut outcome_futures = Vec::with_capacity(wire_transactions.len());
            for tx in wire_transactions.iter().copied() {
                outcome_futures.push(api.tx_status_receipts(&tx.hash, &tx.signer_id).boxed());
            }
            let outcomes = stream::iter(outcome_futures)
                .buffered(self.concurrency)
                .try_collect::<Vec<_>>()
                .await?;

            let mut transactions = Vec::with_capacity(wire_transactions.len());
            let mut actions = Vec::new();
            for (wire_tx, outcome) in wire_transactions.iter().zip(outcomes) {
                let tx = IndexedTransaction {
                    hash: wire_tx.hash.clone(),
                    signer_id: wire_tx.signer_id.clone(),
                    receiver_id: wire_tx.receiver_id.clone(),
                    actions: wire_tx.actions.clone(),
                    gas_price: block.header.gas_price.clone(),
                    gas_used: outcome.transaction_outcome.outcome.gas_burnt,
                    block_hash: block.header.hash.clone(),
                    block_height: block.header.height,
                    timestamp: block.header.timestamp,
                    result: TransactionResult {
                        id: outcome.transaction_outcome.id.clone(),
                        logs: outcome.transaction_outcome.outcome.logs.clone(),
                    },
                };

                let reference = TransactionRef::from(&tx);
                for (id, raw) in wire_tx.actions.iter().enumerate() {
                    let payload = ActionPayload::from_wire(raw)?;
                    actions.push(IndexedAction { id, payload, transaction: reference.clone() });
                }
                transactions.push(tx);
            }

            let receipts =
                chunks.iter().flat_map(|chunk| chunk.receipts.iter().cloned()).collect();

            Ok(IndexedBlock {
                author: block.author,
                header: block.header,
                chunks: block.chunks,
                transactions,
                actions,
                receipts,
            })
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use url::Url;

    use super::*;
    use crate::config::RpcRetryConfig;
    use crate::test_helpers::{
        BlockViewBuilder, ChunkViewBuilder, OutcomeBuilder, TransactionViewBuilder,
    };

    fn client_for(server: &mockito::ServerGuard) -> JsonRpcClient {
        JsonRpcClient::new(Url::parse(&server.url()).unwrap(), &RpcRetryConfig::no_retry())
            .unwrap()
    }

    fn rpc_result<T: serde::Serialize>(result: &T) -> String {
        serde_json::json!({ "jsonrpc": "2.0", "id": 1, "result": result }).to_string()
    }

    async fn mock_call(
        server: &mut mockito::ServerGuard,
        method: &str,
        params: serde_json::Value,
        body: String,
    ) -> mockito::Mock {
        server
            .mock("POST", "/")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "method": method,
                "params": params,
            })))
            .with_body(body)
            .create_async()
            .await
    }

    #[tokio::test]
    async fn assembles_transactions_and_actions_in_chunk_order() {
        let mut server = mockito::Server::new_async().await;

        let block = BlockViewBuilder::new()
            .height(100)
            .timestamp(1_700_000_000_000_000_000)
            .chunk("C0", 0)
            .chunk("C1", 1)
            .build();
        mock_call(&mut server, "block", serde_json::json!({ "block_id": 100 }), rpc_result(&block))
            .await;

        let chunk0 = ChunkViewBuilder::new("C0", 0)
            .transaction(
                TransactionViewBuilder::new()
                    .hash("tx-a")
                    .signer_id("alice.near")
                    .action(serde_json::json!("CreateAccount"))
                    .action(serde_json::json!({ "Transfer": { "deposit": "5" } }))
                    .build(),
            )
            .receipt(serde_json::json!({ "receipt_id": "r0" }))
            .build();
        let chunk1 = ChunkViewBuilder::new("C1", 1)
            .transaction(
                TransactionViewBuilder::new()
                    .hash("tx-b")
                    .signer_id("bob.near")
                    .action(serde_json::json!({ "FunctionCall": {
                        "method_name": "mint", "args": "", "gas": 1u64, "deposit": "0"
                    }}))
                    .build(),
            )
            .build();
        mock_call(&mut server, "chunk", serde_json::json!({ "chunk_id": "C0" }), rpc_result(&chunk0))
            .await;
        mock_call(&mut server, "chunk", serde_json::json!({ "chunk_id": "C1" }), rpc_result(&chunk1))
            .await;

        let outcome_a = OutcomeBuilder::new("tx-a").gas_burnt(111).log("minted").build();
        let outcome_b = OutcomeBuilder::new("tx-b").gas_burnt(222).build();
        mock_call(
            &mut server,
            "EXPERIMENTAL_tx_status",
            serde_json::json!(["tx-a", "alice.near"]),
            rpc_result(&outcome_a),
        )
        .await;
        mock_call(
            &mut server,
            "EXPERIMENTAL_tx_status",
            serde_json::json!(["tx-b", "bob.near"]),
            rpc_result(&outcome_b),
        )
        .await;

        let api = client_for(&server);
        let indexed = BlockAssembler::new(4).assemble(&api, 100).await.unwrap();

        assert_eq!(indexed.height(), 100);
        assert_eq!(indexed.transactions.len(), 2);
        assert_eq!(indexed.transactions[0].hash, "tx-a");
        assert_eq!(indexed.transactions[0].gas_used, 111);
        assert_eq!(indexed.transactions[0].result.logs, vec!["minted".to_string()]);
        assert_eq!(indexed.transactions[1].hash, "tx-b");
        assert_eq!(indexed.transactions[1].gas_used, 222);

        // Actions flatten in (chunk, tx, action) order with in-tx ids.
        assert_eq!(indexed.actions.len(), 3);
        assert_eq!(indexed.actions[0].id, 0);
        assert_eq!(indexed.actions[0].transaction.hash, "tx-a");
        assert_eq!(indexed.actions[1].id, 1);
        assert_eq!(indexed.actions[1].transaction.hash, "tx-a");
        assert_eq!(indexed.actions[2].id, 0);
        assert_eq!(indexed.actions[2].transaction.hash, "tx-b");

        assert_eq!(indexed.receipts.len(), 1);
    }

    #[tokio::test]
    async fn unknown_block_maps_to_block_unavailable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .with_body(
                serde_json::json!({
                    "jsonrpc": "2.0", "id": 1,
                    "error": {
                        "code": -32000,
                        "message": "Block missing",
                        "cause": { "name": "UNKNOWN_BLOCK" }
                    }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let api = client_for(&server);
        let err = BlockAssembler::new(1).assemble(&api, 42).await.unwrap_err();
        assert!(matches!(err, AssemblyError::BlockUnavailable(42)));
    }

    #[tokio::test]
    async fn undecodable_action_fails_assembly() {
        let mut server = mockito::Server::new_async().await;

        let block = BlockViewBuilder::new().height(7).chunk("C0", 0).build();
        mock_call(&mut server, "block", serde_json::json!({ "block_id": 7 }), rpc_result(&block))
            .await;

        let chunk = ChunkViewBuilder::new("C0", 0)
            .transaction(
                TransactionViewBuilder::new()
                    .hash("tx-bad")
                    .action(serde_json::json!({ "Delegate": {} }))
                    .build(),
            )
            .build();
        mock_call(&mut server, "chunk", serde_json::json!({ "chunk_id": "C0" }), rpc_result(&chunk))
            .await;

        let outcome = OutcomeBuilder::new("tx-bad").build();
        mock_call(
            &mut server,
            "EXPERIMENTAL_tx_status",
            serde_json::json!(["tx-bad", "signer.near"]),
            rpc_result(&outcome),
        )
        .await;

        let api = client_for(&server);
        let err = BlockAssembler::new(1).assemble(&api, 7).await.unwrap_err();
        assert!(matches!(err, AssemblyError::InvalidAction(_)));
    }
}
