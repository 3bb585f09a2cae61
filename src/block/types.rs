//! Unified block, transaction and action types produced by the assembler
//! and consumed by the filter engine and the indexer.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::rpc::types::{BlockHeaderView, ChunkHeaderView};

/// Decode failure for a wire action.
#[derive(Debug, Error)]
pub enum InvalidActionError {
    /// The action discriminator is not a member of the closed variant set.
    #[error("Unknown action type: {0}")]
    UnknownType(String),

    /// The action payload did not match the shape its discriminator implies.
    #[error("Malformed `{kind}` action payload: {source}")]
    MalformedPayload {
        /// Action discriminator.
        kind: String,
        /// Underlying decode error.
        #[source]
        source: serde_json::Error,
    },

    /// The wire value is neither the bare `"CreateAccount"` string nor a
    /// single-key object.
    #[error("Invalid action shape: {0}")]
    Shape(String),
}

/// The closed set of action discriminators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionType {
    /// Account creation.
    CreateAccount,
    /// Contract code deployment.
    DeployContract,
    /// Contract method invocation.
    FunctionCall,
    /// Balance transfer.
    Transfer,
    /// Validator staking.
    Stake,
    /// Access key addition.
    AddKey,
    /// Access key removal.
    DeleteKey,
    /// Account deletion.
    DeleteAccount,
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::CreateAccount => "CreateAccount",
            Self::DeployContract => "DeployContract",
            Self::FunctionCall => "FunctionCall",
            Self::Transfer => "Transfer",
            Self::Stake => "Stake",
            Self::AddKey => "AddKey",
            Self::DeleteKey => "DeleteKey",
            Self::DeleteAccount => "DeleteAccount",
        };
        f.write_str(name)
    }
}

/// Payload of a `DeployContract` action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployContractAction {
    /// Base64-encoded contract code.
    pub code: String,
}

/// Payload of a `FunctionCall` action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCallAction {
    /// Method to invoke.
    pub method_name: String,
    /// Base64-encoded call arguments.
    pub args: String,
    /// Gas attached to the call.
    pub gas: u64,
    /// Deposit attached to the call, in yoctoNEAR as a decimal string.
    pub deposit: String,
}

/// Payload of a `Transfer` action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferAction {
    /// Transferred amount in yoctoNEAR as a decimal string.
    pub deposit: String,
}

/// Payload of a `Stake` action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeAction {
    /// Staked amount in yoctoNEAR as a decimal string.
    pub stake: String,
    /// Validator public key.
    pub public_key: String,
}

/// Payload of an `AddKey` action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddKeyAction {
    /// Key being added.
    pub public_key: String,
    /// Permissions granted to the key, passed through undecoded.
    pub access_key: serde_json::Value,
}

/// Payload of a `DeleteKey` action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteKeyAction {
    /// Key being removed.
    pub public_key: String,
}

/// Payload of a `DeleteAccount` action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteAccountAction {
    /// Account receiving the remaining balance.
    pub beneficiary_id: String,
}

/// A decoded action payload, tagged by [`ActionType`].
#[derive(Debug, Clone, PartialEq)]
pub enum ActionPayload {
    /// Account creation; carries no payload.
    CreateAccount,
    /// Contract code deployment.
    DeployContract(DeployContractAction),
    /// Contract method invocation.
    FunctionCall(FunctionCallAction),
    /// Balance transfer.
    Transfer(TransferAction),
    /// Validator staking.
    Stake(StakeAction),
    /// Access key addition.
    AddKey(AddKeyAction),
    /// Access key removal.
    DeleteKey(DeleteKeyAction),
    /// Account deletion.
    DeleteAccount(DeleteAccountAction),
}

impl ActionPayload {
    /// The discriminator of this payload.
    pub fn action_type(&self) -> ActionType {
        match self {
            Self::CreateAccount => ActionType::CreateAccount,
            Self::DeployContract(_) => ActionType::DeployContract,
            Self::FunctionCall(_) => ActionType::FunctionCall,
            Self::Transfer(_) => ActionType::Transfer,
            Self::Stake(_) => ActionType::Stake,
            Self::AddKey(_) => ActionType::AddKey,
            Self::DeleteKey(_) => ActionType::DeleteKey,
            Self::DeleteAccount(_) => ActionType::DeleteAccount,
        }
    }

    /// Decodes a wire action.
    ///
    /// The chain serializes `CreateAccount` either as the bare string
    /// `"CreateAccount"` or as `{"CreateAccount": {}}`; every other action
    /// is a single-key object whose key is the discriminator.
    pub fn from_wire(value: &serde_json::Value) -> Result<Self, InvalidActionError> {
        if let Some(s) = value.as_str() {
            return if s == "CreateAccount" {
                Ok(Self::CreateAccount)
            } else {
                Err(InvalidActionError::UnknownType(s.to_string()))
            };
        }

        let object = value
            .as_object()
            .ok_or_else(|| InvalidActionError::Shape(format!("expected string or object, got {value}")))?;
        if object.len() != 1 {
            return Err(InvalidActionError::Shape(format!(
                "expected a single-key object, got {} keys",
                object.len()
            )));
        }
        let (kind, payload) = object.iter().next().expect("len checked above");

        fn decode<T: serde::de::DeserializeOwned>(
            kind: &str,
            payload: &serde_json::Value,
        ) -> Result<T, InvalidActionError> {
            serde_json::from_value(payload.clone()).map_err(|source| {
                InvalidActionError::MalformedPayload { kind: kind.to_string(), source }
            })
        }

        match kind.as_str() {
            "CreateAccount" => Ok(Self::CreateAccount),
            "DeployContract" => decode(kind, payload).map(Self::DeployContract),
            "FunctionCall" => decode(kind, payload).map(Self::FunctionCall),
            "Transfer" => decode(kind, payload).map(Self::Transfer),
            "Stake" => decode(kind, payload).map(Self::Stake),
            "AddKey" => decode(kind, payload).map(Self::AddKey),
            "DeleteKey" => decode(kind, payload).map(Self::DeleteKey),
            "DeleteAccount" => decode(kind, payload).map(Self::DeleteAccount),
            other => Err(InvalidActionError::UnknownType(other.to_string())),
        }
    }

    /// Re-encodes this payload as the single-key object wire form.
    pub fn to_wire(&self) -> serde_json::Value {
        fn tag<T: Serialize>(kind: &str, payload: &T) -> serde_json::Value {
            serde_json::json!({ kind: payload })
        }

        match self {
            Self::CreateAccount => serde_json::json!({ "CreateAccount": {} }),
            Self::DeployContract(a) => tag("DeployContract", a),
            Self::FunctionCall(a) => tag("FunctionCall", a),
            Self::Transfer(a) => tag("Transfer", a),
            Self::Stake(a) => tag("Stake", a),
            Self::AddKey(a) => tag("AddKey", a),
            Self::DeleteKey(a) => tag("DeleteKey", a),
            Self::DeleteAccount(a) => tag("DeleteAccount", a),
        }
    }
}

impl Serialize for ActionPayload {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_wire().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ActionPayload {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        Self::from_wire(&value).map_err(serde::de::Error::custom)
    }
}

/// Derived execution attributes of a transaction, obtained from the
/// tx-status RPC rather than the chunk body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionResult {
    /// Outcome id (equals the transaction hash).
    pub id: String,
    /// Log lines emitted while converting the transaction to its receipt.
    pub logs: Vec<String>,
}

/// A transaction within a unified block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedTransaction {
    /// Transaction hash.
    pub hash: String,
    /// Signing account.
    pub signer_id: String,
    /// Receiving account.
    pub receiver_id: String,
    /// Raw wire actions, in transaction order.
    pub actions: Vec<serde_json::Value>,
    /// Gas price of the enclosing block.
    pub gas_price: String,
    /// Gas burnt converting this transaction, from the tx-status RPC.
    pub gas_used: u64,
    /// Hash of the enclosing block.
    pub block_hash: String,
    /// Height of the enclosing block.
    pub block_height: u64,
    /// Timestamp of the enclosing block, nanoseconds since the Unix epoch.
    pub timestamp: u64,
    /// Execution result attributes.
    pub result: TransactionResult,
}

/// A lightweight reference from an action back to its transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRef {
    /// Hash of the owning transaction.
    pub hash: String,
    /// Signer of the owning transaction.
    pub signer_id: String,
    /// Receiver of the owning transaction.
    pub receiver_id: String,
    /// Height of the block the transaction was included in.
    pub block_height: u64,
}

impl From<&IndexedTransaction> for TransactionRef {
    fn from(tx: &IndexedTransaction) -> Self {
        Self {
            hash: tx.hash.clone(),
            signer_id: tx.signer_id.clone(),
            receiver_id: tx.receiver_id.clone(),
            block_height: tx.block_height,
        }
    }
}

/// A decoded action within a unified block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedAction {
    /// Position of the action within its transaction.
    pub id: usize,
    /// Decoded payload.
    pub payload: ActionPayload,
    /// The owning transaction.
    pub transaction: TransactionRef,
}

impl IndexedAction {
    /// The discriminator of this action.
    pub fn action_type(&self) -> ActionType {
        self.payload.action_type()
    }
}

/// A block materialized once per height, identified by `(height, hash)`.
///
/// `transactions` and `actions` are derived deterministically from chunk
/// contents in (chunk, in-chunk transaction, in-transaction action) order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedBlock {
    /// Account id of the block producer.
    pub author: String,
    /// The block header.
    pub header: BlockHeaderView,
    /// Chunk headers in shard order.
    pub chunks: Vec<ChunkHeaderView>,
    /// All transactions, flattened across chunks.
    pub transactions: Vec<IndexedTransaction>,
    /// All decoded actions, flattened across transactions.
    pub actions: Vec<IndexedAction>,
    /// All incoming receipts, flattened across chunks, undecoded.
    pub receipts: Vec<serde_json::Value>,
}

impl IndexedBlock {
    /// Height of this block.
    pub fn height(&self) -> u64 {
        self.header.height
    }

    /// Hash of this block.
    pub fn hash(&self) -> &str {
        &self.header.hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_string_decodes_to_create_account() {
        let wire = serde_json::json!("CreateAccount");
        let action = ActionPayload::from_wire(&wire).unwrap();
        assert_eq!(action, ActionPayload::CreateAccount);
        assert_eq!(action.action_type(), ActionType::CreateAccount);
    }

    #[test]
    fn tagged_object_decodes_to_create_account() {
        let wire = serde_json::json!({ "CreateAccount": {} });
        let action = ActionPayload::from_wire(&wire).unwrap();
        assert_eq!(action, ActionPayload::CreateAccount);
    }

    #[test]
    fn create_account_round_trip_is_accepted_in_both_forms() {
        let decoded = ActionPayload::from_wire(&serde_json::json!("CreateAccount")).unwrap();
        let reencoded = decoded.to_wire();

        // The re-encoded object form must itself decode back.
        assert_eq!(reencoded, serde_json::json!({ "CreateAccount": {} }));
        assert_eq!(ActionPayload::from_wire(&reencoded).unwrap(), decoded);
    }

    #[test]
    fn function_call_decodes_payload_fields() {
        let wire = serde_json::json!({
            "FunctionCall": {
                "method_name": "ft_transfer",
                "args": "eyJrZXkiOiAidmFsdWUifQ==",
                "gas": 30_000_000_000_000u64,
                "deposit": "1"
            }
        });

        let action = ActionPayload::from_wire(&wire).unwrap();
        match &action {
            ActionPayload::FunctionCall(call) => {
                assert_eq!(call.method_name, "ft_transfer");
                assert_eq!(call.gas, 30_000_000_000_000);
            }
            other => panic!("expected FunctionCall, got {other:?}"),
        }
        assert_eq!(action.to_wire(), wire);
    }

    #[test]
    fn unknown_discriminator_is_rejected() {
        let wire = serde_json::json!({ "Delegate": {} });
        let err = ActionPayload::from_wire(&wire).unwrap_err();
        assert!(matches!(err, InvalidActionError::UnknownType(t) if t == "Delegate"));
    }

    #[test]
    fn unknown_bare_string_is_rejected() {
        let err = ActionPayload::from_wire(&serde_json::json!("Transfer")).unwrap_err();
        assert!(matches!(err, InvalidActionError::UnknownType(_)));
    }

    #[test]
    fn multi_key_object_is_rejected() {
        let wire = serde_json::json!({ "Transfer": { "deposit": "1" }, "Stake": {} });
        let err = ActionPayload::from_wire(&wire).unwrap_err();
        assert!(matches!(err, InvalidActionError::Shape(_)));
    }

    #[test]
    fn malformed_payload_names_the_kind() {
        let wire = serde_json::json!({ "Transfer": { "amount": "1" } });
        let err = ActionPayload::from_wire(&wire).unwrap_err();
        assert!(matches!(err, InvalidActionError::MalformedPayload { kind, .. } if kind == "Transfer"));
    }
}
