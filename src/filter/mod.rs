//! Pure, synchronous predicates over unified blocks, transactions and
//! actions.
//!
//! Filters are declarative: an absent filter passes everything, and a list
//! of filters passes an item when any member does. Transaction filtering is
//! enforced in-process with the same semantics the dictionary applies
//! remotely, so a dictionary outage cannot change which items handlers see.

pub mod cron;

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

pub use cron::{CronFilter, CronFilterError};

use crate::block::types::{ActionType, IndexedAction, IndexedBlock, IndexedTransaction};

/// A block handler filter as declared in the manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockFilter {
    /// Pass only heights divisible by this modulus.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modulo: Option<u64>,
    /// Pass at most one block per slot of this cron expression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// A transaction handler filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionFilter {
    /// Require this signer account.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    /// Require this receiver account.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<String>,
}

/// An action handler filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionFilter {
    /// Required action discriminator.
    #[serde(rename = "type")]
    pub action_type: ActionType,
    /// Reserved payload matcher; accepted but not consulted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<serde_json::Value>,
}

/// A [`BlockFilter`] with its cron expression compiled against the
/// datasource's anchor block.
#[derive(Debug)]
pub struct CompiledBlockFilter {
    /// Modulo condition carried over from the manifest filter.
    pub modulo: Option<u64>,
    /// Compiled cron slot state, when a timestamp filter was declared.
    pub cron: Option<Mutex<CronFilter>>,
}

impl CompiledBlockFilter {
    /// Compiles `filter`, anchoring any cron expression at `anchor_nanos`.
    pub fn compile(filter: &BlockFilter, anchor_nanos: u64) -> Result<Self, CronFilterError> {
        let cron = match &filter.timestamp {
            Some(expression) => Some(Mutex::new(CronFilter::compile(expression, anchor_nanos)?)),
            None => None,
        };
        Ok(Self { modulo: filter.modulo, cron })
    }
}

/// The `filter | filter[]` shape accepted wherever a handler declares
/// filters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterSpec<F> {
    /// A single filter.
    One(F),
    /// A list of alternatives.
    Many(Vec<F>),
}

impl<F> FilterSpec<F> {
    /// The filters as a slice.
    pub fn as_slice(&self) -> &[F] {
        match self {
            Self::One(f) => std::slice::from_ref(f),
            Self::Many(fs) => fs,
        }
    }
}

/// Evaluates an item against an optional filter spec: absent or empty specs
/// pass, otherwise any matching member passes.
pub fn passes_any<T, F>(
    item: &T,
    spec: Option<&FilterSpec<F>>,
    predicate: impl Fn(&T, &F) -> bool,
) -> bool {
    match spec {
        None => true,
        Some(spec) => {
            let filters = spec.as_slice();
            filters.is_empty() || filters.iter().any(|f| predicate(item, f))
        }
    }
}

/// Evaluates a block against a compiled block filter.
///
/// Both conditions must hold when present: the height modulo and the cron
/// slot. The cron check advances the filter's slot on match.
pub fn filter_block(block: &IndexedBlock, filter: Option<&CompiledBlockFilter>) -> bool {
    let Some(filter) = filter else { return true };

    if let Some(modulo) = filter.modulo {
        if block.height() % modulo != 0 {
            return false;
        }
    }

    if let Some(cron) = &filter.cron {
        let mut cron = cron.lock().expect("cron filter lock poisoned");
        if !cron.matches_and_advance(block.header.timestamp) {
            return false;
        }
    }

    true
}

/// Evaluates a transaction against a transaction filter.
pub fn filter_transaction(tx: &IndexedTransaction, filter: Option<&TransactionFilter>) -> bool {
    let Some(filter) = filter else { return true };

    if let Some(sender) = &filter.sender {
        if &tx.signer_id != sender {
            return false;
        }
    }
    if let Some(receiver) = &filter.receiver {
        if &tx.receiver_id != receiver {
            return false;
        }
    }
    true
}

/// Evaluates an action against an action filter.
///
/// Only the discriminator is consulted; the filter's `action` payload
/// matcher is reserved.
pub fn filter_action(action: &IndexedAction, filter: Option<&ActionFilter>) -> bool {
    match filter {
        None => true,
        Some(filter) => action.action_type() == filter.action_type,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{IndexedBlockBuilder, IndexedTransactionBuilder};

    fn modulo_filter(modulo: u64) -> CompiledBlockFilter {
        CompiledBlockFilter { modulo: Some(modulo), cron: None }
    }

    #[test]
    fn absent_filters_pass_everything() {
        let block = IndexedBlockBuilder::new().height(7).build();
        let tx = IndexedTransactionBuilder::new().build();

        assert!(filter_block(&block, None));
        assert!(filter_transaction(&tx, None));
    }

    #[test]
    fn modulo_filter_checks_divisibility() {
        let filter = modulo_filter(100);

        let on_boundary = IndexedBlockBuilder::new().height(1200).build();
        let off_boundary = IndexedBlockBuilder::new().height(1201).build();

        assert!(filter_block(&on_boundary, Some(&filter)));
        assert!(!filter_block(&off_boundary, Some(&filter)));
    }

    #[test]
    fn transaction_filter_is_symmetric_on_sender_and_receiver() {
        let tx = IndexedTransactionBuilder::new()
            .signer_id("alice.near")
            .receiver_id("dex.near")
            .build();

        let sender_only =
            TransactionFilter { sender: Some("alice.near".into()), receiver: None };
        let wrong_sender = TransactionFilter { sender: Some("bob.near".into()), receiver: None };
        let both = TransactionFilter {
            sender: Some("alice.near".into()),
            receiver: Some("dex.near".into()),
        };
        let wrong_receiver = TransactionFilter {
            sender: Some("alice.near".into()),
            receiver: Some("other.near".into()),
        };

        assert!(filter_transaction(&tx, Some(&sender_only)));
        assert!(!filter_transaction(&tx, Some(&wrong_sender)));
        assert!(filter_transaction(&tx, Some(&both)));
        assert!(!filter_transaction(&tx, Some(&wrong_receiver)));
    }

    #[test]
    fn action_filter_matches_on_type_only() {
        let block = IndexedBlockBuilder::new()
            .height(5)
            .transaction_with_actions(
                IndexedTransactionBuilder::new().build(),
                vec![serde_json::json!("CreateAccount"), serde_json::json!({"Transfer": {"deposit": "1"}})],
            )
            .build();

        let create = ActionFilter { action_type: ActionType::CreateAccount, action: None };
        let transfer = ActionFilter { action_type: ActionType::Transfer, action: None };
        let stake = ActionFilter { action_type: ActionType::Stake, action: None };

        assert!(filter_action(&block.actions[0], Some(&create)));
        assert!(filter_action(&block.actions[1], Some(&transfer)));
        assert!(!filter_action(&block.actions[1], Some(&stake)));
    }

    #[test]
    fn reserved_action_payload_matcher_is_ignored() {
        let block = IndexedBlockBuilder::new()
            .transaction_with_actions(
                IndexedTransactionBuilder::new().build(),
                vec![serde_json::json!({"Transfer": {"deposit": "1"}})],
            )
            .build();

        let filter = ActionFilter {
            action_type: ActionType::Transfer,
            action: Some(serde_json::json!({ "deposit": "999" })),
        };
        assert!(filter_action(&block.actions[0], Some(&filter)));
    }

    #[test]
    fn filter_spec_accepts_one_or_many() {
        let one: FilterSpec<TransactionFilter> =
            serde_json::from_value(serde_json::json!({ "sender": "alice.near" })).unwrap();
        let many: FilterSpec<TransactionFilter> =
            serde_json::from_value(serde_json::json!([{ "sender": "a" }, { "sender": "b" }]))
                .unwrap();

        assert_eq!(one.as_slice().len(), 1);
        assert_eq!(many.as_slice().len(), 2);
    }

    #[test]
    fn passes_any_requires_a_single_match() {
        let tx = IndexedTransactionBuilder::new().signer_id("b").build();
        let spec = FilterSpec::Many(vec![
            TransactionFilter { sender: Some("a".into()), receiver: None },
            TransactionFilter { sender: Some("b".into()), receiver: None },
        ]);

        assert!(passes_any(&tx, Some(&spec), |t, f| filter_transaction(t, Some(f))));

        let empty: FilterSpec<TransactionFilter> = FilterSpec::Many(vec![]);
        assert!(passes_any(&tx, Some(&empty), |t, f| filter_transaction(t, Some(f))));
        assert!(passes_any(&tx, None, |t, f: &TransactionFilter| filter_transaction(t, Some(f))));
    }

    #[test]
    fn combined_modulo_and_cron_must_both_hold() {
        // Hourly cron anchored at t0; block timestamps beyond the first slot.
        let anchor = 1_609_459_200u64 * 1_000_000_000;
        let two_hours = anchor + 2 * 3600 * 1_000_000_000;

        let filter = CompiledBlockFilter::compile(
            &BlockFilter { modulo: Some(10), timestamp: Some("0 0 * * * *".into()) },
            anchor,
        )
        .unwrap();

        // Wrong modulo: cron is never consulted, slot does not advance.
        let off = IndexedBlockBuilder::new().height(11).timestamp(two_hours).build();
        assert!(!filter_block(&off, Some(&filter)));

        // Right modulo and past the slot: passes.
        let on = IndexedBlockBuilder::new().height(20).timestamp(two_hours).build();
        assert!(filter_block(&on, Some(&filter)));
    }
}
