//! The dictionary client: translates handler filters into entity queries
//! against an external index service, validates its metadata, and scans
//! ranges of matching heights.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use reqwest_middleware::ClientWithMiddleware;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::config::RpcRetryConfig;
use crate::project::datasource::{
    Datasource, DatasourceProcessor, HandlerFilter, HandlerKind,
};

/// One equality condition within a dictionary entity query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DictionaryQueryCondition {
    /// Field to match.
    pub field: String,
    /// Value the field must equal.
    pub value: serde_json::Value,
    /// Matcher name; only `equalTo` is emitted by this engine.
    pub matcher: String,
}

impl DictionaryQueryCondition {
    /// An `equalTo` condition.
    pub fn equal_to(field: &str, value: impl Into<serde_json::Value>) -> Self {
        Self { field: field.to_string(), value: value.into(), matcher: "equalTo".into() }
    }
}

/// One entity query sent to the dictionary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DictionaryQueryEntry {
    /// Entity to scan (`transactions`, `actions`).
    pub entity: String,
    /// Conditions a row must satisfy.
    pub conditions: Vec<DictionaryQueryCondition>,
}

impl DictionaryQueryEntry {
    fn dedup_key(&self) -> String {
        let mut conditions: Vec<String> = self
            .conditions
            .iter()
            .map(|c| format!("{}={}:{}", c.field, c.value, c.matcher))
            .collect();
        conditions.sort();
        format!("{}[{}]", self.entity, conditions.join(","))
    }
}

/// Dictionary service metadata attached to every response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DictionaryMetadata {
    /// Highest height the dictionary has indexed.
    pub last_processed_height: u64,
    /// Genesis hash of the chain the dictionary serves.
    pub genesis_hash: String,
    /// Chain id the dictionary serves.
    pub chain: String,
    /// First height the dictionary covers.
    pub start_height: u64,
}

/// A page of matching heights plus metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopedDictionaryEntries {
    /// Heights within the queried range that match any entry.
    #[serde(rename = "batchBlocks")]
    pub batch_blocks: Vec<u64>,
    /// Service metadata.
    #[serde(rename = "_metadata")]
    pub metadata: DictionaryMetadata,
}

/// Dictionary failures and validation outcomes.
#[derive(Debug, Error)]
pub enum DictionaryError {
    /// The service could not be reached or answered malformed data.
    #[error("Dictionary request failed: {0}")]
    Request(String),

    /// The dictionary serves a different chain; the client disables itself
    /// for the rest of the session.
    #[error("Dictionary genesis mismatch: expected {expected}, observed {observed}")]
    GenesisMismatch {
        /// Genesis hash observed from the RPC pool.
        expected: String,
        /// Genesis hash the dictionary reported.
        observed: String,
    },

    /// The dictionary has not yet indexed the requested range; skip it for
    /// this cycle only.
    #[error("Dictionary lags behind: last processed {last_processed}, requested {requested_start}")]
    Lagging {
        /// Highest height the dictionary has indexed.
        last_processed: u64,
        /// Start of the requested range.
        requested_start: u64,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DictionaryRequest<'a> {
    start_height: u64,
    end_height: u64,
    limit: u64,
    entities: &'a [DictionaryQueryEntry],
}

fn transaction_conditions(
    filter: &crate::filter::TransactionFilter,
) -> Vec<DictionaryQueryCondition> {
    let mut conditions = Vec::new();
    if let Some(sender) = &filter.sender {
        conditions.push(DictionaryQueryCondition::equal_to("sender", sender.clone()));
    }
    if let Some(receiver) = &filter.receiver {
        conditions.push(DictionaryQueryCondition::equal_to("receiver", receiver.clone()));
    }
    conditions
}

fn action_entry(filter: &crate::filter::ActionFilter) -> DictionaryQueryEntry {
    DictionaryQueryEntry {
        entity: "actions".into(),
        conditions: vec![DictionaryQueryCondition::equal_to(
            "type",
            filter.action_type.to_string(),
        )],
    }
}

fn fallback_entry(
    processor: &dyn DatasourceProcessor,
    kind: &str,
    raw: serde_json::Value,
) -> Option<DictionaryQueryEntry> {
    use crate::project::datasource::BaseHandlerKind;

    let handler_processor = processor.handler_processors().get(kind)?;
    match handler_processor.base_kind {
        BaseHandlerKind::Transaction => {
            let filter: crate::filter::TransactionFilter = serde_json::from_value(raw).ok()?;
            let conditions = transaction_conditions(&filter);
            if conditions.is_empty() {
                return None;
            }
            Some(DictionaryQueryEntry { entity: "transactions".into(), conditions })
        }
        BaseHandlerKind::Action => {
            let filter: crate::filter::ActionFilter = serde_json::from_value(raw).ok()?;
            Some(action_entry(&filter))
        }
        BaseHandlerKind::Block => None,
    }
}

/// Builds the query entries for a set of datasources.
///
/// Returns `None` when the dictionary cannot narrow the scan: a block
/// handler without a modulo, or a transaction handler without conditions,
/// matches (nearly) every block, so the whole scan falls back to sequential
/// ranges.
pub fn build_query_entries(
    datasources: &[Datasource],
    processors: &HashMap<String, Arc<dyn DatasourceProcessor>>,
) -> Option<Vec<DictionaryQueryEntry>> {
    let mut entries = Vec::new();
    let mut seen = BTreeSet::new();

    let mut push = |entry: DictionaryQueryEntry| {
        if seen.insert(entry.dedup_key()) {
            entries.push(entry);
        }
    };

    for ds in datasources {
        let processor = ds.processor_kind().and_then(|kind| processors.get(kind));

        for handler in &ds.mapping.handlers {
            match (&handler.kind, &handler.filter) {
                (HandlerKind::Block, filter) => {
                    // Modulo-filtered block handlers are computed locally;
                    // anything else makes the dictionary useless for this
                    // project.
                    let all_modulo = matches!(filter, Some(HandlerFilter::Block(spec))
                        if !spec.as_slice().is_empty()
                            && spec.as_slice().iter().all(|f| f.modulo.is_some()));
                    if !all_modulo {
                        return None;
                    }
                }
                (HandlerKind::Transaction, filter) => {
                    let Some(HandlerFilter::Transaction(spec)) = filter else { return None };
                    for f in spec.as_slice() {
                        let conditions = transaction_conditions(f);
                        if conditions.is_empty() {
                            return None;
                        }
                        push(DictionaryQueryEntry { entity: "transactions".into(), conditions });
                    }
                }
                (HandlerKind::Action, Some(HandlerFilter::Action(spec))) => {
                    for f in spec.as_slice() {
                        push(action_entry(f));
                    }
                }
                (HandlerKind::Action, _) => return None,
                (HandlerKind::Custom(kind), filter) => {
                    let Some(processor) = processor else { return None };
                    let raw = match filter {
                        Some(HandlerFilter::Custom(raw)) => raw.clone(),
                        _ => serde_json::Value::Null,
                    };
                    match processor.dictionary_query(&raw, ds) {
                        Some(entry) => push(entry),
                        // Fall back to interpreting the raw filter as the
                        // handler's base-kind filter.
                        None => push(fallback_entry(processor.as_ref(), kind, raw)?),
                    }
                }
            }
        }
    }

    Some(entries)
}

/// A client for one dictionary service, scoped to one chain session.
pub struct DictionaryService {
    url: Url,
    http: ClientWithMiddleware,
    genesis_hash: String,
    disabled: AtomicBool,
    start_height: AtomicU64,
    entries: ArcSwap<Option<Vec<DictionaryQueryEntry>>>,
}

impl DictionaryService {
    /// Creates a client for the dictionary at `url`, validated against the
    /// pool's canonical `genesis_hash`.
    pub fn new(url: Url, genesis_hash: String, retry: &RpcRetryConfig) -> Self {
        let base_client = reqwest::Client::builder()
            .timeout(retry.request_timeout())
            .build()
            .unwrap_or_default();
        let http = reqwest_middleware::ClientBuilder::new(base_client).build();

        Self {
            url,
            http,
            genesis_hash,
            disabled: AtomicBool::new(false),
            start_height: AtomicU64::new(0),
            entries: ArcSwap::new(Arc::new(None)),
        }
    }

    /// Rebuilds the cached query entries from the current datasource set.
    /// Swapped atomically; concurrent readers see either the old or the new
    /// set in full.
    pub fn update_queries(
        &self,
        datasources: &[Datasource],
        processors: &HashMap<String, Arc<dyn DatasourceProcessor>>,
    ) {
        let entries = build_query_entries(datasources, processors);
        match &entries {
            Some(entries) => tracing::info!(
                entry_count = entries.len(),
                "Rebuilt dictionary query entries."
            ),
            None => tracing::warn!(
                "Handler filters cannot be served by the dictionary; falling back to sequential scans."
            ),
        }
        self.entries.store(Arc::new(entries));
    }

    /// The first height the dictionary covers, learned from metadata.
    pub fn start_height(&self) -> u64 {
        self.start_height.load(Ordering::Relaxed)
    }

    /// Whether the dictionary should be used for a scan starting at
    /// `start_height`.
    pub fn usable(&self, start_height: u64) -> bool {
        if self.disabled.load(Ordering::Relaxed) {
            return false;
        }
        let entries = self.entries.load();
        match entries.as_ref() {
            Some(entries) if !entries.is_empty() => start_height >= self.start_height(),
            _ => false,
        }
    }

    /// Queries matching heights in `[start, end)`, returning at most
    /// `limit`, and validates the response metadata.
    ///
    /// A genesis mismatch disables the client for the rest of the session;
    /// a lagging dictionary only skips this cycle.
    pub async fn scoped_dictionary_entries(
        &self,
        start: u64,
        end: u64,
        limit: u64,
    ) -> Result<ScopedDictionaryEntries, DictionaryError> {
        let entries = self.entries.load();
        let entries = entries.as_ref().as_ref().cloned().unwrap_or_default();

        let request =
            DictionaryRequest { start_height: start, end_height: end, limit, entities: &entries };

        let response = self
            .http
            .post(self.url.clone())
            .json(&request)
            .send()
            .await
            .map_err(|e| DictionaryError::Request(e.to_string()))?;
        let page: ScopedDictionaryEntries =
            response.json().await.map_err(|e| DictionaryError::Request(e.to_string()))?;

        self.validate_metadata(&page.metadata, start)?;
        Ok(page)
    }

    /// Fetches metadata only, seeding `start_height` and validating chain
    /// identity. Called once at init.
    pub async fn sync_metadata(&self) -> Result<DictionaryMetadata, DictionaryError> {
        let page = self.scoped_dictionary_entries(0, 0, 0).await?;
        Ok(page.metadata)
    }

    fn validate_metadata(
        &self,
        metadata: &DictionaryMetadata,
        requested_start: u64,
    ) -> Result<(), DictionaryError> {
        if metadata.genesis_hash != self.genesis_hash {
            tracing::warn!(
                expected = %self.genesis_hash,
                observed = %metadata.genesis_hash,
                "Dictionary serves a different chain; disabling it for this session."
            );
            self.disabled.store(true, Ordering::Relaxed);
            return Err(DictionaryError::GenesisMismatch {
                expected: self.genesis_hash.clone(),
                observed: metadata.genesis_hash.clone(),
            });
        }

        self.start_height.store(metadata.start_height, Ordering::Relaxed);

        if requested_start > 0 && metadata.last_processed_height < requested_start {
            return Err(DictionaryError::Lagging {
                last_processed: metadata.last_processed_height,
                requested_start,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime_ds(handlers_yaml: serde_json::Value) -> Datasource {
        serde_json::from_value(serde_json::json!({
            "kind": "Near/Runtime",
            "startBlock": 1,
            "mapping": { "file": "./dist/index.js", "handlers": handlers_yaml }
        }))
        .unwrap()
    }

    fn no_processors() -> HashMap<String, Arc<dyn DatasourceProcessor>> {
        HashMap::new()
    }

    #[test]
    fn transaction_filters_become_equality_conditions() {
        let ds = runtime_ds(serde_json::json!([
            {
                "kind": "near/TransactionHandler",
                "handler": "handleTx",
                "filter": { "sender": "alice.near", "receiver": "dex.near" }
            }
        ]));

        let entries = build_query_entries(&[ds], &no_processors()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entity, "transactions");
        assert_eq!(
            entries[0].conditions,
            vec![
                DictionaryQueryCondition::equal_to("sender", "alice.near"),
                DictionaryQueryCondition::equal_to("receiver", "dex.near"),
            ]
        );
    }

    #[test]
    fn action_filters_query_the_actions_entity() {
        let ds = runtime_ds(serde_json::json!([
            {
                "kind": "near/ActionHandler",
                "handler": "handleAction",
                "filter": [ { "type": "FunctionCall" }, { "type": "Transfer" } ]
            }
        ]));

        let entries = build_query_entries(&[ds], &no_processors()).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.entity == "actions"));
    }

    #[test]
    fn duplicate_entries_collapse() {
        let ds_a = runtime_ds(serde_json::json!([
            { "kind": "near/ActionHandler", "handler": "a", "filter": { "type": "Transfer" } }
        ]));
        let ds_b = runtime_ds(serde_json::json!([
            { "kind": "near/ActionHandler", "handler": "b", "filter": { "type": "Transfer" } }
        ]));

        let entries = build_query_entries(&[ds_a, ds_b], &no_processors()).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn modulo_block_handlers_emit_no_entries() {
        let ds = runtime_ds(serde_json::json!([
            { "kind": "near/BlockHandler", "handler": "h", "filter": { "modulo": 10 } },
            { "kind": "near/ActionHandler", "handler": "a", "filter": { "type": "Stake" } }
        ]));

        let entries = build_query_entries(&[ds], &no_processors()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entity, "actions");
    }

    #[test]
    fn block_handler_without_modulo_abandons_the_dictionary() {
        let ds = runtime_ds(serde_json::json!([
            { "kind": "near/BlockHandler", "handler": "h" },
            { "kind": "near/ActionHandler", "handler": "a", "filter": { "type": "Stake" } }
        ]));

        assert!(build_query_entries(&[ds], &no_processors()).is_none());
    }

    #[test]
    fn unfiltered_transaction_handler_abandons_the_dictionary() {
        let ds = runtime_ds(serde_json::json!([
            { "kind": "near/TransactionHandler", "handler": "handleTx" }
        ]));

        assert!(build_query_entries(&[ds], &no_processors()).is_none());
    }

    fn service_with_entries(server_url: &str, genesis: &str) -> DictionaryService {
        let service = DictionaryService::new(
            Url::parse(server_url).unwrap(),
            genesis.into(),
            &RpcRetryConfig::no_retry(),
        );
        let ds = runtime_ds(serde_json::json!([
            { "kind": "near/ActionHandler", "handler": "a", "filter": { "type": "Transfer" } }
        ]));
        service.update_queries(&[ds], &no_processors());
        service
    }

    fn page_body(
        batch_blocks: &[u64],
        genesis: &str,
        last_processed: u64,
        start_height: u64,
    ) -> String {
        serde_json::json!({
            "batchBlocks": batch_blocks,
            "_metadata": {
                "lastProcessedHeight": last_processed,
                "genesisHash": genesis,
                "chain": "mainnet",
                "startHeight": start_height
            }
        })
        .to_string()
    }

    #[tokio::test]
    async fn query_returns_heights_and_updates_start_height() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "startHeight": 1000, "endHeight": 11000, "limit": 10
            })))
            .with_body(page_body(&[1003, 1500], "0xAAA", 99_000, 100))
            .create_async()
            .await;

        let service = service_with_entries(&server.url(), "0xAAA");
        let page = service.scoped_dictionary_entries(1000, 11000, 10).await.unwrap();

        assert_eq!(page.batch_blocks, vec![1003, 1500]);
        assert_eq!(service.start_height(), 100);
        assert!(service.usable(1000));
    }

    #[tokio::test]
    async fn genesis_mismatch_disables_for_the_session() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .with_body(page_body(&[], "0xBBB", 99_000, 100))
            .create_async()
            .await;

        let service = service_with_entries(&server.url(), "0xAAA");
        assert!(service.usable(1000));

        let err = service.scoped_dictionary_entries(1000, 11000, 10).await.unwrap_err();
        assert!(matches!(err, DictionaryError::GenesisMismatch { .. }));

        // Disabled for every subsequent scan this session.
        assert!(!service.usable(1000));
        assert!(!service.usable(1_000_000));
    }

    #[tokio::test]
    async fn lagging_dictionary_skips_the_cycle_without_disabling() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .with_body(page_body(&[], "0xAAA", 500, 100))
            .create_async()
            .await;

        let service = service_with_entries(&server.url(), "0xAAA");
        let err = service.scoped_dictionary_entries(1000, 11000, 10).await.unwrap_err();

        assert!(matches!(
            err,
            DictionaryError::Lagging { last_processed: 500, requested_start: 1000 }
        ));
        assert!(service.usable(1000));
    }

    #[test]
    fn usable_respects_start_height_and_missing_entries() {
        let service = DictionaryService::new(
            Url::parse("http://localhost:1/").unwrap(),
            "0xAAA".into(),
            &RpcRetryConfig::no_retry(),
        );
        // No entries built yet.
        assert!(!service.usable(1000));

        let ds = runtime_ds(serde_json::json!([
            { "kind": "near/ActionHandler", "handler": "a", "filter": { "type": "Transfer" } }
        ]));
        service.update_queries(&[ds], &no_processors());
        service.start_height.store(500, Ordering::Relaxed);

        assert!(!service.usable(499));
        assert!(service.usable(500));
    }
}
