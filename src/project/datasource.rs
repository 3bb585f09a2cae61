//! Datasource and handler models: the declarative binding of mapping
//! handlers to filters, plus the capability trait custom datasources plug
//! into.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::filter::{ActionFilter, BlockFilter, FilterSpec, TransactionFilter};
use crate::indexer::HandlerInput;

/// The datasource flavor: built-in runtime filtering, or a pluggable
/// processor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DatasourceKind {
    /// Filters raw chain items directly.
    Runtime,
    /// Delegates filtering and transformation to a [`DatasourceProcessor`]
    /// registered under this kind string.
    Custom(String),
}

impl DatasourceKind {
    /// The wire string of this kind.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Runtime => "Near/Runtime",
            Self::Custom(kind) => kind,
        }
    }
}

impl Serialize for DatasourceKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DatasourceKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let kind = String::deserialize(deserializer)?;
        Ok(if kind == "Near/Runtime" { Self::Runtime } else { Self::Custom(kind) })
    }
}

/// The handler kind as declared in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    /// One invocation per matching block.
    Block,
    /// One invocation per matching transaction.
    Transaction,
    /// One invocation per matching action.
    Action,
    /// A processor-defined kind, resolved to a base kind at dispatch.
    Custom(String),
}

impl HandlerKind {
    /// The wire string of this kind.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Block => "near/BlockHandler",
            Self::Transaction => "near/TransactionHandler",
            Self::Action => "near/ActionHandler",
            Self::Custom(kind) => kind,
        }
    }
}

impl Serialize for HandlerKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for HandlerKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let kind = String::deserialize(deserializer)?;
        Ok(match kind.as_str() {
            "near/BlockHandler" => Self::Block,
            "near/TransactionHandler" => Self::Transaction,
            "near/ActionHandler" => Self::Action,
            _ => Self::Custom(kind),
        })
    }
}

/// The base kind a handler ultimately dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaseHandlerKind {
    /// Dispatch per block.
    Block,
    /// Dispatch per transaction.
    Transaction,
    /// Dispatch per action.
    Action,
}

/// A handler's filter, typed by its base kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HandlerFilter {
    /// Filters for a block handler.
    Block(FilterSpec<BlockFilter>),
    /// Filters for a transaction handler.
    Transaction(FilterSpec<TransactionFilter>),
    /// Filters for an action handler.
    Action(FilterSpec<ActionFilter>),
    /// Raw filters of a custom handler, interpreted by its processor.
    Custom(serde_json::Value),
}

impl HandlerFilter {
    /// The block filter spec, when this is a block filter.
    pub fn as_block(&self) -> Option<&FilterSpec<BlockFilter>> {
        match self {
            Self::Block(spec) => Some(spec),
            _ => None,
        }
    }

    /// The transaction filter spec, when this is a transaction filter.
    pub fn as_transaction(&self) -> Option<&FilterSpec<TransactionFilter>> {
        match self {
            Self::Transaction(spec) => Some(spec),
            _ => None,
        }
    }

    /// The action filter spec, when this is an action filter.
    pub fn as_action(&self) -> Option<&FilterSpec<ActionFilter>> {
        match self {
            Self::Action(spec) => Some(spec),
            _ => None,
        }
    }
}

/// A single handler binding within a datasource mapping.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Handler {
    /// Declared kind.
    pub kind: HandlerKind,
    /// Name of the mapping function to invoke.
    pub handler: String,
    /// Optional filter over the handler's input kind.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<HandlerFilter>,
}

impl<'de> Deserialize<'de> for Handler {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct RawHandler {
            kind: HandlerKind,
            handler: String,
            #[serde(default)]
            filter: Option<serde_json::Value>,
        }

        let raw = RawHandler::deserialize(deserializer)?;
        let filter = match (&raw.kind, raw.filter) {
            (_, None) => None,
            (HandlerKind::Block, Some(v)) => Some(HandlerFilter::Block(
                serde_json::from_value(v).map_err(serde::de::Error::custom)?,
            )),
            (HandlerKind::Transaction, Some(v)) => Some(HandlerFilter::Transaction(
                serde_json::from_value(v).map_err(serde::de::Error::custom)?,
            )),
            (HandlerKind::Action, Some(v)) => Some(HandlerFilter::Action(
                serde_json::from_value(v).map_err(serde::de::Error::custom)?,
            )),
            (HandlerKind::Custom(_), Some(v)) => Some(HandlerFilter::Custom(v)),
        };

        Ok(Self { kind: raw.kind, handler: raw.handler, filter })
    }
}

/// The mapping portion of a datasource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mapping {
    /// Path to the compiled mapping bundle.
    pub file: String,
    /// Handler bindings.
    pub handlers: Vec<Handler>,
}

/// A datasource: handlers bound to filters from a start height.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Datasource {
    /// Runtime or custom.
    pub kind: DatasourceKind,
    /// Name of the template this datasource was materialized from; set only
    /// on dynamic datasources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// First height this datasource applies to.
    pub start_block: u64,
    /// Handler mapping.
    pub mapping: Mapping,
    /// Processor options or template arguments, passed through undecoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<serde_json::Value>,
}

impl Datasource {
    /// The processor kind string, for custom datasources.
    pub fn processor_kind(&self) -> Option<&str> {
        match &self.kind {
            DatasourceKind::Runtime => None,
            DatasourceKind::Custom(kind) => Some(kind),
        }
    }
}

/// Errors surfaced by datasource processors.
#[derive(Debug, Error)]
pub enum ProcessorError {
    /// The datasource failed the processor's validation.
    #[error("Datasource validation failed: {0}")]
    Validation(String),

    /// A transformer rejected its input.
    #[error("Transformer failed: {0}")]
    Transform(String),
}

/// Result rows a transformer derives from one input.
pub type TransformedInputs = Vec<serde_json::Value>;

/// A transformer normalized to the v1.0.0 contract.
///
/// v0.0.0 transformers return a single value; they are lifted to a
/// singleton list at registration so dispatch code sees one shape.
#[derive(Clone)]
pub enum Transformer {
    /// Pre-1.0.0 contract: one derived value per input.
    V0(Arc<dyn Fn(&HandlerInput) -> Result<serde_json::Value, ProcessorError> + Send + Sync>),
    /// 1.0.0 contract: any number of derived values per input.
    V1(Arc<dyn Fn(&HandlerInput) -> Result<TransformedInputs, ProcessorError> + Send + Sync>),
}

impl Transformer {
    /// Applies the transformer, always yielding the v1.0.0 list shape.
    pub fn apply(&self, input: &HandlerInput) -> Result<TransformedInputs, ProcessorError> {
        match self {
            Self::V0(f) => f(input).map(|value| vec![value]),
            Self::V1(f) => f(input),
        }
    }
}

impl std::fmt::Debug for Transformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::V0(_) => f.write_str("Transformer::V0"),
            Self::V1(_) => f.write_str("Transformer::V1"),
        }
    }
}

/// How a processor handles one of its declared handler kinds.
pub struct HandlerProcessor {
    /// The base kind this handler dispatches on.
    pub base_kind: BaseHandlerKind,
    /// Secondary filter applied after the base filter, against the raw
    /// custom filter value.
    pub filter: Arc<dyn Fn(&HandlerInput, &serde_json::Value) -> bool + Send + Sync>,
    /// Input transformer.
    pub transformer: Transformer,
}

impl std::fmt::Debug for HandlerProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerProcessor").field("base_kind", &self.base_kind).finish()
    }
}

/// The capability trait a custom datasource kind implements.
pub trait DatasourceProcessor: Send + Sync {
    /// The kind string this processor serves.
    fn kind(&self) -> &str;

    /// Validates a datasource of this kind at project load.
    fn validate(&self, datasource: &Datasource) -> Result<(), ProcessorError>;

    /// Synthesizes a dictionary query for a handler's raw filter, or `None`
    /// to fall back to base-filter query construction.
    fn dictionary_query(
        &self,
        filter: &serde_json::Value,
        datasource: &Datasource,
    ) -> Option<crate::dictionary::DictionaryQueryEntry>;

    /// The handler kinds this processor defines, keyed by kind string.
    fn handler_processors(&self) -> &HashMap<String, HandlerProcessor>;
}
