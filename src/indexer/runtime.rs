//! The seam to the sandboxed handler runtime, and the per-invocation
//! context handed to it.
//!
//! The sandbox itself (module loading, timeouts, isolation) is an external
//! collaborator. The engine only provides the context a handler observes:
//! a height-pinned API view, the entity store, the chain id, and a
//! dynamic-datasource factory. Nothing here is process-global; the context
//! lives for one block indexing step.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use thiserror::Error;

use crate::rpc::SafeRpcClient;
use crate::store::StoreService;

/// A user handler failure. Always fatal: the indexer aborts rather than
/// commit a block with partially applied handlers.
#[derive(Debug, Error)]
#[error("Handler `{handler}` failed: {message}")]
pub struct HandlerError {
    /// Name of the failing handler.
    pub handler: String,
    /// Sandbox-reported failure.
    pub message: String,
}

/// A handler's request to start tracking a new datasource.
#[derive(Debug, Clone, PartialEq)]
pub struct DynamicDsRequest {
    /// Template to materialize.
    pub template: String,
    /// Arguments for the template.
    pub args: serde_json::Value,
}

/// The logger handed to handler code; every line carries the height it
/// was emitted at.
#[derive(Debug, Clone)]
pub struct HandlerLogger {
    height: u64,
}

impl HandlerLogger {
    /// Logs at INFO.
    pub fn info(&self, message: &str) {
        tracing::info!(target: "handler", height = self.height, "{message}");
    }

    /// Logs at WARN.
    pub fn warn(&self, message: &str) {
        tracing::warn!(target: "handler", height = self.height, "{message}");
    }

    /// Logs at ERROR.
    pub fn error(&self, message: &str) {
        tracing::error!(target: "handler", height = self.height, "{message}");
    }

    /// Logs at DEBUG.
    pub fn debug(&self, message: &str) {
        tracing::debug!(target: "handler", height = self.height, "{message}");
    }
}

/// The context injected into one handler invocation.
pub struct HandlerContext {
    /// Height-pinned RPC view; valid only for this block step.
    pub api: SafeRpcClient,
    /// The entity store.
    pub store: Arc<dyn StoreService>,
    /// Chain id of the indexed network.
    pub chain_id: String,
    /// Height-tagged logger for handler output.
    pub logger: HandlerLogger,
    dynamic_ds_requests: Mutex<Vec<DynamicDsRequest>>,
}

impl HandlerContext {
    /// Creates a context for one block indexing step.
    pub fn new(api: SafeRpcClient, store: Arc<dyn StoreService>, chain_id: String) -> Self {
        let logger = HandlerLogger { height: api.height() };
        Self { api, store, chain_id, logger, dynamic_ds_requests: Mutex::new(Vec::new()) }
    }

    /// Records a dynamic-datasource creation request; applied by the
    /// indexer after the handler returns.
    pub fn create_dynamic_datasource(&self, template: &str, args: serde_json::Value) {
        self.dynamic_ds_requests
            .lock()
            .expect("dynamic ds request lock poisoned")
            .push(DynamicDsRequest { template: template.to_string(), args });
    }

    /// Drains the collected creation requests.
    pub fn take_dynamic_ds_requests(&self) -> Vec<DynamicDsRequest> {
        std::mem::take(
            &mut *self.dynamic_ds_requests.lock().expect("dynamic ds request lock poisoned"),
        )
    }
}

/// The sandboxed runtime that executes user mapping handlers.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HandlerRuntime: Send + Sync {
    /// Invokes `handler` from the mapping bundle at `mapping_file` with one
    /// transformed input.
    async fn invoke(
        &self,
        mapping_file: &str,
        handler: &str,
        input: &serde_json::Value,
        ctx: &HandlerContext,
    ) -> Result<(), HandlerError>;
}

/// A runtime that only logs matched inputs.
///
/// Stands in when no sandbox is linked: the pipeline fetches, filters and
/// commits as usual, and every would-be handler invocation is visible in
/// the logs. Useful for dry-running a project's filters against a live
/// chain.
#[derive(Debug, Default)]
pub struct TracingHandlerRuntime;

#[async_trait]
impl HandlerRuntime for TracingHandlerRuntime {
    async fn invoke(
        &self,
        mapping_file: &str,
        handler: &str,
        input: &serde_json::Value,
        ctx: &HandlerContext,
    ) -> Result<(), HandlerError> {
        tracing::info!(
            mapping_file,
            handler,
            height = ctx.api.height(),
            input = %input,
            "Handler matched input."
        );
        Ok(())
    }
}
