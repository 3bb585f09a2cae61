//! The persistence trait seam for engine-owned metadata.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use super::error::PersistenceError;
use crate::project::dynamic::DynamicDsRecord;

/// Repository for the engine's own metadata, keyed by chain id.
///
/// The user-facing entity store is a separate, external collaborator; this
/// repository only records what the engine needs to resume and to rewind.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StateRepository: Send + Sync {
    /// The last height committed for `chain`, if any.
    async fn last_processed_height(&self, chain: &str)
        -> Result<Option<u64>, PersistenceError>;

    /// Records the last committed height and its block hash.
    async fn set_last_processed_height(
        &self,
        chain: &str,
        height: u64,
        block_hash: &str,
    ) -> Result<(), PersistenceError>;

    /// The genesis hash recorded for `chain`, if any.
    async fn genesis_hash(&self, chain: &str) -> Result<Option<String>, PersistenceError>;

    /// Records the observed genesis hash for `chain`.
    async fn set_genesis_hash(
        &self,
        chain: &str,
        genesis_hash: &str,
    ) -> Result<(), PersistenceError>;

    /// All dynamic-datasource creation records for `chain`, in creation
    /// order.
    async fn dynamic_datasources(
        &self,
        chain: &str,
    ) -> Result<Vec<DynamicDsRecord>, PersistenceError>;

    /// Appends a dynamic-datasource creation record.
    async fn add_dynamic_datasource(
        &self,
        chain: &str,
        record: &DynamicDsRecord,
    ) -> Result<(), PersistenceError>;

    /// Deletes creation records at or above `from_height`, returning how
    /// many were removed. Called on rewinds.
    async fn delete_dynamic_datasources(
        &self,
        chain: &str,
        from_height: u64,
    ) -> Result<u64, PersistenceError>;
}
