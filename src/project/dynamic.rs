//! Runtime-created datasources: materialized from manifest templates at a
//! handler's request, persisted as a creation log so rewinds remove them
//! cleanly.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::datasource::Datasource;
use crate::persistence::{PersistenceError, StateRepository};

/// One persisted dynamic-datasource creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicDsRecord {
    /// Template the datasource was materialized from.
    pub name: String,
    /// Arguments the handler supplied at creation.
    pub args: serde_json::Value,
    /// Height the creating handler ran at; doubles as the datasource's
    /// start height.
    pub created_at_height: u64,
    /// Timestamp of the creating block in nanoseconds, anchoring any cron
    /// filters on reload.
    #[serde(default)]
    pub created_at_timestamp: u64,
}

/// Errors from the dynamic-datasource lifecycle.
#[derive(Debug, Error)]
pub enum DynamicDsError {
    /// The requested template is not declared in the manifest.
    #[error("Unknown datasource template `{0}`")]
    UnknownTemplate(String),

    /// The creation log could not be read or written.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Materializes and persists dynamic datasources.
pub struct DynamicDsService {
    chain: String,
    templates: HashMap<String, Datasource>,
    repository: Arc<dyn StateRepository>,
}

impl DynamicDsService {
    /// Creates the service over the manifest's templates.
    pub fn new(
        chain: String,
        templates: Vec<Datasource>,
        repository: Arc<dyn StateRepository>,
    ) -> Self {
        let templates = templates
            .into_iter()
            .filter_map(|t| t.name.clone().map(|name| (name, t)))
            .collect();
        Self { chain, templates, repository }
    }

    /// Re-materializes every persisted dynamic datasource, in creation
    /// order.
    pub async fn load(&self) -> Result<Vec<(Datasource, DynamicDsRecord)>, DynamicDsError> {
        let records = self.repository.dynamic_datasources(&self.chain).await?;
        records
            .into_iter()
            .map(|record| self.materialize(&record).map(|ds| (ds, record)))
            .collect()
    }

    /// Creates a dynamic datasource from `template_name`, persisting it to
    /// the creation log.
    pub async fn create(
        &self,
        template_name: &str,
        args: serde_json::Value,
        height: u64,
        block_timestamp: u64,
    ) -> Result<(Datasource, DynamicDsRecord), DynamicDsError> {
        let record = DynamicDsRecord {
            name: template_name.to_string(),
            args,
            created_at_height: height,
            created_at_timestamp: block_timestamp,
        };
        let datasource = self.materialize(&record)?;
        self.repository.add_dynamic_datasource(&self.chain, &record).await?;

        tracing::info!(
            template = template_name,
            height,
            "Created dynamic datasource."
        );
        Ok((datasource, record))
    }

    /// Removes creation records at or above `height`. Called on rewinds.
    pub async fn delete_records_from(&self, height: u64) -> Result<u64, DynamicDsError> {
        let removed =
            self.repository.delete_dynamic_datasources(&self.chain, height).await?;
        if removed > 0 {
            tracing::warn!(height, removed, "Removed dynamic datasources for rewind.");
        }
        Ok(removed)
    }

    fn materialize(&self, record: &DynamicDsRecord) -> Result<Datasource, DynamicDsError> {
        let template = self
            .templates
            .get(&record.name)
            .ok_or_else(|| DynamicDsError::UnknownTemplate(record.name.clone()))?;

        let mut datasource = template.clone();
        datasource.start_block = record.created_at_height;
        datasource.options = Some(record.args.clone());
        Ok(datasource)
    }
}
