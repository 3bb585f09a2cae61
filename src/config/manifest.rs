//! The project manifest: the YAML document binding a schema, a network and
//! a set of datasources.

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::one_or_many_strings;
use crate::filter::FilterSpec;
use crate::project::datasource::{Datasource, HandlerFilter, HandlerKind};

/// Schema reference within the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaFile {
    /// Path to the GraphQL schema file.
    pub file: String,
}

/// Network section of the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    /// Declared chain id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,

    /// Legacy declared genesis hash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genesis_hash: Option<String>,

    /// RPC endpoint or list of endpoints.
    #[serde(deserialize_with = "one_or_many_strings")]
    pub endpoint: Vec<String>,

    /// Dictionary service URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dictionary: Option<String>,

    /// Heights to skip without processing.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bypass_blocks: Vec<u64>,
}

/// Runner requirements declared by the project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerSpec {
    /// Node requirement.
    pub node: RunnerNode,
}

/// The node name/version requirement within [`RunnerSpec`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerNode {
    /// Required node package name.
    pub name: String,
    /// Required version range.
    pub version: String,
}

/// A parsed project manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectManifest {
    /// Manifest spec version; versions below 1.0.0 are rejected.
    pub spec_version: String,
    /// Project name.
    pub name: String,
    /// Project version.
    pub version: String,
    /// Schema reference.
    pub schema: SchemaFile,
    /// Network binding.
    pub network: NetworkConfig,
    /// Static datasources.
    pub data_sources: Vec<Datasource>,
    /// Templates dynamic datasources are materialized from.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub templates: Vec<Datasource>,
    /// Runner requirements.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner: Option<RunnerSpec>,
}

/// Errors loading or validating a manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// The manifest file could not be read.
    #[error("Failed to read project manifest: {0}")]
    Io(#[from] std::io::Error),

    /// The manifest file is not YAML.
    #[error("Unsupported manifest format; expected a .yaml/.yml file")]
    UnsupportedFormat,

    /// The manifest did not parse.
    #[error("Failed to parse project manifest: {0}")]
    Parse(String),

    /// The manifest declares a spec version this engine does not support.
    #[error("Unsupported specVersion `{0}`; 1.0.0 or later required")]
    UnsupportedSpecVersion(String),

    /// A semantic check failed.
    #[error("Invalid project manifest: {0}")]
    Validation(String),
}

/// Loads and validates project manifests.
pub struct ManifestLoader {
    path: PathBuf,
}

impl ManifestLoader {
    /// Creates a loader for the manifest at `path`.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Loads the manifest, gates its spec version, and validates its
    /// datasources.
    pub fn load(&self) -> Result<ProjectManifest, ManifestError> {
        if !self.is_yaml_file() {
            return Err(ManifestError::UnsupportedFormat);
        }

        let raw = std::fs::read_to_string(&self.path)?;
        let manifest: ProjectManifest =
            serde_yaml::from_str(&raw).map_err(|e| ManifestError::Parse(e.to_string()))?;

        manifest.validate()?;
        Ok(manifest)
    }

    fn is_yaml_file(&self) -> bool {
        matches!(self.path.extension().and_then(|ext| ext.to_str()), Some("yaml") | Some("yml"))
    }
}

impl ProjectManifest {
    /// Runs the semantic checks the loader applies after parsing.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if !spec_version_supported(&self.spec_version) {
            return Err(ManifestError::UnsupportedSpecVersion(self.spec_version.clone()));
        }
        if self.network.endpoint.is_empty() {
            return Err(ManifestError::Validation("network.endpoint must not be empty".into()));
        }
        if self.data_sources.is_empty() {
            return Err(ManifestError::Validation("at least one datasource is required".into()));
        }

        for ds in &self.data_sources {
            validate_datasource(ds)?;
        }
        for template in &self.templates {
            if template.name.is_none() {
                return Err(ManifestError::Validation("templates must carry a name".into()));
            }
            validate_datasource(template)?;
        }
        Ok(())
    }
}

fn validate_datasource(ds: &Datasource) -> Result<(), ManifestError> {
    for handler in &ds.mapping.handlers {
        match (&handler.kind, &handler.filter) {
            (HandlerKind::Block, Some(HandlerFilter::Block(spec))) => {
                validate_block_filters(&handler.handler, spec)?;
            }
            (HandlerKind::Action, None) => {
                return Err(ManifestError::Validation(format!(
                    "action handler `{}` requires a filter with an action type",
                    handler.handler
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

fn validate_block_filters(
    handler: &str,
    spec: &FilterSpec<crate::filter::BlockFilter>,
) -> Result<(), ManifestError> {
    for filter in spec.as_slice() {
        if filter.modulo == Some(0) {
            return Err(ManifestError::Validation(format!(
                "block handler `{handler}` declares modulo 0"
            )));
        }
        if let Some(expression) = &filter.timestamp {
            cron::Schedule::from_str(expression).map_err(|e| {
                ManifestError::Validation(format!(
                    "block handler `{handler}` has an invalid cron expression `{expression}`: {e}"
                ))
            })?;
        }
    }
    Ok(())
}

fn spec_version_supported(version: &str) -> bool {
    let mut parts = version.split('.').map(|p| p.parse::<u64>());
    match (parts.next(), parts.next(), parts.next()) {
        (Some(Ok(major)), Some(Ok(_)), Some(Ok(_))) => major >= 1,
        _ => false,
    }
}
