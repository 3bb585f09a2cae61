//! Node configuration, RPC retry policy, and the project manifest loader.

pub mod app_config;
pub mod manifest;
mod retry;

pub use app_config::NodeConfig;
pub use manifest::{ManifestError, ManifestLoader, NetworkConfig, ProjectManifest};
pub use retry::RpcRetryConfig;

use std::time::Duration;

use serde::{Deserialize, Deserializer};

/// Deserializes a `Duration` from a plain seconds value.
pub(crate) fn duration_from_secs<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_secs)
}

/// Deserializes `string | string[]` into a vector.
pub(crate) fn one_or_many_strings<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}
