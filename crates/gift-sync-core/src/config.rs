//! Sync policy configuration.

use crate::model::EntityType;
use serde::{Deserialize, Serialize};

/// Tunable sync policy. Every field has a default, so `{}` is a valid config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Attempts before a rejected item goes terminal (default: 5)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Attempts before a transiently failing item goes terminal
    /// (default: unlimited)
    #[serde(default)]
    pub max_transient_retries: Option<u32>,

    /// Pull remote changes after draining
    #[serde(default = "default_true")]
    pub pull_enabled: bool,

    /// Entity types pulled from the remote store
    #[serde(default = "default_entity_types")]
    pub entity_types: Vec<EntityType>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            max_transient_retries: None,
            pull_enabled: true,
            entity_types: default_entity_types(),
        }
    }
}

fn default_max_retries() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

fn default_entity_types() -> Vec<EntityType> {
    EntityType::ALL.to_vec()
}
