//! Configuration types for querygate.
//!
//! # Configuration Files
//!
//! - **guard.yaml**: [`GuardConfig`], pipeline behavior (limits, schema
//!   validation mode, masking parameters, policy cache TTL)
//! - **policies.yaml**: [`PolicyFile`], table/column permission records per
//!   organization, connection and role
//! - **catalog.yaml**: table/column metadata ([`crate::Catalog`])
//!
//! Every file may also be JSON when its extension is `.json`.

pub mod files;
pub mod masking;

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub use files::{PolicyFile, load_catalog};
pub use masking::MaskingConfig;

/// Complete guard configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Row limits applied to SELECT statements.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// What to do when the schema validator reports unknown tables/columns.
    #[serde(default)]
    pub schema_validation: SchemaValidationMode,

    /// Masking parameters.
    #[serde(default)]
    pub masking: MaskingConfig,

    /// Policy cache configuration.
    #[serde(default)]
    pub policy_cache: PolicyCacheConfig,
}

/// Row limit configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Limit appended when the caller supplies none. `None` appends nothing.
    #[serde(default)]
    pub default_limit: Option<u32>,

    /// Caller-supplied limits are clamped to this value.
    #[serde(default = "default_max_limit")]
    pub max_limit: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            default_limit: None,
            max_limit: default_max_limit(),
        }
    }
}

impl LimitsConfig {
    /// The limit to append for a request, if any.
    pub fn effective_limit(&self, requested: Option<u32>) -> Option<u32> {
        requested
            .or(self.default_limit)
            .map(|limit| limit.min(self.max_limit))
    }
}

/// Handling of schema validation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaValidationMode {
    /// Reject the query with a schema violation.
    #[default]
    Enforce,
    /// Log the violation and continue.
    Warn,
    /// Skip schema validation.
    Off,
}

/// Policy cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyCacheConfig {
    /// Seconds a cached policy set stays valid. `0` disables caching.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for PolicyCacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
        }
    }
}

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl GuardConfig {
    /// Load configuration from a YAML (or `.json`) file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        if files::is_json(path) {
            let config: Self = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            Self::from_yaml(&content)
        }
    }

    /// Parse configuration from YAML content.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limits.max_limit == 0 {
            return Err(ConfigError::Config(
                "limits.max_limit must be greater than zero".to_string(),
            ));
        }
        if self.masking.redaction_marker.is_empty() {
            return Err(ConfigError::Config(
                "masking.redaction_marker must not be empty".to_string(),
            ));
        }
        if self.masking.hash_length == 0 || self.masking.hash_length > 64 {
            return Err(ConfigError::Config(
                "masking.hash_length must be between 1 and 64".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_max_limit() -> u32 {
    10_000
}

fn default_ttl_secs() -> u64 {
    60
}
