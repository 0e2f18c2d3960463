//! Masking parameters.

use serde::{Deserialize, Serialize};

/// Parameters for the result masking transform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaskingConfig {
    /// Replacement for `full` masks.
    #[serde(default = "default_marker")]
    pub redaction_marker: String,

    /// Leading characters revealed by `partial` masks.
    #[serde(default = "default_reveal")]
    pub partial_prefix: usize,

    /// Trailing characters revealed by `partial` masks.
    #[serde(default = "default_reveal")]
    pub partial_suffix: usize,

    /// Hex characters of the SHA-256 digest kept by `hash` masks.
    #[serde(default = "default_hash_length")]
    pub hash_length: usize,
}

impl Default for MaskingConfig {
    fn default() -> Self {
        Self {
            redaction_marker: default_marker(),
            partial_prefix: default_reveal(),
            partial_suffix: default_reveal(),
            hash_length: default_hash_length(),
        }
    }
}

fn default_marker() -> String {
    "****".to_string()
}

fn default_reveal() -> usize {
    2
}

fn default_hash_length() -> usize {
    16
}
