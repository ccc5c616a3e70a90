//! Configuration hashing for change detection.
//!
//! This module provides deterministic hashing of configuration structures
//! and resource declarations to detect changes between deployments and
//! enable idempotent operations.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{DeployError, Result};

use super::spec::DeployConfig;

/// Hasher for computing configuration hashes.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new configuration hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of the entire stack definition.
    ///
    /// This hash changes when any part of the configuration changes.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be serialized.
    pub fn hash_config(&self, config: &DeployConfig) -> Result<String> {
        let value = serde_json::to_value(config)
            .map_err(|e| DeployError::internal(format!("Failed to serialize config: {e}")))?;
        Ok(self.hash_json(&value))
    }

    /// Computes the hash of a JSON document.
    ///
    /// Object keys are ordered, so two documents with the same content hash
    /// the same regardless of how they were built.
    #[must_use]
    pub fn hash_json(&self, value: &Value) -> String {
        self.hash_bytes(value.to_string().as_bytes())
    }

    /// Computes the SHA-256 hex digest of raw bytes.
    #[must_use]
    pub fn hash_bytes(&self, bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use serde_json::json;

    fn template() -> DeployConfig {
        ConfigParser::new()
            .parse_yaml(include_str!("../../templates/dcs.deploy.yaml"), None)
            .expect("template parses")
    }

    #[test]
    fn test_config_hash_deterministic() {
        let hasher = ConfigHasher::new();
        let config = template();

        let hash1 = hasher.hash_config(&config).expect("hash");
        let hash2 = hasher.hash_config(&config.clone()).expect("hash");

        assert_eq!(hash1, hash2);
        assert_eq!(hash1.len(), 64);
    }

    #[test]
    fn test_config_change_changes_hash() {
        let hasher = ConfigHasher::new();
        let config = template();
        let mut resized = config.clone();
        resized.vm.size = String::from("Standard_E8as_v4");

        assert_ne!(
            hasher.hash_config(&config).expect("hash"),
            hasher.hash_config(&resized).expect("hash")
        );
    }

    #[test]
    fn test_json_hash_ignores_key_order() {
        let hasher = ConfigHasher::new();
        let a = json!({ "sizeGb": 256, "sku": "Premium_LRS" });
        let b = json!({ "sku": "Premium_LRS", "sizeGb": 256 });

        assert_eq!(hasher.hash_json(&a), hasher.hash_json(&b));
    }
}
