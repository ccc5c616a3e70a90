//! Secret lookup.
//!
//! The admin credential is read through a [`SecretStore`] rather than being
//! written into the stack definition. A [`Secret`] never prints its value and
//! cannot be serialized; only its digest is used for change detection.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

use crate::error::{ConfigError, DeployError, Result};

/// A secret value.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    /// Wraps a secret value.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the plaintext value. Only request builders should call this.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Returns the SHA-256 hex digest of the value.
    #[must_use]
    pub fn digest(&self) -> String {
        hex::encode(Sha256::digest(self.0.as_bytes()))
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// A source of secret values.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Returns the secret stored under `key`.
    async fn get(&self, key: &str) -> Result<Secret>;

    /// Returns the store type name.
    fn store_type(&self) -> &'static str;
}

/// Reads secrets from process environment variables.
///
/// Call [`ConfigParser::load_dotenv`](crate::config::ConfigParser::load_dotenv)
/// first to pick up a local `.env` file.
#[derive(Debug, Default)]
pub struct EnvSecretStore;

impl EnvSecretStore {
    /// Creates a new environment-backed store.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn get(&self, key: &str) -> Result<Secret> {
        debug!("Reading secret {} from environment", key);
        match std::env::var(key) {
            Ok(value) if !value.is_empty() => Ok(Secret::new(value)),
            Ok(_) => Err(missing(key, "variable is empty")),
            Err(_) => Err(missing(key, "variable is not set")),
        }
    }

    fn store_type(&self) -> &'static str {
        "env"
    }
}

/// An in-memory secret store.
#[derive(Debug, Default, Clone)]
pub struct StaticSecretStore {
    values: HashMap<String, Secret>,
}

impl StaticSecretStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a secret.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), Secret::new(value));
        self
    }
}

#[async_trait]
impl SecretStore for StaticSecretStore {
    async fn get(&self, key: &str) -> Result<Secret> {
        self.values
            .get(key)
            .cloned()
            .ok_or_else(|| missing(key, "no such key"))
    }

    fn store_type(&self) -> &'static str {
        "static"
    }
}

fn missing(key: &str, reason: &str) -> DeployError {
    DeployError::Config(ConfigError::MissingSecret {
        key: key.to_string(),
        reason: reason.to_string(),
    })
}
