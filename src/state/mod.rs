//! State management module.
//!
//! This module provides persistent state storage for tracking deployed
//! resources: cloud ids, spec hashes, dependencies, exported outputs and
//! deployment history.

mod local;
mod lock;
mod s3;
mod store;
mod types;

pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{LOCK_EXPIRY_SECS, LOCK_REFRESH_SECS, LockInfo, generate_holder_id};
pub use s3::S3StateStore;
pub use store::StateStore;
pub use types::{
    DeploymentHistoryEntry, DeploymentOperation, DeploymentState, ResourceState, ResourceStatus,
    STATE_VERSION, StackOutputs,
};

use crate::config::{DeployConfig, StateBackend};

/// Opens the state store a stack is configured to use.
///
/// The local backend keeps its state next to `config_path` unless
/// `state.path` names another directory.
pub async fn open_store(
    config: &DeployConfig,
    config_path: &std::path::Path,
) -> crate::error::Result<Box<dyn StateStore>> {
    let state = &config.state;
    match state.backend {
        StateBackend::Local => {
            let store = match &state.path {
                Some(path) => LocalStateStore::with_base_dir(path),
                None => LocalStateStore::beside(config_path),
            };
            Ok(Box::new(store))
        }
        StateBackend::S3 => {
            let bucket = state.bucket.as_deref().ok_or_else(|| {
                crate::error::ConfigError::validation(
                    "S3 backend requires a bucket",
                    "state.bucket",
                )
            })?;
            let store = S3StateStore::new(
                bucket,
                state.prefix.as_deref(),
                state.region.as_deref(),
                &config.stack_name(),
            )
            .await;
            Ok(Box::new(store))
        }
    }
}
