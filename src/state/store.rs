//! State store trait definition.
//!
//! This module defines the common interface for state storage backends.

use async_trait::async_trait;
use tracing::debug;

use crate::config::ProjectConfig;
use crate::error::{DeployError, Result, StateError};

use super::lock::LockInfo;
use super::types::DeploymentState;

/// Trait for state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the deployment state.
    ///
    /// Returns `None` if no state exists yet.
    async fn load(&self) -> Result<Option<DeploymentState>>;

    /// Saves the deployment state.
    async fn save(&self, state: &DeploymentState) -> Result<()>;

    /// Deletes the deployment state.
    async fn delete(&self) -> Result<()>;

    /// Checks if state exists.
    async fn exists(&self) -> Result<bool>;

    /// Acquires a lock on the state for `operation`.
    ///
    /// Fails with [`StateError::LockedByOther`] while an unexpired lock is
    /// held.
    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo>;

    /// Releases a lock on the state. Releasing a lock that is not held is a
    /// no-op.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Extends the expiry of the lock held under `lock_id`.
    ///
    /// Fails with [`StateError::LockLost`] if that lock was released or
    /// taken over.
    async fn refresh_lock(&self, lock_id: &str) -> Result<LockInfo>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Checks if the state is locked by an unexpired lock.
    async fn is_locked(&self) -> Result<bool> {
        Ok(self
            .get_lock_info()
            .await?
            .is_some_and(|lock| !lock.is_expired()))
    }

    /// Loads the state of `project`, or a fresh state if none exists.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::StackMismatch`] if the stored state belongs to
    /// another stack or resource group.
    async fn load_for(&self, project: &ProjectConfig) -> Result<DeploymentState> {
        let Some(state) = self.load().await? else {
            debug!("No state recorded, starting fresh");
            return Ok(DeploymentState::new(
                &project.name,
                &project.environment,
                &project.resource_group,
            ));
        };

        let expected = format!("{}-{}", project.name, project.environment);
        if state.stack_name() != expected || state.resource_group != project.resource_group {
            return Err(DeployError::State(StateError::StackMismatch {
                expected: format!("{expected} in {}", project.resource_group),
                found: format!("{} in {}", state.stack_name(), state.resource_group),
            }));
        }

        Ok(state)
    }

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

#[async_trait]
impl StateStore for Box<dyn StateStore> {
    async fn load(&self) -> Result<Option<DeploymentState>> {
        (**self).load().await
    }

    async fn save(&self, state: &DeploymentState) -> Result<()> {
        (**self).save(state).await
    }

    async fn delete(&self) -> Result<()> {
        (**self).delete().await
    }

    async fn exists(&self) -> Result<bool> {
        (**self).exists().await
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        (**self).acquire_lock(holder, operation).await
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        (**self).release_lock(lock_id).await
    }

    async fn refresh_lock(&self, lock_id: &str) -> Result<LockInfo> {
        (**self).refresh_lock(lock_id).await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        (**self).get_lock_info().await
    }

    async fn is_locked(&self) -> Result<bool> {
        (**self).is_locked().await
    }

    async fn load_for(&self, project: &ProjectConfig) -> Result<DeploymentState> {
        (**self).load_for(project).await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}
