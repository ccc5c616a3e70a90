//! Local file-based state storage backend.
//!
//! State lives in `.dcs-deploy/state.json` next to the stack definition; the
//! lock is a sibling `state.lock` file.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{DeployError, Result, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo};
use super::store::StateStore;
use super::types::DeploymentState;

/// Default state directory name.
pub const STATE_DIR: &str = ".dcs-deploy";

/// State file name.
const STATE_FILE: &str = "state.json";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Path to the state file.
    state_path: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
}

impl LocalStateStore {
    /// Creates a store in `.dcs-deploy` below the current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| DeployError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a store in `.dcs-deploy` next to a configuration file.
    #[must_use]
    pub fn beside(config_path: &Path) -> Self {
        let dir = config_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        Self::with_base_dir(dir.join(STATE_DIR))
    }

    /// Creates a new local state store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let state_path = base_dir.join(STATE_FILE);
        let lock_path = base_dir.join(LOCK_FILE);

        Self {
            base_dir,
            state_path,
            lock_path,
        }
    }

    /// Returns the path of the state file.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Ensures the state directory exists.
    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir)
                .await
                .map_err(|e| StateError::write(format!("Failed to create state directory: {e}")))?;
        }
        Ok(())
    }

    /// Writes `content` to `path`, syncing before returning.
    async fn write_synced(path: &Path, content: &str) -> std::io::Result<()> {
        let mut file = fs::File::create(path).await?;
        file.write_all(content.as_bytes()).await?;
        file.sync_all().await
    }

    /// Replaces the lock file with `lock_info`.
    ///
    /// Goes through a temporary file so readers never see a partial lock.
    async fn write_lock_file(&self, lock_info: &LockInfo) -> Result<()> {
        self.ensure_dir().await?;
        let content = serde_json::to_string_pretty(lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;

        let temp_path = self.lock_path.with_extension("lock.tmp");
        Self::write_synced(&temp_path, &content).await.map_err(|e| {
            DeployError::State(StateError::LockFailed {
                message: format!("Failed to write lock file: {e}"),
            })
        })?;
        fs::rename(&temp_path, &self.lock_path).await.map_err(|e| {
            DeployError::State(StateError::LockFailed {
                message: format!("Failed to rename lock file: {e}"),
            })
        })
    }

    /// Reads the lock file if it exists.
    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        if !self.lock_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.lock_path).await.map_err(|e| {
            DeployError::State(StateError::Corrupted {
                message: format!("Failed to read lock file: {e}"),
            })
        })?;

        let lock_info: LockInfo = serde_json::from_str(&content).map_err(|e| {
            DeployError::State(StateError::Corrupted {
                message: format!("Failed to parse lock file: {e}"),
            })
        })?;

        Ok(Some(lock_info))
    }

    /// Deletes the lock file.
    async fn delete_lock_file(&self) -> Result<()> {
        if self.lock_path.exists() {
            fs::remove_file(&self.lock_path).await.map_err(|e| {
                DeployError::State(StateError::LockFailed {
                    message: format!("Failed to delete lock file: {e}"),
                })
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self) -> Result<Option<DeploymentState>> {
        if !self.state_path.exists() {
            debug!("State file does not exist: {}", self.state_path.display());
            return Ok(None);
        }

        info!("Loading state from: {}", self.state_path.display());

        let content = fs::read_to_string(&self.state_path).await.map_err(|e| {
            DeployError::State(StateError::Corrupted {
                message: format!("Failed to read state file: {e}"),
            })
        })?;

        let state: DeploymentState = serde_json::from_str(&content).map_err(|e| {
            DeployError::State(StateError::Corrupted {
                message: format!("Failed to parse state file: {e}"),
            })
        })?;

        Ok(Some(state))
    }

    async fn save(&self, state: &DeploymentState) -> Result<()> {
        self.ensure_dir().await?;

        info!("Saving state to: {}", self.state_path.display());

        let content = serde_json::to_string_pretty(state)
            .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")))?;

        // Write to a temporary file first, then rename for atomicity
        let temp_path = self.state_path.with_extension("tmp");
        Self::write_synced(&temp_path, &content)
            .await
            .map_err(|e| StateError::write(format!("Failed to write temp state file: {e}")))?;

        fs::rename(&temp_path, &self.state_path)
            .await
            .map_err(|e| StateError::write(format!("Failed to rename state file: {e}")))?;

        debug!("State saved successfully");
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        if self.state_path.exists() {
            info!("Deleting state file: {}", self.state_path.display());
            fs::remove_file(&self.state_path)
                .await
                .map_err(|e| StateError::write(format!("Failed to delete state file: {e}")))?;
        }

        self.delete_lock_file().await
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.state_path.exists())
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        if let Some(existing) = self.read_lock_file().await? {
            if !existing.is_expired() {
                return Err(DeployError::State(StateError::LockedByOther {
                    holder: existing.holder.clone(),
                    since: existing.acquired_at.to_rfc3339(),
                }));
            }
            debug!("Expired lock found, taking over");
        }

        let lock_info = LockInfo::new(holder, operation);
        self.write_lock_file(&lock_info).await?;

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            if existing.lock_id == lock_id {
                self.delete_lock_file().await?;
                info!("Released state lock: {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }
        Ok(())
    }

    async fn refresh_lock(&self, lock_id: &str) -> Result<LockInfo> {
        let mut lock_info = match self.read_lock_file().await? {
            Some(existing) if existing.lock_id == lock_id => existing,
            _ => {
                return Err(DeployError::State(StateError::LockLost {
                    lock_id: lock_id.to_string(),
                }));
            }
        };

        lock_info.renew();
        self.write_lock_file(&lock_info).await?;
        debug!("Refreshed state lock {lock_id} until {}", lock_info.expires_at.to_rfc3339());
        Ok(lock_info)
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProjectConfig;
    use tempfile::TempDir;

    fn create_test_store() -> (LocalStateStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(temp_dir.path().join(STATE_DIR));
        (store, temp_dir)
    }

    fn project(name: &str) -> ProjectConfig {
        ProjectConfig {
            name: name.to_string(),
            environment: String::from("prod"),
            resource_group: String::from("DcsMultiplayerServer"),
            location: String::from("northcentralus"),
        }
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (store, _temp) = create_test_store();

        let mut state = DeploymentState::new("dcs", "prod", "DcsMultiplayerServer");
        state.outputs.public_ip_address = Some("20.1.2.3".parse().expect("ip"));
        store.save(&state).await.expect("Failed to save state");

        let loaded = store
            .load()
            .await
            .expect("Failed to load state")
            .expect("State should exist");

        assert_eq!(loaded.stack_name(), "dcs-prod");
        assert_eq!(loaded.outputs, state.outputs);
        assert!(!store.state_path().with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_load_nonexistent() {
        let (store, _temp) = create_test_store();

        assert!(store.load().await.expect("Load should not fail").is_none());
        assert!(!store.exists().await.expect("exists check failed"));
    }

    #[tokio::test]
    async fn test_delete_removes_state_and_lock() {
        let (store, _temp) = create_test_store();
        store
            .save(&DeploymentState::new("dcs", "prod", "DcsMultiplayerServer"))
            .await
            .expect("save");
        store.acquire_lock("ci", "apply").await.expect("lock");

        store.delete().await.expect("delete");

        assert!(!store.exists().await.expect("exists check failed"));
        assert!(store.get_lock_info().await.expect("lock info").is_none());
    }

    #[tokio::test]
    async fn test_corrupted_state() {
        let (store, _temp) = create_test_store();
        store.ensure_dir().await.expect("dir");
        fs::write(store.state_path(), "{ not json").await.expect("write");

        let err = store.load().await.expect_err("corrupted");
        assert!(matches!(err, DeployError::State(StateError::Corrupted { .. })));
    }

    #[tokio::test]
    async fn test_load_for_checks_stack() {
        let (store, _temp) = create_test_store();

        let fresh = store.load_for(&project("dcs")).await.expect("fresh");
        assert!(fresh.resources.is_empty());
        store.save(&fresh).await.expect("save");

        assert!(store.load_for(&project("dcs")).await.is_ok());
        let err = store.load_for(&project("other")).await.expect_err("mismatch");
        assert!(matches!(err, DeployError::State(StateError::StackMismatch { .. })));
    }

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let (store, _temp) = create_test_store();

        let lock = store
            .acquire_lock("test-holder", "apply")
            .await
            .expect("Failed to acquire lock");

        assert!(store.is_locked().await.expect("is_locked failed"));
        assert_eq!(
            store.get_lock_info().await.expect("info").map(|l| l.operation),
            Some(String::from("apply"))
        );

        store
            .release_lock(&lock.lock_id)
            .await
            .expect("Failed to release lock");

        assert!(!store.is_locked().await.expect("is_locked failed"));
    }

    #[tokio::test]
    async fn test_lock_conflict() {
        let (store, _temp) = create_test_store();

        let _lock1 = store
            .acquire_lock("holder-1", "apply")
            .await
            .expect("Failed to acquire first lock");

        let err = store.acquire_lock("holder-2", "destroy").await.expect_err("held");
        assert!(matches!(err, DeployError::State(StateError::LockedByOther { .. })));
    }

    #[tokio::test]
    async fn test_release_with_wrong_id_keeps_lock() {
        let (store, _temp) = create_test_store();
        store.acquire_lock("holder", "apply").await.expect("lock");

        store.release_lock("not-the-lock").await.expect("no-op");
        assert!(store.is_locked().await.expect("is_locked"));
    }

    #[tokio::test]
    async fn test_refresh_extends_held_lock() {
        let (store, _temp) = create_test_store();
        let lock = store.acquire_lock("holder", "apply").await.expect("lock");

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let refreshed = store.refresh_lock(&lock.lock_id).await.expect("refresh");

        assert_eq!(refreshed.lock_id, lock.lock_id);
        assert_eq!(refreshed.acquired_at, lock.acquired_at);
        assert!(refreshed.expires_at > lock.expires_at);
        assert_eq!(
            store.get_lock_info().await.expect("info").map(|l| l.expires_at),
            Some(refreshed.expires_at)
        );
    }

    #[tokio::test]
    async fn test_refresh_fails_once_lock_is_taken_over() {
        let (store, _temp) = create_test_store();
        let lock = store.acquire_lock("holder", "apply").await.expect("lock");
        store.release_lock(&lock.lock_id).await.expect("release");
        let other = store.acquire_lock("other", "destroy").await.expect("lock");

        let err = store.refresh_lock(&lock.lock_id).await.expect_err("lost");
        assert!(matches!(err, DeployError::State(StateError::LockLost { .. })));
        assert_eq!(
            store.get_lock_info().await.expect("info").map(|l| l.lock_id),
            Some(other.lock_id.clone())
        );

        store.release_lock(&other.lock_id).await.expect("release");
        assert!(store.refresh_lock(&other.lock_id).await.is_err());
    }

    #[test]
    fn test_beside_config() {
        let store = LocalStateStore::beside(Path::new("/srv/dcs/dcs.deploy.yaml"));
        assert_eq!(
            store.state_path(),
            Path::new("/srv/dcs/.dcs-deploy/state.json")
        );

        let store = LocalStateStore::beside(Path::new("dcs.deploy.yaml"));
        assert_eq!(store.state_path(), Path::new("./.dcs-deploy/state.json"));
    }
}
