//! Error types for the DCS server deployment tool.
//!
//! This module provides the error hierarchy for every stage of a deployment:
//! configuration, secrets, graph construction, cloud API calls, planning,
//! reconciliation and state management.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the deployment tool.
#[derive(Debug, Error)]
pub enum DeployError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Cloud provider errors.
    #[error("Cloud API error: {0}")]
    Cloud(#[from] CloudError),

    /// Resource graph errors.
    #[error("Resource graph error: {0}")]
    Graph(#[from] GraphError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Reconciliation errors.
    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] ReconcileError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },

    /// A secret could not be resolved from the secret store.
    #[error("Secret '{key}' is not available: {reason}")]
    MissingSecret {
        /// Key of the secret.
        key: String,
        /// Why the lookup failed.
        reason: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State could not be written.
    #[error("Failed to write state: {message}")]
    WriteFailed {
        /// Description of the write failure.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// A held lock was released or taken over before its holder finished.
    #[error("State lock {lock_id} is no longer held")]
    LockLost {
        /// Identifier of the lost lock.
        lock_id: String,
    },

    /// S3 backend error.
    #[error("S3 state backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State belongs to a different stack.
    #[error("State belongs to stack {found}, expected {expected}")]
    StackMismatch {
        /// Stack named in the configuration.
        expected: String,
        /// Stack recorded in the state.
        found: String,
    },
}

/// Cloud provider errors.
#[derive(Debug, Error)]
pub enum CloudError {
    /// Authentication failed.
    #[error("Cloud authentication failed: {message}")]
    AuthenticationFailed {
        /// Description of the auth failure.
        message: String,
    },

    /// API request failed.
    #[error("Cloud API request failed: {status} - {message}")]
    ApiRequestFailed {
        /// HTTP status code.
        status: u16,
        /// Error message from API.
        message: String,
    },

    /// Rate limited.
    #[error("Cloud API rate limited, retry after {retry_after_secs} seconds")]
    RateLimited {
        /// Seconds to wait before retrying.
        retry_after_secs: u64,
    },

    /// The named snapshot does not exist.
    #[error("Snapshot '{name}' not found in resource group '{resource_group}'")]
    SnapshotNotFound {
        /// Snapshot name.
        name: String,
        /// Resource group searched.
        resource_group: String,
    },

    /// Resource not found.
    #[error("{kind} '{name}' not found")]
    ResourceNotFound {
        /// Kind of resource.
        kind: String,
        /// Name of the resource.
        name: String,
    },

    /// Resource provisioning ended in a failed state.
    #[error("Provisioning of {kind} '{name}' failed: {message}")]
    ProvisioningFailed {
        /// Kind of resource.
        kind: String,
        /// Name of the resource.
        name: String,
        /// Reported failure.
        message: String,
    },

    /// Network error.
    #[error("Network error communicating with the cloud API: {message}")]
    NetworkError {
        /// Description of the network error.
        message: String,
    },

    /// Invalid response from API.
    #[error("Invalid response from the cloud API: {message}")]
    InvalidResponse {
        /// Description of the response issue.
        message: String,
    },

    /// Timeout waiting for a long-running operation.
    #[error("Timeout waiting for {kind} '{name}' to finish provisioning")]
    Timeout {
        /// Kind of resource.
        kind: String,
        /// Name of the resource.
        name: String,
    },
}

/// Resource graph errors.
#[derive(Debug, Error)]
pub enum GraphError {
    /// Two declarations share a name.
    #[error("Duplicate resource name: {name}")]
    DuplicateName {
        /// The duplicated name.
        name: String,
    },

    /// A declaration references a resource that is not declared.
    #[error("{from} references undeclared resource '{to}'")]
    DanglingReference {
        /// Referencing resource.
        from: String,
        /// Missing target.
        to: String,
    },

    /// Circular dependency detected.
    #[error("Circular dependency detected: {cycle}")]
    CircularDependency {
        /// Description of the cycle.
        cycle: String,
    },

    /// A reference points at a resource of the wrong kind.
    #[error("{from} expects {expected} for '{to}', found {found}")]
    KindMismatch {
        /// Referencing resource.
        from: String,
        /// Target name.
        to: String,
        /// Expected kind.
        expected: String,
        /// Actual kind.
        found: String,
    },

    /// A disk is smaller than the snapshot it is restored from.
    #[error("Disk '{disk}' is {size_gb} GB but snapshot '{snapshot}' is {snapshot_size_gb} GB")]
    DiskTooSmall {
        /// Disk name.
        disk: String,
        /// Declared disk size.
        size_gb: u32,
        /// Snapshot name.
        snapshot: String,
        /// Snapshot size.
        snapshot_size_gb: u32,
    },

    /// A snapshot lives in a different region than the stack.
    #[error("Snapshot '{snapshot}' is in {found}, stack location is {expected}")]
    LocationMismatch {
        /// Snapshot name.
        snapshot: String,
        /// Stack location.
        expected: String,
        /// Snapshot location.
        found: String,
    },

    /// A value required to build a declaration was not resolved.
    #[error("Unresolved input: {name}")]
    UnresolvedInput {
        /// Name of the missing input.
        name: String,
    },

    /// A one-time schedule would start in the past or too soon to be accepted.
    #[error("Schedule '{name}' starts at {start_time}, which is not far enough in the future")]
    ScheduleInPast {
        /// Schedule name.
        name: String,
        /// Requested start time (RFC 3339).
        start_time: String,
    },
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// A planned action references a resource with no known cloud identity.
    #[error("Cannot resolve reference from '{from}' to '{to}': target has not been provisioned")]
    UnresolvedReference {
        /// Referencing resource.
        from: String,
        /// Target resource.
        to: String,
    },
}

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The run finished with resources left unreconciled.
    #[error("{failed} resource(s) failed after {attempts} attempt(s)")]
    Incomplete {
        /// Number of errors reported by the last attempt.
        failed: usize,
        /// Attempts made.
        attempts: u32,
    },

    /// Reconciliation was aborted.
    #[error("Reconciliation aborted: {reason}")]
    Aborted {
        /// Reason for abort.
        reason: String,
    },
}

/// Result type alias for deployment operations.
pub type Result<T> = std::result::Result<T, DeployError>;

impl DeployError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Cloud(CloudError::RateLimited { .. } | CloudError::NetworkError { .. }) => true,
            Self::Cloud(CloudError::ApiRequestFailed { status, .. }) => *status >= 500,
            Self::State(StateError::LockFailed { .. }) => true,
            _ => false,
        }
    }

    /// Returns the wait the server asked for before a retry.
    #[must_use]
    pub const fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::Cloud(CloudError::RateLimited { retry_after_secs }) => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// Returns true if this error means the target resource does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::Cloud(CloudError::ResourceNotFound { .. }))
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }
}

impl StateError {
    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates a write error with the given message.
    #[must_use]
    pub fn write(message: impl Into<String>) -> Self {
        Self::WriteFailed {
            message: message.into(),
        }
    }
}

impl CloudError {
    /// Creates an API request error.
    #[must_use]
    pub fn api_error(status: u16, message: impl Into<String>) -> Self {
        Self::ApiRequestFailed {
            status,
            message: message.into(),
        }
    }

    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError {
            message: message.into(),
        }
    }

    /// Creates an invalid-response error.
    #[must_use]
    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::InvalidResponse {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let rate_limited = DeployError::Cloud(CloudError::RateLimited { retry_after_secs: 7 });
        assert!(rate_limited.is_retryable());
        assert_eq!(rate_limited.retry_after_secs(), Some(7));

        let server_error = DeployError::Cloud(CloudError::api_error(503, "busy"));
        assert!(server_error.is_retryable());

        let client_error = DeployError::Cloud(CloudError::api_error(400, "bad request"));
        assert!(!client_error.is_retryable());
        assert_eq!(client_error.retry_after_secs(), None);

        let missing = DeployError::Cloud(CloudError::SnapshotNotFound {
            name: String::from("dcsOsHdd"),
            resource_group: String::from("rg"),
        });
        assert!(!missing.is_retryable());
    }

    #[test]
    fn test_not_found() {
        let err = DeployError::Cloud(CloudError::ResourceNotFound {
            kind: String::from("Disk"),
            name: String::from("osManagedDisk"),
        });
        assert!(err.is_not_found());
        assert!(!DeployError::internal("boom").is_not_found());
    }
}
