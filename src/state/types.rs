//! State types for tracking deployment state.
//!
//! These types represent the recorded state of a stack, used for
//! reconciliation and idempotent operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;

use crate::cloud::ResourceAddress;
use crate::graph::{ResolveId, ResourceKind};

/// Current version of the state format.
pub const STATE_VERSION: &str = "1.0";

/// Number of history entries kept.
const MAX_HISTORY: usize = 100;

/// The complete deployment state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentState {
    /// State format version.
    pub version: String,
    /// Project name.
    pub project: String,
    /// Environment name.
    pub environment: String,
    /// Resource group the stack lives in.
    pub resource_group: String,
    /// Hash of the last applied configuration.
    pub config_hash: String,
    /// Managed resources by logical name.
    pub resources: BTreeMap<String, ResourceState>,
    /// Exported values.
    #[serde(default)]
    pub outputs: StackOutputs,
    /// When the stack was first deployed.
    #[serde(default)]
    pub anchor: Option<DateTime<Utc>>,
    /// When the current shutdown window opened.
    #[serde(default)]
    pub shutdown_anchor: Option<DateTime<Utc>>,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Deployment history (recent entries).
    #[serde(default)]
    pub history: Vec<DeploymentHistoryEntry>,
}

/// State of a single managed resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceState {
    /// Logical name.
    pub name: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Cloud resource id.
    pub cloud_id: String,
    /// Parent name for nested kinds.
    #[serde(default)]
    pub parent: Option<String>,
    /// Hash of the declaration when last applied.
    pub spec_hash: String,
    /// Names of the resources this one depends on.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Current status.
    pub status: ResourceStatus,
    /// Allocated address, for public IPs.
    #[serde(default)]
    pub ip_address: Option<IpAddr>,
    /// When the resource was created.
    pub created_at: DateTime<Utc>,
    /// When the resource was last updated.
    pub updated_at: DateTime<Utc>,
}

/// Values the stack exports.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StackOutputs {
    /// Address allocated to the public IP resource.
    #[serde(default)]
    pub public_ip_address: Option<IpAddr>,
}

/// Resource status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    /// Provisioning finished successfully.
    Provisioned,
    /// Provisioning failed.
    Failed,
    /// Status is unknown.
    Unknown,
}

/// A single entry in the deployment history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentHistoryEntry {
    /// When the deployment occurred.
    pub timestamp: DateTime<Utc>,
    /// Type of operation.
    pub operation: DeploymentOperation,
    /// Configuration hash at time of deployment.
    pub config_hash: String,
    /// Resources affected.
    pub resources: Vec<String>,
    /// Whether the deployment succeeded.
    pub success: bool,
    /// Optional error message.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of deployment operations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentOperation {
    /// Initial deployment.
    Create,
    /// Configuration update.
    Update,
    /// Destruction.
    Destroy,
}

impl DeploymentState {
    /// Creates a new empty deployment state.
    #[must_use]
    pub fn new(project: &str, environment: &str, resource_group: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            project: project.to_string(),
            environment: environment.to_string(),
            resource_group: resource_group.to_string(),
            config_hash: String::new(),
            resources: BTreeMap::new(),
            outputs: StackOutputs::default(),
            anchor: None,
            shutdown_anchor: None,
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Returns the stack identifier (`project-environment`).
    #[must_use]
    pub fn stack_name(&self) -> String {
        format!("{}-{}", self.project, self.environment)
    }

    /// Gets a resource by name.
    #[must_use]
    pub fn get_resource(&self, name: &str) -> Option<&ResourceState> {
        self.resources.get(name)
    }

    /// Adds or updates a resource.
    pub fn set_resource(&mut self, resource: ResourceState) {
        self.resources.insert(resource.name.clone(), resource);
        self.last_updated = Utc::now();
    }

    /// Removes a resource by name.
    pub fn remove_resource(&mut self, name: &str) -> Option<ResourceState> {
        let result = self.resources.remove(name);
        if result.is_some() {
            self.last_updated = Utc::now();
        }
        result
    }

    /// Returns the cloud id recorded for `name`.
    #[must_use]
    pub fn cloud_id(&self, name: &str) -> Option<&str> {
        self.resources.get(name).map(|r| r.cloud_id.as_str())
    }

    /// Returns the address of a recorded resource.
    #[must_use]
    pub fn address_of(&self, name: &str) -> Option<ResourceAddress> {
        self.resources.get(name).map(|r| r.address(&self.resource_group))
    }

    /// Returns the first-deployment timestamp, setting it to `now` if unset.
    pub fn anchor_or_init(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        *self.anchor.get_or_insert(now)
    }

    /// Adds a history entry.
    pub fn add_history(&mut self, entry: DeploymentHistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
    }
}

impl ResolveId for DeploymentState {
    fn resolve_id(&self, name: &str) -> Option<String> {
        self.cloud_id(name).map(String::from)
    }
}

impl ResourceState {
    /// Creates a new resource state.
    #[must_use]
    pub fn new(name: &str, kind: ResourceKind, cloud_id: &str, spec_hash: &str) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            kind,
            cloud_id: cloud_id.to_string(),
            parent: None,
            spec_hash: spec_hash.to_string(),
            depends_on: Vec::new(),
            status: ResourceStatus::Provisioned,
            ip_address: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns the address of this resource inside `resource_group`.
    #[must_use]
    pub fn address(&self, resource_group: &str) -> ResourceAddress {
        let address = ResourceAddress::new(resource_group, self.kind, self.name.clone());
        match &self.parent {
            Some(parent) => address.with_parent(parent.clone()),
            None => address,
        }
    }

    /// Updates the status.
    pub fn set_status(&mut self, status: ResourceStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

impl DeploymentHistoryEntry {
    /// Creates a new history entry.
    #[must_use]
    pub fn new(operation: DeploymentOperation, config_hash: &str, resources: Vec<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            config_hash: config_hash.to_string(),
            resources,
            success: true,
            error: None,
        }
    }

    /// Creates a failed history entry.
    #[must_use]
    pub fn failed(
        operation: DeploymentOperation,
        config_hash: &str,
        resources: Vec<String>,
        error: &str,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            config_hash: config_hash.to_string(),
            resources,
            success: false,
            error: Some(error.to_string()),
        }
    }
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match self {
            Self::Provisioned => "provisioned",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        };
        write!(f, "{status}")
    }
}

impl std::fmt::Display for DeploymentOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Destroy => "destroy",
        };
        write!(f, "{op}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_is_capped() {
        let mut state = DeploymentState::new("dcs", "prod", "rg");
        for _ in 0..(MAX_HISTORY + 5) {
            state.add_history(DeploymentHistoryEntry::new(
                DeploymentOperation::Update,
                "hash",
                vec![],
            ));
        }
        assert_eq!(state.history.len(), MAX_HISTORY);
    }

    #[test]
    fn test_anchor_set_once() {
        let mut state = DeploymentState::new("dcs", "prod", "rg");
        let first = Utc::now();
        let later = first + chrono::Duration::hours(3);

        assert_eq!(state.anchor_or_init(first), first);
        assert_eq!(state.anchor_or_init(later), first);
    }

    #[test]
    fn test_address_of_nested_resource() {
        let mut state = DeploymentState::new("dcs", "prod", "rg");
        let mut subnet = ResourceState::new("subnet", ResourceKind::Subnet, "id", "hash");
        subnet.parent = Some(String::from("vnet"));
        state.set_resource(subnet);

        let address = state.address_of("subnet").expect("recorded");
        assert_eq!(address.parent.as_deref(), Some("vnet"));
        assert_eq!(address.resource_group, "rg");
        assert_eq!(state.cloud_id("subnet"), Some("id"));
        assert!(state.address_of("missing").is_none());
    }

    #[test]
    fn test_state_round_trips_through_json() {
        let mut state = DeploymentState::new("dcs", "prod", "rg");
        let mut pip = ResourceState::new("pip", ResourceKind::PublicIpAddress, "id", "hash");
        pip.ip_address = Some("20.1.2.3".parse().expect("ip"));
        state.set_resource(pip);
        state.outputs.public_ip_address = Some("20.1.2.3".parse().expect("ip"));

        let json = serde_json::to_string(&state).expect("serialize");
        let restored: DeploymentState = serde_json::from_str(&json).expect("deserialize");

        assert_eq!(restored.resources, state.resources);
        assert_eq!(restored.outputs, state.outputs);
    }
}
