//! Cloud resource types.
//!
//! This module defines the values exchanged with a [`CloudProvider`]
//! (addresses, requests, provisioned resources) and the ARM wire shapes they
//! are decoded from.
//!
//! [`CloudProvider`]: super::CloudProvider

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::IpAddr;

use crate::graph::ResourceKind;

/// Tag recording which stack manages a resource.
pub const STACK_TAG: &str = "dcs-deploy-stack";

/// Tag recording the spec hash a resource was last applied with.
pub const HASH_TAG: &str = "dcs-deploy-hash";

/// A disk snapshot found by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Resource id.
    pub id: String,
    /// Snapshot name.
    pub name: String,
    /// Region.
    pub location: String,
    /// Size of the source disk in GB.
    pub size_gb: u32,
}

/// Identifies a resource inside a resource group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceAddress {
    /// Resource group.
    pub resource_group: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Resource name.
    pub name: String,
    /// Name of the parent for nested kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

impl ResourceAddress {
    /// Creates an address for a top-level resource.
    #[must_use]
    pub fn new(resource_group: impl Into<String>, kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            resource_group: resource_group.into(),
            kind,
            name: name.into(),
            parent: None,
        }
    }

    /// Sets the parent resource name.
    #[must_use]
    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Returns the resource id below `subscription`.
    ///
    /// Nested kinds without a parent name fall back to a top-level path.
    #[must_use]
    pub fn resource_id(&self, subscription: &str) -> String {
        let mut id = format!(
            "/subscriptions/{subscription}/resourceGroups/{}/providers/{}",
            self.resource_group,
            self.kind.namespace()
        );

        if let (Some(parent_kind), Some(parent)) = (self.kind.parent_kind(), &self.parent) {
            id.push('/');
            id.push_str(parent_kind.type_segment());
            id.push('/');
            id.push_str(parent);
        }

        id.push('/');
        id.push_str(self.kind.type_segment());
        id.push('/');
        id.push_str(&self.name);
        id
    }
}

impl std::fmt::Display for ResourceAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.parent {
            Some(parent) => write!(f, "{} {}/{}", self.kind, parent, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// A create or update request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceRequest {
    /// Target resource.
    pub address: ResourceAddress,
    /// ARM request body.
    pub body: Value,
}

impl ResourceRequest {
    /// Returns a tag from the request body.
    #[must_use]
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.body.get("tags")?.get(key)?.as_str()
    }
}

/// A resource as the cloud reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionedResource {
    /// Resource id.
    pub id: String,
    /// Address it was read from.
    pub address: ResourceAddress,
    /// Provisioning state, e.g. `Succeeded`.
    #[serde(default)]
    pub provisioning_state: Option<String>,
    /// Tags.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Raw properties.
    #[serde(default)]
    pub properties: Value,
}

impl ProvisionedResource {
    /// Builds a provisioned resource from an ARM response.
    #[must_use]
    pub fn from_arm(address: ResourceAddress, resource: ArmResource) -> Self {
        let provisioning_state = resource
            .properties
            .get("provisioningState")
            .and_then(Value::as_str)
            .map(String::from);

        Self {
            id: resource.id,
            address,
            provisioning_state,
            tags: resource.tags.unwrap_or_default(),
            properties: resource.properties,
        }
    }

    /// Returns the spec hash recorded in the resource's tags.
    #[must_use]
    pub fn spec_hash(&self) -> Option<&str> {
        self.tags.get(HASH_TAG).map(String::as_str)
    }

    /// Returns the allocated address of a public IP.
    #[must_use]
    pub fn ip_address(&self) -> Option<IpAddr> {
        self.properties
            .get("ipAddress")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
    }

    /// Returns true once provisioning reached a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.provisioning_state.as_deref(),
            None | Some("Succeeded" | "Failed" | "Canceled")
        )
    }

    /// Returns true if provisioning failed.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self.provisioning_state.as_deref(), Some("Failed" | "Canceled"))
    }
}

/// Generic ARM resource envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct ArmResource {
    /// Resource id.
    pub id: String,
    /// Resource name.
    #[serde(default)]
    pub name: String,
    /// Region.
    #[serde(default)]
    pub location: Option<String>,
    /// Tags.
    #[serde(default)]
    pub tags: Option<BTreeMap<String, String>>,
    /// Resource properties.
    #[serde(default)]
    pub properties: Value,
}

/// ARM snapshot response.
#[derive(Debug, Clone, Deserialize)]
pub struct ArmSnapshot {
    /// Resource id.
    pub id: String,
    /// Snapshot name.
    pub name: String,
    /// Region.
    pub location: String,
    /// Snapshot properties.
    pub properties: ArmSnapshotProperties,
}

/// Properties of an ARM snapshot.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArmSnapshotProperties {
    /// Size in GB.
    #[serde(rename = "diskSizeGB")]
    pub disk_size_gb: u32,
}

impl From<ArmSnapshot> for Snapshot {
    fn from(snapshot: ArmSnapshot) -> Self {
        Self {
            id: snapshot.id,
            name: snapshot.name,
            location: snapshot.location,
            size_gb: snapshot.properties.disk_size_gb,
        }
    }
}

/// ARM error envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct ArmErrorResponse {
    /// Error details.
    pub error: ArmErrorDetail,
}

/// ARM error details.
#[derive(Debug, Clone, Deserialize)]
pub struct ArmErrorDetail {
    /// Error code.
    pub code: String,
    /// Error message.
    pub message: String,
}

/// OAuth2 token response.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    /// Bearer token.
    pub access_token: String,
    /// Lifetime in seconds.
    #[serde(default)]
    pub expires_in: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_top_level_resource_id() {
        let address = ResourceAddress::new("rg", ResourceKind::Disk, "osManagedDisk");
        assert_eq!(
            address.resource_id("sub"),
            "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Compute/disks/osManagedDisk"
        );
    }

    #[test]
    fn test_nested_resource_id() {
        let address = ResourceAddress::new("rg", ResourceKind::Subnet, "subnet").with_parent("vnet");
        assert_eq!(
            address.resource_id("sub"),
            "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Network/virtualNetworks/vnet/subnets/subnet"
        );
    }

    #[test]
    fn test_provisioned_resource_from_arm() {
        let arm: ArmResource = serde_json::from_value(json!({
            "id": "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Network/publicIPAddresses/pip",
            "name": "pip",
            "location": "northcentralus",
            "tags": { "dcs-deploy-hash": "abc" },
            "properties": { "provisioningState": "Succeeded", "ipAddress": "20.1.2.3" }
        }))
        .expect("decode");

        let resource = ProvisionedResource::from_arm(
            ResourceAddress::new("rg", ResourceKind::PublicIpAddress, "pip"),
            arm,
        );

        assert_eq!(resource.spec_hash(), Some("abc"));
        assert_eq!(resource.ip_address(), Some("20.1.2.3".parse().expect("ip")));
        assert!(resource.is_terminal());
        assert!(!resource.is_failed());
    }

    #[test]
    fn test_unallocated_ip_is_none() {
        let resource = ProvisionedResource {
            id: String::from("id"),
            address: ResourceAddress::new("rg", ResourceKind::PublicIpAddress, "pip"),
            provisioning_state: Some(String::from("Updating")),
            tags: BTreeMap::new(),
            properties: json!({}),
        };

        assert!(resource.ip_address().is_none());
        assert!(!resource.is_terminal());
    }
}
