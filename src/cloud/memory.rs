//! In-memory cloud.
//!
//! A [`CloudProvider`] that keeps resources in a map and records every call.
//! Used by tests to exercise the reconcile flow without an Azure account.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

use crate::error::{CloudError, DeployError, Result};
use crate::graph::ResourceKind;

use super::provider::CloudProvider;
use super::types::{ProvisionedResource, ResourceAddress, ResourceRequest, Snapshot};

/// Subscription id used in fabricated resource ids.
pub const FAKE_SUBSCRIPTION: &str = "00000000-0000-0000-0000-000000000000";

/// Operations recorded by [`InMemoryCloud`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloudOperation {
    /// Snapshot lookup.
    LookupSnapshot,
    /// Resource creation.
    Create,
    /// Resource read.
    Read,
    /// In-place update.
    Update,
    /// Resource deletion.
    Delete,
}

/// A recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudCall {
    /// Operation.
    pub operation: CloudOperation,
    /// Resource or snapshot name.
    pub target: String,
}

#[derive(Debug, Default)]
struct Inner {
    snapshots: HashMap<(String, String), Snapshot>,
    resources: BTreeMap<String, ProvisionedResource>,
    calls: Vec<CloudCall>,
    failures: HashMap<String, u32>,
    next_ip: u8,
    defer_public_ips: bool,
}

/// An in-memory [`CloudProvider`].
#[derive(Debug, Default)]
pub struct InMemoryCloud {
    inner: Mutex<Inner>,
    latency: Option<Duration>,
}

impl InMemoryCloud {
    /// Creates an empty cloud.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a snapshot that lookups can find.
    #[must_use]
    pub fn with_snapshot(self, resource_group: &str, snapshot: Snapshot) -> Self {
        self.lock()
            .snapshots
            .insert((resource_group.to_string(), snapshot.name.clone()), snapshot);
        self
    }

    /// Delays every call by `latency`.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Leaves public IPs without an address until a VM is created or updated,
    /// the way Azure assigns dynamic addresses.
    #[must_use]
    pub fn with_deferred_public_ips(self) -> Self {
        self.lock().defer_public_ips = true;
        self
    }

    /// Makes the next `times` create or update calls for `name` fail.
    pub fn fail_next(&self, name: &str, times: u32) {
        self.lock().failures.insert(name.to_string(), times);
    }

    /// Returns all recorded calls.
    #[must_use]
    pub fn calls(&self) -> Vec<CloudCall> {
        self.lock().calls.clone()
    }

    /// Returns how many calls of `operation` were recorded.
    #[must_use]
    pub fn count(&self, operation: CloudOperation) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    /// Returns the number of create, update and delete calls.
    #[must_use]
    pub fn mutation_count(&self) -> usize {
        self.count(CloudOperation::Create)
            + self.count(CloudOperation::Update)
            + self.count(CloudOperation::Delete)
    }

    /// Clears the call log.
    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Returns a resource by name.
    #[must_use]
    pub fn resource(&self, name: &str) -> Option<ProvisionedResource> {
        self.lock()
            .resources
            .values()
            .find(|r| r.address.name == name)
            .cloned()
    }

    /// Returns the number of resources that exist.
    #[must_use]
    pub fn resource_count(&self) -> usize {
        self.lock().resources.len()
    }

    /// Removes a resource behind the deployer's back.
    pub fn remove_out_of_band(&self, name: &str) -> Option<ProvisionedResource> {
        let mut inner = self.lock();
        let key = inner
            .resources
            .iter()
            .find(|(_, r)| r.address.name == name)
            .map(|(k, _)| k.clone())?;
        inner.resources.remove(&key)
    }

    /// Overwrites a tag behind the deployer's back.
    pub fn set_tag_out_of_band(&self, name: &str, key: &str, value: &str) {
        let mut inner = self.lock();
        if let Some(resource) = inner.resources.values_mut().find(|r| r.address.name == name) {
            resource.tags.insert(key.to_string(), value.to_string());
        }
    }

    async fn pause(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn next_address(next_ip: &mut u8) -> IpAddr {
        *next_ip = next_ip.wrapping_add(1);
        IpAddr::V4(Ipv4Addr::new(20, 112, 0, *next_ip))
    }

    fn allocate_pending_ips(inner: &mut Inner) {
        let Inner {
            resources, next_ip, ..
        } = inner;
        for resource in resources.values_mut().filter(|r| {
            r.address.kind == ResourceKind::PublicIpAddress && r.ip_address().is_none()
        }) {
            let ip = Self::next_address(next_ip);
            debug!("In-memory allocation of {} to {}", ip, resource.address);
            resource.properties["ipAddress"] = json!(ip.to_string());
        }
    }

    fn record(inner: &mut Inner, operation: CloudOperation, target: &str) {
        inner.calls.push(CloudCall {
            operation,
            target: target.to_string(),
        });
    }

    fn put(&self, request: &ResourceRequest, operation: CloudOperation) -> Result<ProvisionedResource> {
        let mut inner = self.lock();
        let address = &request.address;
        Self::record(&mut inner, operation, &address.name);

        if let Some(remaining) = inner.failures.get_mut(&address.name)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(DeployError::Cloud(CloudError::ProvisioningFailed {
                kind: address.kind.to_string(),
                name: address.name.clone(),
                message: String::from("injected failure"),
            }));
        }

        if let (Some(parent_kind), Some(parent)) = (address.kind.parent_kind(), &address.parent) {
            let parent_id = ResourceAddress::new(&address.resource_group, parent_kind, parent.clone())
                .resource_id(FAKE_SUBSCRIPTION);
            if !inner.resources.contains_key(&parent_id) {
                return Err(DeployError::Cloud(CloudError::ResourceNotFound {
                    kind: parent_kind.to_string(),
                    name: parent.clone(),
                }));
            }
        }

        let id = address.resource_id(FAKE_SUBSCRIPTION);
        let mut properties = request
            .body
            .get("properties")
            .cloned()
            .unwrap_or_else(|| json!({}));
        if let Some(object) = properties.as_object_mut() {
            object.insert(String::from("provisioningState"), json!("Succeeded"));
        }

        if address.kind == ResourceKind::PublicIpAddress {
            let existing = inner
                .resources
                .get(&id)
                .and_then(ProvisionedResource::ip_address);
            let ip = match existing {
                Some(ip) => Some(ip),
                None if inner.defer_public_ips => None,
                None => Some(Self::next_address(&mut inner.next_ip)),
            };
            if let Some(ip) = ip {
                properties["ipAddress"] = json!(ip.to_string());
            }
        }

        let tags = request
            .body
            .get("tags")
            .and_then(Value::as_object)
            .map(|tags| {
                tags.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        let resource = ProvisionedResource {
            id: id.clone(),
            address: address.clone(),
            provisioning_state: Some(String::from("Succeeded")),
            tags,
            properties,
        };
        inner.resources.insert(id, resource.clone());
        if inner.defer_public_ips && address.kind == ResourceKind::VirtualMachine {
            Self::allocate_pending_ips(&mut inner);
        }
        debug!("In-memory {:?} of {}", operation, address);
        Ok(resource)
    }
}

#[async_trait]
impl CloudProvider for InMemoryCloud {
    async fn lookup_snapshot(&self, resource_group: &str, name: &str) -> Result<Snapshot> {
        self.pause().await;
        let mut inner = self.lock();
        Self::record(&mut inner, CloudOperation::LookupSnapshot, name);
        inner
            .snapshots
            .get(&(resource_group.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| {
                DeployError::Cloud(CloudError::SnapshotNotFound {
                    name: name.to_string(),
                    resource_group: resource_group.to_string(),
                })
            })
    }

    async fn create(&self, request: &ResourceRequest) -> Result<ProvisionedResource> {
        self.pause().await;
        self.put(request, CloudOperation::Create)
    }

    async fn read(&self, address: &ResourceAddress) -> Result<Option<ProvisionedResource>> {
        self.pause().await;
        let mut inner = self.lock();
        Self::record(&mut inner, CloudOperation::Read, &address.name);
        Ok(inner
            .resources
            .get(&address.resource_id(FAKE_SUBSCRIPTION))
            .cloned())
    }

    async fn update(&self, request: &ResourceRequest) -> Result<ProvisionedResource> {
        self.pause().await;
        self.put(request, CloudOperation::Update)
    }

    async fn delete(&self, address: &ResourceAddress) -> Result<()> {
        self.pause().await;
        let mut inner = self.lock();
        Self::record(&mut inner, CloudOperation::Delete, &address.name);
        inner
            .resources
            .remove(&address.resource_id(FAKE_SUBSCRIPTION))
            .map(|_| ())
            .ok_or_else(|| {
                DeployError::Cloud(CloudError::ResourceNotFound {
                    kind: address.kind.to_string(),
                    name: address.name.clone(),
                })
            })
    }

    fn provider_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(kind: ResourceKind, name: &str) -> ResourceRequest {
        ResourceRequest {
            address: ResourceAddress::new("rg", kind, name),
            body: json!({ "location": "northcentralus", "tags": { "a": "b" }, "properties": {} }),
        }
    }

    #[tokio::test]
    async fn test_create_read_delete() {
        let cloud = InMemoryCloud::new();
        let created = cloud
            .create(&request(ResourceKind::VirtualNetwork, "vnet"))
            .await
            .expect("create");

        assert_eq!(created.provisioning_state.as_deref(), Some("Succeeded"));
        assert_eq!(created.tags.get("a").map(String::as_str), Some("b"));

        let read = cloud.read(&created.address).await.expect("read");
        assert_eq!(read, Some(created.clone()));

        cloud.delete(&created.address).await.expect("delete");
        assert!(cloud.read(&created.address).await.expect("read").is_none());
        assert!(cloud.delete(&created.address).await.expect_err("gone").is_not_found());
    }

    #[tokio::test]
    async fn test_public_ip_keeps_address_across_updates() {
        let cloud = InMemoryCloud::new();
        let pip = request(ResourceKind::PublicIpAddress, "pip");

        let first = cloud.create(&pip).await.expect("create");
        let second = cloud.update(&pip).await.expect("update");

        assert!(first.ip_address().is_some());
        assert_eq!(first.ip_address(), second.ip_address());
    }

    #[tokio::test]
    async fn test_deferred_public_ip_is_assigned_with_the_vm() {
        let cloud = InMemoryCloud::new().with_deferred_public_ips();

        let pip = cloud
            .create(&request(ResourceKind::PublicIpAddress, "pip"))
            .await
            .expect("create");
        assert!(pip.ip_address().is_none());

        cloud
            .create(&request(ResourceKind::VirtualMachine, "vm"))
            .await
            .expect("vm");
        let allocated = cloud.resource("pip").and_then(|r| r.ip_address());
        assert!(allocated.is_some());

        let updated = cloud
            .update(&request(ResourceKind::PublicIpAddress, "pip"))
            .await
            .expect("update");
        assert_eq!(updated.ip_address(), allocated);
    }

    #[tokio::test]
    async fn test_nested_resource_needs_parent() {
        let cloud = InMemoryCloud::new();
        let mut subnet = request(ResourceKind::Subnet, "subnet");
        subnet.address.parent = Some(String::from("vnet"));

        assert!(cloud.create(&subnet).await.is_err());

        cloud
            .create(&request(ResourceKind::VirtualNetwork, "vnet"))
            .await
            .expect("vnet");
        cloud.create(&subnet).await.expect("subnet");
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let cloud = InMemoryCloud::new();
        cloud.fail_next("vnet", 1);
        let vnet = request(ResourceKind::VirtualNetwork, "vnet");

        assert!(cloud.create(&vnet).await.is_err());
        assert!(cloud.create(&vnet).await.is_ok());
        assert_eq!(cloud.count(CloudOperation::Create), 2);
    }

    #[tokio::test]
    async fn test_snapshot_lookup() {
        let cloud = InMemoryCloud::new().with_snapshot(
            "rg",
            Snapshot {
                id: String::from("/snap"),
                name: String::from("dcsOsHdd"),
                location: String::from("northcentralus"),
                size_gb: 256,
            },
        );

        assert_eq!(
            cloud.lookup_snapshot("rg", "dcsOsHdd").await.expect("found").size_gb,
            256
        );
        assert!(cloud.lookup_snapshot("other", "dcsOsHdd").await.is_err());
    }
}
