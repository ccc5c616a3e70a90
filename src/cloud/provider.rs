//! The cloud control plane interface.

use async_trait::async_trait;

use crate::error::Result;

use super::types::{ProvisionedResource, ResourceAddress, ResourceRequest, Snapshot};

/// Operations the deployer needs from a cloud control plane.
///
/// Implementations must treat `create` and `update` as idempotent PUTs and
/// return once the resource reached a terminal provisioning state.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Looks up a snapshot by name.
    async fn lookup_snapshot(&self, resource_group: &str, name: &str) -> Result<Snapshot>;

    /// Creates a resource.
    async fn create(&self, request: &ResourceRequest) -> Result<ProvisionedResource>;

    /// Reads a resource, returning `None` if it does not exist.
    async fn read(&self, address: &ResourceAddress) -> Result<Option<ProvisionedResource>>;

    /// Updates a resource in place.
    async fn update(&self, request: &ResourceRequest) -> Result<ProvisionedResource>;

    /// Deletes a resource.
    async fn delete(&self, address: &ResourceAddress) -> Result<()>;

    /// Returns the provider name.
    fn provider_name(&self) -> &'static str;
}

#[async_trait]
impl CloudProvider for Box<dyn CloudProvider> {
    async fn lookup_snapshot(&self, resource_group: &str, name: &str) -> Result<Snapshot> {
        (**self).lookup_snapshot(resource_group, name).await
    }

    async fn create(&self, request: &ResourceRequest) -> Result<ProvisionedResource> {
        (**self).create(request).await
    }

    async fn read(&self, address: &ResourceAddress) -> Result<Option<ProvisionedResource>> {
        (**self).read(address).await
    }

    async fn update(&self, request: &ResourceRequest) -> Result<ProvisionedResource> {
        (**self).update(request).await
    }

    async fn delete(&self, address: &ResourceAddress) -> Result<()> {
        (**self).delete(address).await
    }

    fn provider_name(&self) -> &'static str {
        (**self).provider_name()
    }
}
