//! Cloud control plane integration.
//!
//! This module provides the [`CloudProvider`] interface the reconciler talks
//! to and the Azure Resource Manager client that implements it. An in-memory
//! provider backs the tests; [`StackObserver`] reads a stack's resources.

mod azure;
mod memory;
mod observer;
mod provider;
mod types;

pub use azure::{AzureAuth, AzureClient};
pub use memory::{CloudCall, CloudOperation, FAKE_SUBSCRIPTION, InMemoryCloud};
pub use observer::{ObservedResources, StackObserver};
pub use provider::CloudProvider;
#[cfg(test)]
pub use provider::MockCloudProvider;
pub use types::{
    ArmErrorDetail, ArmErrorResponse, ArmResource, ArmSnapshot, ArmSnapshotProperties, HASH_TAG,
    ProvisionedResource, ResourceAddress, ResourceRequest, STACK_TAG, Snapshot, TokenResponse,
};
