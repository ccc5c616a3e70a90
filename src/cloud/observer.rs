//! Observation of the resources a stack manages.
//!
//! The observer reads every declared resource, plus every resource recorded
//! in state but no longer declared, and returns what the cloud reports.

use std::collections::HashMap;
use tracing::{debug, info};

use crate::error::Result;
use crate::graph::{ResourceGraph, address_of};
use crate::state::DeploymentState;

use super::provider::CloudProvider;
use super::types::{ProvisionedResource, STACK_TAG};

/// Resources as observed in the cloud, keyed by logical name.
#[derive(Debug, Clone, Default)]
pub struct ObservedResources {
    resources: HashMap<String, ProvisionedResource>,
}

impl ObservedResources {
    /// Creates an empty observation.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an observed resource.
    pub fn insert(&mut self, name: impl Into<String>, resource: ProvisionedResource) {
        self.resources.insert(name.into(), resource);
    }

    /// Returns the observed resource for `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ProvisionedResource> {
        self.resources.get(name)
    }

    /// Returns true if `name` exists in the cloud.
    #[must_use]
    pub fn exists(&self, name: &str) -> bool {
        self.resources.contains_key(name)
    }

    /// Returns the number of resources that exist.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Returns true if nothing was observed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Returns names of resources tagged as belonging to another stack.
    #[must_use]
    pub fn foreign(&self, stack: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .resources
            .iter()
            .filter(|(_, r)| r.tags.get(STACK_TAG).is_some_and(|owner| owner != stack))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

/// Reads the current cloud state of a stack.
pub struct StackObserver<'a> {
    provider: &'a dyn CloudProvider,
    resource_group: &'a str,
}

impl<'a> StackObserver<'a> {
    /// Creates an observer for resources in `resource_group`.
    #[must_use]
    pub fn new(provider: &'a dyn CloudProvider, resource_group: &'a str) -> Self {
        Self {
            provider,
            resource_group,
        }
    }

    /// Observes every declared and every recorded resource.
    ///
    /// # Errors
    ///
    /// Returns an error if a read fails for a reason other than absence.
    pub async fn observe(
        &self,
        graph: &ResourceGraph,
        state: Option<&DeploymentState>,
    ) -> Result<ObservedResources> {
        info!(
            "Observing {} declared resources in {}",
            graph.len(),
            self.resource_group
        );

        let mut observed = ObservedResources::new();

        for declaration in graph.declarations() {
            let address = address_of(declaration, self.resource_group);
            if let Some(resource) = self.provider.read(&address).await? {
                observed.insert(declaration.name.clone(), resource);
            }
        }

        if let Some(state) = state {
            for (name, recorded) in &state.resources {
                if graph.contains(name) {
                    continue;
                }
                let address = recorded.address(&state.resource_group);
                if let Some(resource) = self.provider.read(&address).await? {
                    observed.insert(name.clone(), resource);
                }
            }
        }

        debug!("{} resources exist", observed.len());
        Ok(observed)
    }

}
