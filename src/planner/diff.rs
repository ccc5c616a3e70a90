//! Diff engine for comparing desired vs observed state.
//!
//! This module computes the difference between the declared resource graph,
//! the recorded state and what the cloud reports.

use tracing::debug;

use crate::cloud::ObservedResources;
use crate::error::Result;
use crate::graph::{ResourceDeclaration, ResourceGraph, ResourceKind, spec_hash};
use crate::state::{DeploymentState, ResourceState};

/// Engine for computing diffs between desired and observed states.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiffEngine;

/// Difference for a single resource.
#[derive(Debug, Clone)]
pub struct ResourceDiff {
    /// Resource name.
    pub name: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Type of difference.
    pub diff_type: DiffType,
    /// Details about the difference.
    pub details: Vec<DiffDetail>,
    /// Previous hash (if applicable).
    pub old_hash: Option<String>,
    /// New hash (if applicable).
    pub new_hash: Option<String>,
}

/// Type of difference detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffType {
    /// Resource needs to be created.
    Create,
    /// Resource needs to be updated.
    Update,
    /// Resource needs to be deleted.
    Delete,
    /// Resource is unchanged.
    NoChange,
    /// Resource exists but was changed outside the deployer, or was never
    /// recorded.
    Drift,
}

/// Detail about a specific difference.
#[derive(Debug, Clone)]
pub struct DiffDetail {
    /// Field that differs.
    pub field: String,
    /// Old value.
    pub old_value: Option<String>,
    /// New value.
    pub new_value: Option<String>,
}

/// Complete diff result.
#[derive(Debug)]
pub struct DiffResult {
    /// All resource diffs.
    pub diffs: Vec<ResourceDiff>,
    /// Number of resources to create.
    pub creates: usize,
    /// Number of resources to update, drifted ones included.
    pub updates: usize,
    /// Number of resources to delete.
    pub deletes: usize,
    /// Number of unchanged resources.
    pub unchanged: usize,
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the diff between the declared graph and the recorded and
    /// observed state.
    ///
    /// # Errors
    ///
    /// Returns an error if a declaration cannot be hashed.
    pub fn compute_diff(
        &self,
        graph: &ResourceGraph,
        state: Option<&DeploymentState>,
        observed: &ObservedResources,
    ) -> Result<DiffResult> {
        let mut diffs = Vec::new();

        for name in graph.topological_order()? {
            let Some(declaration) = graph.get(&name) else {
                continue;
            };
            let new_hash = spec_hash(declaration)?;
            let recorded = state.and_then(|s| s.get_resource(&name));
            diffs.push(Self::compute_resource_diff(
                declaration,
                recorded,
                observed,
                &new_hash,
            ));
        }

        // Recorded resources that are no longer declared
        if let Some(state) = state {
            for (name, recorded) in &state.resources {
                if graph.contains(name) {
                    continue;
                }
                debug!("{} is no longer declared", name);
                let old_value = if observed.exists(name) {
                    recorded.cloud_id.clone()
                } else {
                    format!("already gone (was {})", recorded.cloud_id)
                };
                diffs.push(ResourceDiff {
                    name: name.clone(),
                    kind: recorded.kind,
                    diff_type: DiffType::Delete,
                    details: vec![DiffDetail {
                        field: String::from("resource"),
                        old_value: Some(old_value),
                        new_value: None,
                    }],
                    old_hash: Some(recorded.spec_hash.clone()),
                    new_hash: None,
                });
            }
        }

        let creates = diffs.iter().filter(|d| d.diff_type == DiffType::Create).count();
        let updates = diffs
            .iter()
            .filter(|d| matches!(d.diff_type, DiffType::Update | DiffType::Drift))
            .count();
        let deletes = diffs.iter().filter(|d| d.diff_type == DiffType::Delete).count();
        let unchanged = diffs.iter().filter(|d| d.diff_type == DiffType::NoChange).count();

        Ok(DiffResult {
            diffs,
            creates,
            updates,
            deletes,
            unchanged,
        })
    }

    /// Computes the diff for a single declaration.
    fn compute_resource_diff(
        declaration: &ResourceDeclaration,
        recorded: Option<&ResourceState>,
        observed: &ObservedResources,
        new_hash: &str,
    ) -> ResourceDiff {
        let name = declaration.name.clone();
        let kind = declaration.kind();
        let state_hash = recorded.map(|r| r.spec_hash.as_str());

        let Some(resource) = observed.get(&name) else {
            debug!("{} {} needs to be created", kind, name);
            let old_value = recorded.map(|r| format!("missing (was {})", r.cloud_id));
            return ResourceDiff {
                name: name.clone(),
                kind,
                diff_type: DiffType::Create,
                details: vec![DiffDetail {
                    field: String::from("resource"),
                    old_value,
                    new_value: Some(name),
                }],
                old_hash: state_hash.map(String::from),
                new_hash: Some(new_hash.to_string()),
            };
        };

        let tag_hash = if kind.is_tracked() {
            resource.spec_hash()
        } else {
            None
        };
        let known_hash = state_hash.or(tag_hash);

        let (diff_type, details) = match known_hash {
            Some(hash) if hash == new_hash => {
                if kind.is_tracked() && tag_hash != Some(new_hash) {
                    (
                        DiffType::Drift,
                        vec![DiffDetail {
                            field: String::from("tags"),
                            old_value: tag_hash.map(String::from),
                            new_value: Some(new_hash.to_string()),
                        }],
                    )
                } else {
                    (DiffType::NoChange, vec![])
                }
            }
            Some(hash) => (
                DiffType::Update,
                vec![DiffDetail {
                    field: String::from("spec"),
                    old_value: Some(hash.to_string()),
                    new_value: Some(new_hash.to_string()),
                }],
            ),
            None => (
                DiffType::Drift,
                vec![DiffDetail {
                    field: String::from("record"),
                    old_value: Some(format!("unmanaged ({})", resource.id)),
                    new_value: Some(name.clone()),
                }],
            ),
        };

        debug!("{} {}: {}", kind, name, diff_type);
        ResourceDiff {
            name,
            kind,
            diff_type,
            details,
            old_hash: known_hash.map(String::from),
            new_hash: Some(new_hash.to_string()),
        }
    }
}

impl DiffResult {
    /// Returns true if there are any changes.
    #[must_use]
    pub const fn has_changes(&self) -> bool {
        self.creates > 0 || self.updates > 0 || self.deletes > 0
    }

    /// Returns the total number of changes.
    #[must_use]
    pub const fn total_changes(&self) -> usize {
        self.creates + self.updates + self.deletes
    }

    /// Filters to only diffs that require action.
    #[must_use]
    pub fn actionable_diffs(&self) -> Vec<&ResourceDiff> {
        self.diffs
            .iter()
            .filter(|d| d.diff_type != DiffType::NoChange)
            .collect()
    }

    /// Returns the diff for `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ResourceDiff> {
        self.diffs.iter().find(|d| d.name == name)
    }
}

impl std::fmt::Display for DiffType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::NoChange => "no change",
            Self::Drift => "drift",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for ResourceDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}: {}", self.kind, self.name, self.diff_type)?;
        if !self.details.is_empty() {
            write!(f, " (")?;
            for (i, detail) in self.details.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", detail.field)?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{HASH_TAG, ProvisionedResource, ResourceAddress};
    use crate::graph::{ResourceRef, ResourceSpec};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn graph() -> ResourceGraph {
        let mut graph = ResourceGraph::new();
        graph
            .insert(ResourceDeclaration::new(
                "vnet",
                "northcentralus",
                ResourceSpec::VirtualNetwork {
                    address_space: vec![String::from("10.0.0.0/16")],
                },
            ))
            .expect("vnet");
        graph
            .insert(ResourceDeclaration::new(
                "subnet",
                "northcentralus",
                ResourceSpec::Subnet {
                    virtual_network: ResourceRef::new(ResourceKind::VirtualNetwork, "vnet"),
                    address_prefix: String::from("10.0.1.0/24"),
                },
            ))
            .expect("subnet");
        graph
    }

    fn observed_with(name: &str, kind: ResourceKind, hash: Option<&str>) -> ProvisionedResource {
        let mut tags = BTreeMap::new();
        if let Some(hash) = hash {
            tags.insert(HASH_TAG.to_string(), hash.to_string());
        }
        ProvisionedResource {
            id: format!("/id/{name}"),
            address: ResourceAddress::new("rg", kind, name),
            provisioning_state: Some(String::from("Succeeded")),
            tags,
            properties: json!({}),
        }
    }

    fn hash_of(graph: &ResourceGraph, name: &str) -> String {
        spec_hash(graph.get(name).expect("declared")).expect("hash")
    }

    fn converged() -> (ResourceGraph, DeploymentState, ObservedResources) {
        let graph = graph();
        let mut state = DeploymentState::new("dcs", "prod", "rg");
        let mut observed = ObservedResources::new();
        for (name, kind) in [
            ("vnet", ResourceKind::VirtualNetwork),
            ("subnet", ResourceKind::Subnet),
        ] {
            let hash = hash_of(&graph, name);
            state.set_resource(ResourceState::new(name, kind, &format!("/id/{name}"), &hash));
            let tag = kind.is_tracked().then_some(hash.as_str());
            observed.insert(name, observed_with(name, kind, tag));
        }
        (graph, state, observed)
    }

    #[test]
    fn test_empty_cloud_creates_everything_in_order() {
        let diff = DiffEngine::new()
            .compute_diff(&graph(), None, &ObservedResources::new())
            .expect("diff");

        assert_eq!(diff.creates, 2);
        let names: Vec<_> = diff.diffs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["vnet", "subnet"]);
    }

    #[test]
    fn test_converged_stack_has_no_changes() {
        let (graph, state, observed) = converged();
        let diff = DiffEngine::new()
            .compute_diff(&graph, Some(&state), &observed)
            .expect("diff");

        assert!(!diff.has_changes());
        assert_eq!(diff.unchanged, 2);
    }

    #[test]
    fn test_changed_hash_is_update() {
        let (graph, mut state, observed) = converged();
        if let Some(vnet) = state.resources.get_mut("vnet") {
            vnet.spec_hash = String::from("stale");
        }

        let diff = DiffEngine::new()
            .compute_diff(&graph, Some(&state), &observed)
            .expect("diff");

        assert_eq!(diff.get("vnet").map(|d| d.diff_type), Some(DiffType::Update));
        assert_eq!(diff.updates, 1);
    }

    #[test]
    fn test_tampered_tag_is_drift() {
        let (graph, state, mut observed) = converged();
        observed.insert(
            "vnet",
            observed_with("vnet", ResourceKind::VirtualNetwork, Some("edited")),
        );

        let diff = DiffEngine::new()
            .compute_diff(&graph, Some(&state), &observed)
            .expect("diff");

        assert_eq!(diff.get("vnet").map(|d| d.diff_type), Some(DiffType::Drift));
        assert_eq!(diff.get("subnet").map(|d| d.diff_type), Some(DiffType::NoChange));
    }

    #[test]
    fn test_unrecorded_resource_is_drift() {
        let graph = graph();
        let mut observed = ObservedResources::new();
        observed.insert("subnet", observed_with("subnet", ResourceKind::Subnet, None));

        let diff = DiffEngine::new()
            .compute_diff(&graph, None, &observed)
            .expect("diff");

        assert_eq!(diff.get("subnet").map(|d| d.diff_type), Some(DiffType::Drift));
        assert_eq!(diff.get("vnet").map(|d| d.diff_type), Some(DiffType::Create));
    }

    #[test]
    fn test_tag_hash_recovers_lost_state() {
        let graph = graph();
        let hash = hash_of(&graph, "vnet");
        let mut observed = ObservedResources::new();
        observed.insert(
            "vnet",
            observed_with("vnet", ResourceKind::VirtualNetwork, Some(&hash)),
        );

        let diff = DiffEngine::new()
            .compute_diff(&graph, None, &observed)
            .expect("diff");

        assert_eq!(diff.get("vnet").map(|d| d.diff_type), Some(DiffType::NoChange));
    }

    #[test]
    fn test_removed_resource_is_deleted() {
        let (graph, mut state, observed) = converged();
        state.set_resource(ResourceState::new(
            "old-pip",
            ResourceKind::PublicIpAddress,
            "/id/old-pip",
            "hash",
        ));

        let diff = DiffEngine::new()
            .compute_diff(&graph, Some(&state), &observed)
            .expect("diff");

        let delete = diff.get("old-pip").expect("planned");
        assert_eq!(delete.diff_type, DiffType::Delete);
        assert_eq!(
            delete.details[0].old_value.as_deref(),
            Some("already gone (was /id/old-pip)")
        );
        assert_eq!(diff.total_changes(), 1);
    }

    #[test]
    fn test_missing_recorded_resource_is_recreated() {
        let (graph, state, observed) = converged();
        let mut only_vnet = ObservedResources::new();
        only_vnet.insert("vnet", observed.get("vnet").expect("observed").clone());

        let diff = DiffEngine::new()
            .compute_diff(&graph, Some(&state), &only_vnet)
            .expect("diff");

        let subnet = diff.get("subnet").expect("diffed");
        assert_eq!(subnet.diff_type, DiffType::Create);
        assert_eq!(
            subnet.details[0].old_value.as_deref(),
            Some("missing (was /id/subnet)")
        );
    }
}
