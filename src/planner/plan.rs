//! Deployment plan types and construction.
//!
//! This module defines the structure of deployment plans and provides
//! functionality for converting diffs into executable plans.

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};

use crate::cloud::ResourceAddress;
use crate::config::GuardrailsConfig;
use crate::graph::{ResourceDeclaration, ResourceGraph, ResourceKind, address_of};
use crate::state::DeploymentState;

use super::diff::{DiffResult, DiffType};

/// A complete deployment plan.
#[derive(Debug)]
pub struct DeploymentPlan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Configuration hash this plan is based on.
    pub config_hash: String,
    /// Planned actions in execution order.
    pub actions: Vec<PlannedAction>,
    /// Whether the plan passes guardrails.
    pub passes_guardrails: bool,
    /// Guardrail violations (if any).
    pub guardrail_violations: Vec<String>,
}

/// A single planned action.
#[derive(Debug, Clone)]
pub struct PlannedAction {
    /// Action type.
    pub action_type: ActionType,
    /// Resource name.
    pub resource_name: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Where the resource lives.
    pub address: ResourceAddress,
    /// Desired declaration, for creates and updates.
    pub declaration: Option<ResourceDeclaration>,
    /// Reason for this action.
    pub reason: String,
    /// New spec hash (if applicable).
    pub new_hash: Option<String>,
    /// Dependencies (action indices that must complete first).
    pub dependencies: Vec<usize>,
}

/// Types of actions in a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Create a resource.
    Create,
    /// Update a resource in place.
    Update,
    /// Delete a resource.
    Delete,
}

impl DeploymentPlan {
    /// Creates a plan from a diff result.
    ///
    /// Creates and updates follow the graph's topological order; deletes
    /// come last, dependents before their dependencies.
    #[must_use]
    pub fn from_diff(
        diff: &DiffResult,
        graph: &ResourceGraph,
        state: Option<&DeploymentState>,
        resource_group: &str,
        guardrails: Option<&GuardrailsConfig>,
        config_hash: &str,
    ) -> Self {
        let mut actions = Vec::new();
        let mut index_of: HashMap<String, usize> = HashMap::new();

        for resource_diff in &diff.diffs {
            let action_type = match resource_diff.diff_type {
                DiffType::Create => ActionType::Create,
                DiffType::Update | DiffType::Drift => ActionType::Update,
                DiffType::Delete | DiffType::NoChange => continue,
            };
            let Some(declaration) = graph.get(&resource_diff.name) else {
                continue;
            };

            let dependencies = declaration
                .depends_on()
                .iter()
                .filter_map(|dep| index_of.get(dep).copied())
                .collect();

            let reason = match resource_diff.diff_type {
                DiffType::Create if resource_diff.old_hash.is_some() => {
                    String::from("Recorded resource is missing")
                }
                DiffType::Create => String::from("Declared in configuration"),
                DiffType::Drift => String::from("Resource drifted from its declaration"),
                _ => String::from("Declaration changed"),
            };

            index_of.insert(resource_diff.name.clone(), actions.len());
            actions.push(PlannedAction {
                action_type,
                resource_name: resource_diff.name.clone(),
                kind: resource_diff.kind,
                address: address_of(declaration, resource_group),
                declaration: Some(declaration.clone()),
                reason,
                new_hash: resource_diff.new_hash.clone(),
                dependencies,
            });
        }

        let removed: BTreeSet<String> = diff
            .diffs
            .iter()
            .filter(|d| d.diff_type == DiffType::Delete)
            .map(|d| d.name.clone())
            .collect();

        if let Some(state) = state {
            Self::push_deletes(
                &mut actions,
                &mut index_of,
                state,
                &removed,
                "Removed from configuration",
            );
        }

        let guardrail_violations = Self::check_guardrails(guardrails, &actions, true);

        Self {
            created_at: Utc::now(),
            config_hash: config_hash.to_string(),
            actions,
            passes_guardrails: guardrail_violations.is_empty(),
            guardrail_violations,
        }
    }

    /// Creates a plan that deletes every recorded resource.
    ///
    /// With `force`, `prevent_destroy` is not enforced.
    #[must_use]
    pub fn destroy(
        state: &DeploymentState,
        guardrails: Option<&GuardrailsConfig>,
        force: bool,
    ) -> Self {
        let mut actions = Vec::new();
        let mut index_of = HashMap::new();
        let names: BTreeSet<String> = state.resources.keys().cloned().collect();

        Self::push_deletes(&mut actions, &mut index_of, state, &names, "Stack destroyed");

        let guardrail_violations = if force {
            Vec::new()
        } else {
            Self::check_guardrails(guardrails, &actions, false)
        };

        Self {
            created_at: Utc::now(),
            config_hash: state.config_hash.clone(),
            actions,
            passes_guardrails: guardrail_violations.is_empty(),
            guardrail_violations,
        }
    }

    /// Creates an empty plan (no changes needed).
    #[must_use]
    pub fn empty(config_hash: &str) -> Self {
        Self {
            created_at: Utc::now(),
            config_hash: config_hash.to_string(),
            actions: vec![],
            passes_guardrails: true,
            guardrail_violations: vec![],
        }
    }

    /// Appends delete actions for `names`, dependents first.
    ///
    /// Each delete depends on the already planned actions of every resource
    /// that recorded a dependency on it.
    fn push_deletes(
        actions: &mut Vec<PlannedAction>,
        index_of: &mut HashMap<String, usize>,
        state: &DeploymentState,
        names: &BTreeSet<String>,
        reason: &str,
    ) {
        let mut remaining = names.clone();
        while !remaining.is_empty() {
            let ready: Vec<String> = remaining
                .iter()
                .filter(|name| {
                    Self::recorded_dependents(state, name)
                        .iter()
                        .all(|dependent| !remaining.contains(*dependent))
                })
                .cloned()
                .collect();

            // A cycle in recorded dependencies; delete the rest by name.
            let batch = if ready.is_empty() {
                remaining.iter().cloned().collect()
            } else {
                ready
            };

            for name in batch {
                remaining.remove(&name);
                let Some(recorded) = state.get_resource(&name) else {
                    continue;
                };

                let dependencies = Self::recorded_dependents(state, &name)
                    .iter()
                    .filter_map(|dependent| index_of.get(*dependent).copied())
                    .collect();

                index_of.insert(name.clone(), actions.len());
                actions.push(PlannedAction {
                    action_type: ActionType::Delete,
                    resource_name: name,
                    kind: recorded.kind,
                    address: recorded.address(&state.resource_group),
                    declaration: None,
                    reason: reason.to_string(),
                    new_hash: None,
                    dependencies,
                });
            }
        }
    }

    /// Returns the recorded resources that depend on `name`.
    fn recorded_dependents<'s>(state: &'s DeploymentState, name: &str) -> Vec<&'s str> {
        state
            .resources
            .values()
            .filter(|r| r.depends_on.iter().any(|d| d == name))
            .map(|r| r.name.as_str())
            .collect()
    }

    /// Checks guardrails for the plan.
    fn check_guardrails(
        guardrails: Option<&GuardrailsConfig>,
        actions: &[PlannedAction],
        limit_actions: bool,
    ) -> Vec<String> {
        let mut violations = Vec::new();

        let Some(guardrails) = guardrails else {
            return violations;
        };

        for action in actions {
            if action.action_type == ActionType::Delete
                && guardrails.prevent_destroy.contains(&action.resource_name)
            {
                violations.push(format!(
                    "Plan deletes protected resource '{}'",
                    action.resource_name
                ));
            }
        }

        if limit_actions
            && let Some(max_actions) = guardrails.max_actions
            && actions.len() > max_actions
        {
            violations.push(format!(
                "Plan contains {} actions but max_actions is {max_actions}",
                actions.len()
            ));
        }

        violations
    }

    /// Returns true if the plan is empty (no changes).
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Returns the number of actions.
    #[must_use]
    pub const fn action_count(&self) -> usize {
        self.actions.len()
    }

    /// Returns the number of actions of `action_type`.
    #[must_use]
    pub fn count(&self, action_type: ActionType) -> usize {
        self.actions
            .iter()
            .filter(|a| a.action_type == action_type)
            .count()
    }

    /// Returns the number of create actions.
    #[must_use]
    pub fn create_count(&self) -> usize {
        self.count(ActionType::Create)
    }

    /// Returns the number of update actions.
    #[must_use]
    pub fn update_count(&self) -> usize {
        self.count(ActionType::Update)
    }

    /// Returns the number of delete actions.
    #[must_use]
    pub fn delete_count(&self) -> usize {
        self.count(ActionType::Delete)
    }
}

impl PlannedAction {
    /// Returns a human-readable description of the action.
    #[must_use]
    pub fn description(&self) -> String {
        match self.action_type {
            ActionType::Create => format!("Create {} '{}'", self.kind, self.resource_name),
            ActionType::Update => format!("Update {} '{}'", self.kind, self.resource_name),
            ActionType::Delete => format!("Delete {} '{}'", self.kind, self.resource_name),
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for PlannedAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.action_type, self.kind, self.resource_name)?;
        if !self.reason.is_empty() {
            write!(f, " ({})", self.reason)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for DeploymentPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.actions.is_empty() {
            return write!(f, "No changes required");
        }

        writeln!(f, "Deployment Plan ({} actions):", self.actions.len())?;
        for (i, action) in self.actions.iter().enumerate() {
            writeln!(f, "  {i}. {action}")?;
        }

        if !self.guardrail_violations.is_empty() {
            writeln!(f, "\nGuardrail violations:")?;
            for violation in &self.guardrail_violations {
                writeln!(f, "  - {violation}")?;
            }
        }

        Ok(())
    }
}
