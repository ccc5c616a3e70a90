//! Plan executor for applying deployment plans.
//!
//! This module handles the execution of deployment plans, including
//! error handling, dependency skipping, and state recording.

use std::collections::HashSet;
use tracing::{debug, error, info, warn};

use crate::cloud::{CloudProvider, ProvisionedResource};
use crate::error::{DeployError, ReconcileError, Result};
use crate::graph::{ResourceKind, render};
use crate::state::{
    DeploymentHistoryEntry, DeploymentOperation, DeploymentState, ResourceState, ResourceStatus,
};

use super::plan::{ActionType, DeploymentPlan, PlannedAction};

/// Error recorded for actions skipped because a dependency failed.
const SKIPPED: &str = "Skipped due to dependency failure";

/// Executor for deployment plans.
pub struct PlanExecutor<'a> {
    /// Cloud provider.
    provider: &'a dyn CloudProvider,
    /// Stack name written into resource tags.
    stack: String,
    /// Whether to continue on errors.
    continue_on_error: bool,
}

/// Result of executing a single action.
#[derive(Debug)]
pub struct ActionResult {
    /// Action index.
    pub index: usize,
    /// Action that was executed.
    pub action: PlannedAction,
    /// Whether the action succeeded.
    pub success: bool,
    /// Cloud resource id (if known).
    pub cloud_id: Option<String>,
    /// Error message (if failed).
    pub error: Option<String>,
}

/// Result of executing the entire plan.
#[derive(Debug)]
pub struct ExecutionResult {
    /// Individual action results.
    pub results: Vec<ActionResult>,
    /// Total actions executed.
    pub total_executed: usize,
    /// Number of successful actions.
    pub successful: usize,
    /// Number of failed actions.
    pub failed: usize,
    /// Number of skipped actions (due to dependency failures).
    pub skipped: usize,
    /// Whether the entire plan succeeded.
    pub success: bool,
}

impl<'a> PlanExecutor<'a> {
    /// Creates a new plan executor.
    #[must_use]
    pub fn new(provider: &'a dyn CloudProvider, stack: &str) -> Self {
        Self {
            provider,
            stack: stack.to_string(),
            continue_on_error: false,
        }
    }

    /// Sets whether to continue on errors.
    #[must_use]
    pub const fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    /// Executes a deployment plan.
    ///
    /// Without `continue_on_error` execution stops at the first failure.
    /// Either way, actions depending on a failed action are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the plan violates guardrails.
    pub async fn execute(
        &self,
        plan: &DeploymentPlan,
        state: &mut DeploymentState,
    ) -> Result<ExecutionResult> {
        info!("Executing deployment plan with {} actions", plan.actions.len());

        if plan.actions.is_empty() {
            return Ok(ExecutionResult {
                results: vec![],
                total_executed: 0,
                successful: 0,
                failed: 0,
                skipped: 0,
                success: true,
            });
        }

        if !plan.passes_guardrails {
            error!("Plan does not pass guardrails");
            for violation in &plan.guardrail_violations {
                error!("  - {violation}");
            }
            return Err(DeployError::Reconcile(ReconcileError::Aborted {
                reason: String::from("Plan violates guardrails"),
            }));
        }

        let operation = if plan.actions.iter().all(|a| a.action_type == ActionType::Delete) {
            DeploymentOperation::Destroy
        } else if state.resources.is_empty() {
            DeploymentOperation::Create
        } else {
            DeploymentOperation::Update
        };

        let mut results = Vec::new();
        let mut failed_indices: HashSet<usize> = HashSet::new();

        for (idx, action) in plan.actions.iter().enumerate() {
            let deps_failed = action
                .dependencies
                .iter()
                .any(|dep| failed_indices.contains(dep));

            if deps_failed {
                warn!("Skipping action {} due to failed dependencies", idx);
                results.push(ActionResult {
                    index: idx,
                    action: action.clone(),
                    success: false,
                    cloud_id: None,
                    error: Some(String::from(SKIPPED)),
                });
                failed_indices.insert(idx);
                continue;
            }

            let result = self.execute_action(idx, action, state).await;

            if !result.success {
                failed_indices.insert(idx);

                if !self.continue_on_error {
                    results.push(result);
                    break;
                }
            }

            results.push(result);
        }

        let skipped = results
            .iter()
            .filter(|r| r.error.as_deref() == Some(SKIPPED))
            .count();
        let successful = results.iter().filter(|r| r.success).count();
        let failed = results.iter().filter(|r| !r.success).count() - skipped;

        let execution_result = ExecutionResult {
            total_executed: results.len(),
            successful,
            failed,
            skipped,
            success: failed == 0 && skipped == 0 && results.len() == plan.actions.len(),
            results,
        };

        let resources = plan
            .actions
            .iter()
            .map(|a| a.resource_name.clone())
            .collect();
        let history_entry = if execution_result.success {
            DeploymentHistoryEntry::new(operation, &plan.config_hash, resources)
        } else {
            DeploymentHistoryEntry::failed(
                operation,
                &plan.config_hash,
                resources,
                &format!(
                    "{} actions failed, {} skipped",
                    execution_result.failed, execution_result.skipped
                ),
            )
        };
        state.add_history(history_entry);
        if execution_result.success && operation != DeploymentOperation::Destroy {
            state.config_hash.clone_from(&plan.config_hash);
        }

        Ok(execution_result)
    }

    /// Executes a single action.
    async fn execute_action(
        &self,
        index: usize,
        action: &PlannedAction,
        state: &mut DeploymentState,
    ) -> ActionResult {
        info!("Executing action {}: {}", index, action.description());

        let outcome = match action.action_type {
            ActionType::Create | ActionType::Update => self.execute_put(action, state).await,
            ActionType::Delete => self.execute_delete(action, state).await,
        };

        match outcome {
            Ok(cloud_id) => ActionResult {
                index,
                action: action.clone(),
                success: true,
                cloud_id,
                error: None,
            },
            Err(e) => {
                error!("Failed to {} {}: {}", action.action_type, action.resource_name, e);
                if let Some(recorded) = state.resources.get_mut(&action.resource_name) {
                    recorded.set_status(ResourceStatus::Failed);
                }
                ActionResult {
                    index,
                    action: action.clone(),
                    success: false,
                    cloud_id: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Creates or updates a resource and records it.
    async fn execute_put(
        &self,
        action: &PlannedAction,
        state: &mut DeploymentState,
    ) -> Result<Option<String>> {
        let declaration = action.declaration.as_ref().ok_or_else(|| {
            DeployError::internal(format!(
                "Missing declaration for {}",
                action.resource_name
            ))
        })?;
        let hash = action.new_hash.as_deref().unwrap_or_default();

        let request = render(
            declaration,
            &action.address.resource_group,
            &self.stack,
            hash,
            &*state,
        )?;

        let resource = if action.action_type == ActionType::Create {
            self.provider.create(&request).await?
        } else {
            self.provider.update(&request).await?
        };

        let mut recorded = ResourceState::new(&action.resource_name, action.kind, &resource.id, hash);
        recorded.parent.clone_from(&action.address.parent);
        recorded.depends_on = declaration.depends_on();
        if let Some(previous) = state.get_resource(&action.resource_name) {
            recorded.created_at = previous.created_at;
        }
        Self::record_address(&mut recorded, &resource, state);

        info!("{} {} ({})", action.action_type, action.resource_name, resource.id);
        let id = resource.id;
        state.set_resource(recorded);
        Ok(Some(id))
    }

    /// Deletes a resource and forgets it. A resource that is already gone
    /// counts as deleted.
    async fn execute_delete(
        &self,
        action: &PlannedAction,
        state: &mut DeploymentState,
    ) -> Result<Option<String>> {
        let cloud_id = state.cloud_id(&action.resource_name).map(String::from);

        match self.provider.delete(&action.address).await {
            Ok(()) => info!("Deleted {}", action.address),
            Err(e) if e.is_not_found() => {
                debug!("{} was already deleted", action.address);
            }
            Err(e) => return Err(e),
        }

        state.remove_resource(&action.resource_name);
        if action.kind == ResourceKind::PublicIpAddress {
            state.outputs.public_ip_address = None;
        }
        Ok(cloud_id)
    }

    /// Records the allocated address of a public IP and exports it.
    fn record_address(
        recorded: &mut ResourceState,
        resource: &ProvisionedResource,
        state: &mut DeploymentState,
    ) {
        if recorded.kind != ResourceKind::PublicIpAddress {
            return;
        }
        recorded.ip_address = resource.ip_address();
        state.outputs.public_ip_address = recorded.ip_address;
        match recorded.ip_address {
            Some(ip) => info!("Public IP {} allocated: {}", recorded.name, ip),
            None => warn!("Public IP {} has no address yet", recorded.name),
        }
    }
}

impl ExecutionResult {
    /// Returns the errors of failed and skipped actions.
    #[must_use]
    pub fn errors(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|r| !r.success)
            .filter_map(|r| {
                r.error
                    .as_ref()
                    .map(|e| format!("{}: {e}", r.action.resource_name))
            })
            .collect()
    }
}

impl std::fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Executed {} actions: {} successful, {} failed, {} skipped",
            self.total_executed, self.successful, self.failed, self.skipped
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{CloudOperation, InMemoryCloud, ObservedResources};
    use crate::graph::{ResourceDeclaration, ResourceGraph, ResourceRef, ResourceSpec};
    use crate::planner::DiffEngine;

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
            .insert(ResourceDeclaration::new(
                "pip",
                "northcentralus",
                ResourceSpec::PublicIpAddress {
                    allocation: crate::config::IpAllocation::Static,
                    sku: crate::config::PublicIpSku::Standard,
                },
            ))
            .expect("pip");
        graph
    }

    fn plan(graph: &ResourceGraph, state: &DeploymentState) -> DeploymentPlan {
        let diff = DiffEngine::new()
            .compute_diff(graph, Some(state), &ObservedResources::new())
            .expect("diff");
        DeploymentPlan::from_diff(&diff, graph, Some(state), "rg", None, "config")
    }

    #[tokio::test]
    async fn test_execute_records_state() {
        let cloud = InMemoryCloud::new();
        let graph = graph();
        let mut state = DeploymentState::new("dcs", "prod", "rg");

        let result = PlanExecutor::new(&cloud, "dcs-prod")
            .execute(&plan(&graph, &state), &mut state)
            .await
            .expect("execute");

        assert!(result.success);
        assert_eq!(result.successful, 3);
        assert_eq!(state.resources.len(), 3);
        assert_eq!(state.config_hash, "config");
        assert_eq!(
            state.get_resource("subnet").map(|r| r.depends_on.clone()),
            Some(vec![String::from("vnet")])
        );

        let pip = cloud.resource("pip").expect("provisioned");
        assert_eq!(state.outputs.public_ip_address, pip.ip_address());
        assert!(state.outputs.public_ip_address.is_some());
        assert_eq!(state.history.last().map(|h| h.operation), Some(DeploymentOperation::Create));
    }

    #[tokio::test]
    async fn test_failure_skips_dependents() {
        let cloud = InMemoryCloud::new();
        cloud.fail_next("vnet", 1);
        let graph = graph();
        let mut state = DeploymentState::new("dcs", "prod", "rg");

        let result = PlanExecutor::new(&cloud, "dcs-prod")
            .with_continue_on_error(true)
            .execute(&plan(&graph, &state), &mut state)
            .await
            .expect("execute");

        assert!(!result.success);
        assert_eq!(result.failed, 1);
        assert_eq!(result.skipped, 1);
        assert_eq!(result.successful, 1);
        assert!(state.get_resource("pip").is_some());
        assert!(state.get_resource("subnet").is_none());
        assert_eq!(result.errors().len(), 2);
        assert!(state.history.last().is_some_and(|h| !h.success));
        assert!(state.config_hash.is_empty());
    }

    #[tokio::test]
    async fn test_stops_at_first_failure() {
        let cloud = InMemoryCloud::new();
        cloud.fail_next("vnet", 1);
        let graph = graph();
        let mut state = DeploymentState::new("dcs", "prod", "rg");

        let result = PlanExecutor::new(&cloud, "dcs-prod")
            .execute(&plan(&graph, &state), &mut state)
            .await
            .expect("execute");

        assert_eq!(result.total_executed, 1);
        assert_eq!(cloud.count(CloudOperation::Create), 1);
    }

    #[tokio::test]
    async fn test_destroy_tolerates_missing_resources() {
        let cloud = InMemoryCloud::new();
        let graph = graph();
        let mut state = DeploymentState::new("dcs", "prod", "rg");
        let executor = PlanExecutor::new(&cloud, "dcs-prod");
        executor
            .execute(&plan(&graph, &state), &mut state)
            .await
            .expect("apply");

        cloud.remove_out_of_band("pip");

        let result = executor
            .execute(&DeploymentPlan::destroy(&state, None, false), &mut state)
            .await
            .expect("destroy");

        assert!(result.success);
        assert!(state.resources.is_empty());
        assert!(state.outputs.public_ip_address.is_none());
        assert_eq!(cloud.resource_count(), 0);
        assert_eq!(state.history.last().map(|h| h.operation), Some(DeploymentOperation::Destroy));
    }

    #[tokio::test]
    async fn test_guardrail_violation_aborts() {
        let cloud = InMemoryCloud::new();
        let mut state = DeploymentState::new("dcs", "prod", "rg");
        state.set_resource(ResourceState::new("vnet", ResourceKind::VirtualNetwork, "id", "h"));
        let guardrails = crate::config::GuardrailsConfig {
            prevent_destroy: vec![String::from("vnet")],
            max_actions: None,
        };

        let err = PlanExecutor::new(&cloud, "dcs-prod")
            .execute(&DeploymentPlan::destroy(&state, Some(&guardrails), false), &mut state)
            .await
            .expect_err("blocked");

        assert!(matches!(err, DeployError::Reconcile(ReconcileError::Aborted { .. })));
        assert_eq!(cloud.mutation_count(), 0);
    }
}
