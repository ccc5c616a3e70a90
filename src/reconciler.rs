//! Reconciler for maintaining desired state.
//!
//! This module implements the core reconciliation loop: resolve the stack's
//! inputs, build the resource graph, observe the cloud, diff, plan and
//! execute, retrying partial failures a bounded number of times.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::cloud::{CloudProvider, ProvisionedResource, ResourceAddress, StackObserver};
use crate::config::{ConfigHasher, DeployConfig};
use crate::error::{DeployError, ReconcileError, Result, StateError};
use crate::graph::{
    GraphBuilder, InputResolver, ResourceGraph, ResourceKind, schedule_is_placeable,
    shutdown_schedule_name, shutdown_start,
};
use crate::planner::{
    ActionType, DeploymentPlan, DiffEngine, DiffResult, DiffType, ExecutionResult, PlanExecutor,
};
use crate::secrets::SecretStore;
use crate::state::{DeploymentState, LOCK_REFRESH_SECS, StackOutputs, StateStore};

/// Default number of apply attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Pause between apply attempts.
const RETRY_DELAY: Duration = Duration::from_secs(2);

/// Reconciler for maintaining desired state.
pub struct Reconciler<'a, S: StateStore> {
    /// Configuration.
    config: &'a DeployConfig,
    /// State store.
    state_store: &'a S,
    /// Cloud provider.
    provider: &'a dyn CloudProvider,
    /// Secret store.
    secrets: &'a dyn SecretStore,
    /// Configuration hasher.
    hasher: ConfigHasher,
    /// Diff engine.
    diff_engine: DiffEngine,
    /// Maximum reconciliation attempts.
    max_attempts: u32,
    /// Pause between attempts.
    retry_delay: Duration,
    /// Whether independent actions keep running after a failure.
    continue_on_error: bool,
    /// How often the held state lock is extended.
    lock_refresh: Duration,
}

/// Result of a reconciliation run.
#[derive(Debug, Serialize)]
pub struct ReconciliationResult {
    /// Whether reconciliation succeeded.
    pub success: bool,
    /// Number of resources created.
    pub created: usize,
    /// Number of resources updated.
    pub updated: usize,
    /// Number of resources deleted.
    pub deleted: usize,
    /// Number of resources unchanged.
    pub unchanged: usize,
    /// Attempts made.
    pub attempts: u32,
    /// Errors encountered.
    pub errors: Vec<String>,
    /// Exported values after the run.
    pub outputs: StackOutputs,
    /// Final state after reconciliation.
    #[serde(skip)]
    pub final_state: Option<DeploymentState>,
}

/// A computed but not executed plan.
#[derive(Debug)]
pub struct PlanPreview {
    /// Per-resource diff.
    pub diff: DiffResult,
    /// Actions an apply would take.
    pub plan: DeploymentPlan,
}

impl<'a, S: StateStore> Reconciler<'a, S> {
    /// Creates a new reconciler.
    #[must_use]
    pub fn new(
        config: &'a DeployConfig,
        state_store: &'a S,
        provider: &'a dyn CloudProvider,
        secrets: &'a dyn SecretStore,
    ) -> Self {
        Self {
            config,
            state_store,
            provider,
            secrets,
            hasher: ConfigHasher::new(),
            diff_engine: DiffEngine::new(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: RETRY_DELAY,
            continue_on_error: false,
            lock_refresh: Duration::from_secs(LOCK_REFRESH_SECS),
        }
    }

    /// Sets the maximum reconciliation attempts.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = if max_attempts == 0 { 1 } else { max_attempts };
        self
    }

    /// Sets the pause between attempts.
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Sets whether independent actions keep running after a failure.
    #[must_use]
    pub const fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    /// Sets how often the held state lock is extended.
    #[must_use]
    pub const fn with_lock_refresh(mut self, interval: Duration) -> Self {
        self.lock_refresh = interval;
        self
    }

    fn resource_group(&self) -> &str {
        &self.config.project.resource_group
    }

    /// Runs `work` while holding the state lock for `operation`.
    ///
    /// The lock is extended every `lock_refresh` for as long as `work` runs.
    /// If another process takes the lock over, `work` is dropped and
    /// [`StateError::LockLost`] is returned.
    async fn with_lock<T>(
        &self,
        operation: &str,
        work: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let lock = self.state_store.acquire_lock("", operation).await?;
        let mut work = std::pin::pin!(work);

        let outcome = loop {
            tokio::select! {
                outcome = &mut work => break outcome,
                () = tokio::time::sleep(self.lock_refresh) => {
                    match self.state_store.refresh_lock(&lock.lock_id).await {
                        Ok(refreshed) => debug!(
                            "State lock extended until {}",
                            refreshed.expires_at.to_rfc3339()
                        ),
                        Err(err @ DeployError::State(StateError::LockLost { .. })) => {
                            error!("Stopping {}: {}", operation, err);
                            break Err(err);
                        }
                        Err(e) => warn!("Failed to extend state lock: {}", e),
                    }
                }
            }
        };

        if let Err(e) = self.state_store.release_lock(&lock.lock_id).await {
            warn!("Failed to release state lock: {}", e);
        }
        outcome
    }

    /// Resolves the stack's inputs and builds its graph.
    ///
    /// Nothing is declared unless every lookup succeeded. Returns the graph
    /// with the shutdown anchor it was built from.
    async fn build_graph(
        &self,
        state: &DeploymentState,
    ) -> Result<(ResourceGraph, DateTime<Utc>)> {
        let resolved = InputResolver::new(self.provider, self.secrets)
            .resolve(self.config)
            .await?;
        let anchor = self.shutdown_anchor(state, Utc::now()).await?;
        let graph = GraphBuilder::new(self.config).build(&resolved, anchor)?;
        Ok((graph, anchor))
    }

    /// Returns the time the shutdown window opens from.
    ///
    /// The recorded window is kept while its schedule is recorded, still lies
    /// ahead, and the VM it targets exists. Otherwise a new window opens at
    /// `now`.
    async fn shutdown_anchor(
        &self,
        state: &DeploymentState,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let shutdown = &self.config.shutdown;
        if !shutdown.enabled {
            return Ok(now);
        }
        let Some(anchor) = state.shutdown_anchor else {
            return Ok(now);
        };

        let vm = self.config.vm.name.as_str();
        if state.get_resource(&shutdown_schedule_name(vm)).is_none() {
            debug!("Shutdown schedule not recorded, opening a new window");
            return Ok(now);
        }
        if !schedule_is_placeable(shutdown_start(anchor, shutdown.after_hours), now) {
            info!(
                "Shutdown window opened at {} has lapsed, opening a new one",
                anchor.to_rfc3339()
            );
            return Ok(now);
        }

        let address = ResourceAddress::new(self.resource_group(), ResourceKind::VirtualMachine, vm);
        if self.provider.read(&address).await?.is_none() {
            info!("VM {} is gone, opening a new shutdown window", vm);
            return Ok(now);
        }

        Ok(anchor)
    }

    /// Computes the plan an apply would execute, without changing anything.
    ///
    /// # Errors
    ///
    /// Returns an error if the inputs cannot be resolved or the cloud cannot
    /// be observed.
    pub async fn plan(&self) -> Result<PlanPreview> {
        let state = self.state_store.load_for(&self.config.project).await?;
        let (graph, _) = self.build_graph(&state).await?;
        let observed = StackObserver::new(self.provider, self.resource_group())
            .observe(&graph, Some(&state))
            .await?;

        let diff = self.diff_engine.compute_diff(&graph, Some(&state), &observed)?;
        let plan = DeploymentPlan::from_diff(
            &diff,
            &graph,
            Some(&state),
            self.resource_group(),
            self.config.guardrails.as_ref(),
            &self.hasher.hash_config(self.config)?,
        );

        Ok(PlanPreview { diff, plan })
    }

    /// Performs a full reconciliation.
    ///
    /// # Errors
    ///
    /// Returns an error if the state is locked, an input cannot be resolved,
    /// the plan violates guardrails, or the last attempt failed outright.
    pub async fn reconcile(&self) -> Result<ReconciliationResult> {
        info!(
            "Starting reconciliation for {} on {}",
            self.config.stack_name(),
            self.provider.provider_name()
        );

        self.with_lock("apply", self.reconcile_locked()).await
    }

    async fn reconcile_locked(&self) -> Result<ReconciliationResult> {
        let config_hash = self.hasher.hash_config(self.config)?;
        let mut state = self.state_store.load_for(&self.config.project).await?;

        let (graph, shutdown_anchor) = self.build_graph(&state).await?;
        let first_deployed = state.anchor_or_init(Utc::now());
        debug!("Stack first deployed {}", first_deployed.to_rfc3339());
        state.shutdown_anchor = self.config.shutdown.enabled.then_some(shutdown_anchor);

        let mut result = ReconciliationResult {
            success: false,
            created: 0,
            updated: 0,
            deleted: 0,
            unchanged: 0,
            attempts: 0,
            errors: vec![],
            outputs: StackOutputs::default(),
            final_state: None,
        };
        let mut last_error = None;

        for attempt in 1..=self.max_attempts {
            debug!("Reconciliation attempt {}/{}", attempt, self.max_attempts);
            result.attempts = attempt;

            match self
                .reconcile_once(&graph, &mut state, &config_hash, &mut result)
                .await
            {
                Ok(true) => {
                    if !result.errors.is_empty() {
                        debug!(
                            "Converged after {} errors in earlier attempts",
                            result.errors.len()
                        );
                        result.errors.clear();
                    }
                    result.success = true;
                    last_error = None;
                    break;
                }
                Ok(false) => {
                    warn!("Reconciliation partially succeeded");
                    last_error = None;
                }
                Err(err @ DeployError::Reconcile(ReconcileError::Aborted { .. })) => {
                    last_error = Some(err);
                    break;
                }
                Err(err) => {
                    error!("Reconciliation attempt {} failed: {}", attempt, err);
                    result.errors.push(format!("Attempt {attempt}: {err}"));
                    last_error = Some(err);
                }
            }

            if attempt < self.max_attempts {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        if let Err(e) = self.state_store.save(&state).await {
            error!("Failed to save state: {}", e);
            result.errors.push(format!("Failed to save state: {e}"));
        }

        result.outputs = state.outputs.clone();
        result.final_state = Some(state);

        if !result.success
            && let Some(err) = last_error
        {
            return Err(err);
        }

        Ok(result)
    }

    /// Performs a single attempt. Returns whether the stack converged.
    async fn reconcile_once(
        &self,
        graph: &ResourceGraph,
        state: &mut DeploymentState,
        config_hash: &str,
        result: &mut ReconciliationResult,
    ) -> Result<bool> {
        let observed = StackObserver::new(self.provider, self.resource_group())
            .observe(graph, Some(state))
            .await?;

        let foreign = observed.foreign(&self.config.stack_name());
        if !foreign.is_empty() {
            return Err(DeployError::Reconcile(ReconcileError::Aborted {
                reason: format!(
                    "resources managed by another stack: {}",
                    foreign.join(", ")
                ),
            }));
        }

        let public_ip = graph
            .declarations()
            .find(|d| d.kind() == ResourceKind::PublicIpAddress)
            .map(|d| d.name.clone());
        if let Some(name) = &public_ip
            && let Some(resource) = observed.get(name)
        {
            Self::record_public_ip(state, name, resource);
        }

        let diff = self.diff_engine.compute_diff(graph, Some(state), &observed)?;
        info!(
            "Diff: {} creates, {} updates, {} deletes, {} unchanged",
            diff.creates, diff.updates, diff.deletes, diff.unchanged
        );
        result.unchanged = diff.unchanged;

        if !diff.has_changes() {
            info!("No changes required, state is converged");
            state.config_hash = config_hash.to_string();
            return Ok(true);
        }

        let plan = DeploymentPlan::from_diff(
            &diff,
            graph,
            Some(state),
            self.resource_group(),
            self.config.guardrails.as_ref(),
            config_hash,
        );

        if !plan.passes_guardrails {
            return Err(DeployError::Reconcile(ReconcileError::Aborted {
                reason: format!(
                    "Plan violates guardrails: {}",
                    plan.guardrail_violations.join(", ")
                ),
            }));
        }

        let execution = PlanExecutor::new(self.provider, &self.config.stack_name())
            .with_continue_on_error(self.continue_on_error)
            .execute(&plan, state)
            .await?;

        Self::tally(&execution, result);
        if !execution.success {
            result.errors.extend(execution.errors());
        }

        // Dynamic addresses appear only once the VM is running.
        if state.outputs.public_ip_address.is_none()
            && let Some(name) = &public_ip
            && let Some(address) = state.address_of(name)
        {
            match self.provider.read(&address).await {
                Ok(Some(resource)) => Self::record_public_ip(state, name, &resource),
                Ok(None) => {}
                Err(e) => warn!("Failed to read public IP {}: {}", name, e),
            }
        }

        Ok(execution.success)
    }

    /// Records the address a recorded public IP currently holds.
    fn record_public_ip(state: &mut DeploymentState, name: &str, resource: &ProvisionedResource) {
        let Some(ip) = resource.ip_address() else {
            return;
        };
        let Some(recorded) = state.resources.get_mut(name) else {
            return;
        };
        recorded.ip_address = Some(ip);
        if state.outputs.public_ip_address != Some(ip) {
            info!("Public IP {} is {}", name, ip);
            state.outputs.public_ip_address = Some(ip);
        }
    }

    fn tally(execution: &ExecutionResult, result: &mut ReconciliationResult) {
        for action in execution.results.iter().filter(|r| r.success) {
            match action.action.action_type {
                ActionType::Create => result.created += 1,
                ActionType::Update => result.updated += 1,
                ActionType::Delete => result.deleted += 1,
            }
        }
    }

    /// Checks for drift without applying changes.
    ///
    /// # Errors
    ///
    /// Returns an error if the inputs cannot be resolved or the cloud cannot
    /// be observed.
    pub async fn check_drift(&self) -> Result<DriftReport> {
        info!("Checking for drift in {}", self.config.stack_name());

        let state = self.state_store.load_for(&self.config.project).await?;
        let (graph, _) = self.build_graph(&state).await?;
        let observed = StackObserver::new(self.provider, self.resource_group())
            .observe(&graph, Some(&state))
            .await?;

        let diff = self.diff_engine.compute_diff(&graph, Some(&state), &observed)?;

        let drifted_resources: Vec<DriftedResource> = diff
            .actionable_diffs()
            .into_iter()
            .map(|d| DriftedResource {
                name: d.name.clone(),
                kind: d.kind,
                change: d.diff_type,
            })
            .collect();

        Ok(DriftReport {
            has_drift: diff.has_changes(),
            drifted_resources,
            foreign: observed.foreign(&self.config.stack_name()),
            total_resources: graph.len(),
            observed_count: observed.len(),
        })
    }

    /// Deletes every recorded resource, dependents first.
    ///
    /// With `force`, `prevent_destroy` is ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the state is locked or the plan violates
    /// guardrails.
    pub async fn destroy(&self, force: bool) -> Result<ReconciliationResult> {
        info!("Destroying {}", self.config.stack_name());

        self.with_lock("destroy", self.destroy_locked(force)).await
    }

    async fn destroy_locked(&self, force: bool) -> Result<ReconciliationResult> {
        let mut state = self.state_store.load_for(&self.config.project).await?;
        let plan = DeploymentPlan::destroy(&state, self.config.guardrails.as_ref(), force);

        if !plan.passes_guardrails {
            return Err(DeployError::Reconcile(ReconcileError::Aborted {
                reason: format!(
                    "Plan violates guardrails: {}",
                    plan.guardrail_violations.join(", ")
                ),
            }));
        }

        let execution = PlanExecutor::new(self.provider, &self.config.stack_name())
            .with_continue_on_error(true)
            .execute(&plan, &mut state)
            .await?;

        let mut result = ReconciliationResult {
            success: execution.success,
            created: 0,
            updated: 0,
            deleted: 0,
            unchanged: 0,
            attempts: 1,
            errors: if execution.success { vec![] } else { execution.errors() },
            outputs: StackOutputs::default(),
            final_state: None,
        };
        Self::tally(&execution, &mut result);

        if state.resources.is_empty() {
            // The next apply starts a new stack lifetime.
            state.anchor = None;
            state.shutdown_anchor = None;
            state.config_hash.clear();
        }
        self.state_store.save(&state).await?;

        result.outputs = state.outputs.clone();
        result.final_state = Some(state);
        Ok(result)
    }

    /// Returns the stack's exported values.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be loaded.
    pub async fn outputs(&self) -> Result<StackOutputs> {
        Ok(self.state_store.load_for(&self.config.project).await?.outputs)
    }
}

/// Report of drift detection.
#[derive(Debug, Serialize)]
pub struct DriftReport {
    /// Whether drift was detected.
    pub has_drift: bool,
    /// Resources that have drifted.
    pub drifted_resources: Vec<DriftedResource>,
    /// Declared names held by resources another stack manages.
    pub foreign: Vec<String>,
    /// Total number of declared resources.
    pub total_resources: usize,
    /// Number of resources that exist in the cloud.
    pub observed_count: usize,
}

/// A resource whose cloud state differs from its declaration.
#[derive(Debug, Serialize)]
pub struct DriftedResource {
    /// Resource name.
    pub name: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// What an apply would do.
    pub change: DiffType,
}

impl DriftReport {
    /// Returns true if the state is converged (no drift).
    #[must_use]
    pub const fn is_converged(&self) -> bool {
        !self.has_drift
    }
}

impl std::fmt::Display for DriftReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.has_drift {
            writeln!(f, "Drift detected:")?;
            for resource in &self.drifted_resources {
                writeln!(f, "  - {} {} ({})", resource.kind, resource.name, resource.change)?;
            }
        } else {
            write!(f, "No drift detected - state is converged")?;
        }
        if !self.foreign.is_empty() {
            writeln!(f)?;
            write!(f, "Managed by another stack: {}", self.foreign.join(", "))?;
        }
        Ok(())
    }
}

impl std::fmt::Display for ReconciliationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = if self.success { "successful" } else { "failed" };
        writeln!(f, "Reconciliation {status}:")?;
        writeln!(f, "  Created: {}", self.created)?;
        writeln!(f, "  Updated: {}", self.updated)?;
        writeln!(f, "  Deleted: {}", self.deleted)?;
        writeln!(f, "  Unchanged: {}", self.unchanged)?;

        if let Some(ip) = self.outputs.public_ip_address {
            writeln!(f, "  Public IP: {ip}")?;
        }

        if !self.errors.is_empty() {
            writeln!(f, "  Errors:")?;
            for error in &self.errors {
                writeln!(f, "    - {error}")?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{CloudOperation, HASH_TAG, InMemoryCloud, STACK_TAG, Snapshot};
    use crate::config::{ConfigParser, GuardrailsConfig, IpAllocation};
    use crate::error::CloudError;
    use crate::secrets::StaticSecretStore;
    use crate::state::{LOCK_EXPIRY_SECS, LocalStateStore, LockInfo};
    use tempfile::TempDir;

    const TEMPLATE: &str = include_str!("../templates/dcs.deploy.yaml");
    const RG: &str = "DcsMultiplayerServer";

    fn config() -> DeployConfig {
        ConfigParser::new()
            .parse_yaml(TEMPLATE, None)
            .expect("template parses")
    }

    fn snapshot(name: &str, size_gb: u32) -> Snapshot {
        Snapshot {
            id: format!("/subscriptions/sub/resourceGroups/{RG}/providers/Microsoft.Compute/snapshots/{name}"),
            name: name.to_string(),
            location: String::from("northcentralus"),
            size_gb,
        }
    }

    fn cloud() -> InMemoryCloud {
        InMemoryCloud::new()
            .with_snapshot(RG, snapshot("dcsOsHdd", 256))
            .with_snapshot(RG, snapshot("dcsDcsHdd", 1024))
    }

    fn secrets() -> StaticSecretStore {
        StaticSecretStore::new().with("DCS_ADMIN_PASSWORD", "s3cret!")
    }

    fn store() -> (LocalStateStore, TempDir) {
        let dir = TempDir::new().expect("temp dir");
        (LocalStateStore::with_base_dir(dir.path()), dir)
    }

    fn with_shutdown(mut config: DeployConfig) -> DeployConfig {
        config.shutdown.enabled = true;
        config.shutdown.runbook_uri = Some(String::from(
            "https://example.blob.core.windows.net/scripts/deleteVm.ps1",
        ));
        config
    }

    fn schedule_start(cloud: &InMemoryCloud) -> DateTime<Utc> {
        let schedule = cloud.resource("dcs-server-vm-shutdown").expect("schedule exists");
        let start = schedule.properties["startTime"].as_str().expect("start time");
        DateTime::parse_from_rfc3339(start)
            .expect("rfc3339 start time")
            .with_timezone(&Utc)
    }

    fn reconciler<'a>(
        config: &'a DeployConfig,
        store: &'a LocalStateStore,
        cloud: &'a InMemoryCloud,
        secrets: &'a StaticSecretStore,
    ) -> Reconciler<'a, LocalStateStore> {
        Reconciler::new(config, store, cloud, secrets).with_retry_delay(Duration::ZERO)
    }

    #[tokio::test]
    async fn test_apply_provisions_stack_and_exports_ip() {
        let (config, cloud, secrets) = (config(), cloud(), secrets());
        let (store, _dir) = store();

        let result = reconciler(&config, &store, &cloud, &secrets)
            .reconcile()
            .await
            .expect("apply");

        assert!(result.success);
        assert_eq!(result.created, 9);
        assert_eq!(cloud.resource_count(), 9);

        let pip = cloud.resource("dcs-server-public-ip").expect("public ip");
        assert!(pip.ip_address().is_some());
        assert_eq!(result.outputs.public_ip_address, pip.ip_address());

        let saved = store.load().await.expect("load").expect("saved");
        assert_eq!(saved.outputs.public_ip_address, pip.ip_address());
        assert!(saved.anchor.is_some());
        assert!(!store.is_locked().await.expect("lock state"));
    }

    #[tokio::test]
    async fn test_second_apply_is_a_no_op() {
        let (config, cloud, secrets) = (config(), cloud(), secrets());
        let (store, _dir) = store();
        let reconciler = reconciler(&config, &store, &cloud, &secrets);

        reconciler.reconcile().await.expect("first apply");
        cloud.clear_calls();

        let result = reconciler.reconcile().await.expect("second apply");

        assert!(result.success);
        assert_eq!(result.created + result.updated + result.deleted, 0);
        assert_eq!(result.unchanged, 9);
        assert_eq!(cloud.mutation_count(), 0);

        let preview = reconciler.plan().await.expect("plan");
        assert!(preview.plan.is_empty());
    }

    #[tokio::test]
    async fn test_missing_snapshot_creates_nothing() {
        let (config, secrets) = (config(), secrets());
        let cloud = InMemoryCloud::new().with_snapshot(RG, snapshot("dcsOsHdd", 256));
        let (store, _dir) = store();

        let err = reconciler(&config, &store, &cloud, &secrets)
            .reconcile()
            .await
            .expect_err("snapshot missing");

        assert!(matches!(err, DeployError::Cloud(CloudError::SnapshotNotFound { .. })));
        assert_eq!(cloud.mutation_count(), 0);
        assert_eq!(cloud.count(CloudOperation::Read), 0);
        assert!(!store.exists().await.expect("exists"));
        assert!(!store.is_locked().await.expect("lock state"));
    }

    #[tokio::test]
    async fn test_missing_secret_creates_nothing() {
        let (config, cloud) = (config(), cloud());
        let secrets = StaticSecretStore::new();
        let (store, _dir) = store();

        assert!(
            reconciler(&config, &store, &cloud, &secrets)
                .reconcile()
                .await
                .is_err()
        );
        assert_eq!(cloud.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let (config, cloud, secrets) = (config(), cloud(), secrets());
        let (store, _dir) = store();
        cloud.fail_next("dcs-server-nic", 1);

        let result = reconciler(&config, &store, &cloud, &secrets)
            .reconcile()
            .await
            .expect("apply converges");

        assert!(result.success);
        assert_eq!(result.attempts, 2);
        assert!(result.errors.is_empty());
        assert!(!result.to_string().contains("Errors"));
        assert_eq!(cloud.resource_count(), 9);
    }

    #[tokio::test]
    async fn test_persistent_failure_reports_errors() {
        let (config, cloud, secrets) = (config(), cloud(), secrets());
        let (store, _dir) = store();
        cloud.fail_next("dcs-server-vm", 5);

        let result = reconciler(&config, &store, &cloud, &secrets)
            .with_max_attempts(2)
            .with_continue_on_error(true)
            .reconcile()
            .await
            .expect("partial apply is reported, not raised");

        assert!(!result.success);
        assert_eq!(result.attempts, 2);
        assert!(cloud.resource("dcs-server-vm").is_none());
        assert!(cloud.resource("startup-script").is_none());
        assert!(result.errors.iter().any(|e| e.contains("dcs-server-vm")));

        let saved = store.load().await.expect("load").expect("progress saved");
        assert!(saved.get_resource("dcs-server-nic").is_some());
    }

    #[tokio::test]
    async fn test_drift_is_detected_and_repaired() {
        let (config, cloud, secrets) = (config(), cloud(), secrets());
        let (store, _dir) = store();
        let reconciler = reconciler(&config, &store, &cloud, &secrets);
        reconciler.reconcile().await.expect("apply");

        cloud.set_tag_out_of_band("dcs-server-nsg", HASH_TAG, "edited");
        cloud.remove_out_of_band("dcs-server-public-ip");

        let report = reconciler.check_drift().await.expect("drift");
        assert!(report.has_drift);
        let drifted: Vec<_> = report
            .drifted_resources
            .iter()
            .map(|d| (d.name.as_str(), d.change))
            .collect();
        assert!(drifted.contains(&("dcs-server-nsg", DiffType::Drift)));
        assert!(drifted.contains(&("dcs-server-public-ip", DiffType::Create)));

        reconciler.reconcile().await.expect("repair");
        assert!(reconciler.check_drift().await.expect("drift").is_converged());
    }

    #[tokio::test]
    async fn test_foreign_resource_blocks_apply() {
        let (config, cloud, secrets) = (config(), cloud(), secrets());
        let (store, _dir) = store();
        let reconciler = reconciler(&config, &store, &cloud, &secrets);
        reconciler.reconcile().await.expect("apply");

        cloud.set_tag_out_of_band("dcs-server-vnet", STACK_TAG, "other-prod");
        cloud.clear_calls();

        let report = reconciler.check_drift().await.expect("drift");
        assert_eq!(report.foreign, vec![String::from("dcs-server-vnet")]);

        let err = reconciler.reconcile().await.expect_err("foreign");
        assert!(matches!(err, DeployError::Reconcile(ReconcileError::Aborted { .. })));
        assert_eq!(cloud.mutation_count(), 0);
        assert!(!store.is_locked().await.expect("lock state"));
    }

    #[tokio::test]
    async fn test_changed_rule_updates_in_place() {
        let (mut config, cloud, secrets) = (config(), cloud(), secrets());
        let (store, _dir) = store();
        reconciler(&config, &store, &cloud, &secrets)
            .reconcile()
            .await
            .expect("apply");
        cloud.clear_calls();

        config.network.security_group.rules.retain(|r| r.name != "rdp-in");
        let result = reconciler(&config, &store, &cloud, &secrets)
            .reconcile()
            .await
            .expect("update");

        assert_eq!(result.updated, 1);
        assert_eq!(cloud.count(CloudOperation::Update), 1);
        assert_eq!(cloud.count(CloudOperation::Create), 0);
        assert_eq!(cloud.count(CloudOperation::Delete), 0);
    }

    #[tokio::test]
    async fn test_destroy_respects_guardrails() {
        let (mut config, cloud, secrets) = (config(), cloud(), secrets());
        let (store, _dir) = store();
        config.guardrails = Some(GuardrailsConfig {
            prevent_destroy: vec![String::from("dcsManagedDisk")],
            max_actions: None,
        });
        let reconciler = reconciler(&config, &store, &cloud, &secrets);
        reconciler.reconcile().await.expect("apply");

        assert!(reconciler.destroy(false).await.is_err());
        assert_eq!(cloud.count(CloudOperation::Delete), 0);

        let result = reconciler.destroy(true).await.expect("forced destroy");
        assert!(result.success);
        assert_eq!(result.deleted, 9);
        assert_eq!(cloud.resource_count(), 0);

        let saved = store.load().await.expect("load").expect("saved");
        assert!(saved.resources.is_empty());
        assert!(saved.anchor.is_none());
        assert!(reconciler.outputs().await.expect("outputs").public_ip_address.is_none());
    }

    #[tokio::test]
    async fn test_locked_state_blocks_apply() {
        let (config, cloud, secrets) = (config(), cloud(), secrets());
        let (store, _dir) = store();
        store.acquire_lock("someone-else", "apply").await.expect("lock");

        let err = reconciler(&config, &store, &cloud, &secrets)
            .reconcile()
            .await
            .expect_err("locked");

        assert!(matches!(
            err,
            DeployError::State(crate::error::StateError::LockedByOther { .. })
        ));
        assert_eq!(cloud.calls().len(), 0);
    }

    #[tokio::test]
    async fn test_enabling_shutdown_on_old_stack_schedules_ahead() {
        let (config, cloud, secrets) = (config(), cloud(), secrets());
        let (store, _dir) = store();
        reconciler(&config, &store, &cloud, &secrets)
            .reconcile()
            .await
            .expect("apply");

        let mut state = store.load().await.expect("load").expect("saved");
        state.anchor = Some(Utc::now() - chrono::Duration::hours(8));
        store.save(&state).await.expect("save");

        let config = with_shutdown(config);
        let before = Utc::now();
        let result = reconciler(&config, &store, &cloud, &secrets)
            .reconcile()
            .await
            .expect("shutdown added");

        assert!(result.success);
        assert_eq!(result.created, 4);
        assert!(schedule_start(&cloud) >= before + chrono::Duration::hours(6));

        cloud.clear_calls();
        reconciler(&config, &store, &cloud, &secrets)
            .reconcile()
            .await
            .expect("reapply");
        assert_eq!(cloud.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_lapsed_shutdown_window_is_reopened() {
        let (config, cloud, secrets) = (with_shutdown(config()), cloud(), secrets());
        let (store, _dir) = store();
        let reconciler = reconciler(&config, &store, &cloud, &secrets);
        reconciler.reconcile().await.expect("apply");
        assert_eq!(cloud.resource_count(), 13);

        let mut state = store.load().await.expect("load").expect("saved");
        state.shutdown_anchor = Some(Utc::now() - chrono::Duration::hours(8));
        store.save(&state).await.expect("save");

        assert!(reconciler.plan().await.is_ok());

        cloud.clear_calls();
        let before = Utc::now();
        let result = reconciler.reconcile().await.expect("window reopened");

        assert!(result.success);
        assert_eq!(result.updated, 1);
        assert_eq!(cloud.count(CloudOperation::Create), 0);
        assert!(schedule_start(&cloud) >= before + chrono::Duration::hours(6));

        let saved = store.load().await.expect("load").expect("saved");
        assert!(saved.shutdown_anchor.is_some_and(|a| a >= before));
    }

    #[tokio::test]
    async fn test_recreated_vm_gets_a_fresh_shutdown_window() {
        let (config, cloud, secrets) = (with_shutdown(config()), cloud(), secrets());
        let (store, _dir) = store();
        let reconciler = reconciler(&config, &store, &cloud, &secrets);
        reconciler.reconcile().await.expect("apply");

        let first_start = schedule_start(&cloud);

        cloud.clear_calls();
        reconciler.reconcile().await.expect("still converged");
        assert_eq!(cloud.mutation_count(), 0);
        assert_eq!(schedule_start(&cloud), first_start);

        cloud.remove_out_of_band("dcs-server-vm");
        let before = Utc::now();
        let result = reconciler.reconcile().await.expect("vm recreated");

        assert!(result.success);
        assert!(cloud.resource("dcs-server-vm").is_some());
        assert!(schedule_start(&cloud) > first_start);
        assert!(schedule_start(&cloud) >= before + chrono::Duration::hours(6));
    }

    #[tokio::test]
    async fn test_dynamic_ip_is_exported_once_assigned() {
        let (mut config, secrets) = (config(), secrets());
        config.network.public_ip.allocation = IpAllocation::Dynamic;
        let cloud = cloud().with_deferred_public_ips();
        let (store, _dir) = store();

        let result = reconciler(&config, &store, &cloud, &secrets)
            .reconcile()
            .await
            .expect("apply");

        let ip = cloud
            .resource("dcs-server-public-ip")
            .and_then(|pip| pip.ip_address());
        assert!(ip.is_some());
        assert_eq!(result.outputs.public_ip_address, ip);

        let saved = store.load().await.expect("load").expect("saved");
        assert_eq!(saved.outputs.public_ip_address, ip);
        assert_eq!(
            saved.get_resource("dcs-server-public-ip").and_then(|r| r.ip_address),
            ip
        );
    }

    #[tokio::test]
    async fn test_missing_ip_output_is_filled_on_next_apply() {
        let (config, cloud, secrets) = (config(), cloud(), secrets());
        let (store, _dir) = store();
        let reconciler = reconciler(&config, &store, &cloud, &secrets);
        reconciler.reconcile().await.expect("apply");

        let mut state = store.load().await.expect("load").expect("saved");
        state.outputs.public_ip_address = None;
        if let Some(pip) = state.resources.get_mut("dcs-server-public-ip") {
            pip.ip_address = None;
        }
        store.save(&state).await.expect("save");

        cloud.clear_calls();
        let result = reconciler.reconcile().await.expect("reapply");

        let ip = cloud
            .resource("dcs-server-public-ip")
            .and_then(|pip| pip.ip_address());
        assert!(ip.is_some());
        assert_eq!(result.outputs.public_ip_address, ip);
        assert_eq!(cloud.mutation_count(), 0);
        assert_eq!(reconciler.outputs().await.expect("outputs").public_ip_address, ip);
    }

    #[tokio::test]
    async fn test_lock_is_extended_while_applying() {
        let (config, secrets) = (config(), secrets());
        let cloud = cloud().with_latency(Duration::from_millis(20));
        let (store, _dir) = store();
        let reconciler = reconciler(&config, &store, &cloud, &secrets)
            .with_lock_refresh(Duration::from_millis(5));

        let extended = async {
            loop {
                tokio::time::sleep(Duration::from_millis(5)).await;
                if let Ok(Some(lock)) = store.get_lock_info().await
                    && lock.expires_at
                        > lock.acquired_at + chrono::Duration::seconds(LOCK_EXPIRY_SECS)
                {
                    return lock;
                }
            }
        };
        let (result, extended) = tokio::join!(
            reconciler.reconcile(),
            tokio::time::timeout(Duration::from_secs(5), extended)
        );

        assert!(result.expect("apply").success);
        assert_eq!(extended.expect("lock extended during apply").operation, "apply");
        assert!(!store.is_locked().await.expect("lock state"));
    }

    /// A store whose lock is taken over as soon as its holder tries to
    /// extend it.
    struct TakenOverStore(LocalStateStore);

    #[async_trait::async_trait]
    impl StateStore for TakenOverStore {
        async fn load(&self) -> Result<Option<DeploymentState>> {
            self.0.load().await
        }

        async fn save(&self, state: &DeploymentState) -> Result<()> {
            self.0.save(state).await
        }

        async fn delete(&self) -> Result<()> {
            self.0.delete().await
        }

        async fn exists(&self) -> Result<bool> {
            self.0.exists().await
        }

        async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
            self.0.acquire_lock(holder, operation).await
        }

        async fn release_lock(&self, lock_id: &str) -> Result<()> {
            self.0.release_lock(lock_id).await
        }

        async fn refresh_lock(&self, lock_id: &str) -> Result<LockInfo> {
            Err(DeployError::State(StateError::LockLost {
                lock_id: lock_id.to_string(),
            }))
        }

        async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
            self.0.get_lock_info().await
        }

        fn backend_type(&self) -> &'static str {
            "taken-over"
        }
    }

    #[tokio::test]
    async fn test_apply_stops_when_lock_is_taken_over() {
        let (config, secrets) = (config(), secrets());
        let cloud = cloud().with_latency(Duration::from_millis(20));
        let (inner, _dir) = store();
        let store = TakenOverStore(inner);

        let err = Reconciler::new(&config, &store, &cloud, &secrets)
            .with_retry_delay(Duration::ZERO)
            .with_lock_refresh(Duration::from_millis(5))
            .reconcile()
            .await
            .expect_err("lock lost");

        assert!(matches!(err, DeployError::State(StateError::LockLost { .. })));
        assert_eq!(cloud.mutation_count(), 0);
        assert!(!store.exists().await.expect("exists"));
        assert!(!store.is_locked().await.expect("lock state"));
    }
}
