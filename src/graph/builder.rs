//! Two-phase graph construction.
//!
//! [`InputResolver`] performs every asynchronous lookup the stack needs
//! (snapshots, the admin secret) and returns [`ResolvedInputs`].
//! [`GraphBuilder`] then builds the declarations synchronously from those
//! values. No declaration exists until every lookup has succeeded.

use chrono::{DateTime, Duration, Utc};
use futures::future::try_join_all;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};
use uuid::Uuid;

use crate::cloud::{CloudProvider, Snapshot};
use crate::config::{DeployConfig, DiskRole};
use crate::error::{DeployError, GraphError, Result};
use crate::secrets::{Secret, SecretStore};

use super::dependency::ResourceGraph;
use super::resource::{
    AdminCredential, DiskAttachment, DiskSource, ResourceDeclaration, ResourceRef, ResourceSpec,
};

/// SKU of the automation account created for scheduled shutdown.
const AUTOMATION_SKU: &str = "Basic";

/// Minimum lead, in minutes, Azure Automation accepts for a schedule start.
pub const SCHEDULE_LEAD_MINUTES: i64 = 5;

/// Returns the name of the shutdown schedule targeting `vm`.
#[must_use]
pub fn shutdown_schedule_name(vm: &str) -> String {
    format!("{vm}-shutdown")
}

/// Returns when a shutdown window opened at `anchor` runs out.
#[must_use]
pub fn shutdown_start(anchor: DateTime<Utc>, after_hours: u32) -> DateTime<Utc> {
    anchor + Duration::hours(i64::from(after_hours))
}

/// Returns true if a schedule starting at `start` can still be created at `now`.
#[must_use]
pub fn schedule_is_placeable(start: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    start > now + Duration::minutes(SCHEDULE_LEAD_MINUTES)
}

/// Values looked up before the graph is built.
#[derive(Debug, Clone)]
pub struct ResolvedInputs {
    snapshots: HashMap<String, Snapshot>,
    admin_password: Option<Secret>,
}

impl ResolvedInputs {
    /// Returns a resolved snapshot by name.
    #[must_use]
    pub fn snapshot(&self, name: &str) -> Option<&Snapshot> {
        self.snapshots.get(name)
    }

    /// Returns the admin password, if the stack declares an admin.
    #[must_use]
    pub const fn admin_password(&self) -> Option<&Secret> {
        self.admin_password.as_ref()
    }
}

/// Performs the lookups a stack depends on.
pub struct InputResolver<'a> {
    provider: &'a dyn CloudProvider,
    secrets: &'a dyn SecretStore,
}

impl<'a> InputResolver<'a> {
    /// Creates a resolver.
    #[must_use]
    pub fn new(provider: &'a dyn CloudProvider, secrets: &'a dyn SecretStore) -> Self {
        Self { provider, secrets }
    }

    /// Looks up every snapshot concurrently, then the admin secret.
    ///
    /// # Errors
    ///
    /// Returns the first failing lookup. Nothing is returned on partial
    /// success.
    pub async fn resolve(&self, config: &DeployConfig) -> Result<ResolvedInputs> {
        let resource_group = config.project.resource_group.as_str();
        let names = config.snapshot_names();
        info!("Resolving {} snapshots in {}", names.len(), resource_group);

        let lookups = names
            .iter()
            .map(|name| self.provider.lookup_snapshot(resource_group, name));
        let snapshots: HashMap<String, Snapshot> = names
            .iter()
            .map(|name| (*name).to_string())
            .zip(try_join_all(lookups).await?)
            .collect();

        let admin_password = match &config.vm.admin {
            Some(admin) => {
                debug!("Resolving admin secret {}", admin.password_secret);
                Some(self.secrets.get(&admin.password_secret).await?)
            }
            None => None,
        };

        Ok(ResolvedInputs {
            snapshots,
            admin_password,
        })
    }
}

/// Builds the resource graph for a stack.
#[derive(Debug)]
pub struct GraphBuilder<'a> {
    config: &'a DeployConfig,
}

impl<'a> GraphBuilder<'a> {
    /// Creates a builder for `config`.
    #[must_use]
    pub const fn new(config: &'a DeployConfig) -> Self {
        Self { config }
    }

    /// Builds and validates the graph.
    ///
    /// `anchor` opens the shutdown window and places the optional shutdown
    /// schedule `after_hours` later.
    ///
    /// # Errors
    ///
    /// Returns an error if a resolved input is missing or inconsistent with
    /// the declaration, if the shutdown schedule would start in the past, or
    /// if the resulting graph is invalid.
    pub fn build(&self, resolved: &ResolvedInputs, anchor: DateTime<Utc>) -> Result<ResourceGraph> {
        let config = self.config;
        let network = &config.network;
        let mut graph = ResourceGraph::new();

        let vnet = self.declare(
            &network.virtual_network.name,
            ResourceSpec::VirtualNetwork {
                address_space: network.virtual_network.address_space.clone(),
            },
        );
        let vnet_ref = vnet.reference();
        graph.insert(vnet)?;

        let subnet = self.declare(
            &network.subnet.name,
            ResourceSpec::Subnet {
                virtual_network: vnet_ref,
                address_prefix: network.subnet.address_prefix.clone(),
            },
        );
        let subnet_ref = subnet.reference();
        graph.insert(subnet)?;

        let public_ip = self.declare(
            &network.public_ip.name,
            ResourceSpec::PublicIpAddress {
                allocation: network.public_ip.allocation,
                sku: network.public_ip.sku,
            },
        );
        let public_ip_ref = public_ip.reference();
        graph.insert(public_ip)?;

        let mut rules = network.security_group.rules.clone();
        rules.sort_by_key(|r| r.priority);
        let nsg = self.declare(
            &network.security_group.name,
            ResourceSpec::NetworkSecurityGroup { rules },
        );
        let nsg_ref = nsg.reference();
        graph.insert(nsg)?;

        let nic = self.declare(
            &network.interface.name,
            ResourceSpec::NetworkInterface {
                ip_configuration: network.interface.ip_configuration.clone(),
                private_ip_allocation: network.interface.private_ip_allocation,
                subnet: subnet_ref,
                public_ip: public_ip_ref,
                security_group: nsg_ref,
            },
        );
        let nic_ref = nic.reference();
        graph.insert(nic)?;

        let mut os_disk = None;
        let mut data_disks = Vec::new();
        for disk in &config.disks {
            let snapshot =
                self.checked_snapshot(resolved, &disk.name, &disk.snapshot, disk.size_gb)?;
            let declaration = self.declare(
                &disk.name,
                ResourceSpec::Disk {
                    size_gb: disk.size_gb,
                    sku: disk.sku,
                    source: DiskSource {
                        snapshot: snapshot.name.clone(),
                        snapshot_id: snapshot.id.clone(),
                    },
                },
            );

            let attachment = DiskAttachment {
                disk: declaration.reference(),
                lun: disk.lun,
                caching: disk.caching,
            };
            match disk.role {
                DiskRole::Os => os_disk = Some(attachment),
                DiskRole::Data => data_disks.push(attachment),
            }
            graph.insert(declaration)?;
        }

        let os_disk = os_disk.ok_or_else(|| {
            DeployError::Graph(GraphError::UnresolvedInput {
                name: String::from("os disk"),
            })
        })?;

        let admin = match &config.vm.admin {
            Some(admin) => {
                let password = resolved.admin_password().cloned().ok_or_else(|| {
                    DeployError::Graph(GraphError::UnresolvedInput {
                        name: admin.password_secret.clone(),
                    })
                })?;
                Some(AdminCredential {
                    username: admin.username.clone(),
                    password,
                })
            }
            None => None,
        };

        let vm = self.declare(
            &config.vm.name,
            ResourceSpec::VirtualMachine {
                size: config.vm.size.clone(),
                os_type: config.vm.os_type,
                ultra_ssd_enabled: config.vm.ultra_ssd_enabled,
                network_interface: nic_ref,
                os_disk,
                data_disks,
                admin,
            },
        );
        let vm_ref = vm.reference();
        graph.insert(vm)?;

        if let Some(script) = &config.startup_script {
            graph.insert(self.declare(
                &script.name,
                ResourceSpec::VirtualMachineExtension {
                    virtual_machine: vm_ref.clone(),
                    publisher: script.publisher.clone(),
                    extension_type: script.extension_type.clone(),
                    type_handler_version: script.type_handler_version.clone(),
                    command: script.command.clone(),
                    file_uris: script.file_uris.clone(),
                },
            ))?;
        }

        if config.shutdown.enabled {
            self.declare_shutdown(&mut graph, vm_ref, anchor)?;
        }

        graph.validate()?;
        info!(
            "Built resource graph for {}: {} resources, {} dependencies",
            config.stack_name(),
            graph.len(),
            graph.edge_count()
        );
        Ok(graph)
    }

    fn declare(&self, name: &str, spec: ResourceSpec) -> ResourceDeclaration {
        let tags = if spec.kind().is_tracked() {
            self.config.tags.clone()
        } else {
            BTreeMap::new()
        };
        ResourceDeclaration::new(name, self.config.project.location.clone(), spec).with_tags(tags)
    }

    fn checked_snapshot<'r>(
        &self,
        resolved: &'r ResolvedInputs,
        disk: &str,
        snapshot: &str,
        size_gb: u32,
    ) -> Result<&'r Snapshot> {
        let found = resolved.snapshot(snapshot).ok_or_else(|| {
            DeployError::Graph(GraphError::UnresolvedInput {
                name: format!("snapshot {snapshot}"),
            })
        })?;

        let expected = &self.config.project.location;
        if normalize_location(&found.location) != normalize_location(expected) {
            return Err(DeployError::Graph(GraphError::LocationMismatch {
                snapshot: snapshot.to_string(),
                expected: expected.clone(),
                found: found.location.clone(),
            }));
        }

        if size_gb < found.size_gb {
            return Err(DeployError::Graph(GraphError::DiskTooSmall {
                disk: disk.to_string(),
                size_gb,
                snapshot: snapshot.to_string(),
                snapshot_size_gb: found.size_gb,
            }));
        }

        Ok(found)
    }

    fn declare_shutdown(
        &self,
        graph: &mut ResourceGraph,
        vm: ResourceRef,
        anchor: DateTime<Utc>,
    ) -> Result<()> {
        let shutdown = &self.config.shutdown;
        let content_uri = shutdown.runbook_uri.clone().ok_or_else(|| {
            DeployError::Graph(GraphError::UnresolvedInput {
                name: String::from("shutdown.runbook_uri"),
            })
        })?;

        let account = self.declare(
            &shutdown.automation_account,
            ResourceSpec::AutomationAccount {
                sku: AUTOMATION_SKU.to_string(),
            },
        );
        let account_ref = account.reference();
        graph.insert(account)?;

        let runbook = self.declare(
            &shutdown.runbook_name,
            ResourceSpec::Runbook {
                account: account_ref.clone(),
                content_uri,
            },
        );
        let runbook_ref = runbook.reference();
        graph.insert(runbook)?;

        let schedule_name = shutdown_schedule_name(&vm.name);
        let start_time = shutdown_start(anchor, shutdown.after_hours);
        if !schedule_is_placeable(start_time, Utc::now()) {
            return Err(DeployError::Graph(GraphError::ScheduleInPast {
                name: schedule_name,
                start_time: start_time.to_rfc3339(),
            }));
        }
        let schedule = self.declare(
            &schedule_name,
            ResourceSpec::Schedule {
                account: account_ref.clone(),
                start_time,
            },
        );
        let schedule_ref = schedule.reference();
        graph.insert(schedule)?;

        let job_name = job_schedule_name(
            &self.config.stack_name(),
            &runbook_ref.name,
            &schedule_ref.name,
        );
        graph.insert(self.declare(
            &job_name,
            ResourceSpec::JobSchedule {
                account: account_ref,
                runbook: runbook_ref,
                schedule: schedule_ref,
                virtual_machine: vm,
                resource_group: self.config.project.resource_group.clone(),
            },
        ))?;

        debug!("Shutdown scheduled for {}", start_time);
        Ok(())
    }
}

/// Job schedules are named by GUID; derive one that is stable per stack.
fn job_schedule_name(stack: &str, runbook: &str, schedule: &str) -> String {
    Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("{stack}/{runbook}/{schedule}").as_bytes(),
    )
    .to_string()
}

fn normalize_location(location: &str) -> String {
    location
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}
