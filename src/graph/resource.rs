//! Resource declarations.
//!
//! Each node of the graph is a [`ResourceDeclaration`]: a logical name, a
//! location and a typed [`ResourceSpec`]. Dependencies are expressed only
//! through [`ResourceRef`] fields inside the spec.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

use crate::config::{
    Caching, DiskSku, IpAllocation, OsType, PublicIpSku, SecurityRuleConfig,
};
use crate::secrets::Secret;

/// The kinds of resource the graph can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Virtual network.
    VirtualNetwork,
    /// Subnet of a virtual network.
    Subnet,
    /// Public IP address.
    PublicIpAddress,
    /// Network security group.
    NetworkSecurityGroup,
    /// Network interface.
    NetworkInterface,
    /// Managed disk.
    Disk,
    /// Virtual machine.
    VirtualMachine,
    /// VM extension.
    VirtualMachineExtension,
    /// Automation account.
    AutomationAccount,
    /// Automation runbook.
    Runbook,
    /// Automation schedule.
    Schedule,
    /// Link between a runbook and a schedule.
    JobSchedule,
}

impl ResourceKind {
    /// Resource provider namespace.
    #[must_use]
    pub const fn namespace(self) -> &'static str {
        match self {
            Self::VirtualNetwork
            | Self::Subnet
            | Self::PublicIpAddress
            | Self::NetworkSecurityGroup
            | Self::NetworkInterface => "Microsoft.Network",
            Self::Disk | Self::VirtualMachine | Self::VirtualMachineExtension => {
                "Microsoft.Compute"
            }
            Self::AutomationAccount | Self::Runbook | Self::Schedule | Self::JobSchedule => {
                "Microsoft.Automation"
            }
        }
    }

    /// The type segment used in resource ids.
    #[must_use]
    pub const fn type_segment(self) -> &'static str {
        match self {
            Self::VirtualNetwork => "virtualNetworks",
            Self::Subnet => "subnets",
            Self::PublicIpAddress => "publicIPAddresses",
            Self::NetworkSecurityGroup => "networkSecurityGroups",
            Self::NetworkInterface => "networkInterfaces",
            Self::Disk => "disks",
            Self::VirtualMachine => "virtualMachines",
            Self::VirtualMachineExtension => "extensions",
            Self::AutomationAccount => "automationAccounts",
            Self::Runbook => "runbooks",
            Self::Schedule => "schedules",
            Self::JobSchedule => "jobSchedules",
        }
    }

    /// The kind a child resource is nested under.
    #[must_use]
    pub const fn parent_kind(self) -> Option<Self> {
        match self {
            Self::Subnet => Some(Self::VirtualNetwork),
            Self::VirtualMachineExtension => Some(Self::VirtualMachine),
            Self::Runbook | Self::Schedule | Self::JobSchedule => Some(Self::AutomationAccount),
            _ => None,
        }
    }

    /// API version used for requests against this kind.
    #[must_use]
    pub const fn api_version(self) -> &'static str {
        match self {
            Self::VirtualNetwork
            | Self::Subnet
            | Self::PublicIpAddress
            | Self::NetworkSecurityGroup
            | Self::NetworkInterface => "2023-09-01",
            Self::Disk => "2023-04-02",
            Self::VirtualMachine | Self::VirtualMachineExtension => "2024-03-01",
            Self::AutomationAccount | Self::Runbook | Self::Schedule | Self::JobSchedule => {
                "2023-11-01"
            }
        }
    }

    /// Whether the resource accepts tags and a location.
    #[must_use]
    pub const fn is_tracked(self) -> bool {
        !matches!(self, Self::Subnet | Self::Schedule | Self::JobSchedule)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::VirtualNetwork => "virtual network",
            Self::Subnet => "subnet",
            Self::PublicIpAddress => "public IP",
            Self::NetworkSecurityGroup => "security group",
            Self::NetworkInterface => "network interface",
            Self::Disk => "disk",
            Self::VirtualMachine => "virtual machine",
            Self::VirtualMachineExtension => "VM extension",
            Self::AutomationAccount => "automation account",
            Self::Runbook => "runbook",
            Self::Schedule => "schedule",
            Self::JobSchedule => "job schedule",
        };
        f.write_str(name)
    }
}

/// A typed reference to another declaration by logical name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    /// Logical name of the target.
    pub name: String,
    /// Kind the target must have.
    pub kind: ResourceKind,
}

impl ResourceRef {
    /// Creates a reference.
    #[must_use]
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

impl Serialize for ResourceRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.name)
    }
}

/// Where a disk's content comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskSource {
    /// Snapshot name.
    pub snapshot: String,
    /// Resolved snapshot resource id.
    pub snapshot_id: String,
}

/// A disk attached to the VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiskAttachment {
    /// The attached disk.
    pub disk: ResourceRef,
    /// LUN for data disks.
    pub lun: Option<u8>,
    /// Host caching.
    pub caching: Caching,
}

/// Admin credential carried by the VM declaration.
///
/// Serializes the user name and the secret's digest, never the password.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminCredential {
    /// Admin user name.
    pub username: String,
    /// Admin password.
    pub password: Secret,
}

impl Serialize for AdminCredential {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("AdminCredential", 2)?;
        state.serialize_field("username", &self.username)?;
        state.serialize_field("passwordDigest", &self.password.digest())?;
        state.end()
    }
}

/// Desired properties of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceSpec {
    /// Virtual network.
    VirtualNetwork {
        /// Address prefixes.
        address_space: Vec<String>,
    },
    /// Subnet.
    Subnet {
        /// Parent network.
        virtual_network: ResourceRef,
        /// Address prefix.
        address_prefix: String,
    },
    /// Public IP address.
    PublicIpAddress {
        /// Allocation method.
        allocation: IpAllocation,
        /// SKU.
        sku: PublicIpSku,
    },
    /// Network security group, rules sorted by priority.
    NetworkSecurityGroup {
        /// Security rules.
        rules: Vec<SecurityRuleConfig>,
    },
    /// Network interface.
    NetworkInterface {
        /// IP configuration name.
        ip_configuration: String,
        /// Private IP allocation.
        private_ip_allocation: IpAllocation,
        /// Subnet.
        subnet: ResourceRef,
        /// Public IP.
        public_ip: ResourceRef,
        /// Security group.
        security_group: ResourceRef,
    },
    /// Managed disk restored from a snapshot.
    Disk {
        /// Size in GB.
        size_gb: u32,
        /// SKU.
        sku: DiskSku,
        /// Source snapshot.
        source: DiskSource,
    },
    /// Virtual machine.
    VirtualMachine {
        /// VM size.
        size: String,
        /// OS type of the boot disk.
        os_type: OsType,
        /// Whether ultra disks may be attached.
        ultra_ssd_enabled: bool,
        /// Network interface.
        network_interface: ResourceRef,
        /// Boot disk.
        os_disk: DiskAttachment,
        /// Data disks.
        data_disks: Vec<DiskAttachment>,
        /// Admin credential.
        admin: Option<AdminCredential>,
    },
    /// Command run inside the VM after creation.
    VirtualMachineExtension {
        /// Target VM.
        virtual_machine: ResourceRef,
        /// Extension publisher.
        publisher: String,
        /// Extension type.
        extension_type: String,
        /// Handler version.
        type_handler_version: String,
        /// Command line.
        command: String,
        /// Files downloaded before the command runs.
        file_uris: Vec<String>,
    },
    /// Automation account.
    AutomationAccount {
        /// SKU name.
        sku: String,
    },
    /// `PowerShell` runbook published from a URI.
    Runbook {
        /// Owning account.
        account: ResourceRef,
        /// Content location.
        content_uri: String,
    },
    /// One-time schedule.
    Schedule {
        /// Owning account.
        account: ResourceRef,
        /// When the schedule fires.
        start_time: DateTime<Utc>,
    },
    /// Runs a runbook on a schedule.
    JobSchedule {
        /// Owning account.
        account: ResourceRef,
        /// Runbook to run.
        runbook: ResourceRef,
        /// Schedule to follow.
        schedule: ResourceRef,
        /// VM the runbook acts on.
        virtual_machine: ResourceRef,
        /// Resource group passed to the runbook.
        resource_group: String,
    },
}

impl ResourceSpec {
    /// Returns the kind of resource this spec describes.
    #[must_use]
    pub const fn kind(&self) -> ResourceKind {
        match self {
            Self::VirtualNetwork { .. } => ResourceKind::VirtualNetwork,
            Self::Subnet { .. } => ResourceKind::Subnet,
            Self::PublicIpAddress { .. } => ResourceKind::PublicIpAddress,
            Self::NetworkSecurityGroup { .. } => ResourceKind::NetworkSecurityGroup,
            Self::NetworkInterface { .. } => ResourceKind::NetworkInterface,
            Self::Disk { .. } => ResourceKind::Disk,
            Self::VirtualMachine { .. } => ResourceKind::VirtualMachine,
            Self::VirtualMachineExtension { .. } => ResourceKind::VirtualMachineExtension,
            Self::AutomationAccount { .. } => ResourceKind::AutomationAccount,
            Self::Runbook { .. } => ResourceKind::Runbook,
            Self::Schedule { .. } => ResourceKind::Schedule,
            Self::JobSchedule { .. } => ResourceKind::JobSchedule,
        }
    }

    /// Returns the resource this one is nested under, if any.
    #[must_use]
    pub const fn parent(&self) -> Option<&ResourceRef> {
        match self {
            Self::Subnet {
                virtual_network, ..
            } => Some(virtual_network),
            Self::VirtualMachineExtension {
                virtual_machine, ..
            } => Some(virtual_machine),
            Self::Runbook { account, .. }
            | Self::Schedule { account, .. }
            | Self::JobSchedule { account, .. } => Some(account),
            _ => None,
        }
    }

    /// Returns every reference this spec holds.
    #[must_use]
    pub fn references(&self) -> Vec<&ResourceRef> {
        match self {
            Self::VirtualNetwork { .. }
            | Self::PublicIpAddress { .. }
            | Self::NetworkSecurityGroup { .. }
            | Self::Disk { .. }
            | Self::AutomationAccount { .. } => Vec::new(),
            Self::Subnet {
                virtual_network, ..
            } => vec![virtual_network],
            Self::NetworkInterface {
                subnet,
                public_ip,
                security_group,
                ..
            } => vec![subnet, public_ip, security_group],
            Self::VirtualMachine {
                network_interface,
                os_disk,
                data_disks,
                ..
            } => {
                let mut refs = vec![network_interface, &os_disk.disk];
                refs.extend(data_disks.iter().map(|d| &d.disk));
                refs
            }
            Self::VirtualMachineExtension {
                virtual_machine, ..
            } => vec![virtual_machine],
            Self::Runbook { account, .. } | Self::Schedule { account, .. } => vec![account],
            Self::JobSchedule {
                account,
                runbook,
                schedule,
                virtual_machine,
                ..
            } => vec![account, runbook, schedule, virtual_machine],
        }
    }
}

/// A declared resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceDeclaration {
    /// Logical name, also used as the cloud resource name.
    pub name: String,
    /// Azure region.
    pub location: String,
    /// Tags; ignored for kinds that are not tracked.
    pub tags: BTreeMap<String, String>,
    /// Desired properties.
    pub spec: ResourceSpec,
}

impl ResourceDeclaration {
    /// Creates a declaration.
    #[must_use]
    pub fn new(name: impl Into<String>, location: impl Into<String>, spec: ResourceSpec) -> Self {
        Self {
            name: name.into(),
            location: location.into(),
            tags: BTreeMap::new(),
            spec,
        }
    }

    /// Sets the tags.
    #[must_use]
    pub fn with_tags(mut self, tags: BTreeMap<String, String>) -> Self {
        self.tags = tags;
        self
    }

    /// Returns the resource kind.
    #[must_use]
    pub const fn kind(&self) -> ResourceKind {
        self.spec.kind()
    }

    /// Returns a reference to this declaration.
    #[must_use]
    pub fn reference(&self) -> ResourceRef {
        ResourceRef::new(self.kind(), self.name.clone())
    }

    /// Returns the names of the declarations this one depends on.
    #[must_use]
    pub fn depends_on(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .spec
            .references()
            .into_iter()
            .map(|r| r.name.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nic() -> ResourceDeclaration {
        ResourceDeclaration::new(
            "nic",
            "northcentralus",
            ResourceSpec::NetworkInterface {
                ip_configuration: String::from("ipconfig1"),
                private_ip_allocation: IpAllocation::Dynamic,
                subnet: ResourceRef::new(ResourceKind::Subnet, "subnet"),
                public_ip: ResourceRef::new(ResourceKind::PublicIpAddress, "pip"),
                security_group: ResourceRef::new(ResourceKind::NetworkSecurityGroup, "nsg"),
            },
        )
    }

    #[test]
    fn test_nic_depends_on_network_resources() {
        let nic = nic();
        assert_eq!(nic.kind(), ResourceKind::NetworkInterface);
        assert_eq!(nic.depends_on(), vec!["nsg", "pip", "subnet"]);
        assert!(nic.spec.parent().is_none());
    }

    #[test]
    fn test_child_kinds() {
        assert_eq!(
            ResourceKind::Subnet.parent_kind(),
            Some(ResourceKind::VirtualNetwork)
        );
        assert_eq!(
            ResourceKind::VirtualMachineExtension.parent_kind(),
            Some(ResourceKind::VirtualMachine)
        );
        assert!(ResourceKind::Disk.parent_kind().is_none());
        assert!(!ResourceKind::Subnet.is_tracked());
        assert!(ResourceKind::VirtualMachine.is_tracked());
    }

    #[test]
    fn test_admin_credential_serializes_digest_only() {
        let admin = AdminCredential {
            username: String::from("dcsadmin"),
            password: Secret::new("correct horse"),
        };

        let json = serde_json::to_string(&admin).expect("serialize");
        assert!(json.contains("dcsadmin"));
        assert!(json.contains(&Secret::new("correct horse").digest()));
        assert!(!json.contains("correct horse"));
    }

    #[test]
    fn test_references_serialize_as_names() {
        let json = serde_json::to_value(&nic().spec).expect("serialize");
        assert_eq!(json["kind"], "network_interface");
        assert_eq!(json["subnet"], "subnet");
    }
}
