//! Configuration types for the deployment tool.
//!
//! This module defines all the structs that map to the `dcs.deploy.yaml` file.
//! These types are declarative and fully describe the desired state of the
//! server stack.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The root configuration structure for a stack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeployConfig {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Networking resources.
    pub network: NetworkConfig,
    /// Disks restored from snapshots.
    pub disks: Vec<DiskConfig>,
    /// Virtual machine.
    pub vm: VmConfig,
    /// Command run once inside the VM after creation.
    #[serde(default)]
    pub startup_script: Option<StartupScriptConfig>,
    /// Optional scheduled shutdown.
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    /// Tags applied to every taggable resource.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Optional guardrails configuration.
    #[serde(default)]
    pub guardrails: Option<GuardrailsConfig>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the project.
    pub name: String,
    /// Environment (e.g., "dev", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Azure resource group that holds every resource and both snapshots.
    pub resource_group: String,
    /// Azure region.
    pub location: String,
}

/// State backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Local state directory (for local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Networking resources of the stack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkConfig {
    /// Virtual network.
    pub virtual_network: VirtualNetworkConfig,
    /// Subnet inside the virtual network.
    pub subnet: SubnetConfig,
    /// Public IP address attached to the NIC.
    pub public_ip: PublicIpConfig,
    /// Network security group attached to the NIC.
    pub security_group: SecurityGroupConfig,
    /// Network interface of the VM.
    pub interface: InterfaceConfig,
}

/// Virtual network configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VirtualNetworkConfig {
    /// Resource name.
    pub name: String,
    /// Address space prefixes (CIDR).
    pub address_space: Vec<String>,
}

/// Subnet configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubnetConfig {
    /// Resource name.
    pub name: String,
    /// Address prefix (CIDR), must lie within the virtual network.
    pub address_prefix: String,
}

/// Public IP configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublicIpConfig {
    /// Resource name.
    pub name: String,
    /// Allocation method.
    #[serde(default = "default_public_allocation")]
    pub allocation: IpAllocation,
    /// SKU.
    #[serde(default)]
    pub sku: PublicIpSku,
}

/// Network security group configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecurityGroupConfig {
    /// Resource name.
    pub name: String,
    /// Security rules.
    #[serde(default)]
    pub rules: Vec<SecurityRuleConfig>,
}

/// A single firewall rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecurityRuleConfig {
    /// Rule name, unique within the group.
    pub name: String,
    /// Protocol.
    pub protocol: RuleProtocol,
    /// Destination port or port range (`"3389"`, `"42674-42675"`, `"*"`).
    pub port: String,
    /// Priority, unique within the group. Lower is evaluated first.
    pub priority: u16,
    /// Traffic direction.
    #[serde(default)]
    pub direction: RuleDirection,
    /// Allow or deny.
    #[serde(default)]
    pub access: RuleAccess,
    /// Source port range.
    #[serde(default = "default_any")]
    pub source_port_range: String,
    /// Source address prefix.
    #[serde(default = "default_any")]
    pub source_address_prefix: String,
    /// Destination address prefix.
    #[serde(default = "default_any")]
    pub destination_address_prefix: String,
}

/// Network interface configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InterfaceConfig {
    /// Resource name.
    pub name: String,
    /// Name of the IP configuration.
    #[serde(default = "default_ip_configuration")]
    pub ip_configuration: String,
    /// Private IP allocation method.
    #[serde(default = "default_private_allocation")]
    pub private_ip_allocation: IpAllocation,
}

/// Security rule protocol.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum RuleProtocol {
    /// TCP.
    #[serde(alias = "tcp", alias = "TCP")]
    Tcp,
    /// UDP.
    #[serde(alias = "udp", alias = "UDP")]
    Udp,
    /// Any protocol.
    #[serde(rename = "*", alias = "any")]
    Any,
}

/// Security rule direction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum RuleDirection {
    /// Incoming traffic.
    #[default]
    #[serde(alias = "inbound")]
    Inbound,
    /// Outgoing traffic.
    #[serde(alias = "outbound")]
    Outbound,
}

/// Security rule access.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum RuleAccess {
    /// Allow matching traffic.
    #[default]
    #[serde(alias = "allow")]
    Allow,
    /// Deny matching traffic.
    #[serde(alias = "deny")]
    Deny,
}

/// IP allocation method.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum IpAllocation {
    /// Address fixed for the lifetime of the resource.
    #[serde(alias = "static")]
    Static,
    /// Address assigned on attach.
    #[serde(alias = "dynamic")]
    Dynamic,
}

/// Public IP SKU.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PublicIpSku {
    /// Basic SKU.
    #[serde(alias = "basic")]
    Basic,
    /// Standard SKU.
    #[default]
    #[serde(alias = "standard")]
    Standard,
}

/// Role of a disk on the VM.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DiskRole {
    /// Boot disk.
    Os,
    /// Additional data disk.
    Data,
}

/// Managed disk SKU.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DiskSku {
    /// Standard HDD.
    #[serde(rename = "Standard_LRS")]
    StandardLrs,
    /// Standard SSD.
    #[serde(rename = "StandardSSD_LRS")]
    StandardSsdLrs,
    /// Premium SSD.
    #[default]
    #[serde(rename = "Premium_LRS")]
    PremiumLrs,
    /// Zone-redundant premium SSD.
    #[serde(rename = "Premium_ZRS")]
    PremiumZrs,
    /// Ultra disk.
    #[serde(rename = "UltraSSD_LRS")]
    UltraSsdLrs,
}

/// Host caching mode of an attached disk.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Caching {
    /// No caching.
    None,
    /// Read caching.
    ReadOnly,
    /// Read and write caching.
    #[default]
    ReadWrite,
}

/// Operating system of the VM.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum OsType {
    /// Windows.
    #[default]
    #[serde(alias = "windows")]
    Windows,
    /// Linux.
    #[serde(alias = "linux")]
    Linux,
}

/// A disk restored from a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiskConfig {
    /// Resource name.
    pub name: String,
    /// Role on the VM.
    pub role: DiskRole,
    /// Name of the snapshot to restore from, in the stack's resource group.
    pub snapshot: String,
    /// Size in GB; must be at least the snapshot size.
    pub size_gb: u32,
    /// SKU.
    #[serde(default)]
    pub sku: DiskSku,
    /// Logical unit number (data disks only).
    #[serde(default)]
    pub lun: Option<u8>,
    /// Host caching.
    #[serde(default)]
    pub caching: Caching,
}

/// Virtual machine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VmConfig {
    /// Resource name.
    pub name: String,
    /// VM size (e.g. `Standard_E4as_v4`).
    pub size: String,
    /// Operating system of the restored OS disk.
    #[serde(default)]
    pub os_type: OsType,
    /// Enables ultra SSD support on the VM.
    #[serde(default)]
    pub ultra_ssd_enabled: bool,
    /// Administrator credential.
    #[serde(default)]
    pub admin: Option<AdminConfig>,
}

/// Administrator credential, with the password held in the secret store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdminConfig {
    /// Administrator user name.
    pub username: String,
    /// Key of the password in the secret store.
    pub password_secret: String,
}

/// Post-deploy command extension.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StartupScriptConfig {
    /// Extension name.
    #[serde(default = "default_startup_name")]
    pub name: String,
    /// Extension publisher.
    #[serde(default = "default_publisher")]
    pub publisher: String,
    /// Extension type.
    #[serde(default = "default_extension_type")]
    pub extension_type: String,
    /// Handler version.
    #[serde(default = "default_handler_version")]
    pub type_handler_version: String,
    /// Command executed inside the VM.
    pub command: String,
    /// Files downloaded before the command runs.
    #[serde(default)]
    pub file_uris: Vec<String>,
}

/// Scheduled shutdown of the VM after a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShutdownConfig {
    /// Whether the schedule is declared at all.
    #[serde(default)]
    pub enabled: bool,
    /// Hours after the first deployment at which the runbook runs.
    #[serde(default = "default_after_hours")]
    pub after_hours: u32,
    /// Automation account name.
    #[serde(default = "default_automation_account")]
    pub automation_account: String,
    /// Runbook name.
    #[serde(default = "default_runbook_name")]
    pub runbook_name: String,
    /// Location of the PowerShell runbook that deletes the VM.
    #[serde(default)]
    pub runbook_uri: Option<String>,
}

/// Guardrails checked before a plan is executed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GuardrailsConfig {
    /// Resources that must never be deleted by a plan.
    #[serde(default)]
    pub prevent_destroy: Vec<String>,
    /// Maximum number of actions a single plan may contain.
    #[serde(default)]
    pub max_actions: Option<usize>,
}

fn default_environment() -> String {
    String::from("dev")
}

const fn default_public_allocation() -> IpAllocation {
    IpAllocation::Static
}

const fn default_private_allocation() -> IpAllocation {
    IpAllocation::Dynamic
}

fn default_any() -> String {
    String::from("*")
}

fn default_ip_configuration() -> String {
    String::from("ipconfig1")
}

fn default_startup_name() -> String {
    String::from("startup-script")
}

fn default_publisher() -> String {
    String::from("Microsoft.Compute")
}

fn default_extension_type() -> String {
    String::from("CustomScriptExtension")
}

fn default_handler_version() -> String {
    String::from("1.10")
}

const fn default_after_hours() -> u32 {
    6
}

fn default_automation_account() -> String {
    String::from("dcs-automation")
}

fn default_runbook_name() -> String {
    String::from("DeleteVmAfterSession")
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            after_hours: default_after_hours(),
            automation_account: default_automation_account(),
            runbook_name: default_runbook_name(),
            runbook_uri: None,
        }
    }
}

impl DeployConfig {
    /// Returns the stack identifier (`project-environment`).
    #[must_use]
    pub fn stack_name(&self) -> String {
        format!("{}-{}", self.project.name, self.project.environment)
    }

    /// Returns the OS disk, if declared.
    #[must_use]
    pub fn os_disk(&self) -> Option<&DiskConfig> {
        self.disks.iter().find(|d| d.role == DiskRole::Os)
    }

    /// Returns the data disks in declaration order.
    pub fn data_disks(&self) -> impl Iterator<Item = &DiskConfig> {
        self.disks.iter().filter(|d| d.role == DiskRole::Data)
    }

    /// Returns the names of all snapshots the stack restores from.
    #[must_use]
    pub fn snapshot_names(&self) -> Vec<&str> {
        self.disks.iter().map(|d| d.snapshot.as_str()).collect()
    }

    /// Returns true if `name` is protected from deletion.
    #[must_use]
    pub fn is_protected(&self, name: &str) -> bool {
        self.guardrails
            .as_ref()
            .is_some_and(|g| g.prevent_destroy.iter().any(|p| p == name))
    }
}

impl RuleProtocol {
    /// Returns the ARM representation.
    #[must_use]
    pub const fn as_arm(self) -> &'static str {
        match self {
            Self::Tcp => "Tcp",
            Self::Udp => "Udp",
            Self::Any => "*",
        }
    }
}

impl RuleDirection {
    /// Returns the ARM representation.
    #[must_use]
    pub const fn as_arm(self) -> &'static str {
        match self {
            Self::Inbound => "Inbound",
            Self::Outbound => "Outbound",
        }
    }
}

impl RuleAccess {
    /// Returns the ARM representation.
    #[must_use]
    pub const fn as_arm(self) -> &'static str {
        match self {
            Self::Allow => "Allow",
            Self::Deny => "Deny",
        }
    }
}

impl IpAllocation {
    /// Returns the ARM representation.
    #[must_use]
    pub const fn as_arm(self) -> &'static str {
        match self {
            Self::Static => "Static",
            Self::Dynamic => "Dynamic",
        }
    }
}

impl PublicIpSku {
    /// Returns the ARM representation.
    #[must_use]
    pub const fn as_arm(self) -> &'static str {
        match self {
            Self::Basic => "Basic",
            Self::Standard => "Standard",
        }
    }
}

impl DiskSku {
    /// Returns the ARM representation.
    #[must_use]
    pub const fn as_arm(self) -> &'static str {
        match self {
            Self::StandardLrs => "Standard_LRS",
            Self::StandardSsdLrs => "StandardSSD_LRS",
            Self::PremiumLrs => "Premium_LRS",
            Self::PremiumZrs => "Premium_ZRS",
            Self::UltraSsdLrs => "UltraSSD_LRS",
        }
    }
}

impl Caching {
    /// Returns the ARM representation.
    #[must_use]
    pub const fn as_arm(self) -> &'static str {
        match self {
            Self::None => "None",
            Self::ReadOnly => "ReadOnly",
            Self::ReadWrite => "ReadWrite",
        }
    }
}

impl OsType {
    /// Returns the ARM representation.
    #[must_use]
    pub const fn as_arm(self) -> &'static str {
        match self {
            Self::Windows => "Windows",
            Self::Linux => "Linux",
        }
    }
}
