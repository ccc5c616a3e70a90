//! Configuration validation for stack definitions.
//!
//! This module validates a stack definition before anything is resolved or
//! submitted, ensuring all values are valid and consistent.

use crate::error::{ConfigError, DeployError, Result};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use tracing::debug;

use super::spec::{
    DeployConfig, DiskConfig, DiskRole, DiskSku, NetworkConfig, ProjectConfig, SecurityRuleConfig,
    ShutdownConfig, StateBackend, StateConfig, VmConfig,
};

/// Lowest priority Azure accepts for a security rule.
pub const MIN_RULE_PRIORITY: u16 = 100;

/// Highest priority Azure accepts for a security rule.
pub const MAX_RULE_PRIORITY: u16 = 4096;

/// Largest managed disk size in GB.
pub const MAX_DISK_SIZE_GB: u32 = 32_767;

/// Validator for stack configurations.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a stack configuration.
    ///
    /// # Errors
    ///
    /// Returns the first error found, if any.
    pub fn validate(&self, config: &DeployConfig) -> Result<ValidationResult> {
        let result = self.check(config);

        if let Some(first_error) = result.errors.first() {
            return Err(DeployError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }));
        }

        debug!("Configuration validation passed");
        Ok(result)
    }

    /// Collects every error and warning without failing.
    #[must_use]
    pub fn check(&self, config: &DeployConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_project(&config.project, &mut result);
        Self::validate_state(&config.state, &mut result);
        Self::validate_network(&config.network, &mut result);
        Self::validate_disks(&config.disks, &config.vm, &mut result);
        Self::validate_vm(&config.vm, &mut result);
        Self::validate_startup_script(config, &mut result);
        Self::validate_shutdown(&config.shutdown, &mut result);
        Self::validate_unique_names(config, &mut result);
        Self::validate_guardrails(config, &mut result);

        result
    }

    /// Validates project configuration.
    fn validate_project(project: &ProjectConfig, result: &mut ValidationResult) {
        if project.name.is_empty() {
            result.error("project.name", "Project name cannot be empty");
        } else if !is_valid_project_name(&project.name) {
            result.error(
                "project.name",
                format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            );
        }

        if project.environment.is_empty() {
            result.error("project.environment", "Environment cannot be empty");
        }

        if !is_valid_resource_group(&project.resource_group) {
            result.error(
                "project.resource_group",
                format!("Resource group name '{}' is invalid", project.resource_group),
            );
        }

        if project.location.is_empty()
            || !project
                .location
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        {
            result.error(
                "project.location",
                format!(
                    "Location '{}' is invalid. Use the short region name, e.g. 'northcentralus'.",
                    project.location
                ),
            );
        }
    }

    /// Validates state configuration.
    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        if state.backend == StateBackend::S3 && state.bucket.as_ref().is_none_or(String::is_empty)
        {
            result.error(
                "state.bucket",
                "S3 bucket name is required when using S3 backend",
            );
        }
    }

    /// Validates networking resources.
    fn validate_network(network: &NetworkConfig, result: &mut ValidationResult) {
        let vnet = &network.virtual_network;
        if vnet.address_space.is_empty() {
            result.error(
                "network.virtual_network.address_space",
                "Virtual network needs at least one address prefix",
            );
        }

        let mut spaces = Vec::new();
        for (i, prefix) in vnet.address_space.iter().enumerate() {
            match parse_cidr(prefix) {
                Some(cidr) => spaces.push(cidr),
                None => result.error(
                    format!("network.virtual_network.address_space[{i}]"),
                    format!("'{prefix}' is not a valid IPv4 CIDR block"),
                ),
            }
        }

        match parse_cidr(&network.subnet.address_prefix) {
            Some(subnet) => {
                if !spaces.is_empty() && !spaces.iter().any(|space| space.contains(&subnet)) {
                    result.error(
                        "network.subnet.address_prefix",
                        format!(
                            "Subnet {} is outside the virtual network address space",
                            network.subnet.address_prefix
                        ),
                    );
                }
            }
            None => result.error(
                "network.subnet.address_prefix",
                format!(
                    "'{}' is not a valid IPv4 CIDR block",
                    network.subnet.address_prefix
                ),
            ),
        }

        Self::validate_rules(&network.security_group.rules, result);

        if network.interface.ip_configuration.is_empty() {
            result.error(
                "network.interface.ip_configuration",
                "IP configuration name cannot be empty",
            );
        }
    }

    /// Validates security rules.
    fn validate_rules(rules: &[SecurityRuleConfig], result: &mut ValidationResult) {
        if rules.is_empty() {
            result
                .warnings
                .push(String::from("Security group has no rules; all inbound traffic is denied"));
            return;
        }

        let mut names = HashSet::new();
        let mut priorities = HashSet::new();

        for (i, rule) in rules.iter().enumerate() {
            let prefix = format!("network.security_group.rules[{i}]");

            if !is_valid_resource_name(&rule.name) {
                result.error(
                    format!("{prefix}.name"),
                    format!("Rule name '{}' is invalid", rule.name),
                );
            } else if !names.insert(rule.name.as_str()) {
                result.error(
                    format!("{prefix}.name"),
                    format!("Duplicate security rule name: {}", rule.name),
                );
            }

            if !(MIN_RULE_PRIORITY..=MAX_RULE_PRIORITY).contains(&rule.priority) {
                result.error(
                    format!("{prefix}.priority"),
                    format!(
                        "Priority {} of rule '{}' must be between {MIN_RULE_PRIORITY} and {MAX_RULE_PRIORITY}",
                        rule.priority, rule.name
                    ),
                );
            } else if !priorities.insert(rule.priority) {
                result.error(
                    format!("{prefix}.priority"),
                    format!(
                        "Priority {} of rule '{}' is already used by another rule",
                        rule.priority, rule.name
                    ),
                );
            }

            if !is_valid_port_range(&rule.port) {
                result.error(
                    format!("{prefix}.port"),
                    format!("'{}' is not a valid port or port range", rule.port),
                );
            }

            if !is_valid_port_range(&rule.source_port_range) {
                result.error(
                    format!("{prefix}.source_port_range"),
                    format!(
                        "'{}' is not a valid port or port range",
                        rule.source_port_range
                    ),
                );
            }
        }

        let ascending = rules.windows(2).all(|w| w[0].priority < w[1].priority);
        if !ascending {
            result.warnings.push(String::from(
                "Security rules are not listed in priority order; they are submitted sorted by priority",
            ));
        }
    }

    /// Validates the disks and their attachment to the VM.
    fn validate_disks(disks: &[DiskConfig], vm: &VmConfig, result: &mut ValidationResult) {
        let os_disks = disks.iter().filter(|d| d.role == DiskRole::Os).count();
        if os_disks != 1 {
            result.error(
                "disks",
                format!("Exactly one OS disk is required, found {os_disks}"),
            );
        }

        let mut snapshots = HashSet::new();
        let mut luns = HashSet::new();

        for (i, disk) in disks.iter().enumerate() {
            let prefix = format!("disks[{i}]");

            if disk.snapshot.is_empty() {
                result.error(format!("{prefix}.snapshot"), "Snapshot name cannot be empty");
            } else if !snapshots.insert(disk.snapshot.as_str()) {
                result.error(
                    format!("{prefix}.snapshot"),
                    format!(
                        "Snapshot '{}' is already restored by another disk",
                        disk.snapshot
                    ),
                );
            }

            if disk.size_gb == 0 || disk.size_gb > MAX_DISK_SIZE_GB {
                result.error(
                    format!("{prefix}.size_gb"),
                    format!(
                        "Disk size {} GB must be between 1 and {MAX_DISK_SIZE_GB}",
                        disk.size_gb
                    ),
                );
            }

            match (disk.role, disk.lun) {
                (DiskRole::Os, Some(_)) => result.error(
                    format!("{prefix}.lun"),
                    "The OS disk cannot have a LUN",
                ),
                (DiskRole::Data, None) => result.error(
                    format!("{prefix}.lun"),
                    format!("Data disk '{}' needs a LUN", disk.name),
                ),
                (DiskRole::Data, Some(lun)) => {
                    if !luns.insert(lun) {
                        result.error(
                            format!("{prefix}.lun"),
                            format!("LUN {lun} is used by more than one data disk"),
                        );
                    }
                }
                (DiskRole::Os, None) => {}
            }

            if disk.sku == DiskSku::UltraSsdLrs && !vm.ultra_ssd_enabled {
                result.error(
                    format!("{prefix}.sku"),
                    "Ultra disks require vm.ultra_ssd_enabled",
                );
            }
        }
    }

    /// Validates the VM.
    fn validate_vm(vm: &VmConfig, result: &mut ValidationResult) {
        if vm.size.is_empty() {
            result.error("vm.size", "VM size cannot be empty");
        }

        match &vm.admin {
            Some(admin) => {
                if admin.username.is_empty() {
                    result.error("vm.admin.username", "Admin user name cannot be empty");
                }
                if admin.password_secret.is_empty() {
                    result.error(
                        "vm.admin.password_secret",
                        "Admin password secret key cannot be empty",
                    );
                }
            }
            None => result.warnings.push(String::from(
                "No admin credential declared; the restored OS disk keeps its existing accounts",
            )),
        }
    }

    /// Validates the post-deploy script.
    fn validate_startup_script(config: &DeployConfig, result: &mut ValidationResult) {
        if let Some(script) = &config.startup_script {
            if script.command.trim().is_empty() {
                result.error("startup_script.command", "Command cannot be empty");
            }
            if !is_valid_resource_name(&script.name) {
                result.error(
                    "startup_script.name",
                    format!("Extension name '{}' is invalid", script.name),
                );
            }
        }
    }

    /// Validates the scheduled shutdown.
    fn validate_shutdown(shutdown: &ShutdownConfig, result: &mut ValidationResult) {
        if !shutdown.enabled {
            return;
        }

        if shutdown.after_hours == 0 {
            result.error("shutdown.after_hours", "Shutdown delay must be at least one hour");
        }

        match shutdown.runbook_uri.as_deref() {
            Some(uri) if uri.starts_with("https://") => {}
            Some(uri) => result.error(
                "shutdown.runbook_uri",
                format!("Runbook URI '{uri}' must use https"),
            ),
            None => result.error(
                "shutdown.runbook_uri",
                "A runbook URI is required when shutdown is enabled",
            ),
        }

        if !is_valid_resource_name(&shutdown.automation_account) {
            result.error(
                "shutdown.automation_account",
                format!(
                    "Automation account name '{}' is invalid",
                    shutdown.automation_account
                ),
            );
        }
    }

    /// Validates that every declared resource has a unique, valid name.
    fn validate_unique_names(config: &DeployConfig, result: &mut ValidationResult) {
        let mut seen = HashSet::new();
        for (field, name) in declared_names(config) {
            if !is_valid_resource_name(name) {
                result.error(field.clone(), format!("Resource name '{name}' is invalid"));
            }
            if !seen.insert(name) {
                result.error(field, format!("Duplicate resource name: {name}"));
            }
        }
    }

    /// Validates guardrails.
    fn validate_guardrails(config: &DeployConfig, result: &mut ValidationResult) {
        let Some(guardrails) = &config.guardrails else {
            return;
        };

        let names: HashSet<&str> = declared_names(config).into_iter().map(|(_, n)| n).collect();
        for protected in &guardrails.prevent_destroy {
            if !names.contains(protected.as_str()) {
                result.warnings.push(format!(
                    "guardrails.prevent_destroy names undeclared resource '{protected}'"
                ));
            }
        }

        if guardrails.max_actions == Some(0) {
            result.error("guardrails.max_actions", "max_actions must be at least 1");
        }
    }
}

impl ValidationResult {
    /// Returns true if no errors were found.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }
}

/// Lists every resource name the stack declares, with its field path.
fn declared_names(config: &DeployConfig) -> Vec<(String, &str)> {
    let network = &config.network;
    let mut names = vec![
        (
            String::from("network.virtual_network.name"),
            network.virtual_network.name.as_str(),
        ),
        (String::from("network.subnet.name"), network.subnet.name.as_str()),
        (String::from("network.public_ip.name"), network.public_ip.name.as_str()),
        (
            String::from("network.security_group.name"),
            network.security_group.name.as_str(),
        ),
        (String::from("network.interface.name"), network.interface.name.as_str()),
        (String::from("vm.name"), config.vm.name.as_str()),
    ];

    for (i, disk) in config.disks.iter().enumerate() {
        names.push((format!("disks[{i}].name"), disk.name.as_str()));
    }

    if let Some(script) = &config.startup_script {
        names.push((String::from("startup_script.name"), script.name.as_str()));
    }

    if config.shutdown.enabled {
        names.push((
            String::from("shutdown.automation_account"),
            config.shutdown.automation_account.as_str(),
        ));
        names.push((
            String::from("shutdown.runbook_name"),
            config.shutdown.runbook_name.as_str(),
        ));
    }

    names
}

/// An IPv4 CIDR block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    /// Network address.
    pub network: u32,
    /// Prefix length.
    pub prefix_len: u8,
}

impl Cidr {
    const fn mask(prefix_len: u8) -> u32 {
        if prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - prefix_len)
        }
    }

    /// Returns true if `other` lies entirely within this block.
    #[must_use]
    pub const fn contains(&self, other: &Self) -> bool {
        other.prefix_len >= self.prefix_len
            && (other.network & Self::mask(self.prefix_len)) == self.network
    }
}

/// Parses an IPv4 CIDR block, rejecting host bits outside the prefix.
#[must_use]
pub fn parse_cidr(value: &str) -> Option<Cidr> {
    let (addr, len) = value.split_once('/')?;
    let addr: Ipv4Addr = addr.parse().ok()?;
    let prefix_len: u8 = len.parse().ok()?;
    if prefix_len > 32 {
        return None;
    }

    let network = u32::from(addr);
    if network & !Cidr::mask(prefix_len) != 0 {
        return None;
    }

    Some(Cidr {
        network,
        prefix_len,
    })
}

/// Checks a port specification: `*`, a single port, or `low-high`.
#[must_use]
pub fn is_valid_port_range(value: &str) -> bool {
    if value == "*" {
        return true;
    }

    let parse = |s: &str| s.parse::<u16>().ok().filter(|p| *p > 0);

    match value.split_once('-') {
        Some((low, high)) => matches!((parse(low), parse(high)), (Some(l), Some(h)) if l <= h),
        None => parse(value).is_some(),
    }
}

/// Checks if a project name is valid (lowercase alphanumeric with hyphens).
fn is_valid_project_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-')
}

/// Checks an Azure resource group name.
fn is_valid_resource_group(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 90
        && !name.ends_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '(' | ')'))
}

/// Checks an Azure resource name: 1-80 characters, alphanumeric first,
/// alphanumeric or underscore last, `-_.` allowed in between.
fn is_valid_resource_name(name: &str) -> bool {
    let (Some(first), Some(last)) = (name.chars().next(), name.chars().last()) else {
        return false;
    };

    name.len() <= 80
        && first.is_ascii_alphanumeric()
        && (last.is_ascii_alphanumeric() || last == '_')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;

    fn template() -> DeployConfig {
        ConfigParser::new()
            .parse_yaml(include_str!("../../templates/dcs.deploy.yaml"), None)
            .expect("template parses")
    }

    fn error_fields(config: &DeployConfig) -> Vec<String> {
        ConfigValidator::new()
            .check(config)
            .errors
            .into_iter()
            .map(|e| e.field)
            .collect()
    }

    #[test]
    fn test_template_is_valid() {
        let result = ConfigValidator::new()
            .validate(&template())
            .expect("template validates");
        assert!(result.is_valid());
    }

    #[test]
    fn test_duplicate_priority_rejected() {
        let mut config = template();
        config.network.security_group.rules[1].priority = 1001;

        let fields = error_fields(&config);
        assert!(fields.contains(&String::from("network.security_group.rules[1].priority")));
    }

    #[test]
    fn test_priority_out_of_range() {
        let mut config = template();
        config.network.security_group.rules[0].priority = 50;

        let fields = error_fields(&config);
        assert!(fields.contains(&String::from("network.security_group.rules[0].priority")));
    }

    #[test]
    fn test_unsorted_rules_warn() {
        let mut config = template();
        config.network.security_group.rules.swap(0, 8);

        let result = ConfigValidator::new().check(&config);
        assert!(result.is_valid());
        assert!(result.warnings.iter().any(|w| w.contains("priority order")));
    }

    #[test]
    fn test_subnet_outside_vnet() {
        let mut config = template();
        config.network.subnet.address_prefix = String::from("10.1.1.0/24");

        let fields = error_fields(&config);
        assert!(fields.contains(&String::from("network.subnet.address_prefix")));
    }

    #[test]
    fn test_shared_snapshot_rejected() {
        let mut config = template();
        config.disks[1].snapshot = config.disks[0].snapshot.clone();

        let fields = error_fields(&config);
        assert!(fields.contains(&String::from("disks[1].snapshot")));
    }

    #[test]
    fn test_two_os_disks_rejected() {
        let mut config = template();
        config.disks[1].role = DiskRole::Os;
        config.disks[1].lun = None;

        let fields = error_fields(&config);
        assert!(fields.contains(&String::from("disks")));
    }

    #[test]
    fn test_duplicate_resource_names() {
        let mut config = template();
        config.network.interface.name = config.vm.name.clone();

        let result = ConfigValidator::new().validate(&config);
        assert!(result.is_err());
    }

    #[test]
    fn test_shutdown_requires_runbook() {
        let mut config = template();
        config.shutdown.enabled = true;

        let fields = error_fields(&config);
        assert!(fields.contains(&String::from("shutdown.runbook_uri")));

        config.shutdown.runbook_uri =
            Some(String::from("https://example.blob.core.windows.net/scripts/deleteVm.ps1"));
        assert!(error_fields(&config).is_empty());
    }

    #[test]
    fn test_parse_cidr() {
        let vnet = parse_cidr("10.0.0.0/16").expect("valid");
        let subnet = parse_cidr("10.0.1.0/24").expect("valid");
        assert!(vnet.contains(&subnet));
        assert!(!subnet.contains(&vnet));

        assert!(parse_cidr("10.0.1.5/24").is_none());
        assert!(parse_cidr("10.0.0.0/33").is_none());
        assert!(parse_cidr("10.0.0.0").is_none());
        assert!(parse_cidr("0.0.0.0/0").is_some());
    }

    #[test]
    fn test_port_ranges() {
        assert!(is_valid_port_range("*"));
        assert!(is_valid_port_range("3389"));
        assert!(is_valid_port_range("42674-42675"));
        assert!(!is_valid_port_range("42675-42674"));
        assert!(!is_valid_port_range("0"));
        assert!(!is_valid_port_range("70000"));
        assert!(!is_valid_port_range("tcp"));
    }

    #[test]
    fn test_resource_names() {
        assert!(is_valid_resource_name("dcs-server-vnet"));
        assert!(is_valid_resource_name("osManagedDisk"));
        assert!(!is_valid_resource_name("-leading"));
        assert!(!is_valid_resource_name("trailing-"));
        assert!(!is_valid_resource_name(""));
        assert!(!is_valid_resource_name("has space"));
    }
}
