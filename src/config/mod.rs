//! Configuration module for the DCS server deployment tool.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `dcs.deploy.yaml`
//! - Validation of configuration values
//! - Computing configuration hashes for change detection

mod spec;
mod parser;
mod validator;
mod hash;

pub use spec::{
    AdminConfig, Caching, DeployConfig, DiskConfig, DiskRole, DiskSku, GuardrailsConfig,
    InterfaceConfig, IpAllocation, NetworkConfig, OsType, ProjectConfig, PublicIpConfig,
    PublicIpSku, RuleAccess, RuleDirection, RuleProtocol, SecurityGroupConfig,
    SecurityRuleConfig, ShutdownConfig, StartupScriptConfig, StateBackend, StateConfig,
    SubnetConfig, VirtualNetworkConfig, VmConfig,
};
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, find_config_file};
pub use validator::{
    Cidr, ConfigValidator, ValidationError, ValidationResult, is_valid_port_range, parse_cidr,
};
pub use hash::ConfigHasher;
