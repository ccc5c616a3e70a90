//! Configuration parser for loading stack definitions.
//!
//! This module handles loading configuration from YAML files and environment
//! variables, with proper precedence and error handling.

use crate::error::{ConfigError, DeployError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::DeployConfig;

/// Configuration parser for loading stack configuration.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<DeployConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(DeployError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            DeployError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<DeployConfig> {
        debug!("Parsing YAML configuration");

        let config: DeployConfig = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string());
            DeployError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!("Parsed configuration for stack: {}", config.stack_name());
        Ok(config)
    }

    /// Loads configuration with environment variable overrides.
    ///
    /// Environment variables are checked in the format
    /// `DCS_DEPLOY_<SECTION>_<KEY>` (e.g., `DCS_DEPLOY_RESOURCE_GROUP`).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<DeployConfig> {
        let mut config = self.load_file(path)?;
        Self::apply_env_overrides(&mut config);
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(config: &mut DeployConfig) {
        if let Ok(name) = std::env::var("DCS_DEPLOY_PROJECT_NAME") {
            debug!("Overriding project.name from environment");
            config.project.name = name;
        }

        if let Ok(env) = std::env::var("DCS_DEPLOY_ENVIRONMENT") {
            debug!("Overriding project.environment from environment");
            config.project.environment = env;
        }

        if let Ok(group) = std::env::var("DCS_DEPLOY_RESOURCE_GROUP") {
            debug!("Overriding project.resource_group from environment");
            config.project.resource_group = group;
        }

        if let Ok(location) = std::env::var("DCS_DEPLOY_LOCATION") {
            debug!("Overriding project.location from environment");
            config.project.location = location;
        }

        if let Ok(bucket) = std::env::var("DCS_DEPLOY_STATE_BUCKET") {
            debug!("Overriding state.bucket from environment");
            config.state.bucket = Some(bucket);
        }

        if let Ok(prefix) = std::env::var("DCS_DEPLOY_STATE_PREFIX") {
            debug!("Overriding state.prefix from environment");
            config.state.prefix = Some(prefix);
        }
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                DeployError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Reads a required environment variable.
    ///
    /// # Errors
    ///
    /// Returns an error if the variable is not set or empty.
    pub fn required_env(name: &str) -> Result<String> {
        match std::env::var(name) {
            Ok(value) if !value.is_empty() => Ok(value),
            _ => Err(DeployError::Config(ConfigError::MissingEnvVar {
                name: name.to_string(),
            })),
        }
    }

    /// Reads an optional environment variable, treating empty as unset.
    #[must_use]
    pub fn optional_env(name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|v| !v.is_empty())
    }
}

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &[
    "dcs.deploy.yaml",
    "dcs.deploy.yml",
    "deploy.yaml",
    "deploy.yml",
];

/// Finds the configuration file in the given directory or its parents.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(DeployError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DiskRole, IpAllocation, RuleProtocol};

    const TEMPLATE: &str = include_str!("../../templates/dcs.deploy.yaml");

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r#"
project:
  name: test-stack
  resource_group: rg-test
  location: westeurope
network:
  virtual_network: { name: vnet, address_space: ["10.1.0.0/16"] }
  subnet: { name: subnet, address_prefix: 10.1.0.0/24 }
  public_ip: { name: pip }
  security_group: { name: nsg }
  interface: { name: nic }
disks:
  - { name: os, role: os, snapshot: snap-os, size_gb: 128 }
vm:
  name: vm
  size: Standard_B2s
"#;
        let parser = ConfigParser::new();
        let config = parser.parse_yaml(yaml, None).expect("minimal config parses");

        assert_eq!(config.project.environment, "dev");
        assert_eq!(config.network.public_ip.allocation, IpAllocation::Static);
        assert_eq!(config.network.interface.ip_configuration, "ipconfig1");
        assert!(config.startup_script.is_none());
        assert!(!config.shutdown.enabled);
        assert_eq!(config.shutdown.after_hours, 6);
    }

    #[test]
    fn test_parse_shipped_template() {
        let parser = ConfigParser::new();
        let config = parser.parse_yaml(TEMPLATE, None).expect("template parses");

        assert_eq!(config.project.resource_group, "DcsMultiplayerServer");
        assert_eq!(config.project.location, "northcentralus");
        assert_eq!(config.network.security_group.rules.len(), 9);
        assert_eq!(config.disks.len(), 2);

        let os = config.os_disk().expect("os disk declared");
        assert_eq!(os.role, DiskRole::Os);
        assert_eq!(os.snapshot, "dcsOsHdd");
        assert_eq!(os.size_gb, 256);

        let data: Vec<_> = config.data_disks().collect();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].snapshot, "dcsDcsHdd");
        assert_eq!(data[0].size_gb, 1024);

        let rdp = config
            .network
            .security_group
            .rules
            .iter()
            .find(|r| r.name == "rdp-in")
            .expect("rdp rule present");
        assert_eq!(rdp.protocol, RuleProtocol::Tcp);
        assert_eq!(rdp.port, "3389");

        let script = config.startup_script.expect("startup script present");
        assert!(script.command.starts_with("powershell -Command"));
        assert!(script.command.contains(r"F:\DCS-SimpleRadio-Standalone\SR-Server.exe"));
        assert!(script.command.contains(r"C:\link-srs-to-dcs.ps1"));
    }

    #[test]
    fn test_parse_error_reports_location() {
        let parser = ConfigParser::new();
        let err = parser
            .parse_yaml("project: [", Some(Path::new("broken.yaml")))
            .expect_err("invalid yaml");

        match err {
            DeployError::Config(ConfigError::ParseError { location, .. }) => {
                assert_eq!(location.as_deref(), Some("broken.yaml"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_find_config_file_walks_up() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).expect("create nested");
        std::fs::write(dir.path().join("dcs.deploy.yaml"), TEMPLATE).expect("write config");

        let found = find_config_file(&nested).expect("config found");
        assert_eq!(found, dir.path().join("dcs.deploy.yaml"));
    }
}
