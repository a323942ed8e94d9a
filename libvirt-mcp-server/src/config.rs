//! Configuration for the server.
//!
//! Precedence, lowest first: defaults, YAML file, environment, CLI flags.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use libvirt_mcp_hypervisor::operations::{default_allowed_operations, AllowList};
use libvirt_mcp_hypervisor::{ConnectionSettings, DEFAULT_IMAGES_DIR};

use crate::cli::Args;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/libvirt-mcp/config.yaml";

/// Main configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub libvirt: LibvirtConfig,
    pub security: SecurityConfig,
    pub logging: LoggingConfig,
    pub storage: StorageConfig,
}

/// Hypervisor connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LibvirtConfig {
    pub uri: String,
    /// Connection timeout in seconds (1-300)
    pub timeout_secs: u64,
    pub readonly: bool,
}

impl Default for LibvirtConfig {
    fn default() -> Self {
        Self {
            uri: "qemu:///system".to_string(),
            timeout_secs: 30,
            readonly: false,
        }
    }
}

/// Policy applied to every operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Reported in the security summary. The stdio transport carries no
    /// credentials, so callers are identified but not authenticated.
    pub auth_required: bool,
    pub allowed_operations: Vec<String>,
    /// Record completed operations in the audit trail
    pub audit_log: bool,
    /// In-flight operations per (user, operation) per window (1-100)
    pub max_concurrent_ops: u32,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            auth_required: true,
            allowed_operations: default_allowed_operations(),
            audit_log: true,
            max_concurrent_ops: 10,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    /// Daily-rotated JSON log file, in addition to stderr
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for generated disk image paths
    pub images_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            images_dir: DEFAULT_IMAGES_DIR.to_string(),
        }
    }
}

/// Configuration errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Missing required operations: {0:?}")]
    MissingOperations(Vec<String>),
}

impl ConfigError {
    fn invalid(field: &str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| "Failed to parse config file")?;

        Ok(config)
    }

    /// Explicit path must exist; otherwise the default location is tried
    /// and built-in defaults are used when it is absent.
    pub fn resolve(path: Option<&str>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => Self::load(DEFAULT_CONFIG_PATH),
            None => Ok(Self::default()),
        }
    }

    /// Apply overrides from process environment variables.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any variable lookup.
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(uri) = lookup("LIBVIRT_URI") {
            self.libvirt.uri = uri;
        }
        if let Some(timeout) = lookup("LIBVIRT_TIMEOUT") {
            self.libvirt.timeout_secs = timeout
                .trim()
                .parse()
                .map_err(|_| ConfigError::invalid("LIBVIRT_TIMEOUT", format!("not a number: {}", timeout)))?;
        }
        if let Some(value) = lookup("LIBVIRT_READONLY") {
            self.libvirt.readonly = parse_bool("LIBVIRT_READONLY", &value)?;
        }
        if let Some(value) = lookup("MCP_AUDIT_LOG") {
            self.security.audit_log = parse_bool("MCP_AUDIT_LOG", &value)?;
        }
        if let Some(value) = lookup("MCP_AUTH_REQUIRED") {
            self.security.auth_required = parse_bool("MCP_AUTH_REQUIRED", &value)?;
        }
        if let Some(level) = lookup("MCP_LOG_LEVEL") {
            self.logging.level = level.to_lowercase();
        }
        if let Some(file) = lookup("MCP_LOG_FILE") {
            self.logging.file = Some(file).filter(|f| !f.is_empty());
        }
        Ok(self)
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref level) = args.log_level {
            self.logging.level = level.to_lowercase();
        }

        if let Some(ref uri) = args.libvirt_uri {
            self.libvirt.uri = uri.clone();
        }

        if args.readonly {
            self.libvirt.readonly = true;
        }

        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.libvirt.uri.trim().is_empty() {
            return Err(ConfigError::invalid("libvirt.uri", "must not be empty"));
        }

        if !(1..=300).contains(&self.libvirt.timeout_secs) {
            return Err(ConfigError::invalid("libvirt.timeout_secs", "must be between 1 and 300"));
        }

        if !(1..=100).contains(&self.security.max_concurrent_ops) {
            return Err(ConfigError::invalid(
                "security.max_concurrent_ops",
                "must be between 1 and 100",
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::invalid(
                "logging.level",
                format!("must be one of: {:?}", valid_levels),
            ));
        }

        let missing = self.allow_list().missing_required();
        if !missing.is_empty() {
            return Err(ConfigError::MissingOperations(
                missing.into_iter().map(String::from).collect(),
            ));
        }

        Ok(())
    }

    pub fn allow_list(&self) -> AllowList {
        AllowList::new(self.security.allowed_operations.iter().cloned())
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            uri: self.libvirt.uri.clone(),
            readonly: self.libvirt.readonly,
            timeout: Duration::from_secs(self.libvirt.timeout_secs),
        }
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize configuration")
    }
}

fn parse_bool(field: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::invalid(field, format!("not a boolean: {}", value))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.libvirt.uri, "qemu:///system");
        assert_eq!(config.libvirt.timeout_secs, 30);
        assert_eq!(config.security.max_concurrent_ops, 10);
        assert!(config.security.audit_log);
        assert!(config.allow_list().is_allowed("domain.list"));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("LIBVIRT_URI", "qemu+ssh://admin@host/system"),
            ("LIBVIRT_TIMEOUT", "60"),
            ("LIBVIRT_READONLY", "yes"),
            ("MCP_AUDIT_LOG", "false"),
            ("MCP_LOG_LEVEL", "DEBUG"),
        ]
        .into_iter()
        .collect();

        let config = Config::default()
            .with_overrides_from(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.libvirt.uri, "qemu+ssh://admin@host/system");
        assert_eq!(config.libvirt.timeout_secs, 60);
        assert!(config.libvirt.readonly);
        assert!(!config.security.audit_log);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_env_rejects_garbage() {
        let result = Config::default().with_overrides_from(|k| {
            (k == "LIBVIRT_TIMEOUT").then(|| "soon".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_overrides_env() {
        let args = Args {
            libvirt_uri: Some("test:///default".to_string()),
            log_level: Some("warn".to_string()),
            ..Default::default()
        };
        let config = Config::default()
            .with_overrides_from(|k| (k == "LIBVIRT_URI").then(|| "qemu:///session".to_string()))
            .unwrap()
            .with_cli_overrides(&args);

        assert_eq!(config.libvirt.uri, "test:///default");
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn test_validation_bounds() {
        let mut config = Config::default();
        config.libvirt.timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.libvirt.timeout_secs = 301;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.security.max_concurrent_ops = 101;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_required_operations() {
        let mut config = Config::default();
        config.security.allowed_operations = vec!["domain.list".to_string()];
        assert_eq!(
            config.validate(),
            Err(ConfigError::MissingOperations(vec!["domain.info".to_string()]))
        );
    }

    #[test]
    fn test_yaml_roundtrip_of_defaults() {
        let yaml = Config::default().to_yaml().unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, Config::default());
    }
}
