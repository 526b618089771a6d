//! Configuration management for the connect gateway.
//!
//! This module handles loading, validation, and conversion of the gateway
//! configuration from TOML files.

use anyhow::Context;
use connect_server::config::DEFAULT_CLIENT_LISTENER_PORT;
use connect_server::ConnectServerConfig;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Application configuration loaded from TOML file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// Listener and session settings
    #[serde(default)]
    pub server: ServerSettings,
    /// Logging configuration settings
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Client listener and session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Interface the client listener binds to (e.g., "0.0.0.0")
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Port the client listener binds to
    #[serde(default = "default_client_listener_port")]
    pub client_listener_port: u16,
    /// Pending connection queue length
    #[serde(default = "default_listener_backlog")]
    pub listener_backlog: u32,
    /// Session idle timeout in seconds (0 to disable)
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Maximum bytes delivered by a single receive
    #[serde(default = "default_maximum_receive_size")]
    pub maximum_receive_size: usize,
    /// Maximum number of concurrent client sessions
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Client addresses refused at accept time
    #[serde(default)]
    pub blocked_addresses: Vec<String>,
    /// Seconds to wait for sessions to drain on shutdown
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period: u64,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_client_listener_port() -> u16 {
    DEFAULT_CLIENT_LISTENER_PORT
}

fn default_listener_backlog() -> u32 {
    1000
}

fn default_timeout() -> u64 {
    60
}

fn default_maximum_receive_size() -> usize {
    6
}

fn default_max_connections() -> usize {
    10_000
}

fn default_shutdown_grace_period() -> u64 {
    5
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            client_listener_port: default_client_listener_port(),
            listener_backlog: default_listener_backlog(),
            timeout: default_timeout(),
            maximum_receive_size: default_maximum_receive_size(),
            max_connections: default_max_connections(),
            blocked_addresses: Vec::new(),
            shutdown_grace_period: default_shutdown_grace_period(),
        }
    }
}

/// Logging system configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Whether to output logs in JSON format
    #[serde(default)]
    pub json_format: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, a default configuration file is written at
    /// that path and the defaults are returned.
    pub async fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let config: AppConfig = toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Converts the file settings into the connect server core configuration.
    pub fn to_server_config(&self) -> ConnectServerConfig {
        ConnectServerConfig {
            client_listener_port: self.server.client_listener_port,
            listener_backlog: self.server.listener_backlog,
            timeout: Duration::from_secs(self.server.timeout),
            maximum_receive_size: self.server.maximum_receive_size,
            max_connections: self.server.max_connections,
        }
    }

    /// The parsed listener interface.
    pub fn bind_ip(&self) -> anyhow::Result<IpAddr> {
        self.server
            .bind_address
            .parse()
            .with_context(|| format!("invalid bind address {}", self.server.bind_address))
    }

    /// The parsed blocklist.
    pub fn blocked_ips(&self) -> anyhow::Result<Vec<IpAddr>> {
        self.server
            .blocked_addresses
            .iter()
            .map(|address| {
                address
                    .parse()
                    .with_context(|| format!("invalid blocked address {address}"))
            })
            .collect()
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_grace_period)
    }

    /// Validates the configuration for consistency and correctness.
    ///
    /// # Returns
    ///
    /// `Ok(())` if the configuration is valid, or an error string describing the issue.
    pub fn validate(&self) -> Result<(), String> {
        if self.server.bind_address.parse::<IpAddr>().is_err() {
            return Err(format!("Invalid bind address: {}", &self.server.bind_address));
        }

        if self.server.listener_backlog == 0 {
            return Err("Listener backlog must be greater than zero".to_string());
        }

        if self.server.maximum_receive_size == 0 {
            return Err("Maximum receive size must be greater than zero".to_string());
        }

        if let Some(address) = self
            .server
            .blocked_addresses
            .iter()
            .find(|address| address.parse::<IpAddr>().is_err())
        {
            return Err(format!("Invalid blocked address: {address}"));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, NamedTempFile};

    #[test]
    fn test_app_config_default() {
        let config = AppConfig::default();

        assert_eq!(config.server.bind_address, "0.0.0.0");
        assert_eq!(config.server.client_listener_port, 44405);
        assert_eq!(config.server.listener_backlog, 1000);
        assert_eq!(config.server.timeout, 60);
        assert_eq!(config.server.maximum_receive_size, 6);
        assert!(config.server.blocked_addresses.is_empty());
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json_format);
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_load_from_nonexistent_file_creates_it() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gateway.toml");

        let config = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(config.server.client_listener_port, 44405);
        assert!(path.exists());

        let written = tokio::fs::read_to_string(&path).await.unwrap();
        let reparsed: AppConfig = toml::from_str(&written).unwrap();
        assert_eq!(reparsed.server.listener_backlog, config.server.listener_backlog);
    }

    #[tokio::test]
    async fn test_load_from_existing_file() {
        let file = NamedTempFile::new().unwrap();
        let toml_content = r#"
[server]
bind_address = "127.0.0.1"
client_listener_port = 55901
timeout = 0
blocked_addresses = ["10.1.2.3"]

[logging]
level = "debug"
json_format = true
"#;
        tokio::fs::write(file.path(), toml_content).await.unwrap();

        let config = AppConfig::load_from_file(file.path()).await.unwrap();
        assert_eq!(config.server.bind_address, "127.0.0.1");
        assert_eq!(config.server.client_listener_port, 55901);
        assert_eq!(config.server.listener_backlog, 1000);
        assert_eq!(config.server.timeout, 0);
        assert_eq!(config.blocked_ips().unwrap(), vec!["10.1.2.3".parse::<IpAddr>().unwrap()]);
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json_format);
    }

    #[tokio::test]
    async fn test_load_from_malformed_file() {
        let file = NamedTempFile::new().unwrap();
        tokio::fs::write(file.path(), "[server\nport = ").await.unwrap();

        assert!(AppConfig::load_from_file(file.path()).await.is_err());
    }

    #[test]
    fn test_to_server_config_conversion() {
        let mut config = AppConfig::default();
        config.server.client_listener_port = 44406;
        config.server.timeout = 90;
        config.server.maximum_receive_size = 16;
        config.server.max_connections = 50;

        let server_config = config.to_server_config();
        assert_eq!(server_config.client_listener_port, 44406);
        assert_eq!(server_config.listener_backlog, 1000);
        assert_eq!(server_config.timeout, Duration::from_secs(90));
        assert_eq!(server_config.maximum_receive_size, 16);
        assert_eq!(server_config.max_connections, 50);
    }

    #[test]
    fn test_validation_invalid_bind_address() {
        let mut config = AppConfig::default();
        config.server.bind_address = "0.0.0.0:44405".to_string();

        let result = config.validate();
        assert!(result.unwrap_err().contains("Invalid bind address"));
        assert!(config.bind_ip().is_err());
    }

    #[test]
    fn test_validation_zero_limits() {
        let mut config = AppConfig::default();
        config.server.listener_backlog = 0;
        assert!(config.validate().unwrap_err().contains("backlog"));

        config.server.listener_backlog = 10;
        config.server.maximum_receive_size = 0;
        assert!(config.validate().unwrap_err().contains("receive size"));
    }

    #[test]
    fn test_validation_invalid_blocked_address() {
        let mut config = AppConfig::default();
        config.server.blocked_addresses = vec!["192.168.0.1".to_string(), "not-an-ip".to_string()];

        assert!(config.validate().unwrap_err().contains("not-an-ip"));
    }

    #[test]
    fn test_validation_log_levels() {
        let mut config = AppConfig::default();
        for level in ["trace", "debug", "info", "warn", "error"] {
            config.logging.level = level.to_string();
            assert!(config.validate().is_ok(), "level {level} should be valid");
        }

        config.logging.level = "verbose".to_string();
        assert!(config.validate().unwrap_err().contains("Invalid log level"));
    }
}
