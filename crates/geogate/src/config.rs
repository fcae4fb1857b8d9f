//! Configuration management for GeoGate.
//!
//! This module handles loading and validation of the gate configuration from
//! TOML files. The `[rules]` table is the reloadable part: the config watcher
//! re-reads the file and installs new rules without a restart.

use access_filter::{FilterConfig, RuleConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

fn default_bind_address() -> String {
    "0.0.0.0:7777".to_string()
}

fn default_upstream_address() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_max_connections() -> usize {
    1000
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_database_path() -> Option<PathBuf> {
    Some(PathBuf::from("GeoLite2-Country.mmdb"))
}

fn default_watch_interval() -> u64 {
    5
}

fn default_block_log_path() -> Option<PathBuf> {
    Some(PathBuf::from("blocked.log"))
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Application configuration loaded from TOML file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Listener and relay settings
    #[serde(default)]
    pub gate: GateSettings,
    /// Access filter runtime settings
    #[serde(default)]
    pub filter: FilterConfig,
    /// Reloadable access rules
    #[serde(default)]
    pub rules: RuleConfig,
    /// Geolocation database settings
    #[serde(default)]
    pub database: DatabaseSettings,
    /// Block log settings
    #[serde(default)]
    pub audit: AuditSettings,
    /// Logging configuration settings
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Listener and relay settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateSettings {
    /// Address players connect to (e.g., "0.0.0.0:7777")
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Game server allowed connections are relayed to
    #[serde(default = "default_upstream_address")]
    pub upstream_address: String,
    /// Maximum number of concurrently relayed connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Upstream connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            upstream_address: default_upstream_address(),
            max_connections: default_max_connections(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

/// Geolocation database settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// MaxMind `.mmdb` file or `network,country` CSV table
    #[serde(default = "default_database_path")]
    pub path: Option<PathBuf>,
    /// How often the config and database files are checked for changes, in seconds (0 disables)
    #[serde(default = "default_watch_interval")]
    pub watch_interval_secs: u64,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            watch_interval_secs: default_watch_interval(),
        }
    }
}

/// Block log settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditSettings {
    /// Append-only file of blocked connections (None disables it)
    #[serde(default = "default_block_log_path")]
    pub block_log_path: Option<PathBuf>,
    /// Log a line for every blocked connection
    #[serde(default = "default_true")]
    pub log_blocked: bool,
    /// Log a line for every allowed connection
    #[serde(default)]
    pub log_allowed: bool,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            block_log_path: default_block_log_path(),
            log_blocked: true,
            log_allowed: false,
        }
    }
}

/// Logging system configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Whether to output logs in JSON format
    #[serde(default)]
    pub json_format: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, creates a default configuration file at the
    /// specified path and returns the default configuration.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// The loaded or default configuration, or an error if the file could not
    /// be read, parsed or created.
    pub async fn load_from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            Ok(Self::parse(&content)?)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content).await?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Parses configuration text.
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.gate.bind_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(format!("Invalid bind address: {}", &self.gate.bind_address));
        }

        if self.gate.upstream_address.trim().is_empty() {
            return Err("Upstream address cannot be empty".to_string());
        }

        if self.gate.max_connections == 0 {
            return Err("gate.max_connections must be greater than 0".to_string());
        }

        if self.gate.connect_timeout == 0 {
            return Err("gate.connect_timeout must be greater than 0".to_string());
        }

        self.filter.validate()?;

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
