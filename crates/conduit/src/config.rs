//! Configuration management for the Conduit server.
//!
//! This module handles loading, validation, and conversion of server
//! configuration from TOML files. A missing file is created with defaults.

use anyhow::Context;
use conduit_server::ServerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Application configuration loaded from TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Listener and connection settings
    pub server: ServerSettings,
    /// Scheduler queue and worker settings
    #[serde(default)]
    pub dispatch: DispatchSettings,
    /// Logging configuration settings
    pub logging: LoggingSettings,
}

/// Listener and per-connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Network address to bind the server to (e.g., "127.0.0.1:8080")
    pub bind_address: String,
    /// Maximum number of concurrent client connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Largest accepted message in bytes
    #[serde(default = "default_receive_buffer_size")]
    pub receive_buffer_size: usize,
    /// How long teardown waits for the peer's close handshake
    #[serde(default = "default_close_timeout")]
    pub close_timeout_ms: u64,
    /// Drop undecodable messages instead of closing the connection
    #[serde(default)]
    pub skip_malformed_messages: bool,
    /// Server tick interval in milliseconds (0 to disable)
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
}

/// Scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSettings {
    /// Capacity of the global input queue
    pub input_queue_capacity: usize,
    /// Capacity of each output partition queue
    pub output_queue_capacity: usize,
    /// Number of output partitions; 0 means one per CPU
    pub output_workers: usize,
    pub dequeue_timeout_ms: u64,
    pub delivery_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
}

/// Logging configuration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Emit JSON instead of human-readable lines
    #[serde(default)]
    pub json_format: bool,
}

fn default_max_connections() -> usize {
    1000
}

fn default_receive_buffer_size() -> usize {
    64 * 1024
}

fn default_close_timeout() -> u64 {
    2_000
}

fn default_tick_interval() -> u64 {
    1_000
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            input_queue_capacity: 500,
            output_queue_capacity: 500,
            output_workers: 0,
            dequeue_timeout_ms: 100,
            delivery_timeout_ms: 5_000,
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                bind_address: "127.0.0.1:8080".to_string(),
                max_connections: default_max_connections(),
                receive_buffer_size: default_receive_buffer_size(),
                close_timeout_ms: default_close_timeout(),
                skip_malformed_messages: false,
                tick_interval_ms: default_tick_interval(),
            },
            dispatch: DispatchSettings::default(),
            logging: LoggingSettings {
                level: "info".to_string(),
                json_format: false,
            },
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file, writing the defaults to `path`
    /// first if it does not exist.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// The loaded or default configuration.
    pub async fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let config: AppConfig =
                toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
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

    /// Converts into the flat configuration the server core consumes.
    pub fn to_server_config(&self) -> anyhow::Result<ServerConfig> {
        let defaults = ServerConfig::default();
        let output_workers = match self.dispatch.output_workers {
            0 => defaults.output_workers,
            n => n,
        };

        Ok(ServerConfig {
            bind_address: self
                .server
                .bind_address
                .parse()
                .with_context(|| format!("invalid bind address {}", self.server.bind_address))?,
            max_connections: self.server.max_connections,
            receive_buffer_size: self.server.receive_buffer_size,
            input_queue_capacity: self.dispatch.input_queue_capacity,
            output_queue_capacity: self.dispatch.output_queue_capacity,
            output_workers,
            dequeue_timeout_ms: self.dispatch.dequeue_timeout_ms,
            delivery_timeout_ms: self.dispatch.delivery_timeout_ms,
            shutdown_timeout_ms: self.dispatch.shutdown_timeout_ms,
            close_timeout_ms: self.server.close_timeout_ms,
            tick_interval_ms: self.server.tick_interval_ms,
            skip_malformed_messages: self.server.skip_malformed_messages,
        })
    }

    /// Validates the configuration for consistency and correctness.
    ///
    /// # Returns
    ///
    /// `Ok(())` if the configuration is valid, or an error string describing the issue.
    pub fn validate(&self) -> Result<(), String> {
        if self.server.bind_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(format!("Invalid bind address: {}", &self.server.bind_address));
        }

        if self.server.max_connections == 0 {
            return Err("max_connections must be greater than 0".to_string());
        }
        if self.server.receive_buffer_size == 0 {
            return Err("receive_buffer_size must be greater than 0".to_string());
        }
        if self.dispatch.input_queue_capacity == 0 || self.dispatch.output_queue_capacity == 0 {
            return Err("Queue capacities must be greater than 0".to_string());
        }
        if self.dispatch.dequeue_timeout_ms == 0 {
            return Err("dequeue_timeout_ms must be greater than 0".to_string());
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
