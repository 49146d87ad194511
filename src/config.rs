//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `relay.toml`.
//!     loads configuration from file or falls back to defaults.
//!
//! structure:
//!     - ServerConfig: Listen address for the http/sse server.
//!     - StorageConfig: Sqlite database and plain-text trace locations.
//!     - BroadcastConfig: Per-observer queue depth and sse keep-alive.
//!     - ReadingsConfig: Bounds for the recent readings query.
//!     - OperatorConfig: Placeholder user ids.
//!     - LoggingConfig: Log level and sensor echo.
//!
//! every section has defaults, so a partial file is fine.
//!
//! ==============================================================================

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct RelayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub readings: ReadingsConfig,
    #[serde(default)]
    pub operator: OperatorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
    pub trace_path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BroadcastConfig {
    /// events queued per observer before new ones are dropped for it
    pub observer_buffer: usize,
    pub keep_alive_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ReadingsConfig {
    pub default_limit: usize,
    pub max_limit: usize,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct OperatorConfig {
    /// used for manual saves when no operator was set
    pub default_user: String,
    /// used for device pushes that carry no user
    pub device_user: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub show_sensor_data: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: "0.0.0.0:3000".to_string() }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data").join("registros.db"),
            trace_path: PathBuf::from("data").join("registros_alcohol.txt"),
        }
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self { observer_buffer: 64, keep_alive_seconds: 15 }
    }
}

impl Default for ReadingsConfig {
    fn default() -> Self {
        Self { default_limit: 1000, max_limit: 1000 }
    }
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            default_user: "USUARIO_01".to_string(),
            device_user: "ESP32".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), show_sensor_data: true }
    }
}

impl ReadingsConfig {
    /// requested limit, defaulted and capped
    pub fn clamp(&self, requested: Option<usize>) -> usize {
        requested.unwrap_or(self.default_limit).min(self.max_limit)
    }
}

impl RelayConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow::anyhow!("Failed to read config file: {}", e))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))
    }

    /// Load with default fallback
    pub fn load_or_default() -> Self {
        let paths = [
            PathBuf::from("config").join("relay.toml"),
            PathBuf::from("..").join("config").join("relay.toml"),
        ];

        for path in &paths {
            if path.exists() {
                match Self::load(path) {
                    Ok(config) => {
                        println!("[CONFIG] Loaded from {}", path.display());
                        return config;
                    }
                    Err(e) => {
                        println!("[CONFIG] Warning: Failed to load {}: {}", path.display(), e);
                    }
                }
            }
        }

        println!("[CONFIG] Warning: No config file found - using defaults");
        Self::default()
    }

    /// Print configuration summary
    pub fn print_summary(&self) {
        println!("┌─────────────────────────────────────────┐");
        println!("│          RELAY CONFIGURATION            │");
        println!("├─────────────────────────────────────────┤");
        println!("│ Bind: {}", self.server.bind);
        println!("│ Database: {}", self.storage.db_path.display());
        println!("│ Trace: {}", self.storage.trace_path.display());
        println!("│ Observer Buffer: {}", self.broadcast.observer_buffer);
        println!("│ Log Level: {}", self.logging.level);
        println!("└─────────────────────────────────────────┘");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = RelayConfig::parse(
            r#"
            [server]
            bind = "127.0.0.1:8080"

            [broadcast]
            observer_buffer = 8
            "#,
        )
        .unwrap();

        assert_eq!(config.server.bind, "127.0.0.1:8080");
        assert_eq!(config.broadcast.observer_buffer, 8);
        assert_eq!(config.broadcast.keep_alive_seconds, 15);
        assert_eq!(config.operator, OperatorConfig::default());
        assert_eq!(config.readings.max_limit, 1000);
    }

    #[test]
    fn test_bad_toml_is_an_error() {
        assert!(RelayConfig::parse("[server\nbind = 1").is_err());
    }

    #[test]
    fn test_limit_clamp() {
        let readings = ReadingsConfig { default_limit: 50, max_limit: 100 };
        assert_eq!(readings.clamp(None), 50);
        assert_eq!(readings.clamp(Some(10)), 10);
        assert_eq!(readings.clamp(Some(5000)), 100);
    }
}
