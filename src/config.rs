//! # Configuration Management
//!
//! Centralized configuration for the clustering proxy.
//!
//! This module provides structured configuration for the client-facing
//! listener, the upstream broker connection, framing limits and logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment-specific overrides via `from_env()`
//!
//! ## Notes
//! - `broker.max_in_flight_messages` bounds the identifier space the proxy
//!   allocates from; the MQTT identifier field caps it at 65,535
//! - A short handshake timeout keeps idle sockets from pinning resources

use crate::core::message::MAX_REMAINING_LENGTH;
use crate::error::{ProtocolError, Result};
use crate::utils::logging::Severity;
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

/// Default upper bound on broker message identifiers in use at once
pub const DEFAULT_MAX_IN_FLIGHT: u16 = u16::MAX;

/// Main proxy configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ProxyConfig {
    /// Client-facing listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Upstream broker configuration
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Framing configuration
    #[serde(default)]
    pub transport: TransportConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ProxyConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("MQTT_PROXY_SERVER_ADDRESS") {
            config.server.address = addr;
        }

        if let Ok(addr) = std::env::var("MQTT_PROXY_BROKER_ADDRESS") {
            config.broker.address = addr;
        }

        if let Ok(max) = std::env::var("MQTT_PROXY_MAX_IN_FLIGHT") {
            config.broker.max_in_flight_messages = max.parse::<u16>().map_err(|_| {
                ProtocolError::ConfigError(format!(
                    "MQTT_PROXY_MAX_IN_FLIGHT must be an integer in 1..=65535, got '{max}'"
                ))
            })?;
        }

        if let Ok(timeout) = std::env::var("MQTT_PROXY_HANDSHAKE_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.server.handshake_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(level) = std::env::var("MQTT_PROXY_LOG_LEVEL") {
            config.logging.log_level = level
                .parse::<Severity>()
                .map_err(|e| ProtocolError::ConfigError(format!("MQTT_PROXY_LOG_LEVEL: {e}")))?;
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.broker.validate());
        errors.extend(self.transport.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

fn validate_address(errors: &mut Vec<String>, label: &str, address: &str) {
    if address.is_empty() {
        errors.push(format!("{label} address cannot be empty"));
    } else if address.parse::<std::net::SocketAddr>().is_err() {
        errors.push(format!(
            "Invalid {} address format: '{}' (expected format: '0.0.0.0:1883')",
            label.to_lowercase(),
            address
        ));
    }
}

/// Client-facing listener configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Listen address (e.g., "0.0.0.0:1883")
    pub address: String,

    /// Maximum number of concurrent client connections
    pub max_connections: usize,

    /// Time a new connection has to deliver its CONNECT
    #[serde(with = "duration_serde")]
    pub handshake_timeout: Duration,

    /// Timeout for graceful server shutdown
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:1883"),
            max_connections: 10_000,
            handshake_timeout: timeout::HANDSHAKE_TIMEOUT,
            shutdown_timeout: timeout::SHUTDOWN_TIMEOUT,
        }
    }
}

impl ServerConfig {
    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        validate_address(&mut errors, "Server", &self.address);

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        } else if self.max_connections > 1_000_000 {
            errors.push(format!(
                "Max connections very high: {} (ensure system resources can support this)",
                self.max_connections
            ));
        }

        if self.handshake_timeout.as_millis() < 100 {
            errors.push("Handshake timeout too short (minimum: 100ms)".to_string());
        } else if self.handshake_timeout.as_secs() > 300 {
            errors.push("Handshake timeout too long (maximum: 300s)".to_string());
        }

        if self.shutdown_timeout.as_secs() < 1 {
            errors.push("Shutdown timeout too short (minimum: 1s)".to_string());
        } else if self.shutdown_timeout.as_secs() > 60 {
            errors.push("Shutdown timeout too long (maximum: 60s)".to_string());
        }

        errors
    }
}

/// Upstream broker configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerConfig {
    /// Broker address (e.g., "10.0.0.5:1883")
    pub address: String,

    /// Upper bound on broker message identifiers in use at once per session
    pub max_in_flight_messages: u16,

    /// Timeout for establishing the broker connection
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:1884"),
            max_in_flight_messages: DEFAULT_MAX_IN_FLIGHT,
            connect_timeout: timeout::CONNECT_TIMEOUT,
        }
    }
}

impl BrokerConfig {
    /// Validate broker configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        validate_address(&mut errors, "Broker", &self.address);

        if self.max_in_flight_messages == 0 {
            errors.push("Max in-flight messages must be greater than 0".to_string());
        }

        if self.connect_timeout.as_millis() < 100 {
            errors.push("Broker connect timeout too short (minimum: 100ms)".to_string());
        } else if self.connect_timeout.as_secs() > 300 {
            errors.push("Broker connect timeout too long (maximum: 300s)".to_string());
        }

        errors
    }
}

/// Framing configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Largest remaining length accepted from a peer
    pub max_remaining_length: usize,

    /// Whether the broker connection sends PINGREQ when idle for the
    /// keep-alive interval of the session's CONNECT
    pub broker_keep_alive: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_remaining_length: MAX_REMAINING_LENGTH,
            broker_keep_alive: true,
        }
    }
}

impl TransportConfig {
    /// Validate transport configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_remaining_length == 0 {
            errors.push("Max remaining length cannot be 0".to_string());
        } else if self.max_remaining_length > MAX_REMAINING_LENGTH {
            errors.push(format!(
                "Max remaining length too large: {} (protocol maximum: {})",
                self.max_remaining_length, MAX_REMAINING_LENGTH
            ));
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Lowest severity that is emitted
    pub log_level: Severity,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("mqtt-cluster-proxy"),
            log_level: Severity::Info,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Durations are written as whole milliseconds
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
