//! Integration tests for configuration validation

#![allow(clippy::expect_used)]

use mqtt_cluster_proxy::config::{
    BrokerConfig, LoggingConfig, ProxyConfig, ServerConfig, TransportConfig,
};
use mqtt_cluster_proxy::core::message::MAX_REMAINING_LENGTH;
use mqtt_cluster_proxy::utils::logging::Severity;
use std::time::Duration;

#[test]
fn test_default_config_validates() {
    let config = ProxyConfig::default();
    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Default config should be valid, but got errors: {:?}",
        errors
    );
}

#[test]
fn test_invalid_server_address() {
    let mut config = ProxyConfig::default();
    config.server.address = "invalid_address".to_string();

    let errors = config.validate();
    assert!(!errors.is_empty(), "Should have validation errors");
    assert!(errors.iter().any(|e| e.contains("Invalid server address")));
}

#[test]
fn test_empty_server_address() {
    let mut config = ProxyConfig::default();
    config.server.address = String::new();

    let errors = config.validate();
    assert!(!errors.is_empty());
    assert!(errors.iter().any(|e| e.contains("cannot be empty")));
}

#[test]
fn test_invalid_broker_address() {
    let mut config = ProxyConfig::default();
    config.broker.address = "broker.local".to_string();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Invalid broker address")));
}

#[test]
fn test_zero_max_connections() {
    let mut config = ProxyConfig::default();
    config.server.max_connections = 0;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Max connections must be greater than 0")));
}

#[test]
fn test_high_max_connections_warning() {
    let mut config = ProxyConfig::default();
    config.server.max_connections = 2_000_000;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Max connections very high")));
}

#[test]
fn test_short_handshake_timeout() {
    let mut config = ProxyConfig::default();
    config.server.handshake_timeout = Duration::from_millis(50);

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Handshake timeout too short")));
}

#[test]
fn test_long_shutdown_timeout() {
    let mut config = ProxyConfig::default();
    config.server.shutdown_timeout = Duration::from_secs(120);

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Shutdown timeout too long")));
}

#[test]
fn test_zero_max_in_flight() {
    let mut config = ProxyConfig::default();
    config.broker.max_in_flight_messages = 0;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Max in-flight messages must be greater than 0")));
}

#[test]
fn test_short_broker_connect_timeout() {
    let mut config = ProxyConfig::default();
    config.broker.connect_timeout = Duration::from_millis(10);

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Broker connect timeout too short")));
}

#[test]
fn test_zero_max_remaining_length() {
    let mut config = ProxyConfig::default();
    config.transport.max_remaining_length = 0;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Max remaining length cannot be 0")));
}

#[test]
fn test_excessive_max_remaining_length() {
    let mut config = ProxyConfig::default();
    config.transport.max_remaining_length = MAX_REMAINING_LENGTH + 1;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Max remaining length too large")));
}

#[test]
fn test_empty_app_name() {
    let mut config = ProxyConfig::default();
    config.logging.app_name = String::new();

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Application name cannot be empty")));
}

#[test]
fn test_long_app_name() {
    let mut config = ProxyConfig::default();
    config.logging.app_name = "x".repeat(65);

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Application name too long")));
}

#[test]
fn test_log_to_file_without_path() {
    let mut config = ProxyConfig::default();
    config.logging.log_to_file = true;
    config.logging.log_file_path = None;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("log_file_path must be specified")));
}

#[test]
fn test_no_logging_outputs() {
    let mut config = ProxyConfig::default();
    config.logging.log_to_console = false;
    config.logging.log_to_file = false;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("At least one logging output")));
}

#[test]
fn test_validate_strict_with_valid_config() {
    assert!(ProxyConfig::default().validate_strict().is_ok());
}

#[test]
fn test_validate_strict_with_invalid_config() {
    let mut config = ProxyConfig::default();
    config.server.address = "nope".to_string();

    let result = config.validate_strict();
    assert!(result.is_err());
    if let Err(e) = result {
        let error_str = format!("{}", e);
        assert!(error_str.contains("Configuration validation failed"));
    }
}

#[test]
fn test_multiple_validation_errors() {
    let config = ProxyConfig {
        server: ServerConfig {
            address: String::new(),
            max_connections: 0,
            ..ServerConfig::default()
        },
        broker: BrokerConfig {
            max_in_flight_messages: 0,
            ..BrokerConfig::default()
        },
        transport: TransportConfig {
            max_remaining_length: 0,
            ..TransportConfig::default()
        },
        logging: LoggingConfig {
            app_name: String::new(),
            ..LoggingConfig::default()
        },
    };

    let errors = config.validate();
    assert!(errors.len() >= 5, "expected at least 5 errors: {errors:?}");
}

#[test]
fn test_valid_production_config() {
    let config = ProxyConfig {
        server: ServerConfig {
            address: "0.0.0.0:1883".to_string(),
            max_connections: 50_000,
            handshake_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
        },
        broker: BrokerConfig {
            address: "10.0.0.5:1883".to_string(),
            max_in_flight_messages: 1_000,
            connect_timeout: Duration::from_secs(3),
        },
        transport: TransportConfig {
            max_remaining_length: 1024 * 1024,
            broker_keep_alive: true,
        },
        logging: LoggingConfig {
            app_name: "edge-proxy".to_string(),
            log_level: Severity::Warn,
            json_format: true,
            ..LoggingConfig::default()
        },
    };

    let errors = config.validate();
    assert!(errors.is_empty(), "unexpected errors: {errors:?}");
}

#[test]
fn test_toml_roundtrip_preserves_settings() {
    let config = ProxyConfig::default_with_overrides(|c| {
        c.broker.max_in_flight_messages = 42;
        c.server.handshake_timeout = Duration::from_millis(2500);
        c.logging.log_level = Severity::Debug;
    });

    let text = toml::to_string(&config).expect("serializable");
    let parsed = ProxyConfig::from_toml(&text).expect("parseable");

    assert_eq!(parsed.broker.max_in_flight_messages, 42);
    assert_eq!(parsed.server.handshake_timeout, Duration::from_millis(2500));
    assert_eq!(parsed.logging.log_level, Severity::Debug);
}

#[test]
fn test_example_config_parses() {
    let example = ProxyConfig::example_config();
    let parsed = ProxyConfig::from_toml(&example).expect("example config parses");
    assert!(parsed.validate().is_empty());
}

#[test]
fn test_malformed_toml_is_config_error() {
    let result = ProxyConfig::from_toml("[server\naddress = ");
    assert!(result.is_err());
}

#[test]
fn test_save_and_load_file() {
    let path = std::env::temp_dir().join(format!(
        "mqtt-cluster-proxy-config-{}.toml",
        std::process::id()
    ));
    let config = ProxyConfig::default_with_overrides(|c| c.server.max_connections = 77);
    config.save_to_file(&path).expect("writable");

    let loaded = ProxyConfig::from_file(&path).expect("readable");
    assert_eq!(loaded.server.max_connections, 77);

    let _ = std::fs::remove_file(&path);
}
