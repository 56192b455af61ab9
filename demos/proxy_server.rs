//! Example: Running the clustering proxy
//!
//! Listens for MQTT clients and forwards every client identity over a single
//! broker connection. Configuration comes from a TOML file given as the first
//! argument, or from `MQTT_PROXY_*` environment variables.
//!
//! Run with: `cargo run --example proxy_server -- [config.toml]`

#![allow(clippy::uninlined_format_args)]

use mqtt_cluster_proxy::config::ProxyConfig;
use mqtt_cluster_proxy::service::start_server;
use mqtt_cluster_proxy::utils::logging::init_logging;
use mqtt_cluster_proxy::utils::metrics::init_metrics;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = match std::env::args().nth(1) {
        Some(path) => ProxyConfig::from_file(path)?,
        None => ProxyConfig::from_env()?,
    };

    let level = init_logging(&config.logging)?;
    init_metrics();
    println!(
        "Proxying {} -> {} (log level {})",
        config.server.address, config.broker.address, level
    );

    start_server(config).await?;
    Ok(())
}
