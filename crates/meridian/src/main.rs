//! # Meridian Space Server - Main Entry Point
//!
//! Clustered virtual-world location synchronization node. This entry point
//! handles CLI parsing, configuration loading, and the node lifecycle.
//!
//! ## Quick Start
//!
//! ```bash
//! # Run with default configuration
//! meridian
//!
//! # Specify custom configuration
//! meridian --config production.toml
//!
//! # Override specific settings
//! meridian --node-id 2 --bind 0.0.0.0:7700 --log-level debug
//!
//! # JSON logging for production
//! meridian --json-logs
//! ```
//!
//! ## Configuration
//!
//! The node loads configuration from a TOML file (default: `config.toml`).
//! If the file doesn't exist, a default configuration will be created.
//!
//! ## Signal Handling
//!
//! The node shuts down gracefully on SIGINT (Ctrl+C).

use meridian_location_system::{LocationUpdatePolicy, ServiceRegistry};
use space_server::stream::WsConnector;
use space_server::{AllowAllAuthenticator, SpaceServer, TransportBinding};
use std::sync::Arc;
use tracing::{error, info};

mod cli;
mod config;
mod logging;

use cli::CliArgs;
use config::AppConfig;

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();
    if let Err(e) = run(args).await {
        error!("💥 Fatal: {}", e);
        std::process::exit(1);
    }
}

async fn run(args: CliArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AppConfig::load_from_file(&args.config_path).await?;

    // Apply CLI overrides
    if let Some(node_id) = args.node_id {
        config.server.node_id = node_id;
    }
    if let Some(bind_address) = args.bind_address {
        config.server.bind_address = bind_address;
    }
    if let Some(log_level) = args.log_level {
        config.logging.level = log_level;
    }

    logging::setup_logging(&config.logging, args.json_logs)?;

    if let Err(e) = config.validate() {
        return Err(format!("Configuration validation failed: {e}").into());
    }
    info!(
        "✅ Configuration loaded from {}",
        args.config_path.display()
    );

    // Pluggable update-policy implementations are chosen by registry key;
    // the registry is owned here, by process configuration.
    let mut policies: ServiceRegistry<Arc<LocationUpdatePolicy>> = ServiceRegistry::new();
    policies.register("standard", || Arc::new(LocationUpdatePolicy::new()));
    let Some(policy) = policies.construct(&config.location.update_policy) else {
        return Err(format!(
            "unknown update policy '{}' (known: {})",
            config.location.update_policy,
            policies.keys().collect::<Vec<_>>().join(", ")
        )
        .into());
    };

    let server_config = config.to_server_config()?;

    // Route table toward peer nodes.
    let connector = WsConnector::new();
    for peer in &server_config.peers {
        let entity =
            meridian_location_system::EntityId::for_node(meridian_location_system::NodeId(
                peer.node_id,
            ));
        connector.add_route(entity, peer.address.clone()).await;
        info!("🗺️ Peer node {} at {}", peer.node_id, peer.address);
    }

    let server = SpaceServer::new(
        server_config,
        connector,
        Arc::new(AllowAllAuthenticator),
        policy,
    )
    .await;
    server.start(TransportBinding::WebSocket).await?;

    info!("🌟 Meridian node {} is up", config.server.node_id);
    tokio::signal::ctrl_c().await?;
    info!("⏹️ Shutdown signal received");
    server.stop().await;
    Ok(())
}
