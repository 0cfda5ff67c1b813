//! Server configuration types and defaults.
//!
//! This module contains the server configuration structure and default
//! values used to initialize and customize space server behavior.

use meridian_location_system::{EntityId, NodeId, DEFAULT_MAX_DIST};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Configuration structure for a space server node.
///
/// Contains all necessary parameters to configure node behavior including
/// cluster identity, network settings, reliable-send retry policy, and the
/// motion update threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// This node's identity within the cluster (must be nonzero)
    pub node_id: u32,

    /// The socket address to bind the inter-node transport to
    pub bind_address: SocketAddr,

    /// Maximum number of concurrent transport connections allowed
    pub max_connections: usize,

    /// Interval between reliable-send retry sweeps, in milliseconds
    pub retry_interval_ms: u64,

    /// Attempts before a reliable send is abandoned
    pub max_send_attempts: u32,

    /// Largest mux frame accepted from a peer, in bytes
    pub max_frame_size: usize,

    /// Motion divergence (in world units) that forces a location update
    pub motion_threshold: f64,

    /// Addresses of peer nodes, keyed by node ID
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

/// Address book entry for one peer node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// The peer's cluster node ID
    pub node_id: u32,
    /// The peer's transport address, `host:port`
    pub address: String,
}

impl ServerConfig {
    /// This node's cluster identity.
    pub fn node(&self) -> NodeId {
        NodeId(self.node_id)
    }

    /// This node's transport endpoint identity.
    pub fn node_entity(&self) -> EntityId {
        EntityId::for_node(self.node())
    }

    /// Retry sweep interval as a [`Duration`].
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            bind_address: "127.0.0.1:7700".parse().expect("Invalid default bind address"),
            max_connections: 1000,
            retry_interval_ms: 500,
            max_send_attempts: 5,
            max_frame_size: 1024 * 1024, // 1MB
            motion_threshold: DEFAULT_MAX_DIST,
            peers: Vec::new(),
        }
    }
}
