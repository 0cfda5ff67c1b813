//! Application configuration loading and validation.
//!
//! The node loads a TOML configuration file at startup (creating a default
//! one when missing) and merges CLI overrides on top before anything else
//! starts.

use serde::{Deserialize, Serialize};
use space_server::{PeerConfig, ServerConfig, ServerError};
use std::path::Path;
use tracing::info;

/// Top-level configuration file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Node and transport settings
    #[serde(default)]
    pub server: ServerSettings,
    /// Location core settings
    #[serde(default)]
    pub location: LocationSettings,
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// `[server]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Cluster node identity (nonzero)
    pub node_id: u32,
    /// Bind address for the inter-node transport
    pub bind_address: String,
    /// Reliable-send retry sweep interval in milliseconds
    pub retry_interval_ms: u64,
    /// Attempts before a reliable send is abandoned
    pub max_send_attempts: u32,
    /// Peer node address book
    #[serde(default)]
    pub peers: Vec<PeerSettings>,
}

/// One `[[server.peers]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSettings {
    /// The peer's cluster node ID
    pub node_id: u32,
    /// The peer's transport address, `host:port`
    pub address: String,
}

/// `[location]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationSettings {
    /// Registry key of the update-policy implementation
    pub update_policy: String,
    /// Motion divergence threshold in world units
    pub motion_threshold: f64,
}

/// `[logging]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Default log level when `RUST_LOG` is unset
    pub level: String,
    /// Whether to emit JSON-formatted logs
    pub json_format: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        let defaults = ServerConfig::default();
        Self {
            node_id: defaults.node_id,
            bind_address: defaults.bind_address.to_string(),
            retry_interval_ms: defaults.retry_interval_ms,
            max_send_attempts: defaults.max_send_attempts,
            peers: Vec::new(),
        }
    }
}

impl Default for LocationSettings {
    fn default() -> Self {
        Self {
            update_policy: "standard".to_string(),
            motion_threshold: meridian_location_system::DEFAULT_MAX_DIST,
        }
    }
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
    /// Loads configuration from `path`, writing a default file first when
    /// none exists yet.
    pub async fn load_from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.exists() {
            let default = Self::default();
            let rendered = toml::to_string_pretty(&default)?;
            tokio::fs::write(path, rendered).await?;
            info!("📝 Wrote default configuration to {}", path.display());
            return Ok(default);
        }

        let raw = tokio::fs::read_to_string(path).await?;
        let config: Self = toml::from_str(&raw)?;
        Ok(config)
    }

    /// Validates the merged configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.server.node_id == 0 {
            return Err("server.node_id must be nonzero".to_string());
        }
        if self.server.bind_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(format!(
                "server.bind_address '{}' is not a valid socket address",
                self.server.bind_address
            ));
        }
        if self.server.max_send_attempts == 0 {
            return Err("server.max_send_attempts must be at least 1".to_string());
        }
        if self.location.motion_threshold <= 0.0 {
            return Err("location.motion_threshold must be positive".to_string());
        }
        Ok(())
    }

    /// Converts the file settings into the server's configuration type.
    pub fn to_server_config(&self) -> Result<ServerConfig, ServerError> {
        let bind_address = self
            .server
            .bind_address
            .parse()
            .map_err(|e| ServerError::Internal(format!("bind address: {e}")))?;
        Ok(ServerConfig {
            node_id: self.server.node_id,
            bind_address,
            retry_interval_ms: self.server.retry_interval_ms,
            max_send_attempts: self.server.max_send_attempts,
            motion_threshold: self.location.motion_threshold,
            peers: self
                .server
                .peers
                .iter()
                .map(|p| PeerConfig {
                    node_id: p.node_id,
                    address: p.address.clone(),
                })
                .collect(),
            ..ServerConfig::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_creates_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let config = AppConfig::load_from_file(&path).await.unwrap();
        assert!(path.exists());
        assert_eq!(config.location.update_policy, "standard");

        // The generated file loads back cleanly.
        let reloaded = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(reloaded.server.node_id, config.server.node_id);
    }

    #[tokio::test]
    async fn test_validation_rejects_bad_settings() {
        let mut config = AppConfig::default();
        assert!(config.validate().is_ok());

        config.server.node_id = 0;
        assert!(config.validate().is_err());

        config.server.node_id = 1;
        config.server.bind_address = "not-an-address".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_conversion_carries_peers() {
        let mut config = AppConfig::default();
        config.server.peers.push(PeerSettings {
            node_id: 9,
            address: "127.0.0.1:7709".to_string(),
        });

        let server_config = config.to_server_config().unwrap();
        assert_eq!(server_config.peers.len(), 1);
        assert_eq!(server_config.peers[0].node_id, 9);
    }
}
