use crate::types::Peer;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Network endpoint constants
pub mod protocol {
    /// Default UDP port for hop-to-hop tunnel traffic
    pub const DEFAULT_PORT: u16 = 7100;

    /// Default TCP port for the local control API
    pub const DEFAULT_API_PORT: u16 = 7150;

    /// Idle timeout for hop-to-hop connections
    pub const IDLE_TIMEOUT_SECS: u64 = 60;

    /// Keep-alive interval on hop-to-hop connections
    pub const KEEPALIVE_INTERVAL_SECS: u64 = 5;
}

/// Tunnel construction constants
pub mod tunnel {
    /// Default number of intermediate hops before the destination
    pub const DEFAULT_MIN_HOPS: usize = 2;

    /// Largest tunnel (intermediates plus destination) a node will build.
    /// Bounds the per-layer overhead reserved in every data frame.
    pub const MAX_TUNNEL_LENGTH: usize = 8;

    /// Time the originator gives a whole build before abandoning it
    pub const BUILD_TIMEOUT_SECS: u64 = 10;
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Listen address for tunnel traffic
    pub listen_addr: String,

    /// Listen port for tunnel traffic
    pub listen_port: u16,

    /// Port of the local control API (bound on loopback)
    pub api_port: u16,

    /// Intermediate hops placed before the destination
    pub min_hops: usize,

    /// Budget in seconds for a whole tunnel build
    pub build_timeout_secs: u64,

    /// Location of the Ed25519 host key; generated when missing
    pub hostkey_path: Option<String>,

    /// Enable verbose logging
    pub verbose: bool,

    /// Peers available to the sampler
    #[serde(default)]
    pub peers: Vec<Peer>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".to_string(),
            listen_port: protocol::DEFAULT_PORT,
            api_port: protocol::DEFAULT_API_PORT,
            min_hops: tunnel::DEFAULT_MIN_HOPS,
            build_timeout_secs: tunnel::BUILD_TIMEOUT_SECS,
            hostkey_path: Some("./data/hostkey".to_string()),
            verbose: false,
            peers: Vec::new(),
        }
    }
}

impl NodeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = addr.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }

    pub fn with_api_port(mut self, port: u16) -> Self {
        self.api_port = port;
        self
    }

    pub fn with_min_hops(mut self, hops: usize) -> Self {
        self.min_hops = hops.min(tunnel::MAX_TUNNEL_LENGTH - 1);
        self
    }

    pub fn with_build_timeout(mut self, timeout: Duration) -> Self {
        self.build_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn with_hostkey_path(mut self, path: Option<String>) -> Self {
        self.hostkey_path = path;
        self
    }

    pub fn with_peers(mut self, peers: Vec<Peer>) -> Self {
        self.peers = peers;
        self
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    /// Socket address the tunnel endpoint binds to
    pub fn listen_socket(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.listen_addr, self.listen_port)
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigError::InvalidValue {
                field: "listen_addr",
                reason: e.to_string(),
            })
    }

    /// Check values that would otherwise surface as confusing runtime failures
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_socket()?;

        if self.min_hops + 1 > tunnel::MAX_TUNNEL_LENGTH {
            return Err(ConfigError::InvalidValue {
                field: "min_hops",
                reason: format!(
                    "tunnels are limited to {} hops including the destination",
                    tunnel::MAX_TUNNEL_LENGTH
                ),
            });
        }

        if self.build_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "build_timeout_secs",
                reason: "must be at least one second".to_string(),
            });
        }

        Ok(())
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError(e.to_string()))?;

        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::WriteError(e.to_string()))?;

        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to serialize config: {0}")]
    SerializeError(String),

    #[error("Failed to write config file: {0}")]
    WriteError(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}
