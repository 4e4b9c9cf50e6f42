//! Shared types, configuration and error taxonomy for onionmesh nodes.

pub mod config;
pub mod error;
pub mod types;

pub use config::{protocol, tunnel, ConfigError, NodeConfig};
pub use error::{BoxError, OnionError, Result};
pub use types::{Peer, Timestamp};
