use std::time::Duration;
use thiserror::Error;

/// Boxed cause kept behind every classified failure
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failure classes of the tunnel engine.
///
/// The class decides the blast radius:
/// - `Protocol`: the connection the offending bytes arrived on is closed
/// - `Tunneling`: the in-progress build or forward operation fails
/// - `DataForwarding`: only the single message being relayed is dropped
/// - `Initialization`: the listener or connection attempt is abandoned
#[derive(Debug, Error)]
pub enum OnionError {
    #[error("Protocol error: {message}")]
    Protocol {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Tunneling error: {message}")]
    Tunneling {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Data forwarding error: {message}")]
    DataForwarding {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Initialization error: {message}")]
    Initialization {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Tunnel build timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type for tunnel operations
pub type Result<T> = std::result::Result<T, OnionError>;

impl OnionError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol {
            message: msg.into(),
            source: None,
        }
    }

    pub fn tunneling(msg: impl Into<String>) -> Self {
        Self::Tunneling {
            message: msg.into(),
            source: None,
        }
    }

    pub fn data_forwarding(msg: impl Into<String>) -> Self {
        Self::DataForwarding {
            message: msg.into(),
            source: None,
        }
    }

    pub fn initialization(msg: impl Into<String>) -> Self {
        Self::Initialization {
            message: msg.into(),
            source: None,
        }
    }

    pub fn protocol_caused_by(msg: impl Into<String>, cause: impl Into<BoxError>) -> Self {
        Self::Protocol {
            message: msg.into(),
            source: Some(cause.into()),
        }
    }

    pub fn tunneling_caused_by(msg: impl Into<String>, cause: impl Into<BoxError>) -> Self {
        Self::Tunneling {
            message: msg.into(),
            source: Some(cause.into()),
        }
    }

    pub fn data_forwarding_caused_by(msg: impl Into<String>, cause: impl Into<BoxError>) -> Self {
        Self::DataForwarding {
            message: msg.into(),
            source: Some(cause.into()),
        }
    }

    pub fn initialization_caused_by(msg: impl Into<String>, cause: impl Into<BoxError>) -> Self {
        Self::Initialization {
            message: msg.into(),
            source: Some(cause.into()),
        }
    }

    /// Whether the connection that produced this error must be torn down
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(self, Self::Protocol { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_cause_is_preserved() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "peer reset");
        let err = OnionError::tunneling_caused_by("extend to 10.0.0.2:7000 failed", io);

        assert_eq!(
            err.to_string(),
            "Tunneling error: extend to 10.0.0.2:7000 failed"
        );
        let source = err.source().expect("cause must be kept");
        assert_eq!(source.to_string(), "peer reset");
    }

    #[test]
    fn test_only_protocol_errors_close_connections() {
        assert!(OnionError::protocol("unknown type 0x7f").is_fatal_to_connection());
        assert!(!OnionError::tunneling("no route").is_fatal_to_connection());
        assert!(!OnionError::data_forwarding("no session").is_fatal_to_connection());
        assert!(!OnionError::Timeout(Duration::from_secs(1)).is_fatal_to_connection());
    }
}
