use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Timestamp in Unix epoch seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn now() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self(secs)
    }

    pub fn from_secs(secs: u64) -> Self {
        Self(secs)
    }

    pub fn as_secs(&self) -> u64 {
        self.0
    }

    pub fn elapsed(&self) -> Duration {
        let now = Self::now();
        Duration::from_secs(now.0.saturating_sub(self.0))
    }
}

/// A participant in the overlay: where it listens and the host key it presents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Peer {
    /// IP address of the peer's tunnel endpoint
    pub address: IpAddr,

    /// UDP port of the peer's tunnel endpoint
    pub port: u16,

    /// Raw public host key bytes
    #[serde(with = "hex_bytes")]
    pub public_key: Vec<u8>,
}

impl Peer {
    pub fn new(address: IpAddr, port: u16, public_key: Vec<u8>) -> Self {
        Self {
            address,
            port,
            public_key,
        }
    }

    pub fn from_socket(addr: SocketAddr, public_key: Vec<u8>) -> Self {
        Self::new(addr.ip(), addr.port(), public_key)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// Hex form of the public key, for logs and APIs
    pub fn key_hex(&self) -> String {
        hex::encode(&self.public_key)
    }
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        hex::decode(encoded).map_err(serde::de::Error::custom)
    }
}
