use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a tunnel, identical at every hop for the tunnel's whole lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TunnelId(pub u32);

impl TunnelId {
    pub fn generate() -> Self {
        Self(rand::thread_rng().gen())
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tunnel({:08x})", self.0)
    }
}

impl FromStr for TunnelId {
    type Err = std::num::ParseIntError;

    /// Accepts plain decimal or `0x`-prefixed hex
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.strip_prefix("0x") {
            Some(hex) => u32::from_str_radix(hex, 16).map(Self),
            None => s.parse().map(Self),
        }
    }
}

/// Correlates one Extend with its Extended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u16);

impl RequestId {
    pub fn generate() -> Self {
        Self(rand::thread_rng().gen())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Request({})", self.0)
    }
}

/// Handle on a shared secret between this node and an adjacent hop.
///
/// Session ids are local to the node that issued them; the two ends of a
/// session generally hold different ids for the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u16);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Session({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tunnel_id_parses_decimal_and_hex() {
        assert_eq!("42".parse::<TunnelId>().unwrap(), TunnelId(42));
        assert_eq!("0x2a".parse::<TunnelId>().unwrap(), TunnelId(42));
        assert!("0xzz".parse::<TunnelId>().is_err());
    }

    #[test]
    fn test_tunnel_id_display() {
        assert_eq!(TunnelId(0xbeef).to_string(), "Tunnel(0000beef)");
    }
}
