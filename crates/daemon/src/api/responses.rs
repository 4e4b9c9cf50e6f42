/// API request and response types

use onionmesh_core::{ControllerStats, TunnelEvent, TunnelId, TunnelInfo};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Node status response
#[derive(Debug, Serialize)]
pub struct NodeStatusResponse {
    /// Hex-encoded host public key
    pub public_key: String,
    /// Address of the tunnel endpoint
    pub listen_addr: String,
    /// Intermediate hops used for new tunnels
    pub min_hops: usize,
    pub stats: ControllerStats,
}

/// Originated tunnels
#[derive(Debug, Serialize)]
pub struct TunnelListResponse {
    pub tunnels: Vec<TunnelInfo>,
    pub total: usize,
}

/// Request to build a tunnel to a destination peer
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateTunnelRequest {
    pub address: IpAddr,
    pub port: u16,
    /// Hex-encoded host key of the destination
    pub public_key: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateTunnelResponse {
    pub tunnel_id: TunnelId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DestroyTunnelResponse {
    pub tunnel_id: TunnelId,
    pub destroyed: bool,
}

/// Application bytes to send through a tunnel
#[derive(Debug, Serialize, Deserialize)]
pub struct SendDataRequest {
    /// Hex-encoded payload
    pub data: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SendDataResponse {
    pub tunnel_id: TunnelId,
    /// Datums the payload was split into
    pub datums: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CoverRequest {
    pub size: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CoverResponse {
    pub tunnel_id: TunnelId,
    pub size: usize,
}

/// Events buffered since the last poll
#[derive(Debug, Serialize)]
pub struct EventsResponse {
    pub events: Vec<TunnelEvent>,
    /// Events discarded because the buffer was full
    pub dropped: u64,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
    /// Error code
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, code: u16) -> Self {
        Self {
            error: error.into(),
            code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_response_shape() {
        let response = EventsResponse {
            events: vec![TunnelEvent::TunnelIncoming {
                tunnel_id: TunnelId(9),
                source_key: vec![0xaa, 0x01],
            }],
            dropped: 0,
        };
        let json = serde_json::to_value(&response).unwrap();

        assert_eq!(json["events"][0]["type"], "tunnel_incoming");
        assert_eq!(json["events"][0]["source_key"], "aa01");
        assert_eq!(json["dropped"], 0);
    }

    #[test]
    fn test_create_request_parses() {
        let request: CreateTunnelRequest = serde_json::from_str(
            r#"{"address": "10.0.0.7", "port": 7100, "public_key": "ab"}"#,
        )
        .unwrap();

        assert_eq!(request.address.to_string(), "10.0.0.7");
        assert_eq!(request.port, 7100);
    }
}
