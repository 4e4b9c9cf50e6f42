use quinn::{Connection as QuinnConnection, RecvStream, SendStream};
use std::net::SocketAddr;

/// A QUIC connection to an adjacent hop
#[derive(Debug, Clone)]
pub struct Connection {
    inner: QuinnConnection,
}

impl Connection {
    pub(crate) fn new(inner: QuinnConnection) -> Self {
        Self { inner }
    }

    /// Open the bidirectional stream a link runs over
    pub async fn open_bi(&self) -> Result<(SendStream, RecvStream), ConnectionError> {
        self.inner
            .open_bi()
            .await
            .map_err(|e| ConnectionError::StreamOpen(e.to_string()))
    }

    /// Wait for the remote side to open a stream
    pub async fn accept_bi(&self) -> Result<(SendStream, RecvStream), ConnectionError> {
        self.inner
            .accept_bi()
            .await
            .map_err(|e| ConnectionError::StreamAccept(e.to_string()))
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_address()
    }

    pub fn stats(&self) -> ConnectionStats {
        let quinn_stats = self.inner.stats();

        ConnectionStats {
            bytes_sent: quinn_stats.udp_tx.bytes,
            bytes_received: quinn_stats.udp_rx.bytes,
        }
    }

    /// Close gracefully
    pub fn close(&self, error_code: u32, reason: &str) {
        self.inner.close(error_code.into(), reason.as_bytes());
    }

    pub fn is_closed(&self) -> bool {
        self.inner.close_reason().is_some()
    }

    /// Resolves once the connection is closed by either side
    pub async fn closed(&self) {
        self.inner.closed().await;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectionStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Failed to open stream: {0}")]
    StreamOpen(String),

    #[error("Failed to accept stream: {0}")]
    StreamAccept(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Endpoint, EndpointConfig};

    async fn create_connection_pair() -> (Connection, Connection) {
        let server = Endpoint::new(EndpointConfig::default()).await.unwrap();
        let server_addr = server.local_addr();
        let client = Endpoint::new(EndpointConfig::default()).await.unwrap();

        let accept_task = tokio::spawn(async move { server.accept().await });

        let client_conn = client.connect(server_addr).await.unwrap();
        let server_conn = accept_task.await.unwrap().unwrap();

        (client_conn, server_conn)
    }

    #[tokio::test]
    async fn test_connection_stats() {
        let (client, _server) = create_connection_pair().await;
        let stats = client.stats();

        assert!(stats.bytes_sent > 0 || stats.bytes_received > 0);
    }

    #[tokio::test]
    async fn test_connection_close() {
        let (client, _server) = create_connection_pair().await;
        assert!(!client.is_closed());

        client.close(0, "test close");
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

        assert!(client.is_closed());
    }
}
