use super::endpoint::Endpoint;
use super::link::{FrameHandler, Link, LinkError};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

/// Opens outbound links to other hops
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(
        &self,
        addr: SocketAddr,
        handler: Arc<dyn FrameHandler>,
    ) -> Result<Link, LinkError>;
}

/// One fresh QUIC connection and stream per link
pub struct QuicDialer {
    endpoint: Arc<Endpoint>,
}

impl QuicDialer {
    pub fn new(endpoint: Arc<Endpoint>) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl Dialer for QuicDialer {
    async fn dial(
        &self,
        addr: SocketAddr,
        handler: Arc<dyn FrameHandler>,
    ) -> Result<Link, LinkError> {
        let connection = self
            .endpoint
            .connect(addr)
            .await
            .map_err(|e| LinkError::Unreachable {
                addr,
                reason: e.to_string(),
            })?;

        let (send, recv) = connection
            .open_bi()
            .await
            .map_err(|e| LinkError::Unreachable {
                addr,
                reason: e.to_string(),
            })?;

        debug!("Dialed {}", addr);
        Ok(Link::spawn(addr, recv, send, Some(connection), handler))
    }
}

/// Accept inbound connections until the endpoint closes, turning every
/// incoming stream into a link served by `handler`.
pub async fn accept_links(endpoint: Arc<Endpoint>, handler: Arc<dyn FrameHandler>) {
    loop {
        let connection = match endpoint.accept().await {
            Ok(connection) => connection,
            Err(super::EndpointError::Closed) => break,
            Err(e) => {
                debug!("Inbound connection failed: {}", e);
                continue;
            }
        };

        let handler = handler.clone();
        tokio::spawn(async move {
            let remote = connection.remote_addr();
            while let Ok((send, recv)) = connection.accept_bi().await {
                Link::spawn(remote, recv, send, Some(connection.clone()), handler.clone());
            }
            debug!("Connection from {} finished", remote);
        });
    }
}
