use super::connection::Connection;
use onionmesh_common::protocol::{IDLE_TIMEOUT_SECS, KEEPALIVE_INTERVAL_SECS};
use onionmesh_common::OnionError;
use quinn::Endpoint as QuinnEndpoint;
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

const SERVER_NAME: &str = "onionmesh.local";

/// QUIC endpoint shared by inbound and outbound hop connections
pub struct Endpoint {
    inner: QuinnEndpoint,
    local_addr: SocketAddr,
}

impl Endpoint {
    /// Bind and configure the endpoint
    pub async fn new(config: EndpointConfig) -> Result<Self, EndpointError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let server_config = Self::create_server_config(&config, provider.clone())?;
        let client_config = Self::create_client_config(&config, provider)?;

        let mut endpoint = QuinnEndpoint::server(server_config, config.bind_addr)
            .map_err(|e| EndpointError::BindFailed(format!("{}: {}", config.bind_addr, e)))?;
        endpoint.set_default_client_config(client_config);

        let local_addr = endpoint.local_addr()?;

        Ok(Self {
            inner: endpoint,
            local_addr,
        })
    }

    fn transport_config(config: &EndpointConfig) -> Result<quinn::TransportConfig, EndpointError> {
        let idle_timeout = quinn::IdleTimeout::try_from(config.idle_timeout)
            .map_err(|e| EndpointError::ConfigCreation(format!("Invalid idle timeout: {}", e)))?;

        let mut transport_config = quinn::TransportConfig::default();
        transport_config.max_idle_timeout(Some(idle_timeout));
        transport_config.keep_alive_interval(Some(config.keep_alive_interval));
        // one stream per tunnel link
        transport_config.max_concurrent_bidi_streams(16u32.into());
        transport_config.max_concurrent_uni_streams(0u32.into());

        Ok(transport_config)
    }

    /// Server side with a throwaway self-signed certificate
    fn create_server_config(
        config: &EndpointConfig,
        provider: Arc<CryptoProvider>,
    ) -> Result<quinn::ServerConfig, EndpointError> {
        let cert = rcgen::generate_simple_self_signed(vec![SERVER_NAME.to_string()])
            .map_err(|e| EndpointError::CertGeneration(e.to_string()))?;

        let cert_der = cert.cert.der().to_vec();
        let key_der = cert.key_pair.serialize_der();

        let cert_chain = vec![rustls::pki_types::CertificateDer::from(cert_der)];
        let key = rustls::pki_types::PrivateKeyDer::try_from(key_der)
            .map_err(|e| EndpointError::CertGeneration(format!("Invalid key: {}", e)))?;

        let server_crypto = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| EndpointError::ConfigCreation(format!("Failed to set protocol versions: {}", e)))?
            .with_no_client_auth()
            .with_single_cert(cert_chain, key)
            .map_err(|e| EndpointError::ConfigCreation(e.to_string()))?;

        let quic_crypto = quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
            .map_err(|e| EndpointError::ConfigCreation(format!("Failed to create QUIC server config: {}", e)))?;

        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_crypto));
        server_config.transport_config(Arc::new(Self::transport_config(config)?));

        Ok(server_config)
    }

    /// Client side. Hop certificates are self-signed, so chain validation is
    /// skipped; handshake signatures are still checked. Peer authenticity
    /// comes from the session handshake carried inside the tunnel.
    fn create_client_config(
        config: &EndpointConfig,
        provider: Arc<CryptoProvider>,
    ) -> Result<quinn::ClientConfig, EndpointError> {
        let verifier = SelfSignedVerifier {
            algorithms: provider.signature_verification_algorithms,
        };

        let crypto = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| EndpointError::ConfigCreation(format!("Failed to set protocol versions: {}", e)))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth();

        let quic_crypto = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
            .map_err(|e| EndpointError::ConfigCreation(format!("Failed to create QUIC client config: {}", e)))?;

        let mut client_config = quinn::ClientConfig::new(Arc::new(quic_crypto));
        client_config.transport_config(Arc::new(Self::transport_config(config)?));

        Ok(client_config)
    }

    /// Connect to a remote hop
    pub async fn connect(&self, addr: SocketAddr) -> Result<Connection, EndpointError> {
        let connecting = self
            .inner
            .connect(addr, SERVER_NAME)
            .map_err(|e| EndpointError::ConnectionFailed(format!("{}: {}", addr, e)))?;

        let connection = connecting
            .await
            .map_err(|e| EndpointError::ConnectionFailed(format!("{}: {}", addr, e)))?;

        Ok(Connection::new(connection))
    }

    /// Accept the next inbound connection; `Closed` once the endpoint shuts down
    pub async fn accept(&self) -> Result<Connection, EndpointError> {
        let incoming = self.inner.accept().await.ok_or(EndpointError::Closed)?;

        let connection = incoming
            .await
            .map_err(|e| EndpointError::ConnectionFailed(e.to_string()))?;

        Ok(Connection::new(connection))
    }

    /// Local address; an unspecified bind address is reported as loopback
    pub fn local_addr(&self) -> SocketAddr {
        let mut addr = self.local_addr;
        if addr.ip().is_unspecified() {
            addr.set_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
        }
        addr
    }

    pub fn close(&self) {
        self.inner.close(0u32.into(), b"shutdown");
    }
}

#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub bind_addr: SocketAddr,
    pub idle_timeout: Duration,
    pub keep_alive_interval: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            idle_timeout: Duration::from_secs(IDLE_TIMEOUT_SECS),
            keep_alive_interval: Duration::from_secs(KEEPALIVE_INTERVAL_SECS),
        }
    }
}

impl EndpointConfig {
    pub fn with_bind_addr(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Self::default()
        }
    }
}

#[derive(Debug)]
struct SelfSignedVerifier {
    algorithms: WebPkiSupportedAlgorithms,
}

impl rustls::client::danger::ServerCertVerifier for SelfSignedVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("Failed to bind to address: {0}")]
    BindFailed(String),

    #[error("Failed to generate certificate: {0}")]
    CertGeneration(String),

    #[error("Failed to create config: {0}")]
    ConfigCreation(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Endpoint is closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<EndpointError> for OnionError {
    fn from(err: EndpointError) -> Self {
        OnionError::initialization_caused_by("transport endpoint failure", err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_endpoint_binds_ephemeral_port() {
        let endpoint = Endpoint::new(EndpointConfig::default()).await.unwrap();
        assert_ne!(endpoint.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn test_endpoint_connect() {
        let server = Endpoint::new(EndpointConfig::default()).await.unwrap();
        let server_addr = server.local_addr();
        let client = Endpoint::new(EndpointConfig::default()).await.unwrap();

        let accept_task = tokio::spawn(async move { server.accept().await });

        let client_conn = client.connect(server_addr).await.unwrap();
        let server_conn = accept_task.await.unwrap().unwrap();

        assert_eq!(client_conn.remote_addr(), server_addr);
        assert_eq!(server_conn.remote_addr(), client.local_addr());
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let first = Endpoint::new(EndpointConfig::default()).await.unwrap();
        let taken = EndpointConfig::with_bind_addr(first.local_addr());

        assert!(matches!(
            Endpoint::new(taken).await,
            Err(EndpointError::BindFailed(_))
        ));
    }
}
