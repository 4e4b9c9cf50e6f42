//! Node runtime
//!
//! Wires a QUIC endpoint, the tunnel engine and the tunnel controller into
//! one running participant of the overlay.

use crate::identity::HostKey;
use crate::session::{SessionAuthority, X25519SessionAuthority};
use crate::transport::{accept_links, Endpoint, EndpointConfig, FrameHandler, QuicDialer};
use crate::tunnel::{
    ControllerConfig, PeerSampler, StaticPeerSampler, TunnelController, TunnelEngine,
};
use onionmesh_common::{NodeConfig, OnionError, Peer, Result};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct Node {
    host_key: HostKey,
    peer: Peer,
    endpoint: Arc<Endpoint>,
    engine: Arc<TunnelEngine>,
    controller: Arc<TunnelController>,
    accept_task: JoinHandle<()>,
}

impl Node {
    /// Bind the tunnel endpoint and start accepting links
    pub async fn bind(
        config: &NodeConfig,
        host_key: HostKey,
        authority: Arc<dyn SessionAuthority>,
        sampler: Arc<dyn PeerSampler>,
    ) -> Result<Self> {
        let bind_addr = config.listen_socket().map_err(|e| {
            OnionError::initialization_caused_by("invalid listen address", e)
        })?;

        let endpoint = Arc::new(Endpoint::new(EndpointConfig::with_bind_addr(bind_addr)).await?);
        let local_addr = endpoint.local_addr();

        let dialer = Arc::new(QuicDialer::new(endpoint.clone()));
        let engine = TunnelEngine::new(host_key.public_bytes().to_vec(), authority, dialer);

        let handler: Arc<dyn FrameHandler> = engine.clone();
        let accept_task = tokio::spawn(accept_links(endpoint.clone(), handler));

        let controller_config = ControllerConfig::new(local_addr)
            .with_min_hops(config.min_hops)
            .with_build_timeout(config.build_timeout());
        let controller = match TunnelController::new(engine.clone(), sampler, controller_config) {
            Ok(controller) => Arc::new(controller),
            Err(e) => {
                accept_task.abort();
                endpoint.close();
                return Err(e);
            }
        };

        let peer = Peer::from_socket(local_addr, host_key.public_bytes().to_vec());
        info!("Node {} listening on {}", host_key.public_hex(), local_addr);

        Ok(Self {
            host_key,
            peer,
            endpoint,
            engine,
            controller,
            accept_task,
        })
    }

    /// Host key from `hostkey_path` (generated when missing), X25519 sessions
    /// and the configured peer list
    pub async fn from_config(config: &NodeConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| OnionError::initialization_caused_by("invalid configuration", e))?;

        let host_key = match &config.hostkey_path {
            Some(path) => HostKey::load_or_generate(Path::new(path))?,
            None => {
                warn!("No host key path configured, using a throwaway key");
                HostKey::generate()
            }
        };

        let sampler = Arc::new(StaticPeerSampler::new(config.peers.clone()));
        Self::bind(
            config,
            host_key,
            Arc::new(X25519SessionAuthority::new()),
            sampler,
        )
        .await
    }

    /// How other nodes reach this one
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn host_key(&self) -> &HostKey {
        &self.host_key
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    pub fn controller(&self) -> &Arc<TunnelController> {
        &self.controller
    }

    pub fn engine(&self) -> &Arc<TunnelEngine> {
        &self.engine
    }

    /// Retire originated tunnels, drop relayed routes and close the endpoint
    pub async fn shutdown(&self) {
        info!("Node {} shutting down", self.local_addr());
        self.controller.shutdown().await;
        self.engine.shutdown().await;
        self.accept_task.abort();
        self.endpoint.close();
    }
}
