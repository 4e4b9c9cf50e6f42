use super::engine::TunnelEngine;
use super::events::{EventKind, Subscription, SubscriptionId};
use super::sampler::{Exclusions, PeerSampler};
use crate::protocol::frame::PAYLOAD_BYTES;
use crate::protocol::{Datum, SessionId, TunnelId, TunnelMessage};
use crate::routing::RoutingError;
use dashmap::DashMap;
use onionmesh_common::tunnel::{BUILD_TIMEOUT_SECS, DEFAULT_MIN_HOPS, MAX_TUNNEL_LENGTH};
use onionmesh_common::{OnionError, Peer, Result, Timestamp};
use rand::RngCore;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const REGISTER_ATTEMPTS: usize = 8;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Intermediate hops before the destination
    pub min_hops: usize,
    /// Budget for a whole build, every extension round included
    pub build_timeout: Duration,
    /// This node's own tunnel address, never chosen as a hop. The host key
    /// is excluded as well, so a peer list naming this node elsewhere is safe.
    pub local_addr: SocketAddr,
}

impl ControllerConfig {
    pub fn new(local_addr: SocketAddr) -> Self {
        Self {
            min_hops: DEFAULT_MIN_HOPS,
            build_timeout: Duration::from_secs(BUILD_TIMEOUT_SECS),
            local_addr,
        }
    }

    pub fn with_min_hops(mut self, min_hops: usize) -> Self {
        self.min_hops = min_hops;
        self
    }

    pub fn with_build_timeout(mut self, timeout: Duration) -> Self {
        self.build_timeout = timeout;
        self
    }
}

/// A tunnel this node originated
struct OutgoingTunnel {
    destination: Peer,
    sessions: Vec<SessionId>,
    created_at: Timestamp,
    datums_sent: u64,
    bytes_sent: u64,
}

/// Snapshot of an originated tunnel
#[derive(Debug, Clone, Serialize)]
pub struct TunnelInfo {
    pub tunnel_id: TunnelId,
    pub destination: Peer,
    pub hops: usize,
    pub created_at: Timestamp,
    pub datums_sent: u64,
    pub bytes_sent: u64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ControllerStats {
    /// Tunnels originated here and still up
    pub outgoing_tunnels: usize,
    /// Routes held for tunnels of other originators
    pub relayed_tunnels: usize,
    pub subscribers: usize,
}

/// Entry point for local applications: build, use and tear down tunnels
pub struct TunnelController {
    engine: Arc<TunnelEngine>,
    sampler: Arc<dyn PeerSampler>,
    config: ControllerConfig,
    outgoing: DashMap<TunnelId, OutgoingTunnel>,
}

impl TunnelController {
    pub fn new(
        engine: Arc<TunnelEngine>,
        sampler: Arc<dyn PeerSampler>,
        config: ControllerConfig,
    ) -> Result<Self> {
        if config.min_hops + 1 > MAX_TUNNEL_LENGTH {
            return Err(OnionError::initialization(format!(
                "{} intermediate hops exceed the tunnel length limit of {}",
                config.min_hops, MAX_TUNNEL_LENGTH
            )));
        }

        Ok(Self {
            engine,
            sampler,
            config,
            outgoing: DashMap::new(),
        })
    }

    pub fn engine(&self) -> &Arc<TunnelEngine> {
        &self.engine
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Build a tunnel of `min_hops` sampled intermediates ending at
    /// `destination`. Partial state is released when any round fails.
    pub async fn create_tunnel(&self, destination: Peer) -> Result<TunnelId> {
        let tunnel = self.claim_tunnel_id()?;
        info!("Building {} to {} via {} hops", tunnel, destination, self.config.min_hops);

        let mut sessions = Vec::with_capacity(self.config.min_hops + 1);
        let timeout = self.config.build_timeout;
        let built = tokio::time::timeout(timeout, self.build(tunnel, &destination, &mut sessions))
            .await
            .unwrap_or(Err(OnionError::Timeout(timeout)));

        match built {
            Ok(()) => {
                self.outgoing.insert(
                    tunnel,
                    OutgoingTunnel {
                        destination,
                        sessions,
                        created_at: Timestamp::now(),
                        datums_sent: 0,
                        bytes_sent: 0,
                    },
                );
                info!("{} is up", tunnel);
                Ok(tunnel)
            }
            Err(e) => {
                warn!("Building {} failed: {}", tunnel, e);
                self.abandon(tunnel, &sessions).await;
                Err(e)
            }
        }
    }

    fn claim_tunnel_id(&self) -> Result<TunnelId> {
        for _ in 0..REGISTER_ATTEMPTS {
            let tunnel = TunnelId::generate();
            match self.engine.routes().register(tunnel) {
                Ok(()) => return Ok(tunnel),
                Err(RoutingError::AlreadyRegistered(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(OnionError::tunneling("no free tunnel id"))
    }

    async fn build(
        &self,
        tunnel: TunnelId,
        destination: &Peer,
        sessions: &mut Vec<SessionId>,
    ) -> Result<()> {
        let mut excluded = Exclusions::new();
        excluded.insert_addr(self.config.local_addr);
        excluded.insert_key(self.engine.source_key());
        excluded.insert(destination);

        for round in 0..=self.config.min_hops {
            let peer = if round == self.config.min_hops {
                destination.clone()
            } else {
                let peer = self.sampler.sample(&excluded)?;
                excluded.insert(&peer);
                peer
            };

            let session = if round == 0 {
                self.engine.extend_first(tunnel, &peer).await?
            } else {
                self.engine.extend_through(tunnel, &sessions[..], &peer).await?
            };
            sessions.push(session);
        }
        Ok(())
    }

    /// Release whatever a failed build left behind
    async fn abandon(&self, tunnel: TunnelId, sessions: &[SessionId]) {
        if let Err(e) = self.engine.retire(tunnel).await {
            warn!("Releasing {} after failed build: {}", tunnel, e);
        }
        for session in sessions {
            self.engine.authority().close(*session).await;
        }
    }

    /// Tear a tunnel down. Returns false when nothing was known about it.
    pub async fn destroy_tunnel(&self, tunnel: TunnelId) -> Result<bool> {
        let outgoing = self.outgoing.remove(&tunnel).map(|(_, t)| t);
        let released = self.engine.retire(tunnel).await;

        if let Some(outgoing) = &outgoing {
            for session in &outgoing.sessions {
                self.engine.authority().close(*session).await;
            }
            info!("Destroyed {}", tunnel);
        }
        Ok(released? || outgoing.is_some())
    }

    fn established(&self, tunnel: TunnelId) -> Result<Vec<SessionId>> {
        self.outgoing
            .get(&tunnel)
            .map(|t| t.sessions.clone())
            .ok_or_else(|| OnionError::tunneling(format!("{} is not an established tunnel", tunnel)))
    }

    async fn send_datum(&self, tunnel: TunnelId, sessions: &[SessionId], datum: Datum) -> Result<()> {
        let first = self.engine.routes().next(tunnel).ok_or_else(|| {
            OnionError::tunneling(format!("{} lost its first hop", tunnel))
        })?;
        let len = datum.payload.len() as u64;
        self.engine
            .send_sealed(tunnel, &first, sessions, &TunnelMessage::Datum(datum))
            .await?;

        if let Some(mut outgoing) = self.outgoing.get_mut(&tunnel) {
            outgoing.datums_sent += 1;
            outgoing.bytes_sent += len;
        }
        Ok(())
    }

    /// Send application bytes, split into as many Datums as needed.
    /// Returns the number of Datums sent.
    pub async fn forward(&self, tunnel: TunnelId, bytes: &[u8]) -> Result<usize> {
        let sessions = self.established(tunnel)?;

        let mut sent = 0;
        for chunk in bytes.chunks(PAYLOAD_BYTES) {
            self.send_datum(tunnel, &sessions, Datum::data(tunnel, chunk.to_vec()))
                .await?;
            sent += 1;
        }
        Ok(sent)
    }

    /// Send `size` random bytes of cover traffic on any established tunnel
    pub async fn cover(&self, size: usize) -> Result<TunnelId> {
        let tunnel = self
            .outgoing
            .iter()
            .map(|entry| *entry.key())
            .find(|tunnel| self.engine.routes().has_next(*tunnel))
            .ok_or_else(|| OnionError::tunneling("no established tunnel for cover traffic"))?;

        self.cover_on(tunnel, size).await?;
        Ok(tunnel)
    }

    /// Send one cover Datum of `size` random bytes on `tunnel`
    pub async fn cover_on(&self, tunnel: TunnelId, size: usize) -> Result<()> {
        if size > PAYLOAD_BYTES {
            return Err(OnionError::tunneling(format!(
                "cover of {} bytes exceeds one datum ({} bytes)",
                size, PAYLOAD_BYTES
            )));
        }
        let sessions = self.established(tunnel)?;

        let mut payload = vec![0u8; size];
        rand::thread_rng().fill_bytes(&mut payload);
        self.send_datum(tunnel, &sessions, Datum::cover(tunnel, payload))
            .await
    }

    pub fn subscribe(&self, kind: EventKind) -> Subscription {
        self.engine.events().subscribe(kind)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.engine.events().unsubscribe(id)
    }

    /// Originated tunnels still routed; ones whose first hop went away are pruned
    pub fn tunnels(&self) -> Vec<TunnelInfo> {
        self.outgoing
            .retain(|tunnel, _| self.engine.routes().contains(*tunnel));

        let mut tunnels: Vec<TunnelInfo> = self
            .outgoing
            .iter()
            .map(|entry| TunnelInfo {
                tunnel_id: *entry.key(),
                destination: entry.destination.clone(),
                hops: entry.sessions.len(),
                created_at: entry.created_at,
                datums_sent: entry.datums_sent,
                bytes_sent: entry.bytes_sent,
            })
            .collect();
        tunnels.sort_by_key(|t| t.created_at.as_secs());
        tunnels
    }

    pub fn stats(&self) -> ControllerStats {
        let outgoing_tunnels = self.tunnels().len();
        ControllerStats {
            outgoing_tunnels,
            relayed_tunnels: self.engine.routes().len().saturating_sub(outgoing_tunnels),
            subscribers: self.engine.events().subscriber_count(),
        }
    }

    /// Retire every originated tunnel
    pub async fn shutdown(&self) {
        let tunnels: Vec<TunnelId> = self.outgoing.iter().map(|entry| *entry.key()).collect();
        for tunnel in tunnels {
            if let Err(e) = self.destroy_tunnel(tunnel).await {
                warn!("Destroying {} on shutdown: {}", tunnel, e);
            }
        }
    }
}
