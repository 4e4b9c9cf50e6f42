use onionmesh_common::{OnionError, Peer};
use rand::seq::SliceRandom;
use std::net::SocketAddr;
use std::sync::RwLock;

/// Peers a sample must avoid, matched by address or by host key
#[derive(Debug, Default, Clone)]
pub struct Exclusions {
    addrs: Vec<SocketAddr>,
    keys: Vec<Vec<u8>>,
}

impl Exclusions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exclude a peer under its address and its key
    pub fn insert(&mut self, peer: &Peer) {
        self.insert_addr(peer.socket_addr());
        self.insert_key(&peer.public_key);
    }

    pub fn insert_addr(&mut self, addr: SocketAddr) {
        if !self.addrs.contains(&addr) {
            self.addrs.push(addr);
        }
    }

    /// Empty keys identify nobody and are ignored
    pub fn insert_key(&mut self, key: &[u8]) {
        if !key.is_empty() && !self.keys.iter().any(|k| k == key) {
            self.keys.push(key.to_vec());
        }
    }

    pub fn excludes(&self, peer: &Peer) -> bool {
        self.addrs.contains(&peer.socket_addr())
            || (!peer.public_key.is_empty() && self.keys.iter().any(|k| *k == peer.public_key))
    }
}

/// Supplies candidate intermediate hops for tunnel builds
pub trait PeerSampler: Send + Sync {
    /// Pick one peer uniformly among those `excluded` does not match
    fn sample(&self, excluded: &Exclusions) -> Result<Peer, SamplerError>;
}

/// Samples from a fixed list of peers, usually the configured ones
#[derive(Debug, Default)]
pub struct StaticPeerSampler {
    peers: RwLock<Vec<Peer>>,
}

impl StaticPeerSampler {
    pub fn new(peers: Vec<Peer>) -> Self {
        Self {
            peers: RwLock::new(peers),
        }
    }

    /// Add a peer unless one with the same address is already known
    pub fn add_peer(&self, peer: Peer) {
        if let Ok(mut peers) = self.peers.write() {
            if !peers.iter().any(|p| p.socket_addr() == peer.socket_addr()) {
                peers.push(peer);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.peers.read().map(|peers| peers.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PeerSampler for StaticPeerSampler {
    fn sample(&self, excluded: &Exclusions) -> Result<Peer, SamplerError> {
        let peers = self.peers.read().map_err(|_| SamplerError::Unavailable)?;

        let candidates: Vec<&Peer> = peers.iter().filter(|peer| !excluded.excludes(peer)).collect();

        candidates
            .choose(&mut rand::thread_rng())
            .map(|peer| (*peer).clone())
            .ok_or(SamplerError::InsufficientPeers {
                known: peers.len(),
                excluded: peers.len() - candidates.len(),
            })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SamplerError {
    #[error("No eligible peer: {known} known, {excluded} excluded")]
    InsufficientPeers { known: usize, excluded: usize },

    #[error("Peer list unavailable")]
    Unavailable,
}

impl From<SamplerError> for OnionError {
    fn from(err: SamplerError) -> Self {
        OnionError::tunneling_caused_by("cannot select intermediate hop", err)
    }
}
