//! Engine tests over an in-memory network of nodes.

use super::*;
use crate::protocol::frame::PAYLOAD_BYTES;
use crate::protocol::{
    Connect, Datum, DatumEncrypted, Extended, RelayEnvelope, RequestId, TunnelId, TunnelMessage,
};
use crate::session::X25519SessionAuthority;
use crate::transport::{Dialer, FrameHandler, Link, LinkError};
use async_trait::async_trait;
use dashmap::DashMap;
use onionmesh_common::{OnionError, Peer};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

/// Addresses of nodes that accept links, and the engines behind them
#[derive(Default)]
struct MemoryNetwork {
    nodes: DashMap<SocketAddr, Arc<dyn FrameHandler>>,
}

struct MemoryDialer {
    network: Arc<MemoryNetwork>,
    local: SocketAddr,
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial(
        &self,
        addr: SocketAddr,
        handler: Arc<dyn FrameHandler>,
    ) -> Result<Link, LinkError> {
        let remote = self
            .network
            .nodes
            .get(&addr)
            .map(|entry| entry.value().clone())
            .ok_or(LinkError::Unreachable {
                addr,
                reason: "no such node".to_string(),
            })?;

        let (ours, theirs) = tokio::io::duplex(256 * 1024);
        let (our_read, our_write) = tokio::io::split(ours);
        let (their_read, their_write) = tokio::io::split(theirs);

        Link::spawn(self.local, their_read, their_write, None, remote);
        Ok(Link::spawn(addr, our_read, our_write, None, handler))
    }
}

/// Swallows everything, never answers
struct BlackHole;

#[async_trait]
impl FrameHandler for BlackHole {
    async fn handle_frame(&self, _link: &Link, _message: TunnelMessage) -> Result<(), OnionError> {
        Ok(())
    }

    async fn link_closed(&self, _link: &Link) {}
}

/// Holds every frame it accepts for `delay` before the engine sees it
struct Sluggish {
    engine: Arc<TunnelEngine>,
    delay: Duration,
}

#[async_trait]
impl FrameHandler for Sluggish {
    async fn handle_frame(&self, link: &Link, message: TunnelMessage) -> Result<(), OnionError> {
        tokio::time::sleep(self.delay).await;
        self.engine.handle_frame(link, message).await
    }

    async fn link_closed(&self, link: &Link) {
        self.engine.link_closed(link).await
    }
}

struct TestNode {
    peer: Peer,
    engine: Arc<TunnelEngine>,
    controller: TunnelController,
}

fn addr(i: u8) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, i)), 7100)
}

/// `count` connected nodes; every node samples from all the others
fn network(count: u8, min_hops: usize) -> (Arc<MemoryNetwork>, Vec<TestNode>) {
    let net = Arc::new(MemoryNetwork::default());
    let mut engines = Vec::new();
    let mut peers = Vec::new();

    for i in 1..=count {
        let local = addr(i);
        let key = vec![i; 32];
        let engine = TunnelEngine::new(
            key.clone(),
            Arc::new(X25519SessionAuthority::new()),
            Arc::new(MemoryDialer {
                network: net.clone(),
                local,
            }),
        );
        net.nodes.insert(local, engine.clone());
        engines.push(engine);
        peers.push(Peer::from_socket(local, key));
    }

    let nodes = engines
        .into_iter()
        .zip(peers.iter().cloned())
        .map(|(engine, peer)| {
            let config = ControllerConfig::new(peer.socket_addr())
                .with_min_hops(min_hops)
                .with_build_timeout(Duration::from_millis(500));
            let sampler = Arc::new(StaticPeerSampler::new(peers.clone()));
            let controller = TunnelController::new(engine.clone(), sampler, config).unwrap();
            TestNode {
                peer,
                engine,
                controller,
            }
        })
        .collect();

    (net, nodes)
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

async fn next_event(sub: &mut Subscription) -> TunnelEvent {
    tokio::time::timeout(Duration::from_secs(2), sub.recv())
        .await
        .expect("event within deadline")
        .expect("bus alive")
}

#[tokio::test]
async fn test_three_node_tunnel_bindings() {
    let (_net, nodes) = network(3, 1);
    let (origin, hop, dest) = (&nodes[0], &nodes[1], &nodes[2]);

    let tunnel = origin.controller.create_tunnel(dest.peer.clone()).await.unwrap();

    let first = origin.engine.routes().next(tunnel).unwrap();
    assert_eq!(first.remote_addr(), hop.peer.socket_addr());
    assert!(!origin.engine.routes().has_prev(tunnel));
    assert!(!origin.engine.routes().has_session(tunnel));

    assert!(hop.engine.routes().has_prev(tunnel));
    assert!(hop.engine.routes().has_next(tunnel));
    assert!(hop.engine.routes().has_session(tunnel));

    assert!(dest.engine.routes().has_prev(tunnel));
    assert!(!dest.engine.routes().has_next(tunnel));
    assert!(dest.engine.routes().has_session(tunnel));

    let tunnels = origin.controller.tunnels();
    assert_eq!(tunnels.len(), 1);
    assert_eq!(tunnels[0].hops, 2);
    assert_eq!(tunnels[0].destination, dest.peer);
}

#[tokio::test]
async fn test_longer_tunnel_uses_distinct_hops() {
    let (_net, nodes) = network(5, 3);
    let dest = &nodes[4];

    let tunnel = nodes[0].controller.create_tunnel(dest.peer.clone()).await.unwrap();

    // every other node is on the path exactly once
    for node in &nodes[1..4] {
        assert!(node.engine.routes().has_prev(tunnel));
        assert!(node.engine.routes().has_next(tunnel));
    }
    assert!(!dest.engine.routes().has_next(tunnel));
    assert_eq!(nodes[0].controller.tunnels()[0].hops, 4);
}

#[tokio::test]
async fn test_extension_events_reach_subscribers() {
    let (_net, nodes) = network(3, 1);
    let mut extended = nodes[0].controller.subscribe(EventKind::TunnelExtended);

    let tunnel = nodes[0].controller.create_tunnel(nodes[2].peer.clone()).await.unwrap();

    for _ in 0..2 {
        match next_event(&mut extended).await {
            TunnelEvent::TunnelExtended { tunnel_id, .. } => assert_eq!(tunnel_id, tunnel),
            other => panic!("unexpected {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_forward_fragments_and_reassembles() {
    let (_net, nodes) = network(3, 1);
    let dest = &nodes[2];
    let mut data = dest.controller.subscribe(EventKind::DatumReceived);
    let mut incoming = dest.controller.subscribe(EventKind::TunnelIncoming);

    let tunnel = nodes[0].controller.create_tunnel(dest.peer.clone()).await.unwrap();

    let payload: Vec<u8> = (0..2 * PAYLOAD_BYTES + 100).map(|i| (i % 251) as u8).collect();
    let sent = nodes[0].controller.forward(tunnel, &payload).await.unwrap();
    assert_eq!(sent, 3);

    let mut received = Vec::new();
    while received.len() < payload.len() {
        match next_event(&mut data).await {
            TunnelEvent::DatumReceived { tunnel_id, payload } => {
                assert_eq!(tunnel_id, tunnel);
                received.extend_from_slice(&payload);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
    assert_eq!(received, payload);

    // announced once, with the originator's key
    assert_eq!(
        next_event(&mut incoming).await,
        TunnelEvent::TunnelIncoming {
            tunnel_id: tunnel,
            source_key: nodes[0].peer.public_key.clone(),
        }
    );
    assert!(incoming.try_recv().is_none());

    let info = &nodes[0].controller.tunnels()[0];
    assert_eq!(info.datums_sent, 3);
    assert_eq!(info.bytes_sent, payload.len() as u64);
}

#[tokio::test]
async fn test_cover_never_reaches_data_subscribers() {
    let (_net, nodes) = network(3, 1);
    let dest = &nodes[2];
    let mut data = dest.controller.subscribe(EventKind::DatumReceived);
    let mut cover = dest.controller.subscribe(EventKind::CoverReceived);

    let tunnel = nodes[0].controller.create_tunnel(dest.peer.clone()).await.unwrap();
    assert_eq!(nodes[0].controller.cover(128).await.unwrap(), tunnel);

    assert_eq!(
        next_event(&mut cover).await,
        TunnelEvent::CoverReceived {
            tunnel_id: tunnel,
            size: 128
        }
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(data.try_recv().is_none());
}

#[tokio::test]
async fn test_cover_needs_a_tunnel() {
    let (_net, nodes) = network(3, 1);
    assert!(matches!(
        nodes[0].controller.cover(16).await,
        Err(OnionError::Tunneling { .. })
    ));
}

#[tokio::test]
async fn test_retire_clears_every_hop() {
    let (_net, nodes) = network(4, 2);
    let tunnel = nodes[0].controller.create_tunnel(nodes[3].peer.clone()).await.unwrap();
    for node in &nodes {
        assert!(node.engine.routes().contains(tunnel));
    }

    assert!(nodes[0].controller.destroy_tunnel(tunnel).await.unwrap());

    for node in &nodes {
        let routes = node.engine.routes();
        assert!(eventually(|| !routes.contains(tunnel)).await);
    }
    assert!(nodes[0].controller.tunnels().is_empty());

    // again: nothing left to do
    assert!(!nodes[0].controller.destroy_tunnel(tunnel).await.unwrap());
    assert!(matches!(
        nodes[0].controller.forward(tunnel, b"late").await,
        Err(OnionError::Tunneling { .. })
    ));
}

#[tokio::test]
async fn test_unreachable_destination_releases_state() {
    let (_net, nodes) = network(2, 1);
    let nowhere = Peer::from_socket(addr(99), vec![0; 32]);

    assert!(nodes[0].controller.create_tunnel(nowhere).await.is_err());

    let hop = nodes[1].engine.routes();
    assert!(eventually(|| hop.is_empty()).await);
    assert!(nodes[0].engine.routes().is_empty());
    assert!(nodes[0].engine.pending.is_empty());
}

#[tokio::test]
async fn test_silent_peer_times_out() {
    let (net, nodes) = network(2, 0);
    let silent = addr(50);
    net.nodes.insert(silent, Arc::new(BlackHole));

    let result = nodes[0]
        .controller
        .create_tunnel(Peer::from_socket(silent, vec![0; 32]))
        .await;

    assert!(matches!(result, Err(OnionError::Timeout(_))));
    assert!(nodes[0].engine.routes().is_empty());
    assert!(nodes[0].engine.pending.is_empty());
}

#[tokio::test]
async fn test_not_enough_peers_fails_cleanly() {
    let (_net, nodes) = network(2, 2);

    let result = nodes[0].controller.create_tunnel(nodes[1].peer.clone()).await;
    assert!(matches!(result, Err(OnionError::Tunneling { .. })));
    assert!(nodes[0].engine.routes().is_empty());
}

#[tokio::test]
async fn test_own_key_never_sampled_under_another_address() {
    let (_net, nodes) = network(3, 1);
    let (origin, hop, dest) = (&nodes[0], &nodes[1], &nodes[2]);

    // bound to the wildcard, listed by its real address in a shared peer list
    let wildcard: SocketAddr = "0.0.0.0:7100".parse().unwrap();
    let peers = nodes.iter().map(|node| node.peer.clone()).collect();
    let controller = TunnelController::new(
        origin.engine.clone(),
        Arc::new(StaticPeerSampler::new(peers)),
        ControllerConfig::new(wildcard)
            .with_min_hops(1)
            .with_build_timeout(Duration::from_millis(500)),
    )
    .unwrap();

    for _ in 0..20 {
        let tunnel = controller.create_tunnel(dest.peer.clone()).await.unwrap();
        let first = origin.engine.routes().next(tunnel).unwrap();
        assert_eq!(first.remote_addr(), hop.peer.socket_addr());
        assert!(controller.destroy_tunnel(tunnel).await.unwrap());
    }
}

#[tokio::test]
async fn test_build_timeout_covers_every_round() {
    let (net, nodes) = network(3, 1);
    let (origin, hop, dest) = (&nodes[0], &nodes[1], &nodes[2]);

    // each round fits the budget on its own, both together do not
    net.nodes.insert(
        hop.peer.socket_addr(),
        Arc::new(Sluggish {
            engine: hop.engine.clone(),
            delay: Duration::from_millis(300),
        }),
    );

    let result = origin.controller.create_tunnel(dest.peer.clone()).await;
    assert!(matches!(result, Err(OnionError::Timeout(_))));
    assert!(origin.engine.routes().is_empty());
    assert!(origin.engine.pending.is_empty());
}

#[tokio::test]
async fn test_unmatched_extended_is_dropped() {
    let (_net, nodes) = network(1, 0);
    let engine = &nodes[0].engine;
    let tunnel = TunnelId(42);
    engine.routes().register(tunnel).unwrap();

    let (link, _other) = crate::transport::linked_pair(engine.clone(), Arc::new(BlackHole));
    let stray = Extended::new(tunnel, RequestId(7), vec![0; 34]);

    engine.handle_frame(&link, stray.into()).await.unwrap();
    assert!(!link.is_closed());
}

#[tokio::test]
async fn test_datum_without_session_is_dropped() {
    let (_net, nodes) = network(1, 0);
    let engine = &nodes[0].engine;
    let tunnel = TunnelId(5);
    let (link, _other) = crate::transport::linked_pair(engine.clone(), Arc::new(BlackHole));
    engine.routes().set_prev(tunnel, link.clone());

    let result = engine
        .handle_frame(&link, DatumEncrypted::new(tunnel, vec![1; 64]).into())
        .await;
    assert!(matches!(result, Err(OnionError::DataForwarding { .. })));
}

#[tokio::test]
async fn test_bare_datum_is_a_protocol_violation() {
    let (_net, nodes) = network(1, 0);
    let engine = &nodes[0].engine;
    let (link, _other) = crate::transport::linked_pair(engine.clone(), Arc::new(BlackHole));

    let result = engine
        .handle_frame(&link, Datum::data(TunnelId(1), vec![1]).into())
        .await;
    assert!(matches!(result, Err(ref e) if e.is_fatal_to_connection()));
}

#[tokio::test]
async fn test_second_extension_from_same_hop_rejected() {
    let (_net, nodes) = network(3, 1);
    let (origin, hop, dest) = (&nodes[0], &nodes[1], &nodes[2]);
    let tunnel = origin.controller.create_tunnel(dest.peer.clone()).await.unwrap();

    // hop already extends to dest; a second Connect must not branch the path
    let connect = Connect::new(
        tunnel,
        dest.peer.address,
        dest.peer.port,
        origin.peer.public_key.clone(),
        vec![0; 34],
    );
    let result = hop.engine.handle_connect(tunnel, connect).await;
    assert!(matches!(result, Err(OnionError::Tunneling { .. })));
}

#[tokio::test]
async fn test_layers_left_at_last_hop_dropped() {
    let (_net, nodes) = network(3, 1);
    let (origin, dest) = (&nodes[0], &nodes[2]);
    let tunnel = origin.controller.create_tunnel(dest.peer.clone()).await.unwrap();

    // a datum wrapped once more than the path is long never reaches subscribers
    let mut data = dest.controller.subscribe(EventKind::DatumReceived);
    let sealed = RelayEnvelope::seal(&Datum::data(tunnel, b"x".to_vec()).into()).unwrap();
    let route = dest.engine.routes().get(tunnel).unwrap();
    let prev = route.prev.unwrap();
    let session = route.session.unwrap();
    let extra = dest
        .engine
        .authority()
        .encrypt(&sealed, &[session, session])
        .await
        .unwrap();

    let result = dest
        .engine
        .handle_frame(&prev, DatumEncrypted::new(tunnel, extra).into())
        .await;
    assert!(matches!(result, Err(OnionError::Tunneling { .. })));
    assert!(data.try_recv().is_none());
}
