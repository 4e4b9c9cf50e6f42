//! Tunnels across real nodes on localhost QUIC endpoints.

use onionmesh_common::{NodeConfig, Peer};
use onionmesh_core::{
    EventKind, HostKey, Node, StaticPeerSampler, Subscription, TunnelEvent,
    X25519SessionAuthority, PAYLOAD_BYTES,
};
use std::sync::Arc;
use std::time::Duration;

struct Cluster {
    nodes: Vec<Node>,
}

impl Cluster {
    /// `count` nodes that all know each other
    async fn start(count: usize, min_hops: usize) -> Self {
        let config = NodeConfig::new()
            .with_listen_addr("127.0.0.1")
            .with_port(0)
            .with_min_hops(min_hops)
            .with_build_timeout(Duration::from_secs(5))
            .with_hostkey_path(None);

        let mut nodes = Vec::new();
        let mut samplers = Vec::new();
        for _ in 0..count {
            let sampler = Arc::new(StaticPeerSampler::new(vec![]));
            let node = Node::bind(
                &config,
                HostKey::generate(),
                Arc::new(X25519SessionAuthority::new()),
                sampler.clone(),
            )
            .await
            .unwrap();
            samplers.push(sampler);
            nodes.push(node);
        }

        let peers: Vec<Peer> = nodes.iter().map(|n| n.peer().clone()).collect();
        for sampler in &samplers {
            for peer in &peers {
                sampler.add_peer(peer.clone());
            }
        }
        Self { nodes }
    }

    async fn stop(self) {
        for node in &self.nodes {
            node.shutdown().await;
        }
    }
}

async fn next_event(sub: &mut Subscription) -> TunnelEvent {
    tokio::time::timeout(Duration::from_secs(5), sub.recv())
        .await
        .expect("event within deadline")
        .expect("bus alive")
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}

#[tokio::test]
async fn test_one_intermediate_hop() {
    let cluster = Cluster::start(3, 1).await;
    let (origin, hop, dest) = (&cluster.nodes[0], &cluster.nodes[1], &cluster.nodes[2]);

    let tunnel = origin
        .controller()
        .create_tunnel(dest.peer().clone())
        .await
        .unwrap();

    let first = origin.engine().routes().next(tunnel).unwrap();
    assert_eq!(first.remote_addr(), hop.local_addr());
    assert!(!origin.engine().routes().has_prev(tunnel));

    assert!(hop.engine().routes().has_prev(tunnel));
    assert!(hop.engine().routes().has_next(tunnel));

    assert!(dest.engine().routes().has_prev(tunnel));
    assert!(!dest.engine().routes().has_next(tunnel));
    assert!(dest.engine().routes().has_session(tunnel));

    cluster.stop().await;
}

#[tokio::test]
async fn test_data_arrives_in_order() {
    let cluster = Cluster::start(4, 2).await;
    let (origin, dest) = (&cluster.nodes[0], &cluster.nodes[3]);
    let mut data = dest.controller().subscribe(EventKind::DatumReceived);
    let mut incoming = dest.controller().subscribe(EventKind::TunnelIncoming);

    let tunnel = origin
        .controller()
        .create_tunnel(dest.peer().clone())
        .await
        .unwrap();

    let payload: Vec<u8> = (0..3 * PAYLOAD_BYTES + 7).map(|i| (i * 7 % 256) as u8).collect();
    let sent = origin.controller().forward(tunnel, &payload).await.unwrap();
    assert_eq!(sent, payload.len().div_ceil(PAYLOAD_BYTES));

    let mut received = Vec::new();
    while received.len() < payload.len() {
        if let TunnelEvent::DatumReceived { payload, .. } = next_event(&mut data).await {
            received.extend_from_slice(&payload);
        }
    }
    assert_eq!(received, payload);

    match next_event(&mut incoming).await {
        TunnelEvent::TunnelIncoming { tunnel_id, source_key } => {
            assert_eq!(tunnel_id, tunnel);
            assert_eq!(source_key, origin.peer().public_key);
        }
        other => panic!("unexpected {:?}", other),
    }

    cluster.stop().await;
}

#[tokio::test]
async fn test_cover_is_not_data() {
    let cluster = Cluster::start(3, 1).await;
    let (origin, dest) = (&cluster.nodes[0], &cluster.nodes[2]);
    let mut data = dest.controller().subscribe(EventKind::DatumReceived);
    let mut cover = dest.controller().subscribe(EventKind::CoverReceived);

    let tunnel = origin
        .controller()
        .create_tunnel(dest.peer().clone())
        .await
        .unwrap();
    origin.controller().cover_on(tunnel, 300).await.unwrap();

    assert!(matches!(
        next_event(&mut cover).await,
        TunnelEvent::CoverReceived { size: 300, .. }
    ));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(data.try_recv().is_none());

    cluster.stop().await;
}

#[tokio::test]
async fn test_destroy_clears_all_hops() {
    let cluster = Cluster::start(3, 1).await;
    let origin = &cluster.nodes[0];

    let tunnel = origin
        .controller()
        .create_tunnel(cluster.nodes[2].peer().clone())
        .await
        .unwrap();
    assert_eq!(origin.controller().stats().outgoing_tunnels, 1);

    assert!(origin.controller().destroy_tunnel(tunnel).await.unwrap());
    for node in &cluster.nodes {
        let routes = node.engine().routes();
        assert!(eventually(|| !routes.contains(tunnel)).await);
    }
    assert!(!origin.controller().destroy_tunnel(tunnel).await.unwrap());
    assert_eq!(origin.controller().stats().outgoing_tunnels, 0);

    cluster.stop().await;
}

#[tokio::test]
async fn test_concurrent_builds() {
    let cluster = Cluster::start(4, 1).await;
    let origin = &cluster.nodes[0];
    let dest = cluster.nodes[3].peer().clone();

    let (a, b) = tokio::join!(
        origin.controller().create_tunnel(dest.clone()),
        origin.controller().create_tunnel(dest.clone())
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_ne!(a, b);
    assert_eq!(origin.controller().tunnels().len(), 2);

    cluster.stop().await;
}
