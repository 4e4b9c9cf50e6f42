use crate::protocol::{RequestId, SessionId, TunnelId};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

/// Notifications raised by the tunnel engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TunnelEvent {
    /// The originator finished one extension round
    TunnelExtended {
        tunnel_id: TunnelId,
        session: SessionId,
        request_id: RequestId,
    },
    /// Real data reached the terminal hop
    DatumReceived {
        tunnel_id: TunnelId,
        #[serde(with = "hex::serde")]
        payload: Vec<u8>,
    },
    /// Cover traffic reached the terminal hop and was discarded
    CoverReceived { tunnel_id: TunnelId, size: usize },
    /// First real data on a tunnel this node terminates
    TunnelIncoming {
        tunnel_id: TunnelId,
        #[serde(with = "hex::serde")]
        source_key: Vec<u8>,
    },
}

impl TunnelEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::TunnelExtended { .. } => EventKind::TunnelExtended,
            Self::DatumReceived { .. } => EventKind::DatumReceived,
            Self::CoverReceived { .. } => EventKind::CoverReceived,
            Self::TunnelIncoming { .. } => EventKind::TunnelIncoming,
        }
    }

    pub fn tunnel_id(&self) -> TunnelId {
        match self {
            Self::TunnelExtended { tunnel_id, .. }
            | Self::DatumReceived { tunnel_id, .. }
            | Self::CoverReceived { tunnel_id, .. }
            | Self::TunnelIncoming { tunnel_id, .. } => *tunnel_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TunnelExtended,
    DatumReceived,
    CoverReceived,
    TunnelIncoming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Receiving end of one subscription
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub kind: EventKind,
    receiver: mpsc::UnboundedReceiver<TunnelEvent>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<TunnelEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<TunnelEvent> {
        self.receiver.try_recv().ok()
    }
}

struct Subscriber {
    kind: EventKind,
    sender: mpsc::UnboundedSender<TunnelEvent>,
}

/// One channel per subscriber, each bound to a single event kind
#[derive(Default)]
pub struct EventBus {
    subscribers: DashMap<SubscriptionId, Subscriber>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, kind: EventKind) -> Subscription {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers.insert(id, Subscriber { kind, sender });

        Subscription { id, kind, receiver }
    }

    /// Returns false for an unknown id
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.remove(&id).is_some()
    }

    /// Deliver to every subscriber of the event's kind; subscribers whose
    /// receiver is gone are dropped. Returns how many received it.
    pub fn publish(&self, event: TunnelEvent) -> usize {
        let kind = event.kind();
        let mut delivered = 0;
        let mut gone = Vec::new();

        for entry in self.subscribers.iter() {
            if entry.kind != kind {
                continue;
            }
            if entry.sender.send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                gone.push(*entry.key());
            }
        }

        for id in gone {
            self.subscribers.remove(&id);
        }
        debug!("{:?} on {} delivered to {} subscribers", kind, event.tunnel_id(), delivered);
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}
