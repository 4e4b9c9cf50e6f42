//! Buffers tunnel events between polls of the control API.

use onionmesh_core::{EventKind, Subscription, TunnelController, TunnelEvent};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

/// Events kept before the oldest are discarded
pub const INBOX_CAPACITY: usize = 1024;

/// Kinds collected for API clients
pub const COLLECTED: [EventKind; 4] = [
    EventKind::TunnelExtended,
    EventKind::TunnelIncoming,
    EventKind::DatumReceived,
    EventKind::CoverReceived,
];

#[derive(Default)]
struct Buffer {
    events: VecDeque<TunnelEvent>,
    dropped: u64,
}

pub struct EventInbox {
    capacity: usize,
    buffer: Mutex<Buffer>,
}

impl EventInbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buffer: Mutex::new(Buffer::default()),
        }
    }

    pub async fn push(&self, event: TunnelEvent) {
        let mut buffer = self.buffer.lock().await;
        if buffer.events.len() == self.capacity {
            buffer.events.pop_front();
            buffer.dropped += 1;
        }
        buffer.events.push_back(event);
    }

    /// Take everything buffered, with the count dropped since the last drain
    pub async fn drain(&self) -> (Vec<TunnelEvent>, u64) {
        let mut buffer = self.buffer.lock().await;
        let dropped = std::mem::take(&mut buffer.dropped);
        (buffer.events.drain(..).collect(), dropped)
    }

    /// Subscribe to every collected kind and feed this inbox until the bus goes away
    pub fn collect_from(self: &Arc<Self>, controller: &TunnelController) -> Vec<JoinHandle<()>> {
        COLLECTED
            .iter()
            .map(|kind| {
                let subscription = controller.subscribe(*kind);
                tokio::spawn(forward(subscription, self.clone()))
            })
            .collect()
    }
}

async fn forward(mut subscription: Subscription, inbox: Arc<EventInbox>) {
    while let Some(event) = subscription.recv().await {
        inbox.push(event).await;
    }
    debug!("Event feed for {:?} ended", subscription.kind);
}
