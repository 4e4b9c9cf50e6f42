use super::events::{EventBus, TunnelEvent};
use crate::protocol::{RequestId, SessionId, TunnelId, TunnelMessage};
use crate::routing::RoutingTable;
use crate::session::SessionAuthority;
use crate::transport::{Dialer, FrameHandler, Link};
use async_trait::async_trait;
use dashmap::DashMap;
use onionmesh_common::{OnionError, Result};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Outcome of one extension round, delivered to the waiting originator
pub(crate) type ExtendOutcome = Result<SessionId>;

/// Per-node protocol state machine.
///
/// Every inbound frame enters through [`FrameHandler::handle_frame`]; the
/// handshake relay and the forwarding pipeline live in sibling modules as
/// further `impl TunnelEngine` blocks.
pub struct TunnelEngine {
    me: Weak<TunnelEngine>,
    pub(crate) source_key: Vec<u8>,
    pub(crate) routes: RoutingTable,
    pub(crate) authority: Arc<dyn SessionAuthority>,
    dialer: Arc<dyn Dialer>,
    pub(crate) events: EventBus,
    /// Originator builds waiting for their Extended
    pub(crate) pending: DashMap<(TunnelId, RequestId), oneshot::Sender<ExtendOutcome>>,
}

impl TunnelEngine {
    pub fn new(
        source_key: Vec<u8>,
        authority: Arc<dyn SessionAuthority>,
        dialer: Arc<dyn Dialer>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            source_key,
            routes: RoutingTable::new(),
            authority,
            dialer,
            events: EventBus::new(),
            pending: DashMap::new(),
        })
    }

    pub fn routes(&self) -> &RoutingTable {
        &self.routes
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn authority(&self) -> &Arc<dyn SessionAuthority> {
        &self.authority
    }

    pub fn source_key(&self) -> &[u8] {
        &self.source_key
    }

    /// Open a link whose inbound frames come back to this engine
    pub(crate) async fn dial(&self, addr: SocketAddr) -> Result<Link> {
        let handler: Arc<dyn FrameHandler> = self
            .me
            .upgrade()
            .ok_or_else(|| OnionError::initialization("tunnel engine is shutting down"))?;

        Ok(self.dialer.dial(addr, handler).await?)
    }

    pub(crate) fn publish(&self, event: TunnelEvent) {
        self.events.publish(event);
    }

    /// Drop the route and the session it holds. Unknown tunnels are a no-op.
    pub(crate) async fn release(&self, tunnel: TunnelId) -> Result<bool> {
        let session = self.routes.session(tunnel);
        let removed = self.routes.forget(tunnel);

        if let Some(session) = session {
            self.authority.close(session).await;
        }
        Ok(removed?.is_some())
    }

    /// Close every route and session. Used when the node stops.
    pub async fn shutdown(&self) {
        for (tunnel, route) in self.routes.shutdown() {
            if let Some(session) = route.session {
                self.authority.close(session).await;
            }
            debug!("Dropped {} on shutdown", tunnel);
        }
        self.pending.clear();
    }
}

#[async_trait]
impl FrameHandler for TunnelEngine {
    async fn handle_frame(&self, link: &Link, message: TunnelMessage) -> Result<()> {
        debug!(
            "{:?} for {} on {}",
            message.message_type(),
            message.tunnel_id(),
            link.id()
        );

        match message {
            TunnelMessage::Extend(extend) => self.handle_extend(link, extend).await,
            TunnelMessage::Extended(extended) => self.handle_extended(link, extended).await,
            TunnelMessage::DatumEncrypted(datum) => {
                self.handle_datum_encrypted(link, datum).await
            }
            TunnelMessage::Retire(retire) => self.handle_retire(link, retire).await,
            // only ever valid inside a relay envelope
            other @ (TunnelMessage::Connect(_) | TunnelMessage::Datum(_)) => {
                Err(OnionError::protocol(format!(
                    "{:?} for {} arrived outside a relay envelope",
                    other.message_type(),
                    other.tunnel_id()
                )))
            }
        }
    }

    async fn link_closed(&self, link: &Link) {
        for tunnel in self.routes.tunnels_using(link.id()) {
            let Some(route) = self.routes.get(tunnel) else {
                continue;
            };

            // upstream vanished: tear down the rest of the path
            if route.prev.as_ref() == Some(link) {
                if let Some(next) = &route.next {
                    if let Err(e) = next.send(&crate::protocol::Retire::new(tunnel).into()).await {
                        debug!("Could not retire {} downstream: {}", tunnel, e);
                    }
                }
            }

            match self.release(tunnel).await {
                Ok(_) => warn!("{} lost {}, route released", tunnel, link.id()),
                Err(e) => warn!("{} lost {}, release incomplete: {}", tunnel, link.id(), e),
            }
        }
    }
}
