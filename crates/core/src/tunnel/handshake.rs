//! Extending a tunnel by one hop per round.
//!
//! Round one: the originator dials the first hop and sends it a plain
//! Extend. Later rounds: the originator wraps a Connect in every established
//! layer; the current last hop peels it, dials the new peer and hands it the
//! Extend. A plain Extend arriving on a link always means "join as the last
//! hop". The Extended answer walks back along the `prev` bindings unchanged.

use super::engine::{ExtendOutcome, TunnelEngine};
use super::events::TunnelEvent;
use crate::protocol::{Connect, Extend, Extended, RequestId, SessionId, TunnelId};
use crate::routing::RouteUpdate;
use crate::session::SessionAuthority;
use crate::transport::Link;
use dashmap::DashMap;
use onionmesh_common::{OnionError, Peer, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// One outstanding extension round at the originator.
///
/// Dropping it, whether the round failed or was cancelled by a timeout,
/// removes the pending entry and releases the half-open handshake.
struct PendingRound<'a> {
    pending: &'a DashMap<(TunnelId, RequestId), oneshot::Sender<ExtendOutcome>>,
    key: (TunnelId, RequestId),
    authority: Arc<dyn SessionAuthority>,
    started: Option<SessionId>,
}

impl PendingRound<'_> {
    fn complete(mut self) {
        self.started = None;
    }
}

impl Drop for PendingRound<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.key);
        if let Some(started) = self.started.take() {
            let authority = self.authority.clone();
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move { authority.close(started).await });
            }
        }
    }
}

/// Closes a freshly dialed link unless the round that opened it succeeds
struct DialedLink {
    link: Option<Link>,
}

impl DialedLink {
    fn keep(mut self) -> Option<Link> {
        self.link.take()
    }
}

impl Drop for DialedLink {
    fn drop(&mut self) {
        if let Some(link) = self.link.take() {
            let _ = link.close();
        }
    }
}

impl TunnelEngine {
    fn begin_round(
        &self,
        tunnel: TunnelId,
        request: RequestId,
        started: SessionId,
    ) -> (PendingRound<'_>, oneshot::Receiver<ExtendOutcome>) {
        let (tx, rx) = oneshot::channel();
        self.pending.insert((tunnel, request), tx);
        let round = PendingRound {
            pending: &self.pending,
            key: (tunnel, request),
            authority: self.authority.clone(),
            started: Some(started),
        };
        (round, rx)
    }

    async fn finish_round(
        &self,
        round: PendingRound<'_>,
        rx: oneshot::Receiver<ExtendOutcome>,
    ) -> Result<SessionId> {
        let tunnel = round.key.0;
        match rx.await {
            Ok(Ok(session)) => {
                round.complete();
                Ok(session)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(OnionError::tunneling(format!(
                "extension of {} abandoned",
                tunnel
            ))),
        }
    }

    /// First round: dial `peer` directly and make it hop one.
    ///
    /// The tunnel must already be registered locally. On success the new
    /// link becomes the originator's `next` binding.
    pub async fn extend_first(&self, tunnel: TunnelId, peer: &Peer) -> Result<SessionId> {
        let (started, handshake) = self.authority.start(peer).await?;
        let extend = Extend::new(tunnel, self.source_key.clone(), handshake);
        let (round, rx) = self.begin_round(tunnel, extend.request_id, started);

        let dialed = DialedLink {
            link: Some(self.dial(peer.socket_addr()).await?),
        };
        if let Some(link) = &dialed.link {
            link.send(&extend.into()).await.map_err(|e| {
                OnionError::tunneling_caused_by(format!("sending Extend for {} to {}", tunnel, peer), e)
            })?;
        }

        let session = self.finish_round(round, rx).await?;
        if let Some(link) = dialed.keep() {
            self.routes.set_next(tunnel, link);
        }
        info!("{} reached first hop {}", tunnel, peer);
        Ok(session)
    }

    /// Later rounds: instruct the current last hop to add `peer`.
    pub async fn extend_through(
        &self,
        tunnel: TunnelId,
        sessions: &[SessionId],
        peer: &Peer,
    ) -> Result<SessionId> {
        let first = self
            .routes
            .next(tunnel)
            .ok_or_else(|| OnionError::tunneling(format!("{} has no first hop", tunnel)))?;

        let (started, handshake) = self.authority.start(peer).await?;
        let connect = Connect::new(
            tunnel,
            peer.address,
            peer.port,
            self.source_key.clone(),
            handshake,
        );
        let (round, rx) = self.begin_round(tunnel, connect.request_id, started);

        self.send_sealed(tunnel, &first, sessions, &connect.into())
            .await?;

        let session = self.finish_round(round, rx).await?;
        info!("{} extended to {} ({} hops)", tunnel, peer, sessions.len() + 1);
        Ok(session)
    }

    /// A plain Extend: this node joins the tunnel as its last hop
    pub(crate) async fn handle_extend(&self, link: &Link, extend: Extend) -> Result<()> {
        let tunnel = extend.tunnel_id;
        let (session, response) = self.authority.response_to(&extend.handshake).await?;

        let registered = self.routes.register_with(
            tunnel,
            RouteUpdate {
                prev: Some(link.clone()),
                session: Some(session),
                source_key: Some(extend.source_key),
                ..Default::default()
            },
        );
        if let Err(e) = registered {
            self.authority.close(session).await;
            return Err(e.into());
        }

        let reply = Extended::new(tunnel, extend.request_id, response);
        if let Err(e) = link.send(&reply.into()).await {
            // the route must not outlive a failed build
            if let Err(forget) = self.routes.forget(tunnel) {
                debug!("Releasing {}: {}", tunnel, forget);
            }
            self.authority.close(session).await;
            return Err(OnionError::tunneling_caused_by(
                format!("answering Extend for {}", tunnel),
                e,
            ));
        }

        info!("Joined {} as last hop via {}", tunnel, link.remote_addr());
        Ok(())
    }

    /// A peeled Connect: extend the tunnel past this node.
    ///
    /// Paths never branch, so a Connect for a tunnel that already has a
    /// `next` hop is refused. It is refused as a `Tunneling` error rather
    /// than a protocol violation: the frame decoded and authenticated, so
    /// the link to `prev` stays open and only this extension is dropped.
    pub(crate) async fn handle_connect(&self, tunnel: TunnelId, connect: Connect) -> Result<()> {
        if connect.tunnel_id != tunnel {
            return Err(OnionError::protocol(format!(
                "Connect for {} sealed inside {}",
                connect.tunnel_id, tunnel
            )));
        }
        if self.routes.has_next(tunnel) {
            return Err(OnionError::tunneling(format!(
                "{} already extends past this node",
                tunnel
            )));
        }

        let addr = SocketAddr::new(connect.destination, connect.port);
        let dialed = DialedLink {
            link: Some(self.dial(addr).await?),
        };
        if let Some(link) = &dialed.link {
            link.send(&connect.to_extend().into()).await.map_err(|e| {
                OnionError::tunneling_caused_by(format!("forwarding Extend for {} to {}", tunnel, addr), e)
            })?;
        }

        if let Some(link) = dialed.keep() {
            self.routes.set_next(tunnel, link);
        }
        debug!("{} extending to {}", tunnel, addr);
        Ok(())
    }

    pub(crate) async fn handle_extended(&self, link: &Link, extended: Extended) -> Result<()> {
        let tunnel = extended.tunnel_id;
        let Some(route) = self.routes.get(tunnel) else {
            warn!("Dropping Extended for unknown {} from {}", tunnel, link.remote_addr());
            return Ok(());
        };

        if let Some(prev) = route.prev {
            return prev.send(&extended.into()).await.map_err(|e| {
                OnionError::tunneling_caused_by(format!("relaying Extended for {}", tunnel), e)
            });
        }

        // no prev: this node originated the tunnel
        let request = extended.request_id;
        let Some((_, waiter)) = self.pending.remove(&(tunnel, request)) else {
            warn!("Dropping unmatched Extended {} for {}", request, tunnel);
            return Ok(());
        };

        let outcome = self
            .authority
            .confirm(&extended.handshake)
            .await
            .map_err(OnionError::from);
        if let Ok(session) = &outcome {
            self.publish(TunnelEvent::TunnelExtended {
                tunnel_id: tunnel,
                session: *session,
                request_id: request,
            });
        }

        if let Err(Ok(session)) = waiter.send(outcome) {
            debug!("Originator of {} stopped waiting for {}", tunnel, request);
            self.authority.close(session).await;
        }
        Ok(())
    }
}
