//! Moving layered data along established tunnels.

use super::engine::TunnelEngine;
use super::events::TunnelEvent;
use crate::protocol::{Datum, DatumEncrypted, RelayEnvelope, Retire, SessionId, TunnelId, TunnelMessage};
use crate::transport::Link;
use onionmesh_common::{OnionError, Result};
use tracing::{debug, info};

impl TunnelEngine {
    /// Seal `message` in a relay envelope, wrap it under every session and
    /// send it towards the first hop.
    pub(crate) async fn send_sealed(
        &self,
        tunnel: TunnelId,
        first: &Link,
        sessions: &[SessionId],
        message: &TunnelMessage,
    ) -> Result<()> {
        let sealed = RelayEnvelope::seal(message)?;
        let layered = self.authority.encrypt(&sealed, sessions).await?;
        let frame = TunnelMessage::DatumEncrypted(DatumEncrypted::new(tunnel, layered));

        first.send(&frame).await.map_err(|e| {
            OnionError::tunneling_caused_by(format!("sending on {}", tunnel), e)
        })
    }

    pub(crate) async fn handle_datum_encrypted(
        &self,
        link: &Link,
        datum: DatumEncrypted,
    ) -> Result<()> {
        let tunnel = datum.tunnel_id;
        let route = self.routes.get(tunnel).ok_or_else(|| {
            OnionError::data_forwarding(format!("no route for {}", tunnel))
        })?;

        if route.prev.as_ref() != Some(link) {
            return Err(OnionError::data_forwarding(format!(
                "{} data arrived from {} instead of upstream",
                tunnel,
                link.id()
            )));
        }
        let session = route.session.ok_or_else(|| {
            OnionError::data_forwarding(format!("no session for {}", tunnel))
        })?;

        let (peeled, is_plaintext) = self
            .authority
            .decrypt(&datum.payload, session)
            .await
            .map_err(|e| OnionError::data_forwarding_caused_by(format!("peeling {}", tunnel), e))?;

        if !is_plaintext {
            let next = route.next.ok_or_else(|| {
                OnionError::tunneling(format!(
                    "{} still layered but no hop follows this node",
                    tunnel
                ))
            })?;
            return next
                .send(&DatumEncrypted::new(tunnel, peeled).into())
                .await
                .map_err(|e| {
                    OnionError::data_forwarding_caused_by(format!("relaying {}", tunnel), e)
                });
        }

        match RelayEnvelope::open(&peeled)? {
            TunnelMessage::Connect(connect) => self.handle_connect(tunnel, connect).await,
            TunnelMessage::Datum(datum) => self.deliver(tunnel, route.next.is_some(), datum),
            other => Err(OnionError::protocol(format!(
                "{:?} sealed in {}",
                other.message_type(),
                tunnel
            ))),
        }
    }

    fn deliver(&self, tunnel: TunnelId, has_next: bool, datum: Datum) -> Result<()> {
        if datum.tunnel_id != tunnel {
            return Err(OnionError::protocol(format!(
                "Datum for {} sealed inside {}",
                datum.tunnel_id, tunnel
            )));
        }
        if has_next {
            return Err(OnionError::tunneling(format!(
                "{} data fully peeled before the last hop",
                tunnel
            )));
        }

        if datum.is_cover {
            self.publish(TunnelEvent::CoverReceived {
                tunnel_id: tunnel,
                size: datum.payload.len(),
            });
            return Ok(());
        }

        if self.routes.mark_announced(tunnel) {
            let source_key = self
                .routes
                .get(tunnel)
                .and_then(|route| route.source_key)
                .unwrap_or_default();
            info!("Incoming {}", tunnel);
            self.publish(TunnelEvent::TunnelIncoming {
                tunnel_id: tunnel,
                source_key,
            });
        }
        self.publish(TunnelEvent::DatumReceived {
            tunnel_id: tunnel,
            payload: datum.payload,
        });
        Ok(())
    }

    pub(crate) async fn handle_retire(&self, link: &Link, retire: Retire) -> Result<()> {
        let tunnel = retire.tunnel_id;
        let Some(route) = self.routes.get(tunnel) else {
            debug!("Retire for unknown {}", tunnel);
            return Ok(());
        };
        if route.prev.as_ref() != Some(link) {
            debug!("Ignoring Retire for {} from {}", tunnel, link.id());
            return Ok(());
        }

        if let Some(next) = &route.next {
            if let Err(e) = next.send(&retire.into()).await {
                debug!("Could not pass Retire for {} on: {}", tunnel, e);
            }
        }
        self.release(tunnel).await?;
        info!("Retired {}", tunnel);
        Ok(())
    }

    /// Originator side of teardown: tell the first hop, then drop local state
    pub async fn retire(&self, tunnel: TunnelId) -> Result<bool> {
        if let Some(next) = self.routes.next(tunnel) {
            if let Err(e) = next.send(&Retire::new(tunnel).into()).await {
                debug!("Could not send Retire for {}: {}", tunnel, e);
            }
        }
        self.release(tunnel).await
    }
}
