//! Framed hop-to-hop links.
//!
//! A link is one ordered byte stream between two adjacent hops carrying
//! fixed-size tunnel frames, each preceded by a 4-byte big-endian length.
//! Inbound frames are decoded and handed to a [`FrameHandler`] one at a
//! time, so messages on a link are processed strictly in arrival order.
//! Outbound frames go through a bounded queue drained by a writer task.

use super::connection::Connection;
use crate::protocol::{ProtocolError, TunnelMessage, MESSAGE_SIZE};
use async_trait::async_trait;
use onionmesh_common::OnionError;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Frames queued per link before senders wait
const OUTBOUND_QUEUE: usize = 256;

/// How long a finished link waits for the peer before dropping the connection
const CLOSE_LINGER: Duration = Duration::from_secs(3);

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// Process-local link identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Link#{}", self.0)
    }
}

/// Receives every frame decoded from a link
#[async_trait]
pub trait FrameHandler: Send + Sync + 'static {
    /// Protocol errors returned here close the link
    async fn handle_frame(&self, link: &Link, message: TunnelMessage) -> Result<(), OnionError>;

    /// Called once when the link stops reading, whatever the reason
    async fn link_closed(&self, link: &Link);
}

struct LinkInner {
    id: LinkId,
    remote: SocketAddr,
    outbound: mpsc::Sender<Vec<u8>>,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
    /// The peer ended its side of the stream
    remote_finished: AtomicBool,
}

/// Cheap handle on a running link; clones refer to the same link
#[derive(Clone)]
pub struct Link {
    inner: Arc<LinkInner>,
}

impl Link {
    /// Start the reader and writer tasks over an established stream pair
    pub fn spawn<R, W>(
        remote: SocketAddr,
        reader: R,
        writer: W,
        connection: Option<Connection>,
        handler: Arc<dyn FrameHandler>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let link = Self {
            inner: Arc::new(LinkInner {
                id: LinkId(NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed)),
                remote,
                outbound,
                shutdown,
                closed: AtomicBool::new(false),
                remote_finished: AtomicBool::new(false),
            }),
        };

        tokio::spawn(write_loop(
            link.clone(),
            writer,
            connection,
            outbound_rx,
            shutdown_rx.clone(),
        ));
        tokio::spawn(read_loop(link.clone(), reader, shutdown_rx, handler));

        debug!("{} up with {}", link.id(), remote);
        link
    }

    pub fn id(&self) -> LinkId {
        self.inner.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Encode and queue a message
    pub async fn send(&self, message: &TunnelMessage) -> Result<(), LinkError> {
        let frame = message.encode()?;
        self.send_frame(frame).await
    }

    /// Queue an already encoded frame
    pub async fn send_frame(&self, frame: Vec<u8>) -> Result<(), LinkError> {
        if frame.len() != MESSAGE_SIZE {
            return Err(ProtocolError::WrongLength {
                expected: MESSAGE_SIZE,
                actual: frame.len(),
            }
            .into());
        }
        if self.is_closed() {
            return Err(LinkError::Closed(self.id()));
        }
        self.inner
            .outbound
            .send(frame)
            .await
            .map_err(|_| LinkError::Closed(self.id()))
    }

    /// Stop both tasks. Frames already queued are still written, then the
    /// underlying connection is closed. Closing an already closed link is a
    /// no-op.
    pub fn close(&self) -> Result<(), LinkError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!("{} closing", self.id());
        self.inner
            .shutdown
            .send(true)
            .map_err(|_| LinkError::Disconnected(self.id()))
    }
}

impl PartialEq for Link {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Link {}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.id())
            .field("remote", &self.remote_addr())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, LinkError>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len != MESSAGE_SIZE {
        return Err(ProtocolError::WrongLength {
            expected: MESSAGE_SIZE,
            actual: len,
        }
        .into());
    }

    let mut frame = vec![0u8; MESSAGE_SIZE];
    reader.read_exact(&mut frame).await?;
    Ok(Some(frame))
}

async fn read_loop<R>(
    link: Link,
    mut reader: R,
    mut shutdown: watch::Receiver<bool>,
    handler: Arc<dyn FrameHandler>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => break,
            frame = read_frame(&mut reader) => frame,
        };

        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!("{} reached end of stream", link.id());
                link.inner.remote_finished.store(true, Ordering::Release);
                break;
            }
            Err(e) => {
                warn!("{} read failed: {}", link.id(), e);
                break;
            }
        };

        let message = match TunnelMessage::decode(&frame) {
            Ok(message) => message,
            Err(e) => {
                warn!("{} sent a malformed frame, closing: {}", link.id(), e);
                break;
            }
        };

        if let Err(e) = handler.handle_frame(&link, message).await {
            if e.is_fatal_to_connection() {
                warn!("{} closed after protocol violation: {}", link.id(), e);
                break;
            }
            debug!("{} dropped a message: {}", link.id(), e);
        }
    }

    if let Err(e) = link.close() {
        debug!("{} was already torn down: {}", link.id(), e);
    }
    handler.link_closed(&link).await;
}

async fn write_loop<W>(
    link: Link,
    mut writer: W,
    connection: Option<Connection>,
    mut frames: mpsc::Receiver<Vec<u8>>,
    mut shutdown: watch::Receiver<bool>,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let id = link.id();
    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let result = async {
            writer.write_u32(frame.len() as u32).await?;
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = result {
            warn!("{} write failed: {}", id, e);
            break;
        }
    }

    // let already queued frames reach the wire before the stream ends
    while let Ok(frame) = frames.try_recv() {
        if writer.write_u32(frame.len() as u32).await.is_err()
            || writer.write_all(&frame).await.is_err()
        {
            break;
        }
    }
    let _ = writer.shutdown().await;

    if let Some(connection) = connection {
        // the peer closes once it has read our end of the stream
        let remote_finished = link.inner.remote_finished.load(Ordering::Acquire);
        if !remote_finished
            && tokio::time::timeout(CLOSE_LINGER, connection.closed()).await.is_err()
        {
            debug!("{} peer did not close in time", id);
        }
        connection.close(0, "link closed");
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("{0} is closed")]
    Closed(LinkId),

    #[error("{0} lost its tasks before it could be closed")]
    Disconnected(LinkId),

    #[error("Cannot reach {addr}: {reason}")]
    Unreachable { addr: SocketAddr, reason: String },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LinkError> for OnionError {
    fn from(err: LinkError) -> Self {
        match err {
            LinkError::Protocol(e) => e.into(),
            LinkError::Unreachable { .. } => {
                OnionError::initialization_caused_by("cannot open link", err)
            }
            other => OnionError::tunneling_caused_by("link failure", other),
        }
    }
}
