//! Session authority: the key exchange and layered cipher the tunnel engine
//! consumes.
//!
//! The engine never inspects ciphertext. It hands the authority an ordered
//! list of sessions to wrap data under, and trusts the `is_plaintext` flag
//! returned by [`SessionAuthority::decrypt`] to tell it when the last layer
//! has come off.

mod x25519;

pub use x25519::X25519SessionAuthority;

use crate::protocol::SessionId;
use async_trait::async_trait;
use onionmesh_common::{OnionError, Peer};

#[async_trait]
pub trait SessionAuthority: Send + Sync {
    /// Begin a handshake towards `peer`. Returns the session id this node
    /// will use once confirmed, and the first handshake message.
    async fn start(&self, peer: &Peer) -> Result<(SessionId, Vec<u8>), SessionError>;

    /// Answer a first handshake message, establishing the session locally
    async fn response_to(&self, handshake: &[u8]) -> Result<(SessionId, Vec<u8>), SessionError>;

    /// Finish a handshake started with [`SessionAuthority::start`]
    async fn confirm(&self, handshake: &[u8]) -> Result<SessionId, SessionError>;

    /// Wrap `plaintext` under every session, first hop outermost
    async fn encrypt(
        &self,
        plaintext: &[u8],
        sessions: &[SessionId],
    ) -> Result<Vec<u8>, SessionError>;

    /// Remove one layer. The flag is true once no layers remain.
    async fn decrypt(
        &self,
        ciphertext: &[u8],
        session: SessionId,
    ) -> Result<(Vec<u8>, bool), SessionError>;

    /// Drop any material held for `session`. Unknown ids are ignored.
    async fn close(&self, session: SessionId);
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Unknown session {0}")]
    UnknownSession(SessionId),

    #[error("Malformed handshake: {0}")]
    MalformedHandshake(String),

    #[error("No handshake in progress for {0}")]
    NoPendingHandshake(SessionId),

    #[error("Layered encryption needs at least one session")]
    NoSessions,

    #[error("Cannot stack {0} layers")]
    TooManyLayers(usize),

    #[error("Malformed layer: {0}")]
    MalformedLayer(String),

    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Session id space exhausted")]
    Exhausted,
}

impl From<SessionError> for OnionError {
    fn from(err: SessionError) -> Self {
        OnionError::tunneling_caused_by("session authority failure", err)
    }
}
