use super::{SessionAuthority, SessionError};
use crate::protocol::SessionId;
use async_trait::async_trait;
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use onionmesh_common::Peer;
use rand::{Rng, RngCore};
use tracing::debug;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey, SharedSecret};

const HANDSHAKE_LEN: usize = 2 + 32;
const NONCE_LEN: usize = 12;
const LAYER_HEADER_LEN: usize = 1 + NONCE_LEN;
const KDF_CONTEXT: &[u8] = b"ONIONMESH-SESSION-LAYER-V1";
const MAX_ALLOCATION_ATTEMPTS: usize = 64;

/// Ephemeral X25519 exchange with ChaCha20-Poly1305 layers.
///
/// Handshake messages are `[2B initiator session][32B public key]`. Every
/// layer is `[1B layers remaining][12B nonce][ciphertext]` with the layer
/// byte bound as associated data, so a hop cannot be tricked into treating
/// an inner layer as the last one.
pub struct X25519SessionAuthority {
    pending: DashMap<SessionId, EphemeralSecret>,
    sessions: DashMap<SessionId, ChaCha20Poly1305>,
}

impl X25519SessionAuthority {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
            sessions: DashMap::new(),
        }
    }

    /// Established sessions, excluding handshakes still in flight
    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    fn derive_cipher(shared_secret: &SharedSecret) -> ChaCha20Poly1305 {
        let mut hasher = blake3::Hasher::new_keyed(shared_secret.as_bytes());
        hasher.update(KDF_CONTEXT);
        let key = *hasher.finalize().as_bytes();
        ChaCha20Poly1305::new(&key.into())
    }

    fn is_taken(&self, id: SessionId) -> bool {
        self.pending.contains_key(&id) || self.sessions.contains_key(&id)
    }

    /// Reserve a fresh id in `pending`
    fn allocate_pending(&self, secret: EphemeralSecret) -> Result<SessionId, SessionError> {
        let mut secret = Some(secret);
        for _ in 0..MAX_ALLOCATION_ATTEMPTS {
            let id = SessionId(rand::thread_rng().gen());
            if self.sessions.contains_key(&id) {
                continue;
            }
            if let Entry::Vacant(slot) = self.pending.entry(id) {
                if let Some(secret) = secret.take() {
                    slot.insert(secret);
                    return Ok(id);
                }
            }
        }
        Err(SessionError::Exhausted)
    }

    /// Reserve a fresh id in `sessions`
    fn allocate_session(&self, cipher: ChaCha20Poly1305) -> Result<SessionId, SessionError> {
        for _ in 0..MAX_ALLOCATION_ATTEMPTS {
            let id = SessionId(rand::thread_rng().gen());
            if self.is_taken(id) {
                continue;
            }
            if let Entry::Vacant(slot) = self.sessions.entry(id) {
                slot.insert(cipher);
                return Ok(id);
            }
        }
        Err(SessionError::Exhausted)
    }

    fn parse_handshake(handshake: &[u8]) -> Result<(SessionId, X25519PublicKey), SessionError> {
        if handshake.len() != HANDSHAKE_LEN {
            return Err(SessionError::MalformedHandshake(format!(
                "expected {} bytes, got {}",
                HANDSHAKE_LEN,
                handshake.len()
            )));
        }
        let id = SessionId(u16::from_be_bytes([handshake[0], handshake[1]]));
        let mut public = [0u8; 32];
        public.copy_from_slice(&handshake[2..]);
        Ok((id, X25519PublicKey::from(public)))
    }

    fn handshake_bytes(id: SessionId, public: &X25519PublicKey) -> Vec<u8> {
        let mut out = Vec::with_capacity(HANDSHAKE_LEN);
        out.extend_from_slice(&id.0.to_be_bytes());
        out.extend_from_slice(public.as_bytes());
        out
    }

    fn seal_layer(
        &self,
        data: &[u8],
        session: SessionId,
        remaining: u8,
    ) -> Result<Vec<u8>, SessionError> {
        let cipher = self
            .sessions
            .get(&session)
            .ok_or(SessionError::UnknownSession(session))?;

        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let aad = [remaining];
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: data, aad: &aad })
            .map_err(|_| SessionError::EncryptionFailed)?;

        let mut layer = Vec::with_capacity(LAYER_HEADER_LEN + ciphertext.len());
        layer.push(remaining);
        layer.extend_from_slice(&nonce);
        layer.extend_from_slice(&ciphertext);
        Ok(layer)
    }
}

impl Default for X25519SessionAuthority {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionAuthority for X25519SessionAuthority {
    async fn start(&self, peer: &Peer) -> Result<(SessionId, Vec<u8>), SessionError> {
        let secret = EphemeralSecret::random_from_rng(&mut rand::thread_rng());
        let public = X25519PublicKey::from(&secret);
        let id = self.allocate_pending(secret)?;

        debug!("Started handshake {} towards {}", id, peer);
        Ok((id, Self::handshake_bytes(id, &public)))
    }

    async fn response_to(&self, handshake: &[u8]) -> Result<(SessionId, Vec<u8>), SessionError> {
        let (initiator_id, initiator_public) = Self::parse_handshake(handshake)?;

        let secret = EphemeralSecret::random_from_rng(&mut rand::thread_rng());
        let public = X25519PublicKey::from(&secret);
        let shared = secret.diffie_hellman(&initiator_public);
        let id = self.allocate_session(Self::derive_cipher(&shared))?;

        debug!("Answered handshake {}, local {}", initiator_id, id);
        Ok((id, Self::handshake_bytes(initiator_id, &public)))
    }

    async fn confirm(&self, handshake: &[u8]) -> Result<SessionId, SessionError> {
        let (id, responder_public) = Self::parse_handshake(handshake)?;
        let (_, secret) = self
            .pending
            .remove(&id)
            .ok_or(SessionError::NoPendingHandshake(id))?;

        let shared = secret.diffie_hellman(&responder_public);
        self.sessions.insert(id, Self::derive_cipher(&shared));

        debug!("Confirmed {}", id);
        Ok(id)
    }

    async fn encrypt(
        &self,
        plaintext: &[u8],
        sessions: &[SessionId],
    ) -> Result<Vec<u8>, SessionError> {
        if sessions.is_empty() {
            return Err(SessionError::NoSessions);
        }
        if sessions.len() > u8::MAX as usize {
            return Err(SessionError::TooManyLayers(sessions.len()));
        }

        // innermost layer belongs to the last hop
        let mut data = plaintext.to_vec();
        for (idx, session) in sessions.iter().enumerate().rev() {
            let remaining = (sessions.len() - idx) as u8;
            data = self.seal_layer(&data, *session, remaining)?;
        }
        Ok(data)
    }

    async fn decrypt(
        &self,
        ciphertext: &[u8],
        session: SessionId,
    ) -> Result<(Vec<u8>, bool), SessionError> {
        if ciphertext.len() < LAYER_HEADER_LEN {
            return Err(SessionError::MalformedLayer(format!(
                "{} bytes is shorter than a layer header",
                ciphertext.len()
            )));
        }
        let remaining = ciphertext[0];
        if remaining == 0 {
            return Err(SessionError::MalformedLayer(
                "layer count is zero".to_string(),
            ));
        }

        let cipher = self
            .sessions
            .get(&session)
            .ok_or(SessionError::UnknownSession(session))?;
        let nonce = Nonce::from_slice(&ciphertext[1..LAYER_HEADER_LEN]);
        let aad = [remaining];
        let plaintext = cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &ciphertext[LAYER_HEADER_LEN..],
                    aad: &aad,
                },
            )
            .map_err(|_| SessionError::DecryptionFailed)?;

        Ok((plaintext, remaining == 1))
    }

    async fn close(&self, session: SessionId) {
        let established = self.sessions.remove(&session).is_some();
        let pending = self.pending.remove(&session).is_some();
        if established || pending {
            debug!("Closed {}", session);
        }
    }
}
