//! Relay envelope: the plaintext wrapped in the session layers of a
//! DatumEncrypted.
//!
//! ```text
//! [16B MD5(body)][2B body length][body = compact Datum or Connect]
//! ```

use super::error::ProtocolError;
use super::frame::{FrameReader, FrameWriter, RELAY_ENVELOPE_OVERHEAD};
use super::integrity::relay_digest;
use super::messages::TunnelMessage;

pub struct RelayEnvelope;

impl RelayEnvelope {
    /// Wrap a Datum or Connect for layered encryption
    pub fn seal(message: &TunnelMessage) -> Result<Vec<u8>, ProtocolError> {
        match message {
            TunnelMessage::Datum(_) | TunnelMessage::Connect(_) => {}
            other => return Err(ProtocolError::NotRelayable(other.message_type())),
        }

        let body = message.encode_compact()?;
        let mut writer = FrameWriter::new();
        writer.put_slice(&relay_digest(&body));
        writer.put_short_field("relay_body", &body)?;
        writer.finish_compact()
    }

    /// Verify and unwrap the innermost plaintext of a DatumEncrypted
    pub fn open(bytes: &[u8]) -> Result<TunnelMessage, ProtocolError> {
        let mut reader = FrameReader::new(bytes);
        let digest = reader.get_array::<16>()?;
        let body = reader.get_short_field()?;

        if relay_digest(&body) != digest {
            return Err(ProtocolError::DigestMismatch);
        }

        let message = TunnelMessage::decode_compact(&body)?;
        match message {
            TunnelMessage::Datum(_) | TunnelMessage::Connect(_) => Ok(message),
            other => Err(ProtocolError::NotRelayable(other.message_type())),
        }
    }

    pub fn sealed_len(body_len: usize) -> usize {
        RELAY_ENVELOPE_OVERHEAD + body_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::{DATUM_OVERHEAD, PAYLOAD_BYTES};
    use crate::protocol::ids::TunnelId;
    use crate::protocol::messages::{Datum, MessageType, Retire};

    #[test]
    fn test_envelope_carries_datum() {
        let datum: TunnelMessage = Datum::data(TunnelId(11), b"abc".to_vec()).into();
        let sealed = RelayEnvelope::seal(&datum).unwrap();

        assert_eq!(sealed.len(), RelayEnvelope::sealed_len(DATUM_OVERHEAD + 3));
        assert_eq!(RelayEnvelope::open(&sealed).unwrap(), datum);
    }

    #[test]
    fn test_full_payload_fits_envelope_budget() {
        let datum: TunnelMessage = Datum::data(TunnelId(11), vec![0u8; PAYLOAD_BYTES]).into();
        let sealed = RelayEnvelope::seal(&datum).unwrap();

        assert_eq!(
            sealed.len(),
            RelayEnvelope::sealed_len(DATUM_OVERHEAD + PAYLOAD_BYTES)
        );
    }

    #[test]
    fn test_tampered_envelope_rejected() {
        let datum: TunnelMessage = Datum::data(TunnelId(11), b"abc".to_vec()).into();
        let mut sealed = RelayEnvelope::seal(&datum).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x80;

        assert_eq!(
            RelayEnvelope::open(&sealed),
            Err(ProtocolError::DigestMismatch)
        );
    }

    #[test]
    fn test_only_datum_and_connect_are_relayable() {
        let retire: TunnelMessage = Retire::new(TunnelId(1)).into();
        assert_eq!(
            RelayEnvelope::seal(&retire),
            Err(ProtocolError::NotRelayable(MessageType::Retire))
        );
    }
}
