//! Tunnel wire protocol: identifiers, fixed-size frames, message variants
//! and the relay envelope that travels inside layered encryption.

pub mod error;
pub mod frame;
pub mod ids;
pub mod integrity;
pub mod messages;
pub mod relay;

pub use error::ProtocolError;
pub use frame::{MESSAGE_SIZE, PAYLOAD_BYTES};
pub use ids::{RequestId, SessionId, TunnelId};
pub use messages::{
    Connect, Datum, DatumEncrypted, Extend, Extended, MessageType, Retire, TunnelMessage,
};
pub use relay::RelayEnvelope;
