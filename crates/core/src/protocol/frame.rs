//! Fixed-size frame primitives.
//!
//! Every tunnel message occupies exactly [`MESSAGE_SIZE`] bytes on the wire.
//! The meaningful content is written big-endian from the start of the frame
//! and the remainder is filled with random bytes so that message sizes leak
//! nothing. Variable-length fields carry an explicit 2-byte length.
//!
//! ```text
//! +-------------+-----------+------------+---------------------+---------+
//! | TunnelId 4B | Type 2B   | Request 2B | variant fields ...  | padding |
//! +-------------+-----------+------------+---------------------+---------+
//!               |<- typed ->|<- traceable only ->|
//! ```

use super::error::ProtocolError;
use bytes::{Buf, BufMut, BytesMut};
use onionmesh_common::tunnel::MAX_TUNNEL_LENGTH;
use rand::RngCore;

/// Size of every tunnel message on the wire
pub const MESSAGE_SIZE: usize = 1024;

/// `[TunnelId]`
pub const TUNNEL_HEADER_SIZE: usize = 4;

/// `[TunnelId][MessageType]`
pub const TYPED_HEADER_SIZE: usize = TUNNEL_HEADER_SIZE + 2;

/// `[TunnelId][MessageType][RequestId]`
pub const TRACEABLE_HEADER_SIZE: usize = TYPED_HEADER_SIZE + 2;

/// Length of the Datum integrity tag
pub const CHECKSUM_SIZE: usize = 16;

/// Opaque bytes a DatumEncrypted frame can carry
pub const DATUM_ENCRYPTED_CAPACITY: usize = MESSAGE_SIZE - TYPED_HEADER_SIZE - 4;

/// Bytes any session authority may add per encryption layer
pub const MAX_LAYER_OVERHEAD: usize = 29;

/// `[16B digest][2B length]` in front of every relay envelope body
pub const RELAY_ENVELOPE_OVERHEAD: usize = 16 + 2;

/// Compact Datum framing: typed header, flags, length and checksum
pub const DATUM_OVERHEAD: usize = TYPED_HEADER_SIZE + 1 + 4 + CHECKSUM_SIZE;

/// Application bytes carried by one Datum, sized so that the sealed,
/// fully layered Datum still fits a DatumEncrypted frame on the longest
/// permitted tunnel.
pub const PAYLOAD_BYTES: usize = DATUM_ENCRYPTED_CAPACITY
    - MAX_TUNNEL_LENGTH * MAX_LAYER_OVERHEAD
    - RELAY_ENVELOPE_OVERHEAD
    - DATUM_OVERHEAD;

/// Largest value a 2-byte length prefix can describe
pub const MAX_SHORT_FIELD: usize = u16::MAX as usize;

/// Builder for one outgoing message
pub struct FrameWriter {
    buf: BytesMut,
}

impl FrameWriter {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(MESSAGE_SIZE),
        }
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.buf.put_u16(value);
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.put_u32(value);
    }

    pub fn put_slice(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    /// Write `[2B len][bytes]`
    pub fn put_short_field(&mut self, field: &'static str, bytes: &[u8]) -> Result<(), ProtocolError> {
        if bytes.len() > MAX_SHORT_FIELD {
            return Err(ProtocolError::FieldTooLong {
                field,
                len: bytes.len(),
                max: MAX_SHORT_FIELD,
            });
        }
        self.buf.put_u16(bytes.len() as u16);
        self.buf.put_slice(bytes);
        Ok(())
    }

    /// Write `[4B len][bytes]`
    pub fn put_long_field(&mut self, field: &'static str, bytes: &[u8]) -> Result<(), ProtocolError> {
        if bytes.len() > DATUM_ENCRYPTED_CAPACITY {
            return Err(ProtocolError::FieldTooLong {
                field,
                len: bytes.len(),
                max: DATUM_ENCRYPTED_CAPACITY,
            });
        }
        self.buf.put_u32(bytes.len() as u32);
        self.buf.put_slice(bytes);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Content only, without padding. Used for messages nested in a relay
    /// envelope, where the outer frame provides the padding.
    pub fn finish_compact(self) -> Result<Vec<u8>, ProtocolError> {
        if self.buf.len() > MESSAGE_SIZE {
            return Err(ProtocolError::Oversized {
                len: self.buf.len(),
                max: MESSAGE_SIZE,
            });
        }
        Ok(self.buf.to_vec())
    }

    /// Pad with random bytes to exactly [`MESSAGE_SIZE`]
    pub fn finish_padded(mut self) -> Result<Vec<u8>, ProtocolError> {
        let content = self.buf.len();
        if content > MESSAGE_SIZE {
            return Err(ProtocolError::Oversized {
                len: content,
                max: MESSAGE_SIZE,
            });
        }

        self.buf.resize(MESSAGE_SIZE, 0);
        rand::thread_rng().fill_bytes(&mut self.buf[content..]);

        if self.buf.len() != MESSAGE_SIZE {
            return Err(ProtocolError::WrongLength {
                expected: MESSAGE_SIZE,
                actual: self.buf.len(),
            });
        }
        Ok(self.buf.to_vec())
    }
}

impl Default for FrameWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounds-checked cursor over an incoming frame
pub struct FrameReader<'a> {
    buf: &'a [u8],
}

impl<'a> FrameReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn require(&self, needed: usize) -> Result<(), ProtocolError> {
        if self.buf.remaining() < needed {
            return Err(ProtocolError::Truncated {
                needed,
                available: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn get_u8(&mut self) -> Result<u8, ProtocolError> {
        self.require(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn get_u16(&mut self) -> Result<u16, ProtocolError> {
        self.require(2)?;
        Ok(self.buf.get_u16())
    }

    pub fn get_u32(&mut self) -> Result<u32, ProtocolError> {
        self.require(4)?;
        Ok(self.buf.get_u32())
    }

    pub fn get_bytes(&mut self, len: usize) -> Result<Vec<u8>, ProtocolError> {
        self.require(len)?;
        let bytes = self.buf[..len].to_vec();
        self.buf.advance(len);
        Ok(bytes)
    }

    pub fn get_array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        self.require(N)?;
        let mut out = [0u8; N];
        self.buf.copy_to_slice(&mut out);
        Ok(out)
    }

    /// Read `[2B len][bytes]`
    pub fn get_short_field(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let len = self.get_u16()? as usize;
        self.get_bytes(len)
    }

    /// Read `[4B len][bytes]`
    pub fn get_long_field(&mut self, field: &'static str) -> Result<Vec<u8>, ProtocolError> {
        let len = self.get_u32()? as usize;
        if len > DATUM_ENCRYPTED_CAPACITY {
            return Err(ProtocolError::FieldTooLong {
                field,
                len,
                max: DATUM_ENCRYPTED_CAPACITY,
            });
        }
        self.get_bytes(len)
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }
}
