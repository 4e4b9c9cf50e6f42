use super::error::ProtocolError;
use super::frame::{FrameReader, FrameWriter, CHECKSUM_SIZE, MESSAGE_SIZE};
use super::ids::{RequestId, TunnelId};
use super::integrity;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Discriminator written after the TunnelId of every message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    /// Extension instruction for the current last hop (relayed only)
    Connect = 0x0c01,
    /// Handshake request to the peer being added
    Extend = 0x0c02,
    /// Handshake response travelling back to the originator
    Extended = 0x0c03,
    /// Plaintext data unit (relayed only)
    Datum = 0x0c04,
    /// Layered ciphertext moving along an established tunnel
    DatumEncrypted = 0x0c05,
    /// Tunnel teardown
    Retire = 0x0c06,
}

impl MessageType {
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Whether the variant carries a RequestId after the type
    pub fn is_traceable(self) -> bool {
        matches!(self, Self::Connect | Self::Extend | Self::Extended)
    }
}

impl TryFrom<u16> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0c01 => Ok(Self::Connect),
            0x0c02 => Ok(Self::Extend),
            0x0c03 => Ok(Self::Extended),
            0x0c04 => Ok(Self::Datum),
            0x0c05 => Ok(Self::DatumEncrypted),
            0x0c06 => Ok(Self::Retire),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

/// Header fields shared by every variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub tunnel_id: TunnelId,
    pub message_type: MessageType,
    pub request_id: Option<RequestId>,
}

impl Header {
    fn read(reader: &mut FrameReader<'_>) -> Result<Self, ProtocolError> {
        let tunnel_id = TunnelId(reader.get_u32()?);
        let message_type = MessageType::try_from(reader.get_u16()?)?;
        let request_id = if message_type.is_traceable() {
            Some(RequestId(reader.get_u16()?))
        } else {
            None
        };

        Ok(Self {
            tunnel_id,
            message_type,
            request_id,
        })
    }
}

/// Shared header-writing capability; each variant only describes its body.
trait WireMessage: Sized {
    const TYPE: MessageType;

    fn tunnel_id(&self) -> TunnelId;

    fn request_id(&self) -> Option<RequestId> {
        None
    }

    fn write_body(&self, writer: &mut FrameWriter) -> Result<(), ProtocolError>;

    fn read_body(header: Header, reader: &mut FrameReader<'_>) -> Result<Self, ProtocolError>;

    fn write(&self, writer: &mut FrameWriter) -> Result<(), ProtocolError> {
        writer.put_u32(self.tunnel_id().as_u32());
        writer.put_u16(Self::TYPE.code());
        if Self::TYPE.is_traceable() {
            let request_id = self.request_id().ok_or(ProtocolError::InvalidField {
                field: "request_id",
                reason: "traceable message without request id".to_string(),
            })?;
            writer.put_u16(request_id.0);
        }
        self.write_body(writer)
    }
}

fn traced(header: &Header) -> Result<RequestId, ProtocolError> {
    header.request_id.ok_or(ProtocolError::InvalidField {
        field: "request_id",
        reason: "missing".to_string(),
    })
}

/// Extension instruction: the receiving hop must reach `destination:port`
/// and hand it an Extend carrying `source_key` and `handshake`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub tunnel_id: TunnelId,
    pub request_id: RequestId,
    pub destination: IpAddr,
    pub port: u16,
    pub source_key: Vec<u8>,
    pub handshake: Vec<u8>,
}

const IPV6_FLAG: u8 = 0x01;

impl Connect {
    pub fn new(
        tunnel_id: TunnelId,
        destination: IpAddr,
        port: u16,
        source_key: Vec<u8>,
        handshake: Vec<u8>,
    ) -> Self {
        Self {
            tunnel_id,
            request_id: RequestId::generate(),
            destination,
            port,
            source_key,
            handshake,
        }
    }

    pub fn with_request_id(mut self, request_id: RequestId) -> Self {
        self.request_id = request_id;
        self
    }

    /// The Extend this instruction turns into at the extending hop
    pub fn to_extend(&self) -> Extend {
        Extend {
            tunnel_id: self.tunnel_id,
            request_id: self.request_id,
            source_key: self.source_key.clone(),
            handshake: self.handshake.clone(),
        }
    }
}

impl WireMessage for Connect {
    const TYPE: MessageType = MessageType::Connect;

    fn tunnel_id(&self) -> TunnelId {
        self.tunnel_id
    }

    fn request_id(&self) -> Option<RequestId> {
        Some(self.request_id)
    }

    fn write_body(&self, writer: &mut FrameWriter) -> Result<(), ProtocolError> {
        writer.put_u16(self.port);
        match self.destination {
            IpAddr::V4(addr) => {
                writer.put_u8(0);
                writer.put_slice(&addr.octets());
            }
            IpAddr::V6(addr) => {
                writer.put_u8(IPV6_FLAG);
                writer.put_slice(&addr.octets());
            }
        }
        writer.put_short_field("source_key", &self.source_key)?;
        writer.put_short_field("handshake", &self.handshake)
    }

    fn read_body(header: Header, reader: &mut FrameReader<'_>) -> Result<Self, ProtocolError> {
        let port = reader.get_u16()?;
        let flags = reader.get_u8()?;
        let destination = if flags & IPV6_FLAG != 0 {
            IpAddr::V6(Ipv6Addr::from(reader.get_array::<16>()?))
        } else {
            IpAddr::V4(Ipv4Addr::from(reader.get_array::<4>()?))
        };
        let source_key = reader.get_short_field()?;
        let handshake = reader.get_short_field()?;

        Ok(Self {
            tunnel_id: header.tunnel_id,
            request_id: traced(&header)?,
            destination,
            port,
            source_key,
            handshake,
        })
    }
}

/// Handshake request for the peer being added to a tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extend {
    pub tunnel_id: TunnelId,
    pub request_id: RequestId,
    pub source_key: Vec<u8>,
    pub handshake: Vec<u8>,
}

impl Extend {
    pub fn new(tunnel_id: TunnelId, source_key: Vec<u8>, handshake: Vec<u8>) -> Self {
        Self {
            tunnel_id,
            request_id: RequestId::generate(),
            source_key,
            handshake,
        }
    }

    pub fn with_request_id(mut self, request_id: RequestId) -> Self {
        self.request_id = request_id;
        self
    }
}

impl WireMessage for Extend {
    const TYPE: MessageType = MessageType::Extend;

    fn tunnel_id(&self) -> TunnelId {
        self.tunnel_id
    }

    fn request_id(&self) -> Option<RequestId> {
        Some(self.request_id)
    }

    fn write_body(&self, writer: &mut FrameWriter) -> Result<(), ProtocolError> {
        writer.put_short_field("source_key", &self.source_key)?;
        writer.put_short_field("handshake", &self.handshake)
    }

    fn read_body(header: Header, reader: &mut FrameReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            tunnel_id: header.tunnel_id,
            request_id: traced(&header)?,
            source_key: reader.get_short_field()?,
            handshake: reader.get_short_field()?,
        })
    }
}

/// Handshake response; relayed unmodified towards the originator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extended {
    pub tunnel_id: TunnelId,
    pub request_id: RequestId,
    pub handshake: Vec<u8>,
}

impl Extended {
    pub fn new(tunnel_id: TunnelId, request_id: RequestId, handshake: Vec<u8>) -> Self {
        Self {
            tunnel_id,
            request_id,
            handshake,
        }
    }
}

impl WireMessage for Extended {
    const TYPE: MessageType = MessageType::Extended;

    fn tunnel_id(&self) -> TunnelId {
        self.tunnel_id
    }

    fn request_id(&self) -> Option<RequestId> {
        Some(self.request_id)
    }

    fn write_body(&self, writer: &mut FrameWriter) -> Result<(), ProtocolError> {
        writer.put_short_field("handshake", &self.handshake)
    }

    fn read_body(header: Header, reader: &mut FrameReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            tunnel_id: header.tunnel_id,
            request_id: traced(&header)?,
            handshake: reader.get_short_field()?,
        })
    }
}

const COVER_FLAG: u8 = 0x01;

/// Unit of application data (or cover traffic) inside a tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datum {
    pub tunnel_id: TunnelId,
    pub is_cover: bool,
    pub payload: Vec<u8>,
    pub checksum: [u8; CHECKSUM_SIZE],
}

impl Datum {
    /// Build a Datum and tag it
    pub fn new(tunnel_id: TunnelId, is_cover: bool, payload: Vec<u8>) -> Self {
        let mut datum = Self {
            tunnel_id,
            is_cover,
            payload,
            checksum: [0u8; CHECKSUM_SIZE],
        };
        datum.checksum = integrity::datum_checksum(&datum.tagged_content());
        datum
    }

    pub fn data(tunnel_id: TunnelId, payload: Vec<u8>) -> Self {
        Self::new(tunnel_id, false, payload)
    }

    pub fn cover(tunnel_id: TunnelId, payload: Vec<u8>) -> Self {
        Self::new(tunnel_id, true, payload)
    }

    fn flags(&self) -> u8 {
        if self.is_cover {
            COVER_FLAG
        } else {
            0
        }
    }

    /// `[TunnelId][flags][len][payload]`, the bytes covered by the checksum
    fn tagged_content(&self) -> Vec<u8> {
        let mut content = Vec::with_capacity(9 + self.payload.len());
        content.extend_from_slice(&self.tunnel_id.as_u32().to_be_bytes());
        content.push(self.flags());
        content.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        content.extend_from_slice(&self.payload);
        content
    }

    pub fn verify(&self) -> bool {
        integrity::verify_datum_checksum(&self.tagged_content(), &self.checksum)
    }
}

impl WireMessage for Datum {
    const TYPE: MessageType = MessageType::Datum;

    fn tunnel_id(&self) -> TunnelId {
        self.tunnel_id
    }

    fn write_body(&self, writer: &mut FrameWriter) -> Result<(), ProtocolError> {
        writer.put_u8(self.flags());
        writer.put_long_field("payload", &self.payload)?;
        writer.put_slice(&self.checksum);
        Ok(())
    }

    fn read_body(header: Header, reader: &mut FrameReader<'_>) -> Result<Self, ProtocolError> {
        let flags = reader.get_u8()?;
        let payload = reader.get_long_field("payload")?;
        let checksum = reader.get_array::<CHECKSUM_SIZE>()?;

        let datum = Self {
            tunnel_id: header.tunnel_id,
            is_cover: flags & COVER_FLAG != 0,
            payload,
            checksum,
        };
        if !datum.verify() {
            return Err(ProtocolError::ChecksumMismatch);
        }
        Ok(datum)
    }
}

/// Layered ciphertext; hops forward it without looking inside
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatumEncrypted {
    pub tunnel_id: TunnelId,
    pub payload: Vec<u8>,
}

impl DatumEncrypted {
    pub fn new(tunnel_id: TunnelId, payload: Vec<u8>) -> Self {
        Self { tunnel_id, payload }
    }
}

impl WireMessage for DatumEncrypted {
    const TYPE: MessageType = MessageType::DatumEncrypted;

    fn tunnel_id(&self) -> TunnelId {
        self.tunnel_id
    }

    fn write_body(&self, writer: &mut FrameWriter) -> Result<(), ProtocolError> {
        writer.put_long_field("payload", &self.payload)
    }

    fn read_body(header: Header, reader: &mut FrameReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            tunnel_id: header.tunnel_id,
            payload: reader.get_long_field("payload")?,
        })
    }
}

/// Tunnel teardown, propagated towards the destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retire {
    pub tunnel_id: TunnelId,
}

impl Retire {
    pub fn new(tunnel_id: TunnelId) -> Self {
        Self { tunnel_id }
    }
}

impl WireMessage for Retire {
    const TYPE: MessageType = MessageType::Retire;

    fn tunnel_id(&self) -> TunnelId {
        self.tunnel_id
    }

    fn write_body(&self, _writer: &mut FrameWriter) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn read_body(header: Header, _reader: &mut FrameReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            tunnel_id: header.tunnel_id,
        })
    }
}

/// Every message that can appear on a hop-to-hop connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelMessage {
    Connect(Connect),
    Extend(Extend),
    Extended(Extended),
    Datum(Datum),
    DatumEncrypted(DatumEncrypted),
    Retire(Retire),
}

impl TunnelMessage {
    pub fn tunnel_id(&self) -> TunnelId {
        match self {
            Self::Connect(m) => m.tunnel_id,
            Self::Extend(m) => m.tunnel_id,
            Self::Extended(m) => m.tunnel_id,
            Self::Datum(m) => m.tunnel_id,
            Self::DatumEncrypted(m) => m.tunnel_id,
            Self::Retire(m) => m.tunnel_id,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Connect(_) => MessageType::Connect,
            Self::Extend(_) => MessageType::Extend,
            Self::Extended(_) => MessageType::Extended,
            Self::Datum(_) => MessageType::Datum,
            Self::DatumEncrypted(_) => MessageType::DatumEncrypted,
            Self::Retire(_) => MessageType::Retire,
        }
    }

    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Self::Connect(m) => Some(m.request_id),
            Self::Extend(m) => Some(m.request_id),
            Self::Extended(m) => Some(m.request_id),
            _ => None,
        }
    }

    fn write(&self, writer: &mut FrameWriter) -> Result<(), ProtocolError> {
        match self {
            Self::Connect(m) => m.write(writer),
            Self::Extend(m) => m.write(writer),
            Self::Extended(m) => m.write(writer),
            Self::Datum(m) => m.write(writer),
            Self::DatumEncrypted(m) => m.write(writer),
            Self::Retire(m) => m.write(writer),
        }
    }

    /// Encode into a full, randomly padded frame of exactly [`MESSAGE_SIZE`] bytes
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut writer = FrameWriter::new();
        self.write(&mut writer)?;
        writer.finish_padded()
    }

    /// Encode without padding, for nesting inside a relay envelope
    pub fn encode_compact(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut writer = FrameWriter::new();
        self.write(&mut writer)?;
        writer.finish_compact()
    }

    /// Decode a full wire frame
    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        if frame.len() != MESSAGE_SIZE {
            return Err(ProtocolError::WrongLength {
                expected: MESSAGE_SIZE,
                actual: frame.len(),
            });
        }
        Self::parse(frame)
    }

    /// Decode content that may or may not be followed by padding
    pub fn decode_compact(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Self::parse(bytes)
    }

    /// Read the discriminator without consuming the frame
    pub fn peek_type(bytes: &[u8]) -> Result<MessageType, ProtocolError> {
        let mut reader = FrameReader::new(bytes);
        reader.get_u32()?;
        MessageType::try_from(reader.get_u16()?)
    }

    fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = FrameReader::new(bytes);
        let header = Header::read(&mut reader)?;

        let message = match header.message_type {
            MessageType::Connect => Self::Connect(Connect::read_body(header, &mut reader)?),
            MessageType::Extend => Self::Extend(Extend::read_body(header, &mut reader)?),
            MessageType::Extended => Self::Extended(Extended::read_body(header, &mut reader)?),
            MessageType::Datum => Self::Datum(Datum::read_body(header, &mut reader)?),
            MessageType::DatumEncrypted => {
                Self::DatumEncrypted(DatumEncrypted::read_body(header, &mut reader)?)
            }
            MessageType::Retire => Self::Retire(Retire::read_body(header, &mut reader)?),
        };
        Ok(message)
    }
}

impl From<Connect> for TunnelMessage {
    fn from(m: Connect) -> Self {
        Self::Connect(m)
    }
}

impl From<Extend> for TunnelMessage {
    fn from(m: Extend) -> Self {
        Self::Extend(m)
    }
}

impl From<Extended> for TunnelMessage {
    fn from(m: Extended) -> Self {
        Self::Extended(m)
    }
}

impl From<Datum> for TunnelMessage {
    fn from(m: Datum) -> Self {
        Self::Datum(m)
    }
}

impl From<DatumEncrypted> for TunnelMessage {
    fn from(m: DatumEncrypted) -> Self {
        Self::DatumEncrypted(m)
    }
}

impl From<Retire> for TunnelMessage {
    fn from(m: Retire) -> Self {
        Self::Retire(m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::PAYLOAD_BYTES;

    fn sample_messages() -> Vec<TunnelMessage> {
        let tunnel = TunnelId(0xdead_beef);
        vec![
            Connect::new(
                tunnel,
                IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)),
                7100,
                vec![1u8; 32],
                vec![2u8; 34],
            )
            .into(),
            Connect::new(
                tunnel,
                IpAddr::V6(Ipv6Addr::LOCALHOST),
                65535,
                vec![],
                vec![9u8; 3],
            )
            .into(),
            Extend::new(tunnel, vec![3u8; 32], vec![4u8; 34]).into(),
            Extended::new(tunnel, RequestId(17), vec![5u8; 34]).into(),
            Datum::data(tunnel, vec![6u8; PAYLOAD_BYTES]).into(),
            Datum::cover(tunnel, vec![]).into(),
            DatumEncrypted::new(tunnel, vec![7u8; 900]).into(),
            Retire::new(tunnel).into(),
        ]
    }

    #[test]
    fn test_every_variant_survives_the_wire() {
        for message in sample_messages() {
            let frame = message.encode().unwrap();
            assert_eq!(frame.len(), MESSAGE_SIZE);
            assert_eq!(TunnelMessage::decode(&frame).unwrap(), message);
            assert_eq!(
                TunnelMessage::peek_type(&frame).unwrap(),
                message.message_type()
            );
        }
    }

    #[test]
    fn test_compact_encoding_has_no_padding() {
        let message: TunnelMessage = Extended::new(TunnelId(1), RequestId(2), vec![0xaa; 5]).into();
        let compact = message.encode_compact().unwrap();

        assert_eq!(compact.len(), 8 + 2 + 5);
        assert_eq!(TunnelMessage::decode_compact(&compact).unwrap(), message);
    }

    #[test]
    fn test_header_layout_is_big_endian() {
        let message: TunnelMessage = Extend::new(TunnelId(0x01020304), vec![0xee], vec![])
            .with_request_id(RequestId(0x0a0b))
            .into();
        let frame = message.encode().unwrap();

        assert_eq!(&frame[..4], &[1, 2, 3, 4]);
        assert_eq!(&frame[4..6], &MessageType::Extend.code().to_be_bytes());
        assert_eq!(&frame[6..8], &[0x0a, 0x0b]);
        assert_eq!(&frame[8..11], &[0, 1, 0xee]);
    }

    #[test]
    fn test_padding_is_random() {
        let message: TunnelMessage = Retire::new(TunnelId(5)).into();
        let a = message.encode().unwrap();
        let b = message.encode().unwrap();

        assert_eq!(a[..6], b[..6]);
        assert_ne!(a[6..], b[6..]);
    }

    #[test]
    fn test_mutated_datum_fails_integrity() {
        let mut datum = Datum::data(TunnelId(3), b"hello tunnel".to_vec());
        datum.payload[0] ^= 0x01;

        let frame = TunnelMessage::Datum(datum).encode().unwrap();
        assert_eq!(
            TunnelMessage::decode(&frame),
            Err(ProtocolError::ChecksumMismatch)
        );
    }

    #[test]
    fn test_flipping_cover_flag_fails_integrity() {
        let datum = Datum::cover(TunnelId(3), vec![1, 2, 3]);
        let mut frame = TunnelMessage::Datum(datum).encode().unwrap();
        frame[6] ^= COVER_FLAG;

        assert_eq!(
            TunnelMessage::decode(&frame),
            Err(ProtocolError::ChecksumMismatch)
        );
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut frame = TunnelMessage::Retire(Retire::new(TunnelId(9)))
            .encode()
            .unwrap();
        frame[4] = 0x7f;
        frame[5] = 0xff;

        assert_eq!(
            TunnelMessage::decode(&frame),
            Err(ProtocolError::UnknownMessageType(0x7fff))
        );
    }

    #[test]
    fn test_short_frame_rejected() {
        assert_eq!(
            TunnelMessage::decode(&[0u8; 100]),
            Err(ProtocolError::WrongLength {
                expected: MESSAGE_SIZE,
                actual: 100
            })
        );
    }

    #[test]
    fn test_inner_length_beyond_frame_rejected() {
        let mut frame = TunnelMessage::Extended(Extended::new(TunnelId(1), RequestId(1), vec![]))
            .encode()
            .unwrap();
        // handshake length claims more bytes than the frame holds
        frame[8] = 0xff;
        frame[9] = 0xff;

        assert!(matches!(
            TunnelMessage::decode(&frame),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_oversized_handshake_fails_to_encode() {
        let message: TunnelMessage =
            Extend::new(TunnelId(1), vec![0u8; 32], vec![0u8; MESSAGE_SIZE]).into();

        assert!(matches!(
            message.encode(),
            Err(ProtocolError::Oversized { .. })
        ));
    }

    #[test]
    fn test_connect_becomes_extend_with_same_request() {
        let connect = Connect::new(
            TunnelId(8),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            7000,
            vec![1, 2],
            vec![3, 4],
        )
        .with_request_id(RequestId(99));
        let extend = connect.to_extend();

        assert_eq!(extend.tunnel_id, TunnelId(8));
        assert_eq!(extend.request_id, RequestId(99));
        assert_eq!(extend.source_key, vec![1, 2]);
        assert_eq!(extend.handshake, vec![3, 4]);
    }
}
