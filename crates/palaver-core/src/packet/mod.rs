//! The typed packet family and its binary codec.
//!
//! Every packet is a fixed 14-byte header followed by `payload_len` bytes
//! of variant-specific payload. The header's length field is the single
//! source of truth for framing; variable-length fields (meta, error
//! strings) ride in a JSON object appended after the fixed-width binary
//! fields so extension fields never break layout.
//!
//! Wire header layout, all integers big-endian:
//!
//! ```text
//! byte 0        version (high 4 bits) | header flags (low 4 bits)
//! byte 1        packet type
//! bytes 2..10   packet-id (u64)
//! bytes 10..14  payload length (u32)
//! ```

mod app;
mod conn;
mod factory;
mod sess;

pub use app::*;
pub use conn::*;
pub use factory::*;
pub use sess::*;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::Error;

/// Wire protocol version carried in every header.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Fixed header size on the wire.
pub const HEADER_LEN: usize = 14;

/// Payloads larger than this indicate framing desynchronization.
pub const MAX_PAYLOAD_LEN: u32 = 16 * 1024 * 1024;

/// Discriminator byte for the packet family.
///
/// `0x0*` is the connection layer, `0x1*` the dialogue layer, `0x2*` the
/// application layer (carried transparently).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Conn = 0x01,
    ConnAck = 0x02,
    Heartbeat = 0x03,
    HeartbeatAck = 0x04,

    Session = 0x11,
    SessionAck = 0x12,
    Dismiss = 0x13,
    DismissAck = 0x14,

    Message = 0x21,
    MessageAck = 0x22,
    Request = 0x23,
    Response = 0x24,
    Register = 0x25,
    RegisterAck = 0x26,
    Stream = 0x27,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Conn),
            0x02 => Some(Self::ConnAck),
            0x03 => Some(Self::Heartbeat),
            0x04 => Some(Self::HeartbeatAck),
            0x11 => Some(Self::Session),
            0x12 => Some(Self::SessionAck),
            0x13 => Some(Self::Dismiss),
            0x14 => Some(Self::DismissAck),
            0x21 => Some(Self::Message),
            0x22 => Some(Self::MessageAck),
            0x23 => Some(Self::Request),
            0x24 => Some(Self::Response),
            0x25 => Some(Self::Register),
            0x26 => Some(Self::RegisterAck),
            0x27 => Some(Self::Stream),
            _ => None,
        }
    }

    /// Connection-scope packets (handshake, liveness).
    pub fn is_connection_layer(self) -> bool {
        matches!(
            self,
            Self::Conn | Self::ConnAck | Self::Heartbeat | Self::HeartbeatAck
        )
    }

    /// Dialogue open/close negotiation packets.
    pub fn is_session_layer(self) -> bool {
        matches!(
            self,
            Self::Session | Self::SessionAck | Self::Dismiss | Self::DismissAck
        )
    }

    /// Packets carried opaquely on behalf of the application layer.
    pub fn is_application_layer(self) -> bool {
        (self as u8) & 0xF0 == 0x20
    }
}

/// The fixed packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub version: u8,
    pub flags: u8,
    pub typ: PacketType,
    pub packet_id: u64,
    pub payload_len: u32,
}

impl PacketHeader {
    pub fn new(typ: PacketType, packet_id: u64) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            flags: 0,
            typ,
            packet_id,
            payload_len: 0,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8((self.version << 4) | (self.flags & 0x0F));
        buf.put_u8(self.typ as u8);
        buf.put_u64(self.packet_id);
        buf.put_u32(self.payload_len);
    }

    /// Decode the fixed header from the front of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < HEADER_LEN {
            return Err(Error::IncompletePacket);
        }
        let mut cur = buf;
        let first = cur.get_u8();
        let version = first >> 4;
        if version != PROTOCOL_VERSION {
            return Err(Error::MalformedPacket(format!(
                "unsupported version {version:#x}"
            )));
        }
        let flags = first & 0x0F;
        let raw_typ = cur.get_u8();
        let typ = PacketType::from_u8(raw_typ).ok_or_else(|| {
            Error::MalformedPacket(format!("unknown packet type {raw_typ:#04x}"))
        })?;
        let packet_id = cur.get_u64();
        let payload_len = cur.get_u32();
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(Error::MalformedPacket(format!(
                "implausible payload length {payload_len}"
            )));
        }
        Ok(Self {
            version,
            flags,
            typ,
            packet_id,
            payload_len,
        })
    }
}

/// One packet of the family. The variant and `header.typ` always agree.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Conn(ConnPacket),
    ConnAck(ConnAckPacket),
    Heartbeat(HeartbeatPacket),
    HeartbeatAck(HeartbeatPacket),
    Session(SessionPacket),
    SessionAck(SessionAckPacket),
    Dismiss(DismissPacket),
    DismissAck(DismissAckPacket),
    /// Message, MessageAck, Request, Response, Register, RegisterAck and
    /// Stream packets: only the session-id routing prefix is interpreted
    /// here, the rest belongs to the application layer.
    Application(AppPacket),
}

impl Packet {
    pub fn header(&self) -> &PacketHeader {
        match self {
            Packet::Conn(p) => &p.header,
            Packet::ConnAck(p) => &p.header,
            Packet::Heartbeat(p) | Packet::HeartbeatAck(p) => &p.header,
            Packet::Session(p) => &p.header,
            Packet::SessionAck(p) => &p.header,
            Packet::Dismiss(p) => &p.header,
            Packet::DismissAck(p) => &p.header,
            Packet::Application(p) => &p.header,
        }
    }

    pub fn packet_id(&self) -> u64 {
        self.header().packet_id
    }

    pub fn typ(&self) -> PacketType {
        self.header().typ
    }

    /// Encode header and payload into one buffer, with the header's length
    /// field patched to the actual payload size.
    pub fn encode(&self) -> Result<Bytes, Error> {
        let payload = match self {
            Packet::Conn(p) => p.encode_payload()?,
            Packet::ConnAck(p) => p.encode_payload()?,
            Packet::Heartbeat(p) | Packet::HeartbeatAck(p) => p.encode_payload(),
            Packet::Session(p) => p.encode_payload()?,
            Packet::SessionAck(p) => p.encode_payload()?,
            Packet::Dismiss(p) => p.encode_payload()?,
            Packet::DismissAck(p) => p.encode_payload()?,
            Packet::Application(p) => p.encode_payload(),
        };

        let mut header = *self.header();
        header.payload_len = payload.len() as u32;

        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        header.encode(&mut buf);
        buf.extend_from_slice(&payload);
        Ok(buf.freeze())
    }

    /// Decode the payload for an already-decoded header.
    ///
    /// Fails with [`Error::IncompletePacket`] when `payload` holds fewer
    /// bytes than the header declared.
    pub fn decode(header: PacketHeader, payload: &[u8]) -> Result<Packet, Error> {
        let declared = header.payload_len as usize;
        if payload.len() < declared {
            return Err(Error::IncompletePacket);
        }
        let payload = &payload[..declared];

        Ok(match header.typ {
            PacketType::Conn => Packet::Conn(ConnPacket::decode(header, payload)?),
            PacketType::ConnAck => Packet::ConnAck(ConnAckPacket::decode(header, payload)?),
            PacketType::Heartbeat => Packet::Heartbeat(HeartbeatPacket::decode(header, payload)?),
            PacketType::HeartbeatAck => {
                Packet::HeartbeatAck(HeartbeatPacket::decode(header, payload)?)
            }
            PacketType::Session => Packet::Session(SessionPacket::decode(header, payload)?),
            PacketType::SessionAck => {
                Packet::SessionAck(SessionAckPacket::decode(header, payload)?)
            }
            PacketType::Dismiss => Packet::Dismiss(DismissPacket::decode(header, payload)?),
            PacketType::DismissAck => {
                Packet::DismissAck(DismissAckPacket::decode(header, payload)?)
            }
            _ => Packet::Application(AppPacket::decode(header, payload)?),
        })
    }

    /// Decode one whole packet (header plus payload) from `buf`.
    pub fn decode_buf(buf: &[u8]) -> Result<Packet, Error> {
        let header = PacketHeader::decode(buf)?;
        Self::decode(header, &buf[HEADER_LEN..])
    }
}

#[cfg(test)]
mod proptests;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::Parity;

    fn factory() -> PacketFactory {
        PacketFactory::new(Parity::Even)
    }

    fn roundtrip(pkt: &Packet) -> Packet {
        let bytes = pkt.encode().unwrap();
        let decoded = Packet::decode_buf(&bytes).unwrap();
        // re-encoding must be byte-identical
        assert_eq!(decoded.encode().unwrap(), bytes);
        decoded
    }

    #[test]
    fn header_roundtrip() {
        let mut header = PacketHeader::new(PacketType::Session, 0xDEAD_BEEF_0042);
        header.payload_len = 77;
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_LEN);
        assert_eq!(PacketHeader::decode(&buf).unwrap(), header);
    }

    #[test]
    fn header_length_field_sits_at_bytes_10_to_14() {
        let pkt = Packet::Session(factory().new_session(
            SessionFlags::default(),
            b"hello".to_vec(),
        ));
        let bytes = pkt.encode().unwrap();
        let payload_len = u32::from_be_bytes([bytes[10], bytes[11], bytes[12], bytes[13]]);
        assert_eq!(payload_len as usize, bytes.len() - HEADER_LEN);
    }

    #[test]
    fn header_rejects_wrong_version() {
        let mut buf = BytesMut::new();
        PacketHeader::new(PacketType::Heartbeat, 2).encode(&mut buf);
        buf[0] = (0x07 << 4) | (buf[0] & 0x0F);
        assert!(matches!(
            PacketHeader::decode(&buf),
            Err(Error::MalformedPacket(_))
        ));
    }

    #[test]
    fn header_rejects_unknown_type() {
        let mut buf = BytesMut::new();
        PacketHeader::new(PacketType::Heartbeat, 2).encode(&mut buf);
        buf[1] = 0x7F;
        assert!(matches!(
            PacketHeader::decode(&buf),
            Err(Error::MalformedPacket(_))
        ));
    }

    #[test]
    fn header_rejects_implausible_length() {
        let mut buf = BytesMut::new();
        let mut header = PacketHeader::new(PacketType::Message, 2);
        header.payload_len = MAX_PAYLOAD_LEN + 1;
        header.encode(&mut buf);
        assert!(matches!(
            PacketHeader::decode(&buf),
            Err(Error::MalformedPacket(_))
        ));
    }

    #[test]
    fn short_header_is_incomplete() {
        let mut buf = BytesMut::new();
        PacketHeader::new(PacketType::Heartbeat, 2).encode(&mut buf);
        for k in 1..HEADER_LEN {
            assert!(matches!(
                PacketHeader::decode(&buf[..HEADER_LEN - k]),
                Err(Error::IncompletePacket)
            ));
        }
    }

    #[test]
    fn conn_roundtrip() {
        let pkt = Packet::Conn(factory().new_conn(42, b"meta-bytes".to_vec()));
        match roundtrip(&pkt) {
            Packet::Conn(p) => {
                assert_eq!(p.client_id, 42);
                assert_eq!(p.data.meta, b"meta-bytes");
                assert!(p.data.error.is_empty());
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn conn_ack_roundtrip_with_error() {
        let pkt = Packet::ConnAck(factory().new_conn_ack(8, 0, "denied".to_string()));
        match roundtrip(&pkt) {
            Packet::ConnAck(p) => {
                assert_eq!(p.header.packet_id, 8);
                assert_eq!(p.data.error, "denied");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn heartbeat_roundtrip_is_header_only() {
        let f = factory();
        let pkt = Packet::Heartbeat(f.new_heartbeat());
        let bytes = pkt.encode().unwrap();
        assert_eq!(bytes.len(), HEADER_LEN);
        roundtrip(&pkt);

        let ack = Packet::HeartbeatAck(f.new_heartbeat_ack(pkt.packet_id()));
        assert_eq!(ack.packet_id(), pkt.packet_id());
        roundtrip(&ack);
    }

    #[test]
    fn session_roundtrip_preserves_flags_and_meta() {
        let flags = SessionFlags {
            priority: 0xA5,
            qos: 0x03,
            session_id_acquire: true,
        };
        let pkt = Packet::Session(factory().new_session(flags, b"hello".to_vec()));
        match roundtrip(&pkt) {
            Packet::Session(p) => {
                assert_eq!(p.flags, flags);
                assert_eq!(p.negotiate_id, p.header.packet_id);
                assert_eq!(p.data.meta, b"hello");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn session_id_acquire_bit_is_tested_nonzero() {
        // bit 4 of the second flag byte can only yield 0 or 0x10, so the
        // decoder must test for non-zero, not for literal 1
        let flags = SessionFlags {
            priority: 0,
            qos: 0,
            session_id_acquire: true,
        };
        let pkt = Packet::Session(factory().new_session(flags, Vec::new()));
        let bytes = pkt.encode().unwrap();
        assert_eq!(bytes[HEADER_LEN + 1] & 0x10, 0x10);
        match Packet::decode_buf(&bytes).unwrap() {
            Packet::Session(p) => assert!(p.flags.session_id_acquire),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn session_ack_roundtrip() {
        let f = factory();
        let session = f.new_session(SessionFlags::default(), b"m".to_vec());
        let pkt = Packet::SessionAck(f.new_session_ack(&session, 17, String::new()));
        match roundtrip(&pkt) {
            Packet::SessionAck(p) => {
                assert_eq!(p.header.packet_id, session.header.packet_id);
                assert_eq!(p.negotiate_id, session.negotiate_id);
                assert_eq!(p.session_id, 17);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn dismiss_roundtrip() {
        let f = factory();
        let pkt = Packet::Dismiss(f.new_dismiss(9));
        let decoded = match roundtrip(&pkt) {
            Packet::Dismiss(p) => p,
            other => panic!("wrong variant: {other:?}"),
        };
        assert_eq!(decoded.session_id, 9);

        let ack = Packet::DismissAck(f.new_dismiss_ack(&decoded, String::new()));
        match roundtrip(&ack) {
            Packet::DismissAck(p) => {
                assert_eq!(p.session_id, 9);
                assert_eq!(p.header.packet_id, decoded.header.packet_id);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn application_roundtrip_keeps_bytes_opaque() {
        let f = factory();
        for typ in [
            PacketType::Message,
            PacketType::MessageAck,
            PacketType::Request,
            PacketType::Response,
            PacketType::Register,
            PacketType::RegisterAck,
            PacketType::Stream,
        ] {
            let pkt = Packet::Application(f.new_application(
                typ,
                33,
                Bytes::from_static(b"\x00\x01opaque\xFF"),
            ));
            match roundtrip(&pkt) {
                Packet::Application(p) => {
                    assert_eq!(p.header.typ, typ);
                    assert_eq!(p.session_id, 33);
                    assert_eq!(p.data.as_ref(), b"\x00\x01opaque\xFF");
                }
                other => panic!("wrong variant: {other:?}"),
            }
        }
    }

    #[test]
    fn truncated_payload_is_incomplete() {
        let pkt = Packet::Session(factory().new_session(
            SessionFlags::default(),
            b"some meta".to_vec(),
        ));
        let bytes = pkt.encode().unwrap();
        for k in 1..(bytes.len() - HEADER_LEN) {
            let truncated = &bytes[..bytes.len() - k];
            let header = PacketHeader::decode(truncated).unwrap();
            assert!(
                matches!(
                    Packet::decode(header, &truncated[HEADER_LEN..]),
                    Err(Error::IncompletePacket)
                ),
                "k={k} should starve the decoder"
            );
        }
    }

    #[test]
    fn declared_length_shorter_than_fixed_fields_is_malformed() {
        let pkt = Packet::Dismiss(factory().new_dismiss(1));
        let mut bytes = BytesMut::from(pkt.encode().unwrap().as_ref());
        // claim a 4-byte payload: too short for the session-id prefix
        bytes[10..14].copy_from_slice(&4u32.to_be_bytes());
        let header = PacketHeader::decode(&bytes).unwrap();
        assert!(matches!(
            Packet::decode(header, &bytes[HEADER_LEN..]),
            Err(Error::MalformedPacket(_))
        ));
    }
}
