//! Dialogue open/close negotiation packets.

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::error::Error;

use super::PacketHeader;

/// JSON tail of Session/SessionAck/Dismiss/DismissAck payloads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionData {
    #[serde(
        with = "base64_bytes",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub meta: Vec<u8>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// Bit-packed session flags: priority is the first payload byte, qos the
/// low 4 bits of the second, session-id-acquire bit 4 of the second.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionFlags {
    pub priority: u8,
    /// 4 bits on the wire.
    pub qos: u8,
    /// Asks the receiving peer to assign the dialogue-id instead of
    /// adopting the negotiate-id.
    pub session_id_acquire: bool,
}

impl SessionFlags {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u8(self.priority);
        let mut second = self.qos & 0x0F;
        if self.session_id_acquire {
            second |= 0x10;
        }
        buf.put_u8(second);
    }

    fn decode(cur: &mut &[u8]) -> Self {
        let priority = cur.get_u8();
        let second = cur.get_u8();
        Self {
            priority,
            qos: second & 0x0F,
            // bit 4 yields 0 or 0x10, so set iff non-zero
            session_id_acquire: (second & 0x10) != 0,
        }
    }
}

/// Dialogue open request.
///
/// Payload: flags (2 bytes), negotiate-id (u64), JSON tail. The
/// negotiate-id doubles as the header packet-id and keys the originator's
/// sync-hub wait.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionPacket {
    pub header: PacketHeader,
    pub flags: SessionFlags,
    pub negotiate_id: u64,
    pub data: SessionData,
}

impl SessionPacket {
    pub(super) fn encode_payload(&self) -> Result<Vec<u8>, Error> {
        let tail = serde_json::to_vec(&self.data)?;
        let mut buf = Vec::with_capacity(10 + tail.len());
        self.flags.encode(&mut buf);
        buf.put_u64(self.negotiate_id);
        buf.extend_from_slice(&tail);
        Ok(buf)
    }

    pub(super) fn decode(header: PacketHeader, payload: &[u8]) -> Result<Self, Error> {
        if payload.len() < 10 {
            return Err(Error::MalformedPacket(
                "session payload shorter than fixed fields".into(),
            ));
        }
        let mut cur = payload;
        let flags = SessionFlags::decode(&mut cur);
        let negotiate_id = cur.get_u64();
        let data: SessionData = serde_json::from_slice(cur)?;
        Ok(Self {
            header,
            flags,
            negotiate_id,
            data,
        })
    }
}

/// Dialogue open reply. The `session_id` it carries is authoritative for
/// every subsequent packet on the dialogue.
///
/// Payload: 2 reserved bytes, negotiate-id (u64), session-id (u64), JSON
/// tail.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionAckPacket {
    pub header: PacketHeader,
    pub negotiate_id: u64,
    pub session_id: u64,
    pub data: SessionData,
}

impl SessionAckPacket {
    pub(super) fn encode_payload(&self) -> Result<Vec<u8>, Error> {
        let tail = serde_json::to_vec(&self.data)?;
        let mut buf = Vec::with_capacity(18 + tail.len());
        buf.put_u16(0); // reserved flag bytes
        buf.put_u64(self.negotiate_id);
        buf.put_u64(self.session_id);
        buf.extend_from_slice(&tail);
        Ok(buf)
    }

    pub(super) fn decode(header: PacketHeader, payload: &[u8]) -> Result<Self, Error> {
        if payload.len() < 18 {
            return Err(Error::MalformedPacket(
                "session ack payload shorter than fixed fields".into(),
            ));
        }
        let mut cur = payload;
        let _reserved = cur.get_u16();
        let negotiate_id = cur.get_u64();
        let session_id = cur.get_u64();
        let data: SessionData = serde_json::from_slice(cur)?;
        Ok(Self {
            header,
            negotiate_id,
            session_id,
            data,
        })
    }
}

/// Dialogue close request. Payload: session-id (u64), JSON tail.
/// A session-id of 0 addresses the connection itself.
#[derive(Debug, Clone, PartialEq)]
pub struct DismissPacket {
    pub header: PacketHeader,
    pub session_id: u64,
    pub data: SessionData,
}

/// Dialogue close reply; same layout as [`DismissPacket`].
#[derive(Debug, Clone, PartialEq)]
pub struct DismissAckPacket {
    pub header: PacketHeader,
    pub session_id: u64,
    pub data: SessionData,
}

fn encode_dismiss(session_id: u64, data: &SessionData) -> Result<Vec<u8>, Error> {
    let tail = serde_json::to_vec(data)?;
    let mut buf = Vec::with_capacity(8 + tail.len());
    buf.put_u64(session_id);
    buf.extend_from_slice(&tail);
    Ok(buf)
}

fn decode_dismiss(payload: &[u8]) -> Result<(u64, SessionData), Error> {
    if payload.len() < 8 {
        return Err(Error::MalformedPacket(
            "dismiss payload shorter than session-id".into(),
        ));
    }
    let mut cur = payload;
    let session_id = cur.get_u64();
    let data: SessionData = serde_json::from_slice(cur)?;
    Ok((session_id, data))
}

impl DismissPacket {
    pub(super) fn encode_payload(&self) -> Result<Vec<u8>, Error> {
        encode_dismiss(self.session_id, &self.data)
    }

    pub(super) fn decode(header: PacketHeader, payload: &[u8]) -> Result<Self, Error> {
        let (session_id, data) = decode_dismiss(payload)?;
        Ok(Self {
            header,
            session_id,
            data,
        })
    }
}

impl DismissAckPacket {
    pub(super) fn encode_payload(&self) -> Result<Vec<u8>, Error> {
        encode_dismiss(self.session_id, &self.data)
    }

    pub(super) fn decode(header: PacketHeader, payload: &[u8]) -> Result<Self, Error> {
        let (session_id, data) = decode_dismiss(payload)?;
        Ok(Self {
            header,
            session_id,
            data,
        })
    }
}

/// Base64 transport for byte fields inside the JSON tails.
pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}
