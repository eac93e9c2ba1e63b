//! Connection-scope packets: handshake and liveness.

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::error::Error;

use super::PacketHeader;

/// JSON tail of Conn/ConnAck payloads.
///
/// `meta` travels base64-encoded so the wire stays compatible with peers
/// that marshal raw bytes through their platform JSON encoder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnData {
    #[serde(
        with = "super::sess::base64_bytes",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub meta: Vec<u8>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// Dialer's half of the handshake.
///
/// Payload: client-id (u64) followed by the JSON tail.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnPacket {
    pub header: PacketHeader,
    pub client_id: u64,
    pub data: ConnData,
}

/// Acceptor's half of the handshake. Shares the dialer's packet-id; a
/// non-empty `data.error` rejects the connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnAckPacket {
    pub header: PacketHeader,
    pub client_id: u64,
    pub data: ConnData,
}

fn encode_id_and_tail(client_id: u64, data: &ConnData) -> Result<Vec<u8>, Error> {
    let tail = serde_json::to_vec(data)?;
    let mut buf = Vec::with_capacity(8 + tail.len());
    buf.put_u64(client_id);
    buf.extend_from_slice(&tail);
    Ok(buf)
}

fn decode_id_and_tail(payload: &[u8]) -> Result<(u64, ConnData), Error> {
    if payload.len() < 8 {
        return Err(Error::MalformedPacket(
            "conn payload shorter than client-id".into(),
        ));
    }
    let mut cur = payload;
    let client_id = cur.get_u64();
    let data: ConnData = serde_json::from_slice(cur)?;
    Ok((client_id, data))
}

impl ConnPacket {
    pub(super) fn encode_payload(&self) -> Result<Vec<u8>, Error> {
        encode_id_and_tail(self.client_id, &self.data)
    }

    pub(super) fn decode(header: PacketHeader, payload: &[u8]) -> Result<Self, Error> {
        let (client_id, data) = decode_id_and_tail(payload)?;
        Ok(Self {
            header,
            client_id,
            data,
        })
    }
}

impl ConnAckPacket {
    pub(super) fn encode_payload(&self) -> Result<Vec<u8>, Error> {
        encode_id_and_tail(self.client_id, &self.data)
    }

    pub(super) fn decode(header: PacketHeader, payload: &[u8]) -> Result<Self, Error> {
        let (client_id, data) = decode_id_and_tail(payload)?;
        Ok(Self {
            header,
            client_id,
            data,
        })
    }
}

/// Heartbeat and HeartbeatAck: the header is the whole packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatPacket {
    pub header: PacketHeader,
}

impl HeartbeatPacket {
    pub(super) fn encode_payload(&self) -> Vec<u8> {
        Vec::new()
    }

    pub(super) fn decode(header: PacketHeader, _payload: &[u8]) -> Result<Self, Error> {
        Ok(Self { header })
    }
}
