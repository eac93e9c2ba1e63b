//! Application-layer packets, carried opaquely.

use bytes::{Buf, BufMut, Bytes};

use crate::error::Error;

use super::PacketHeader;

/// One application packet. The dialogue layer interprets only the
/// session-id routing prefix; `data` belongs to the application.
#[derive(Debug, Clone, PartialEq)]
pub struct AppPacket {
    pub header: PacketHeader,
    pub session_id: u64,
    pub data: Bytes,
}

impl AppPacket {
    pub(super) fn encode_payload(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + self.data.len());
        buf.put_u64(self.session_id);
        buf.extend_from_slice(&self.data);
        buf
    }

    pub(super) fn decode(header: PacketHeader, payload: &[u8]) -> Result<Self, Error> {
        if payload.len() < 8 {
            return Err(Error::MalformedPacket(
                "application payload shorter than session-id".into(),
            ));
        }
        let mut cur = payload;
        let session_id = cur.get_u64();
        Ok(Self {
            header,
            session_id,
            data: Bytes::copy_from_slice(cur),
        })
    }
}
