//! Packet construction with allocator-backed IDs.

use std::sync::Arc;

use bytes::Bytes;

use crate::ids::{IdFactory, Parity};

use super::{
    AppPacket, ConnAckPacket, ConnData, ConnPacket, DismissAckPacket, DismissPacket,
    HeartbeatPacket, PacketHeader, PacketType, SessionAckPacket, SessionData, SessionFlags,
    SessionPacket,
};

/// Builds packets with fresh packet-ids from one side's allocator, so the
/// layers never hand-assemble headers. Cheap to clone; clones share the
/// allocator.
#[derive(Debug, Clone)]
pub struct PacketFactory {
    ids: Arc<IdFactory>,
}

impl PacketFactory {
    pub fn new(parity: Parity) -> Self {
        Self {
            ids: Arc::new(IdFactory::new(parity)),
        }
    }

    /// Allocate a bare packet-id (also used for dialogue-id assignment).
    pub fn packet_id(&self) -> u64 {
        self.ids.next()
    }

    pub fn new_conn(&self, client_id: u64, meta: Vec<u8>) -> ConnPacket {
        ConnPacket {
            header: PacketHeader::new(PacketType::Conn, self.ids.next()),
            client_id,
            data: ConnData {
                meta,
                error: String::new(),
            },
        }
    }

    /// Ack for a `Conn`; reuses the request's packet-id.
    pub fn new_conn_ack(&self, packet_id: u64, client_id: u64, error: String) -> ConnAckPacket {
        ConnAckPacket {
            header: PacketHeader::new(PacketType::ConnAck, packet_id),
            client_id,
            data: ConnData {
                meta: Vec::new(),
                error,
            },
        }
    }

    pub fn new_heartbeat(&self) -> HeartbeatPacket {
        HeartbeatPacket {
            header: PacketHeader::new(PacketType::Heartbeat, self.ids.next()),
        }
    }

    /// Ack for a `Heartbeat`; reuses the request's packet-id.
    pub fn new_heartbeat_ack(&self, packet_id: u64) -> HeartbeatPacket {
        HeartbeatPacket {
            header: PacketHeader::new(PacketType::HeartbeatAck, packet_id),
        }
    }

    /// Open request. The fresh packet-id doubles as the negotiate-id.
    pub fn new_session(&self, flags: SessionFlags, meta: Vec<u8>) -> SessionPacket {
        let id = self.ids.next();
        SessionPacket {
            header: PacketHeader::new(PacketType::Session, id),
            flags,
            negotiate_id: id,
            data: SessionData {
                meta,
                error: String::new(),
            },
        }
    }

    /// Ack for a `Session`; echoes the negotiate-id and carries the
    /// authoritative session-id.
    pub fn new_session_ack(
        &self,
        session: &SessionPacket,
        session_id: u64,
        error: String,
    ) -> SessionAckPacket {
        SessionAckPacket {
            header: PacketHeader::new(PacketType::SessionAck, session.header.packet_id),
            negotiate_id: session.negotiate_id,
            session_id,
            data: SessionData {
                meta: Vec::new(),
                error,
            },
        }
    }

    pub fn new_dismiss(&self, session_id: u64) -> DismissPacket {
        DismissPacket {
            header: PacketHeader::new(PacketType::Dismiss, self.ids.next()),
            session_id,
            data: SessionData::default(),
        }
    }

    /// Ack for a `Dismiss`; reuses the request's packet-id.
    pub fn new_dismiss_ack(&self, dismiss: &DismissPacket, error: String) -> DismissAckPacket {
        DismissAckPacket {
            header: PacketHeader::new(PacketType::DismissAck, dismiss.header.packet_id),
            session_id: dismiss.session_id,
            data: SessionData {
                meta: Vec::new(),
                error,
            },
        }
    }

    /// Application packet addressed to one dialogue.
    pub fn new_application(&self, typ: PacketType, session_id: u64, data: Bytes) -> AppPacket {
        debug_assert!(typ.is_application_layer());
        AppPacket {
            header: PacketHeader::new(typ, self.ids.next()),
            session_id,
            data,
        }
    }
}
