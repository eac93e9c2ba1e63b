//! Configuration for connections and dialogues.

use std::net::SocketAddr;
use std::time::Duration;

use crate::dialogue::DialogueState;

/// Per-connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// How often the dialer emits heartbeats.
    pub heartbeat_interval: Duration,
    /// How long handshake and connection-scope waits may block.
    pub handshake_timeout: Duration,
    /// Identity to present (dialer) or to fall back on when the delegate
    /// does not resolve one (acceptor).
    pub client_id: Option<u64>,
    /// Opaque bytes presented during the handshake.
    pub meta: Vec<u8>,
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(30),
            client_id: None,
            meta: Vec::new(),
            local_addr: None,
            remote_addr: None,
        }
    }
}

impl ConnectionOptions {
    pub fn with_meta(mut self, meta: Vec<u8>) -> Self {
        self.meta = meta;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

/// Per-dialogue configuration for active opens.
#[derive(Debug, Clone, Default)]
pub struct DialogueOptions {
    /// Opaque bytes presented to the peer in the open request.
    pub meta: Vec<u8>,
    /// Override the allocator-chosen negotiate-id. Required when resuming
    /// a dialogue whose id was agreed out of band.
    pub negotiating_id: Option<u64>,
    /// Ask the peer to assign the dialogue-id instead of adopting the
    /// negotiate-id.
    pub peer_assigns_id: bool,
    /// Start the dialogue in this state instead of negotiating. Passing
    /// `Sessioned` resumes a dialogue both sides already agreed on; the
    /// open then skips the Session/SessionAck exchange entirely.
    pub initial_state: Option<DialogueState>,
}

impl DialogueOptions {
    pub fn with_meta(mut self, meta: Vec<u8>) -> Self {
        self.meta = meta;
        self
    }

    pub fn with_peer_assigns_id(mut self, peer_assigns_id: bool) -> Self {
        self.peer_assigns_id = peer_assigns_id;
        self
    }

    /// Resume a sessioned dialogue under `dialogue_id`, skipping the open
    /// negotiation. The peer must resume the same id.
    pub fn with_resumed_id(mut self, dialogue_id: u64) -> Self {
        self.negotiating_id = Some(dialogue_id);
        self.initial_state = Some(DialogueState::Sessioned);
        self
    }
}
