//! Protocol error taxonomy.

use core::fmt;

/// Errors surfaced by the packet codec, the connection layer, and the
/// dialogue layer.
///
/// Codec errors are local to one packet; `MalformedPacket` and `Io` are
/// connection-fatal; the remaining variants surface to the caller of the
/// operation that failed.
#[derive(Debug)]
pub enum Error {
    /// The decoder was handed fewer bytes than the header declared.
    /// Recoverable by reading more bytes.
    IncompletePacket,
    /// Header or payload violates a wire invariant. Fatal for the
    /// connection because framing can no longer be trusted.
    MalformedPacket(String),
    /// An inbound packet references a dialogue that is not registered.
    /// The packet is dropped.
    UnknownDialogue(u64),
    /// Operation on a connection that has been torn down.
    MultiplexerClosed,
    /// A dialogue with this id is already registered on the connection.
    DialogueIdConflict(u64),
    /// Operation on a dialogue that already reached its terminal state.
    DialogueClosed,
    /// A pending wait expired before the matching ack arrived.
    Timeout,
    /// A pending wait was cancelled before the matching ack arrived.
    Cancelled,
    /// No transition is defined from the current state for this event.
    InvalidTransition { state: String, event: String },
    /// A bounded queue refused the packet.
    BufferFull,
    /// The acceptor rejected the handshake; carries the peer's reason.
    HandshakeRejected(String),
    /// Two consecutive heartbeat acks were missed.
    HeartbeatTimeout,
    /// Underlying byte-stream failure.
    Io(std::io::Error),
    /// Error string carried inside a peer's packet.
    Remote(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IncompletePacket => write!(f, "incomplete packet"),
            Self::MalformedPacket(msg) => write!(f, "malformed packet: {msg}"),
            Self::UnknownDialogue(id) => write!(f, "unknown dialogue {id}"),
            Self::MultiplexerClosed => write!(f, "operation on closed multiplexer"),
            Self::DialogueIdConflict(id) => write!(f, "dialogue id {id} already in use"),
            Self::DialogueClosed => write!(f, "operation on closed dialogue"),
            Self::Timeout => write!(f, "wait timed out"),
            Self::Cancelled => write!(f, "wait cancelled"),
            Self::InvalidTransition { state, event } => {
                write!(f, "no transition from state {state} for event {event}")
            }
            Self::BufferFull => write!(f, "bounded queue full"),
            Self::HandshakeRejected(reason) => write!(f, "handshake rejected: {reason}"),
            Self::HeartbeatTimeout => write!(f, "heartbeat timed out"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Remote(msg) => write!(f, "remote error: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::MalformedPacket(format!("bad json tail: {e}"))
    }
}

impl Error {
    /// True for errors that desynchronize framing and must terminate the
    /// connection.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Self::MalformedPacket(_) | Self::Io(_) | Self::HeartbeatTimeout
        )
    }
}
