//! palaver: a layered, connection-oriented RPC and messaging transport.
//!
//! Two peers share a reliable byte stream; on top of it they multiplex many
//! independent logical conversations ("dialogues"). The protocol is
//! symmetric: once a connection is established either side can originate
//! dialogues.
//!
//! ```text
//!  application        read()/write()/close() per dialogue
//!  ────────────────────────────────────────────────────────
//!  dialogue layer     open/dismiss negotiation, per-dialogue pumps
//!  ────────────────────────────────────────────────────────
//!  connection layer   handshake, heartbeat, routing, single writer
//!  ────────────────────────────────────────────────────────
//!  byte stream        anything AsyncRead + AsyncWrite
//! ```
//!
//! Dial one side with [`Connection::dial`], accept the other with
//! [`Connection::accept`], then open dialogues from either end:
//!
//! ```ignore
//! let conn = Connection::dial(stream, ConnectionOptions::default(), delegate).await?;
//! let dialogue = conn.open_dialogue(b"hello".to_vec()).await?;
//! dialogue.write(dialogue.app_packet(PacketType::Message, payload)).await?;
//! ```

pub mod connection;
pub mod dialogue;
pub mod options;
mod stream;

pub use connection::Connection;
pub use dialogue::{Dialogue, DialogueState};
pub use options::{ConnectionOptions, DialogueOptions};

pub use palaver_core::{
    packet, ConnDescriptor, Delegate, DialogueDescriptor, Error, NoopDelegate, Side,
};

/// Fixed capacity of every bounded queue in both layers.
pub(crate) const QUEUE_CAPACITY: usize = 128;
