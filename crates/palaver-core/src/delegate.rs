//! Host-side lifecycle callbacks.
//!
//! The connection and dialogue layers notify the host about lifecycle
//! events through a [`Delegate`]. Every method has a no-op default, so a
//! host implements only what it cares about; a returned error aborts the
//! event that triggered the callback.

use std::net::SocketAddr;

use crate::error::Error;
use crate::ids::Parity;

/// Which end of the connection this peer is.
///
/// The side determines ID parity and which peer originates heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    /// Packet-id parity for this side.
    pub fn parity(self) -> Parity {
        match self {
            Side::Client => Parity::Even,
            Side::Server => Parity::Odd,
        }
    }

    pub fn peer(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

/// Identity and addressing of one connection, as seen by delegates.
#[derive(Debug, Clone)]
pub struct ConnDescriptor {
    pub client_id: u64,
    pub meta: Vec<u8>,
    pub side: Side,
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
}

/// Identity of one dialogue, as seen by delegates.
#[derive(Debug, Clone)]
pub struct DialogueDescriptor {
    pub negotiating_id: u64,
    pub client_id: u64,
    pub dialogue_id: u64,
    pub meta: Vec<u8>,
    pub side: Side,
}

/// Callbacks into the host.
///
/// `get_client_id` is the server-side identity resolution hook: it maps the
/// dialer's opaque meta bytes to a client-id, and its error (if any) is
/// carried back to the dialer inside the handshake ack.
pub trait Delegate: Send + Sync {
    fn conn_online(&self, _descr: &ConnDescriptor) -> Result<(), Error> {
        Ok(())
    }

    fn conn_offline(&self, _descr: &ConnDescriptor) -> Result<(), Error> {
        Ok(())
    }

    fn heartbeat(&self, _descr: &ConnDescriptor) -> Result<(), Error> {
        Ok(())
    }

    fn get_client_id(&self, _meta: &[u8]) -> Result<u64, Error> {
        Ok(0)
    }

    fn dialogue_online(&self, _descr: &DialogueDescriptor) -> Result<(), Error> {
        Ok(())
    }

    fn dialogue_offline(&self, _descr: &DialogueDescriptor) -> Result<(), Error> {
        Ok(())
    }
}

/// Delegate that accepts everything and observes nothing.
#[derive(Debug, Default)]
pub struct NoopDelegate;

impl Delegate for NoopDelegate {}
