//! palaver-core: packet model and shared primitives for the palaver transport.
//!
//! This crate defines:
//! - The typed packet family and its binary codec ([`packet`])
//! - The parity-disciplined ID allocator ([`IdFactory`])
//! - The pending-ack registry ([`SyncHub`])
//! - The finite-state-machine runtime ([`StateMachine`])
//! - Host delegate callbacks ([`Delegate`])
//! - The protocol error taxonomy ([`Error`])
//!
//! The connection and dialogue layers live in the `palaver` crate; this crate
//! carries everything both layers share.

#![forbid(unsafe_code)]

mod delegate;
mod error;
mod fsm;
mod ids;
pub mod packet;
mod synchub;

pub use delegate::*;
pub use error::*;
pub use fsm::*;
pub use ids::*;
pub use synchub::*;
