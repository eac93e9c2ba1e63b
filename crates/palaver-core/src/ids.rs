//! Monotone 64-bit ID allocation with parity discipline.
//!
//! Each side of a connection runs its own allocator; the two sides are
//! configured with opposite parity so their packet-ids never collide, the
//! same way two RPC peers interleave odd and even channel ids.

use std::sync::atomic::{AtomicU64, Ordering};

/// Which residue class an allocator hands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    /// IDs 2, 4, 6, ... (client-origin).
    Even,
    /// IDs 1, 3, 5, ... (server-origin).
    Odd,
}

impl Parity {
    fn seed(self) -> u64 {
        match self {
            Parity::Even => 2,
            Parity::Odd => 1,
        }
    }
}

/// Strictly increasing ID generator.
///
/// `next()` steps by two so the configured parity is preserved. On overflow
/// the sequence wraps back to the seed; outstanding-ID pressure at that
/// point is the caller's problem and in practice exhaustion is fatal long
/// before the wrap.
#[derive(Debug)]
pub struct IdFactory {
    parity: Parity,
    next: AtomicU64,
}

impl IdFactory {
    pub fn new(parity: Parity) -> Self {
        Self {
            parity,
            next: AtomicU64::new(parity.seed()),
        }
    }

    pub fn parity(&self) -> Parity {
        self.parity
    }

    /// Allocate the next ID.
    pub fn next(&self) -> u64 {
        let seed = self.parity.seed();
        let prev = self
            .next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.checked_add(2).unwrap_or(seed))
            });
        match prev {
            Ok(v) => v,
            // fetch_update with a Some-returning closure cannot fail
            Err(v) => v,
        }
    }
}
