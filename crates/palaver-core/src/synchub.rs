//! Pending-ack registry.
//!
//! Packets that require acknowledgement register their packet-id here
//! before being written; the read pump delivers the matching ack (or the
//! peer's error) to the registered waiter. Delivery is exactly-once: the
//! entry is removed under the lock before the waiter is woken, so a
//! late ack, a cancel, and a timeout can race without double-delivery.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::Error;

/// Default wait for open, dismiss, and handshake acknowledgements.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

type Slot = oneshot::Sender<Result<(), Error>>;

/// Registry of in-flight packet-ids awaiting acknowledgement.
#[derive(Clone, Default)]
pub struct SyncHub {
    pending: Arc<Mutex<HashMap<u64, Slot>>>,
}

impl SyncHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending entry for `id`.
    ///
    /// The returned handle resolves to exactly one outcome: the acked
    /// result, `Timeout`, or `Cancelled`. Dropping the handle without
    /// waiting de-registers the entry.
    pub fn register(&self, id: u64, timeout: Duration) -> SyncHandle {
        let (tx, rx) = oneshot::channel();
        if self.pending.lock().insert(id, tx).is_some() {
            // ids are allocator-unique, so a duplicate means a caller bug
            tracing::warn!(packet_id = id, "replaced pending entry");
        }
        SyncHandle {
            id,
            rx,
            timeout,
            hub: self.clone(),
        }
    }

    /// Deliver an acknowledgement to the waiter registered for `id`.
    ///
    /// An ack with no matching pending entry is logged and dropped.
    pub fn ack(&self, id: u64, result: Result<(), Error>) {
        match self.pending.lock().remove(&id) {
            Some(tx) => {
                // the waiter may have timed out between removal and here;
                // the value is then discarded with the receiver
                let _ = tx.send(result);
            }
            None => {
                tracing::warn!(packet_id = id, "ack without pending entry, dropped");
            }
        }
    }

    /// Wake the waiter for `id` with a cancellation error.
    pub fn cancel(&self, id: u64) {
        if let Some(tx) = self.pending.lock().remove(&id) {
            let _ = tx.send(Err(Error::Cancelled));
        }
    }

    /// Wake every waiter with a cancellation error.
    pub fn cancel_all(&self) {
        let drained: Vec<Slot> = {
            let mut pending = self.pending.lock();
            pending.drain().map(|(_, tx)| tx).collect()
        };
        for tx in drained {
            let _ = tx.send(Err(Error::Cancelled));
        }
    }

    pub fn is_pending(&self, id: u64) -> bool {
        self.pending.lock().contains_key(&id)
    }

    fn remove(&self, id: u64) {
        self.pending.lock().remove(&id);
    }
}

/// Waiter side of one pending entry.
pub struct SyncHandle {
    id: u64,
    rx: oneshot::Receiver<Result<(), Error>>,
    timeout: Duration,
    hub: SyncHub,
}

impl SyncHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Block until the ack arrives, the entry is cancelled, or the timeout
    /// elapses.
    pub async fn wait(mut self) -> Result<(), Error> {
        match tokio::time::timeout(self.timeout, &mut self.rx).await {
            Ok(Ok(result)) => result,
            // sender dropped without delivering: hub was torn down
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => {
                self.hub.remove(self.id);
                Err(Error::Timeout)
            }
        }
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        // callers that drop without waiting (task aborted mid-call) must
        // not leave a dangling entry behind
        self.hub.remove(self.id);
    }
}
