//! palaver-testkit: loopback plumbing and recording delegates.
//!
//! End-to-end tests run two in-process peers over a `tokio::io::duplex`
//! pipe: [`loopback`] hands out the two halves, [`connected_pair`] runs
//! the handshake on both, and [`RecordingDelegate`] captures every
//! lifecycle callback for later assertions.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::DuplexStream;
use tokio::sync::Notify;

use palaver::{Connection, ConnectionOptions};
use palaver_core::{ConnDescriptor, Delegate, DialogueDescriptor, Error};

pub mod raw;

/// Buffer of the in-process pipe. Small enough that a fast writer hits
/// transport back-pressure in tests.
pub const LOOPBACK_BUFFER: usize = 16 * 1024;

/// An in-process byte-stream pair: what one side writes, the other reads.
pub fn loopback() -> (DuplexStream, DuplexStream) {
    tokio::io::duplex(LOOPBACK_BUFFER)
}

/// Install a test subscriber honoring `RUST_LOG`. Safe to call from every
/// test; only the first call wins.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Dial and accept over a loopback pipe, returning `(client, server)`.
pub async fn connected_pair(
    client_options: ConnectionOptions,
    server_options: ConnectionOptions,
    client_delegate: Arc<dyn Delegate>,
    server_delegate: Arc<dyn Delegate>,
) -> (Connection, Connection) {
    init_tracing();
    let (client_stream, server_stream) = loopback();
    let accept = tokio::spawn(Connection::accept(
        server_stream,
        server_options,
        server_delegate,
    ));
    let client = Connection::dial(client_stream, client_options, client_delegate)
        .await
        .expect("dial failed");
    let server = accept
        .await
        .expect("accept task panicked")
        .expect("accept failed");
    (client, server)
}

/// One observed delegate callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DelegateEvent {
    ConnOnline { client_id: u64 },
    ConnOffline { client_id: u64 },
    Heartbeat,
    DialogueOnline { dialogue_id: u64, meta: Vec<u8> },
    DialogueOffline { dialogue_id: u64 },
}

/// Delegate that records every callback and optionally resolves or
/// rejects client identity.
#[derive(Default)]
pub struct RecordingDelegate {
    events: Mutex<Vec<DelegateEvent>>,
    notify: Notify,
    client_id: Option<u64>,
    reject: Option<String>,
}

impl RecordingDelegate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Server-side delegate resolving every peer to `client_id`.
    pub fn resolving(client_id: u64) -> Arc<Self> {
        Arc::new(Self {
            client_id: Some(client_id),
            ..Self::default()
        })
    }

    /// Server-side delegate rejecting every handshake with `reason`.
    pub fn rejecting(reason: &str) -> Arc<Self> {
        Arc::new(Self {
            reject: Some(reason.to_string()),
            ..Self::default()
        })
    }

    pub fn events(&self) -> Vec<DelegateEvent> {
        self.events.lock().clone()
    }

    /// Wait until the recorded events satisfy `pred`. Callers wrap this in
    /// `tokio::time::timeout`.
    pub async fn wait_for(&self, mut pred: impl FnMut(&[DelegateEvent]) -> bool) {
        loop {
            let notified = self.notify.notified();
            if pred(&self.events.lock()) {
                return;
            }
            notified.await;
        }
    }

    fn record(&self, event: DelegateEvent) {
        self.events.lock().push(event);
        self.notify.notify_waiters();
    }
}

impl Delegate for RecordingDelegate {
    fn conn_online(&self, descr: &ConnDescriptor) -> Result<(), Error> {
        self.record(DelegateEvent::ConnOnline {
            client_id: descr.client_id,
        });
        Ok(())
    }

    fn conn_offline(&self, descr: &ConnDescriptor) -> Result<(), Error> {
        self.record(DelegateEvent::ConnOffline {
            client_id: descr.client_id,
        });
        Ok(())
    }

    fn heartbeat(&self, _descr: &ConnDescriptor) -> Result<(), Error> {
        self.record(DelegateEvent::Heartbeat);
        Ok(())
    }

    fn get_client_id(&self, _meta: &[u8]) -> Result<u64, Error> {
        if let Some(reason) = &self.reject {
            return Err(Error::Remote(reason.clone()));
        }
        Ok(self.client_id.unwrap_or(0))
    }

    fn dialogue_online(&self, descr: &DialogueDescriptor) -> Result<(), Error> {
        self.record(DelegateEvent::DialogueOnline {
            dialogue_id: descr.dialogue_id,
            meta: descr.meta.clone(),
        });
        Ok(())
    }

    fn dialogue_offline(&self, descr: &DialogueDescriptor) -> Result<(), Error> {
        self.record(DelegateEvent::DialogueOffline {
            dialogue_id: descr.dialogue_id,
        });
        Ok(())
    }
}
