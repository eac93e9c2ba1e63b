//! Connection layer: owns the byte stream and every dialogue on it.
//!
//! One connection runs three tasks:
//! - a read pump, the only reader of the transport: decodes one packet at
//!   a time and routes it by type and dialogue-id,
//! - a write pump, the only writer: drains one bounded outbound queue so
//!   writes are serialized,
//! - on the dialer side, a heartbeat pump.
//!
//! Teardown cascades: whichever pump dies first flips the closed flag,
//! wakes the others, finishes every dialogue, and cancels every pending
//! wait. Teardown is idempotent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};

use palaver_core::packet::{
    ConnAckPacket, ConnPacket, DismissPacket, HeartbeatPacket, Packet, PacketFactory,
    SessionAckPacket, SessionFlags, SessionPacket,
};
use palaver_core::{
    ConnDescriptor, Delegate, Error, Side, StateMachine, SyncHub, DEFAULT_WAIT_TIMEOUT,
};

use crate::dialogue::{Dialogue, DialogueContext, DialogueState};
use crate::options::{ConnectionOptions, DialogueOptions};
use crate::{stream, QUEUE_CAPACITY};

/// Consecutive heartbeat-ack misses that terminate the connection.
const HEARTBEAT_MISS_LIMIT: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ConnState {
    Init,
    ConnSent,
    ConnRecv,
    Connected,
    DismissSent,
    DismissRecv,
    Dismissed,
    Fini,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ConnEvent {
    ConnSent,
    ConnRecv,
    ConnAck,
    DismissSent,
    DismissRecv,
    DismissAck,
    Error,
    Eof,
    Fini,
}

fn conn_fsm() -> StateMachine<ConnState, ConnEvent> {
    use ConnEvent as E;
    use ConnState as S;

    let mut fsm = StateMachine::new(S::Init);
    fsm.transition(S::Init, E::ConnSent, S::ConnSent)
        .transition(S::Init, E::ConnRecv, S::ConnRecv)
        .transition(S::ConnSent, E::ConnAck, S::Connected)
        .transition(S::ConnRecv, E::ConnAck, S::Connected)
        .transition(S::Connected, E::DismissSent, S::DismissSent)
        .transition(S::Connected, E::DismissRecv, S::DismissRecv)
        .transition(S::DismissSent, E::DismissAck, S::Dismissed)
        .transition(S::DismissRecv, E::DismissAck, S::Dismissed)
        .transition_from_any(E::Fini, S::Fini);
    for live in [S::ConnSent, S::ConnRecv, S::Connected] {
        fsm.transition(live, E::Error, S::Dismissed)
            .transition(live, E::Eof, S::Dismissed);
    }
    fsm
}

/// The connection's dialogue routing table.
///
/// Active opens wait in `negotiating` under their negotiate-id until the
/// peer's ack fixes the authoritative session-id; everything established
/// lives in `established` under the dialogue-id. Writers are open/close;
/// the reader is the connection read pump.
pub(crate) struct DialogueMap {
    negotiating: RwLock<HashMap<u64, Dialogue>>,
    established: RwLock<HashMap<u64, Dialogue>>,
}

impl DialogueMap {
    fn new() -> Self {
        Self {
            negotiating: RwLock::new(HashMap::new()),
            established: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn get(&self, dialogue_id: u64) -> Option<Dialogue> {
        self.established.read().get(&dialogue_id).cloned()
    }

    fn get_negotiating(&self, negotiate_id: u64) -> Option<Dialogue> {
        self.negotiating.read().get(&negotiate_id).cloned()
    }

    fn insert_negotiating(&self, negotiate_id: u64, dialogue: Dialogue) {
        self.negotiating.write().insert(negotiate_id, dialogue);
    }

    fn insert_established(&self, dialogue_id: u64, dialogue: Dialogue) {
        self.established.write().insert(dialogue_id, dialogue);
    }

    /// Open negotiation done: move the dialogue under its authoritative
    /// session-id.
    fn promote(&self, negotiate_id: u64, session_id: u64) {
        let dialogue = self.negotiating.write().remove(&negotiate_id);
        if let Some(dialogue) = dialogue {
            dialogue.set_map_key(session_id);
            self.established.write().insert(session_id, dialogue);
        }
    }

    /// True if either table holds `id`: resumes must not collide with an
    /// established dialogue or an in-flight open's negotiate-id.
    fn contains(&self, id: u64) -> bool {
        self.established.read().contains_key(&id) || self.negotiating.read().contains_key(&id)
    }

    /// Drop every key a finished dialogue may be registered under.
    pub(crate) fn forget(&self, negotiate_id: u64, dialogue_key: u64) {
        self.negotiating.write().remove(&negotiate_id);
        if dialogue_key != 0 {
            self.established.write().remove(&dialogue_key);
        }
    }

    fn drain(&self) -> Vec<Dialogue> {
        let mut all: Vec<Dialogue> = self
            .negotiating
            .write()
            .drain()
            .map(|(_, d)| d)
            .collect();
        all.extend(self.established.write().drain().map(|(_, d)| d));
        all
    }

    pub(crate) fn len(&self) -> usize {
        self.negotiating.read().len() + self.established.read().len()
    }
}

pub(crate) struct ConnCore {
    side: Side,
    options: ConnectionOptions,
    client_id: AtomicU64,
    /// Local meta on the dialer; replaced by the peer's meta on the
    /// acceptor once the handshake arrives.
    meta: Mutex<Vec<u8>>,
    factory: PacketFactory,
    synchub: SyncHub,
    fsm: Mutex<StateMachine<ConnState, ConnEvent>>,
    dialogues: Arc<DialogueMap>,
    outbound: RwLock<Option<mpsc::Sender<Packet>>>,
    accepted_tx: RwLock<Option<mpsc::Sender<Dialogue>>>,
    accepted_rx: tokio::sync::Mutex<mpsc::Receiver<Dialogue>>,
    delegate: Arc<dyn Delegate>,
    /// Acceptor-side: wakes `accept` once the handshake resolves.
    handshake_tx: Mutex<Option<oneshot::Sender<Result<(), Error>>>>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    close_reason: Mutex<Option<Arc<Error>>>,
}

/// One end of a connection. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    core: Arc<ConnCore>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("side", &self.core.side)
            .field("client_id", &self.client_id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Dial: run the client half of the handshake over `stream` and return
    /// the established connection. Heartbeats start once the handshake
    /// completes.
    pub async fn dial<S>(
        stream: S,
        options: ConnectionOptions,
        delegate: Arc<dyn Delegate>,
    ) -> Result<Connection, Error>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let conn = Connection::start(stream, Side::Client, options, delegate);
        match conn.handshake_dial().await {
            Ok(()) => {
                tokio::spawn(heartbeat_pump(conn.core.clone()));
                Ok(conn)
            }
            Err(e) => {
                conn.core.teardown(None).await;
                Err(e)
            }
        }
    }

    /// Accept: wait for the dialer's handshake over `stream`, resolve the
    /// client-id through the delegate, and return the established
    /// connection.
    pub async fn accept<S>(
        stream: S,
        options: ConnectionOptions,
        delegate: Arc<dyn Delegate>,
    ) -> Result<Connection, Error>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let timeout = options.handshake_timeout;
        let (tx, rx) = oneshot::channel();
        let conn = Connection::start_with(stream, Side::Server, options, delegate, Some(tx));

        let outcome = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            // sender dropped: torn down before the handshake resolved
            Ok(Err(_)) => Err(Error::MultiplexerClosed),
            Err(_) => Err(Error::Timeout),
        };
        match outcome {
            Ok(()) => Ok(conn),
            Err(e) => {
                conn.core.teardown(None).await;
                Err(e)
            }
        }
    }

    fn start<S>(
        stream: S,
        side: Side,
        options: ConnectionOptions,
        delegate: Arc<dyn Delegate>,
    ) -> Connection
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::start_with(stream, side, options, delegate, None)
    }

    fn start_with<S>(
        stream: S,
        side: Side,
        options: ConnectionOptions,
        delegate: Arc<dyn Delegate>,
        handshake_tx: Option<oneshot::Sender<Result<(), Error>>>,
    ) -> Connection
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (outbound_tx, outbound_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (accepted_tx, accepted_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (shutdown, _) = watch::channel(false);

        let core = Arc::new(ConnCore {
            side,
            client_id: AtomicU64::new(options.client_id.unwrap_or(0)),
            meta: Mutex::new(options.meta.clone()),
            factory: PacketFactory::new(side.parity()),
            synchub: SyncHub::new(),
            fsm: Mutex::new(conn_fsm()),
            dialogues: Arc::new(DialogueMap::new()),
            outbound: RwLock::new(Some(outbound_tx)),
            accepted_tx: RwLock::new(Some(accepted_tx)),
            accepted_rx: tokio::sync::Mutex::new(accepted_rx),
            delegate,
            handshake_tx: Mutex::new(handshake_tx),
            closed: AtomicBool::new(false),
            shutdown,
            close_reason: Mutex::new(None),
            options,
        });

        tokio::spawn(read_pump(core.clone(), Box::new(reader)));
        tokio::spawn(write_pump(core.clone(), Box::new(writer), outbound_rx));

        Connection { core }
    }

    async fn handshake_dial(&self) -> Result<(), Error> {
        let core = &self.core;
        let conn = core.factory.new_conn(
            core.options.client_id.unwrap_or(0),
            core.options.meta.clone(),
        );
        let packet_id = conn.header.packet_id;

        let _ = core.fsm.lock().emit(ConnEvent::ConnSent);
        let handle = core
            .synchub
            .register(packet_id, core.options.handshake_timeout);
        core.send(Packet::Conn(conn)).await?;
        handle.wait().await?;

        if let Err(e) = core.delegate.conn_online(&core.descriptor()) {
            tracing::warn!(error = %e, "conn_online delegate failed");
        }
        tracing::debug!(client_id = self.client_id(), "connection established");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Dialogue surface
    // ------------------------------------------------------------------

    /// Open a dialogue towards the peer and wait (up to 30 s) for it to
    /// come online.
    pub async fn open_dialogue(&self, meta: Vec<u8>) -> Result<Dialogue, Error> {
        self.open_dialogue_with(DialogueOptions {
            meta,
            ..DialogueOptions::default()
        })
        .await
    }

    /// [`open_dialogue`](Self::open_dialogue) with explicit options.
    pub async fn open_dialogue_with(&self, opts: DialogueOptions) -> Result<Dialogue, Error> {
        let core = &self.core;
        if core.closed.load(Ordering::SeqCst)
            || !core.fsm.lock().in_state(ConnState::Connected)
        {
            return Err(Error::MultiplexerClosed);
        }

        if let Some(initial) = opts.initial_state {
            return self.resume_dialogue(opts, initial);
        }

        let flags = SessionFlags {
            priority: 0,
            qos: 0,
            session_id_acquire: opts.peer_assigns_id,
        };
        let mut sess = core.factory.new_session(flags, opts.meta.clone());
        if let Some(negotiating_id) = opts.negotiating_id {
            sess.header.packet_id = negotiating_id;
            sess.negotiate_id = negotiating_id;
        }
        let negotiate_id = sess.negotiate_id;

        let dialogue = Dialogue::spawn_active(core.dialogue_ctx(false)?, negotiate_id, opts.meta);
        core.dialogues
            .insert_negotiating(negotiate_id, dialogue.clone());

        let handle = dialogue
            .synchub()
            .register(negotiate_id, DEFAULT_WAIT_TIMEOUT);
        let _ = dialogue.emit(crate::dialogue::DialogueEvent::SessionSent);
        if let Err(e) = dialogue.send_ctrl(Packet::Session(sess)).await {
            dialogue.fini();
            return Err(e);
        }
        match handle.wait().await {
            Ok(()) => {
                tracing::debug!(
                    dialogue_id = dialogue.dialogue_id(),
                    negotiate_id,
                    "dialogue opened"
                );
                Ok(dialogue)
            }
            Err(e) => {
                dialogue.fini();
                Err(e)
            }
        }
    }

    /// Bring up a dialogue without negotiation. Both sides must create it
    /// with the same id and the same initial state; only `Sessioned`
    /// resumption is meaningful.
    fn resume_dialogue(
        &self,
        opts: DialogueOptions,
        initial: DialogueState,
    ) -> Result<Dialogue, Error> {
        if initial != DialogueState::Sessioned {
            return Err(Error::InvalidTransition {
                state: format!("{initial:?}"),
                event: "Resume".to_string(),
            });
        }
        let core = &self.core;
        let dialogue_id = opts
            .negotiating_id
            .unwrap_or_else(|| core.factory.packet_id());
        if core.dialogues.contains(dialogue_id) {
            return Err(Error::DialogueIdConflict(dialogue_id));
        }
        let dialogue = Dialogue::spawn_resumed(core.dialogue_ctx(false)?, dialogue_id, opts.meta);
        core.dialogues
            .insert_established(dialogue_id, dialogue.clone());
        tracing::debug!(dialogue_id, "dialogue resumed");
        Ok(dialogue)
    }

    /// Receive the next dialogue the peer opened towards us.
    pub async fn accept_dialogue(&self) -> Result<Dialogue, Error> {
        let mut rx = self.core.accepted_rx.lock().await;
        rx.recv().await.ok_or(Error::MultiplexerClosed)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Graceful close: a best-effort connection-scope dismiss exchange,
    /// then idempotent teardown of every dialogue and pump.
    pub async fn close(&self) -> Result<(), Error> {
        let core = &self.core;
        if core.closed.load(Ordering::SeqCst) {
            return Ok(());
        }

        if core.fsm.lock().emit(ConnEvent::DismissSent).is_ok() {
            let dismiss = core.factory.new_dismiss(0);
            let handle = core
                .synchub
                .register(dismiss.header.packet_id, DEFAULT_WAIT_TIMEOUT);
            if core.send(Packet::Dismiss(dismiss)).await.is_ok() {
                match handle.wait().await {
                    Ok(()) => {
                        let _ = core.fsm.lock().emit(ConnEvent::DismissAck);
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "connection dismiss ack not received");
                    }
                }
            }
        }
        core.teardown(None).await;
        Ok(())
    }

    pub fn client_id(&self) -> u64 {
        self.core.client_id.load(Ordering::SeqCst)
    }

    pub fn side(&self) -> Side {
        self.core.side
    }

    pub fn meta(&self) -> Vec<u8> {
        self.core.meta.lock().clone()
    }

    pub fn descriptor(&self) -> ConnDescriptor {
        self.core.descriptor()
    }

    pub fn is_closed(&self) -> bool {
        self.core.closed.load(Ordering::SeqCst)
    }

    /// Why the connection went down, when teardown carried a reason.
    pub fn close_reason(&self) -> Option<Arc<Error>> {
        self.core.close_reason.lock().clone()
    }

    /// Resolves once teardown ran.
    pub async fn wait_closed(&self) {
        let mut rx = self.core.shutdown.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Number of live dialogues.
    pub fn dialogue_count(&self) -> usize {
        self.core.dialogues.len()
    }
}

impl ConnCore {
    fn descriptor(&self) -> ConnDescriptor {
        ConnDescriptor {
            client_id: self.client_id.load(Ordering::SeqCst),
            meta: self.meta.lock().clone(),
            side: self.side,
            local_addr: self.options.local_addr,
            remote_addr: self.options.remote_addr,
        }
    }

    async fn send(&self, pkt: Packet) -> Result<(), Error> {
        let tx = self
            .outbound
            .read()
            .clone()
            .ok_or(Error::MultiplexerClosed)?;
        tx.send(pkt).await.map_err(|_| Error::MultiplexerClosed)
    }

    fn dialogue_ctx(&self, accepted: bool) -> Result<DialogueContext, Error> {
        let outbound = self
            .outbound
            .read()
            .clone()
            .ok_or(Error::MultiplexerClosed)?;
        Ok(DialogueContext {
            side: self.side,
            client_id: self.client_id.load(Ordering::SeqCst),
            factory: self.factory.clone(),
            delegate: self.delegate.clone(),
            outbound,
            registry: Arc::downgrade(&self.dialogues),
            accepted: if accepted {
                self.accepted_tx.read().clone()
            } else {
                None
            },
        })
    }

    // ------------------------------------------------------------------
    // Inbound dispatch
    // ------------------------------------------------------------------

    async fn dispatch(&self, pkt: Packet) -> Result<(), Error> {
        match pkt {
            Packet::Conn(conn) => self.handle_conn(conn).await,
            Packet::ConnAck(ack) => {
                self.handle_conn_ack(ack);
                Ok(())
            }
            Packet::Heartbeat(hb) => self.handle_heartbeat(hb).await,
            Packet::HeartbeatAck(hb) => {
                self.synchub.ack(hb.header.packet_id, Ok(()));
                Ok(())
            }
            Packet::Session(sess) => self.handle_session(sess).await,
            Packet::SessionAck(ack) => self.handle_session_ack(ack).await,
            Packet::Dismiss(dismiss) if dismiss.session_id == 0 => {
                self.handle_conn_dismiss(dismiss).await
            }
            Packet::DismissAck(ack) if ack.session_id == 0 => {
                self.synchub.ack(ack.header.packet_id, Ok(()));
                Ok(())
            }
            Packet::Dismiss(dismiss) => {
                let id = dismiss.session_id;
                self.route(id, Packet::Dismiss(dismiss)).await
            }
            Packet::DismissAck(ack) => {
                let id = ack.session_id;
                self.route(id, Packet::DismissAck(ack)).await
            }
            Packet::Application(app) => {
                let id = app.session_id;
                self.route(id, Packet::Application(app)).await
            }
        }
    }

    async fn route(&self, dialogue_id: u64, pkt: Packet) -> Result<(), Error> {
        match self.dialogues.get(dialogue_id) {
            Some(dialogue) => {
                if dialogue.deliver(pkt).await.is_err() {
                    tracing::debug!(dialogue_id, "packet for finished dialogue dropped");
                }
            }
            None => {
                let e = Error::UnknownDialogue(dialogue_id);
                tracing::warn!(dialogue_id, typ = ?pkt.typ(), "{e}, packet dropped");
            }
        }
        Ok(())
    }

    /// Acceptor half of the handshake.
    async fn handle_conn(&self, conn: ConnPacket) -> Result<(), Error> {
        if self.side != Side::Server {
            tracing::warn!("conn packet on the dialing side, dropped");
            return Ok(());
        }
        let _ = self.fsm.lock().emit(ConnEvent::ConnRecv);
        *self.meta.lock() = conn.data.meta.clone();

        match self.delegate.get_client_id(&conn.data.meta) {
            Ok(resolved) => {
                let client_id = match resolved {
                    0 => self.options.client_id.unwrap_or(conn.client_id),
                    id => id,
                };
                self.client_id.store(client_id, Ordering::SeqCst);
                let ack =
                    self.factory
                        .new_conn_ack(conn.header.packet_id, client_id, String::new());
                self.send(Packet::ConnAck(ack)).await?;
                let _ = self.fsm.lock().emit(ConnEvent::ConnAck);
                if let Err(e) = self.delegate.conn_online(&self.descriptor()) {
                    tracing::warn!(error = %e, "conn_online delegate failed");
                }
                self.finish_handshake(Ok(()));
                tracing::debug!(client_id, "connection accepted");
                Ok(())
            }
            Err(e) => {
                // carry the bare reason, not our Display prefix
                let reason = match e {
                    Error::Remote(msg) | Error::HandshakeRejected(msg) => msg,
                    other => other.to_string(),
                };
                let ack =
                    self.factory
                        .new_conn_ack(conn.header.packet_id, 0, reason.clone());
                let _ = self.send(Packet::ConnAck(ack)).await;
                self.finish_handshake(Err(Error::HandshakeRejected(reason.clone())));
                self.teardown(Some(Error::HandshakeRejected(reason))).await;
                Ok(())
            }
        }
    }

    /// Dialer half of the handshake.
    fn handle_conn_ack(&self, ack: ConnAckPacket) {
        if self.side != Side::Client {
            tracing::warn!("conn ack on the accepting side, dropped");
            return;
        }
        if !ack.data.error.is_empty() {
            self.synchub.ack(
                ack.header.packet_id,
                Err(Error::HandshakeRejected(ack.data.error)),
            );
            return;
        }
        self.client_id.store(ack.client_id, Ordering::SeqCst);
        let _ = self.fsm.lock().emit(ConnEvent::ConnAck);
        self.synchub.ack(ack.header.packet_id, Ok(()));
    }

    async fn handle_heartbeat(&self, hb: HeartbeatPacket) -> Result<(), Error> {
        if let Err(e) = self.delegate.heartbeat(&self.descriptor()) {
            tracing::warn!(error = %e, "heartbeat delegate failed");
        }
        let ack = self.factory.new_heartbeat_ack(hb.header.packet_id);
        self.send(Packet::HeartbeatAck(ack)).await
    }

    /// Passive open: decide the dialogue-id and bring up a dialogue for
    /// the peer's `Session`.
    async fn handle_session(&self, sess: SessionPacket) -> Result<(), Error> {
        let dialogue_id = if sess.flags.session_id_acquire {
            // one allocator feeds packet-ids and assigned dialogue-ids, so
            // ids of this side never repeat
            self.factory.packet_id()
        } else {
            sess.negotiate_id
        };

        if let Some(existing) = self.dialogues.get(dialogue_id) {
            // duplicate open: the dialogue's own FSM rejects it
            if existing.deliver(Packet::Session(sess)).await.is_err() {
                tracing::debug!(dialogue_id, "session for finished dialogue dropped");
            }
            return Ok(());
        }

        let dialogue = Dialogue::spawn_passive(self.dialogue_ctx(true)?, dialogue_id, &sess);
        self.dialogues.insert_established(dialogue_id, dialogue.clone());
        tracing::debug!(
            dialogue_id,
            negotiate_id = sess.negotiate_id,
            "passive dialogue created"
        );
        if dialogue.deliver(Packet::Session(sess)).await.is_err() {
            tracing::debug!(dialogue_id, "session for finished dialogue dropped");
        }
        Ok(())
    }

    /// Active open completing: adopt the authoritative session-id before
    /// the dialogue sees the ack.
    async fn handle_session_ack(&self, ack: SessionAckPacket) -> Result<(), Error> {
        match self.dialogues.get_negotiating(ack.negotiate_id) {
            Some(dialogue) => {
                if ack.data.error.is_empty() {
                    self.dialogues.promote(ack.negotiate_id, ack.session_id);
                }
                if dialogue.deliver(Packet::SessionAck(ack)).await.is_err() {
                    tracing::debug!("session ack for finished dialogue dropped");
                }
            }
            None => {
                tracing::warn!(
                    negotiate_id = ack.negotiate_id,
                    "session ack without pending dialogue, dropped"
                );
            }
        }
        Ok(())
    }

    /// Connection-scope dismiss: acknowledge so the peer can finish, then
    /// tear down our side.
    async fn handle_conn_dismiss(&self, dismiss: DismissPacket) -> Result<(), Error> {
        let ack = self.factory.new_dismiss_ack(&dismiss, String::new());
        {
            let mut fsm = self.fsm.lock();
            if !matches!(fsm.current(), ConnState::DismissSent | ConnState::Dismissed) {
                let _ = fsm.emit(ConnEvent::DismissRecv);
            }
        }
        let _ = self.send(Packet::DismissAck(ack)).await;
        let _ = self.fsm.lock().emit(ConnEvent::DismissAck);
        self.teardown(None).await;
        Ok(())
    }

    fn finish_handshake(&self, result: Result<(), Error>) {
        if let Some(tx) = self.handshake_tx.lock().take() {
            let _ = tx.send(result);
        }
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Idempotent teardown: stop the pumps, finish every dialogue, cancel
    /// every pending wait, notify the delegate.
    async fn teardown(&self, reason: Option<Error>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(reason) = reason {
            tracing::debug!(side = ?self.side, error = %reason, "connection teardown");
            let _ = self.fsm.lock().emit(ConnEvent::Error);
            *self.close_reason.lock() = Some(Arc::new(reason));
        } else {
            tracing::debug!(side = ?self.side, "connection teardown");
        }

        // the write pump drains what is queued, then exits once the last
        // sender (ours or a dialogue's) is gone
        drop(self.outbound.write().take());
        drop(self.accepted_tx.write().take());

        for dialogue in self.dialogues.drain() {
            dialogue.fini();
        }
        self.synchub.cancel_all();
        self.finish_handshake(Err(Error::MultiplexerClosed));
        let _ = self.fsm.lock().emit(ConnEvent::Fini);
        if let Err(e) = self.delegate.conn_offline(&self.descriptor()) {
            tracing::warn!(error = %e, "conn_offline delegate failed");
        }
        // signalled last: observers of wait_closed see the cascade done
        self.shutdown.send_replace(true);
    }
}


// ----------------------------------------------------------------------
// Pumps
// ----------------------------------------------------------------------

async fn read_pump(core: Arc<ConnCore>, mut reader: Box<dyn AsyncRead + Send + Unpin>) {
    let mut shutdown = core.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            res = stream::read_frame(&mut reader) => match res {
                Ok((header, payload)) => {
                    // a payload failing its typed decode is local to this
                    // packet: the length framing already consumed it
                    let pkt = match Packet::decode(header, &payload) {
                        Ok(pkt) => pkt,
                        Err(e) => {
                            tracing::warn!(
                                typ = ?header.typ,
                                packet_id = header.packet_id,
                                error = %e,
                                "undecodable payload dropped"
                            );
                            continue;
                        }
                    };
                    tracing::trace!(typ = ?pkt.typ(), packet_id = pkt.packet_id(), "packet in");
                    if let Err(e) = core.dispatch(pkt).await {
                        if e.is_connection_fatal() {
                            core.teardown(Some(e)).await;
                            break;
                        }
                        tracing::debug!(error = %e, "dispatch failed, packet dropped");
                    }
                }
                Err(e) => {
                    core.teardown(Some(e)).await;
                    break;
                }
            }
        }
    }
}

async fn write_pump(
    core: Arc<ConnCore>,
    mut writer: Box<dyn AsyncWrite + Send + Unpin>,
    mut outbound: mpsc::Receiver<Packet>,
) {
    while let Some(pkt) = outbound.recv().await {
        tracing::trace!(typ = ?pkt.typ(), packet_id = pkt.packet_id(), "packet out");
        if let Err(e) = stream::write_packet(&mut writer, &pkt).await {
            core.teardown(Some(e)).await;
            break;
        }
    }
    let _ = tokio::io::AsyncWriteExt::shutdown(&mut writer).await;
}

/// Dialer-side liveness: one heartbeat per interval, terminated after two
/// consecutive unacknowledged rounds.
async fn heartbeat_pump(core: Arc<ConnCore>) {
    let period = core.options.heartbeat_interval;
    let mut shutdown = core.shutdown.subscribe();
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut missed = 0u32;

    loop {
        if missed == 0 {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = interval.tick() => {}
            }
        }

        let hb = core.factory.new_heartbeat();
        let handle = core.synchub.register(hb.header.packet_id, period);
        if core.send(Packet::Heartbeat(hb)).await.is_err() {
            return;
        }
        match handle.wait().await {
            Ok(()) => missed = 0,
            Err(Error::Timeout) => {
                missed += 1;
                tracing::warn!(missed, "heartbeat ack missed");
                if missed >= HEARTBEAT_MISS_LIMIT {
                    core.teardown(Some(Error::HeartbeatTimeout)).await;
                    return;
                }
            }
            // cancelled: teardown already running
            Err(_) => return,
        }
    }
}
