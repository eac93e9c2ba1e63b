//! Dialogue layer: one logical, full-duplex conversation multiplexed over
//! a connection.
//!
//! A dialogue owns its FSM, its sync hub, and four bounded queues:
//!
//! ```text
//!  connection ──read-in──▶ read pump ──read-out──▶ application
//!  application ──write-in──▶ write pump ──▶ connection outbound
//!  FSM ──write-ctrl──▶ write pump (drained preferentially)
//! ```
//!
//! The queue senders live behind an `RwLock<Option<..>>`: writers take the
//! read lock, check the slot is still occupied, clone and send; teardown
//! takes the write lock and empties the slot exactly once. That is what
//! lets both pumps, the application, and the connection race against
//! teardown without ever touching a dead queue.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use palaver_core::packet::{
    AppPacket, Packet, PacketFactory, PacketType, SessionAckPacket, SessionPacket,
};
use palaver_core::{
    Delegate, DialogueDescriptor, Error, Side, StateMachine, SyncHub, DEFAULT_WAIT_TIMEOUT,
};

use crate::connection::DialogueMap;
use crate::QUEUE_CAPACITY;

/// Lifecycle states of one dialogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DialogueState {
    Init,
    SessionSent,
    SessionRecv,
    Sessioned,
    DismissSent,
    DismissRecv,
    Dismissed,
    Fini,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum DialogueEvent {
    SessionSent,
    SessionRecv,
    SessionAck,
    DismissSent,
    DismissRecv,
    DismissAck,
    Error,
    Eof,
    Fini,
}

fn dialogue_fsm(initial: DialogueState) -> StateMachine<DialogueState, DialogueEvent> {
    use DialogueEvent as E;
    use DialogueState as S;

    let mut fsm = StateMachine::new(initial);
    fsm.transition(S::Init, E::SessionSent, S::SessionSent)
        .transition(S::Init, E::SessionRecv, S::SessionRecv)
        .transition(S::SessionSent, E::SessionAck, S::Sessioned)
        .transition(S::SessionRecv, E::SessionAck, S::Sessioned)
        .transition(S::Sessioned, E::DismissSent, S::DismissSent)
        .transition(S::Sessioned, E::DismissRecv, S::DismissRecv)
        .transition(S::DismissSent, E::DismissAck, S::Dismissed)
        .transition(S::DismissRecv, E::DismissAck, S::Dismissed)
        .transition_from_any(E::Fini, S::Fini);
    for live in [S::SessionSent, S::SessionRecv, S::Sessioned] {
        fsm.transition(live, E::Error, S::Dismissed)
            .transition(live, E::Eof, S::Dismissed);
    }
    fsm
}

/// Everything a dialogue borrows from its connection.
pub(crate) struct DialogueContext {
    pub side: Side,
    pub client_id: u64,
    pub factory: PacketFactory,
    pub delegate: Arc<dyn Delegate>,
    pub outbound: mpsc::Sender<Packet>,
    pub registry: Weak<DialogueMap>,
    /// Where passively-opened dialogues report for `accept_dialogue`.
    pub accepted: Option<mpsc::Sender<Dialogue>>,
}

struct DialogueChannels {
    read_in_tx: mpsc::Sender<Packet>,
    read_out_tx: mpsc::Sender<AppPacket>,
    write_in_tx: mpsc::Sender<AppPacket>,
    write_ctrl_tx: mpsc::Sender<Packet>,
    outbound: mpsc::Sender<Packet>,
}

pub(crate) struct DialogueInner {
    negotiate_id: u64,
    dialogue_id: AtomicU64,
    /// Dialogue-id under which the connection's established table holds
    /// this dialogue; 0 while the open is still negotiating.
    map_key: AtomicU64,
    client_id: u64,
    side: Side,
    meta: Vec<u8>,
    fsm: Mutex<StateMachine<DialogueState, DialogueEvent>>,
    synchub: SyncHub,
    factory: PacketFactory,
    delegate: Arc<dyn Delegate>,
    registry: Weak<DialogueMap>,
    accepted: Option<mpsc::Sender<Dialogue>>,
    channels: RwLock<Option<DialogueChannels>>,
    read_out_rx: tokio::sync::Mutex<mpsc::Receiver<AppPacket>>,
    online: AtomicBool,
    finished: AtomicBool,
}

/// Handle to one dialogue. Cheap to clone; all clones observe the same
/// lifecycle and a closed dialogue cannot be resurrected.
#[derive(Clone)]
pub struct Dialogue {
    inner: Arc<DialogueInner>,
}

impl std::fmt::Debug for Dialogue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialogue")
            .field("dialogue_id", &self.dialogue_id())
            .field("side", &self.side())
            .field("state", &self.state())
            .finish()
    }
}

impl Dialogue {
    fn spawn(
        ctx: DialogueContext,
        negotiate_id: u64,
        dialogue_id: u64,
        map_key: u64,
        meta: Vec<u8>,
        initial_state: DialogueState,
    ) -> Dialogue {
        let (read_in_tx, read_in_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (read_out_tx, read_out_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (write_in_tx, write_in_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (write_ctrl_tx, write_ctrl_rx) = mpsc::channel(QUEUE_CAPACITY);

        let inner = Arc::new(DialogueInner {
            negotiate_id,
            dialogue_id: AtomicU64::new(dialogue_id),
            map_key: AtomicU64::new(map_key),
            client_id: ctx.client_id,
            side: ctx.side,
            meta,
            fsm: Mutex::new(dialogue_fsm(initial_state)),
            synchub: SyncHub::new(),
            factory: ctx.factory,
            delegate: ctx.delegate,
            registry: ctx.registry,
            accepted: ctx.accepted,
            channels: RwLock::new(Some(DialogueChannels {
                read_in_tx,
                read_out_tx,
                write_in_tx,
                write_ctrl_tx,
                outbound: ctx.outbound,
            })),
            read_out_rx: tokio::sync::Mutex::new(read_out_rx),
            online: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        });

        tokio::spawn(read_pump(inner.clone(), read_in_rx));
        tokio::spawn(write_pump(inner.clone(), write_ctrl_rx, write_in_rx));

        Dialogue { inner }
    }

    /// Locally-initiated open. The dialogue-id stays unknown until the
    /// peer's ack adopts the authoritative session-id.
    pub(crate) fn spawn_active(ctx: DialogueContext, negotiate_id: u64, meta: Vec<u8>) -> Dialogue {
        Self::spawn(ctx, negotiate_id, 0, 0, meta, DialogueState::Init)
    }

    /// Remotely-initiated open: the connection has already decided the
    /// dialogue-id; the `Session` packet itself is delivered afterwards.
    pub(crate) fn spawn_passive(
        ctx: DialogueContext,
        dialogue_id: u64,
        sess: &SessionPacket,
    ) -> Dialogue {
        Self::spawn(
            ctx,
            sess.negotiate_id,
            dialogue_id,
            dialogue_id,
            sess.data.meta.clone(),
            DialogueState::Init,
        )
    }

    /// Resume a dialogue both sides already agreed on out of band: no
    /// Session/SessionAck exchange, the dialogue starts sessioned.
    pub(crate) fn spawn_resumed(
        ctx: DialogueContext,
        dialogue_id: u64,
        meta: Vec<u8>,
    ) -> Dialogue {
        let dialogue = Self::spawn(
            ctx,
            dialogue_id,
            dialogue_id,
            dialogue_id,
            meta,
            DialogueState::Sessioned,
        );
        dialogue.inner.online();
        dialogue
    }

    // ------------------------------------------------------------------
    // Application-facing surface
    // ------------------------------------------------------------------

    /// Receive the next application packet.
    ///
    /// Returns [`Error::DialogueClosed`] once the dialogue reached its
    /// terminal state and the queue drained: that is the end-of-stream.
    pub async fn read(&self) -> Result<AppPacket, Error> {
        let mut rx = self.inner.read_out_rx.lock().await;
        rx.recv().await.ok_or(Error::DialogueClosed)
    }

    /// Queue one application packet for the peer. Blocks when 128 packets
    /// are already in flight.
    pub async fn write(&self, mut pkt: AppPacket) -> Result<(), Error> {
        if !self.inner.fsm.lock().in_state(DialogueState::Sessioned) {
            return Err(Error::DialogueClosed);
        }
        pkt.session_id = self.dialogue_id();
        let tx = self
            .inner
            .channel(|c| c.write_in_tx.clone())
            .ok_or(Error::DialogueClosed)?;
        tx.send(pkt).await.map_err(|_| Error::DialogueClosed)
    }

    /// Build an application packet addressed to this dialogue.
    pub fn app_packet(&self, typ: PacketType, data: Bytes) -> AppPacket {
        self.inner
            .factory
            .new_application(typ, self.dialogue_id(), data)
    }

    /// Negotiated close: send `Dismiss`, wait for the ack (up to 30 s),
    /// then finish. Safe to call repeatedly and from either side at once.
    pub async fn close(&self) -> Result<(), Error> {
        let inner = &self.inner;
        if inner.finished.load(Ordering::SeqCst) {
            return Ok(());
        }
        if inner.emit(DialogueEvent::DismissSent).is_err() {
            // never sessioned, or the peer is already dismissing: nothing
            // to negotiate
            inner.fini();
            return Ok(());
        }

        let dismiss = inner.factory.new_dismiss(self.dialogue_id());
        let handle = inner
            .synchub
            .register(dismiss.header.packet_id, DEFAULT_WAIT_TIMEOUT);
        if let Err(e) = inner.send_ctrl(Packet::Dismiss(dismiss)).await {
            inner.fini();
            return Err(e);
        }
        match handle.wait().await {
            Ok(()) => {}
            Err(Error::Timeout) => {
                tracing::warn!(dialogue_id = self.dialogue_id(), "dismiss ack timed out");
            }
            // cancelled: teardown got there first
            Err(_) => {}
        }
        inner.fini();
        Ok(())
    }

    pub fn dialogue_id(&self) -> u64 {
        self.inner.dialogue_id.load(Ordering::SeqCst)
    }

    pub fn negotiating_id(&self) -> u64 {
        self.inner.negotiate_id
    }

    pub fn meta(&self) -> &[u8] {
        &self.inner.meta
    }

    pub fn side(&self) -> Side {
        self.inner.side
    }

    pub fn state(&self) -> DialogueState {
        self.inner.fsm.lock().current()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.finished.load(Ordering::SeqCst)
    }

    pub fn descriptor(&self) -> DialogueDescriptor {
        self.inner.descriptor()
    }

    // ------------------------------------------------------------------
    // Connection-facing surface
    // ------------------------------------------------------------------

    /// Hand an inbound packet to this dialogue's read pump.
    pub(crate) async fn deliver(&self, pkt: Packet) -> Result<(), Error> {
        let tx = self
            .inner
            .channel(|c| c.read_in_tx.clone())
            .ok_or(Error::DialogueClosed)?;
        tx.send(pkt).await.map_err(|_| Error::DialogueClosed)
    }

    pub(crate) fn synchub(&self) -> &SyncHub {
        &self.inner.synchub
    }

    pub(crate) async fn send_ctrl(&self, pkt: Packet) -> Result<(), Error> {
        self.inner.send_ctrl(pkt).await
    }

    pub(crate) fn emit(&self, event: DialogueEvent) -> Result<DialogueState, Error> {
        self.inner.emit(event)
    }

    pub(crate) fn set_map_key(&self, key: u64) {
        self.inner.map_key.store(key, Ordering::SeqCst);
    }

    pub(crate) fn fini(&self) {
        self.inner.fini();
    }
}

impl DialogueInner {
    fn channel<T>(&self, f: impl FnOnce(&DialogueChannels) -> T) -> Option<T> {
        self.channels.read().as_ref().map(f)
    }

    fn emit(&self, event: DialogueEvent) -> Result<DialogueState, Error> {
        self.fsm.lock().emit(event)
    }

    fn state(&self) -> DialogueState {
        self.fsm.lock().current()
    }

    fn dialogue_id(&self) -> u64 {
        self.dialogue_id.load(Ordering::SeqCst)
    }

    fn descriptor(&self) -> DialogueDescriptor {
        DialogueDescriptor {
            negotiating_id: self.negotiate_id,
            client_id: self.client_id,
            dialogue_id: self.dialogue_id(),
            meta: self.meta.clone(),
            side: self.side,
        }
    }

    async fn send_ctrl(&self, pkt: Packet) -> Result<(), Error> {
        let tx = self
            .channel(|c| c.write_ctrl_tx.clone())
            .ok_or(Error::DialogueClosed)?;
        tx.send(pkt).await.map_err(|_| Error::DialogueClosed)
    }

    fn online(&self) {
        self.online.store(true, Ordering::SeqCst);
        if let Err(e) = self.delegate.dialogue_online(&self.descriptor()) {
            tracing::warn!(
                dialogue_id = self.dialogue_id(),
                error = %e,
                "dialogue_online delegate failed"
            );
        }
    }

    /// Terminal teardown. Runs exactly once; every later call is a no-op.
    fn fini(&self) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        // closing the queues under the write lock is what makes every
        // concurrent writer observe DialogueClosed instead of racing a
        // dead queue
        drop(self.channels.write().take());
        self.synchub.cancel_all();
        let _ = self.fsm.lock().emit(DialogueEvent::Fini);
        if let Some(registry) = self.registry.upgrade() {
            registry.forget(self.negotiate_id, self.map_key.load(Ordering::SeqCst));
        }
        if self.online.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.delegate.dialogue_offline(&self.descriptor()) {
                tracing::warn!(
                    dialogue_id = self.dialogue_id(),
                    error = %e,
                    "dialogue_offline delegate failed"
                );
            }
        }
        tracing::debug!(
            dialogue_id = self.dialogue_id(),
            side = ?self.side,
            "dialogue finished"
        );
    }
}

// ----------------------------------------------------------------------
// Pumps
// ----------------------------------------------------------------------

async fn read_pump(inner: Arc<DialogueInner>, mut read_in: mpsc::Receiver<Packet>) {
    while let Some(pkt) = read_in.recv().await {
        if !handle_in(&inner, pkt).await {
            break;
        }
    }
    inner.fini();
}

/// Feed one inbound packet to the FSM; returns false once the dialogue is
/// done and the pump should stop.
async fn handle_in(inner: &Arc<DialogueInner>, pkt: Packet) -> bool {
    match pkt {
        Packet::Session(sess) => on_session(inner, sess).await,
        Packet::SessionAck(ack) => on_session_ack(inner, ack).await,
        Packet::Dismiss(dismiss) => {
            let state = inner.state();
            if matches!(state, DialogueState::DismissSent | DialogueState::Dismissed) {
                // both sides closed at once: let the peer terminate, but
                // hold our own state
                let ack = inner.factory.new_dismiss_ack(&dismiss, String::new());
                let _ = inner.send_ctrl(Packet::DismissAck(ack)).await;
                return true;
            }
            if let Err(e) = inner.emit(DialogueEvent::DismissRecv) {
                tracing::warn!(
                    dialogue_id = inner.dialogue_id(),
                    error = %e,
                    "dropping dismiss"
                );
                return true;
            }
            let ack = inner.factory.new_dismiss_ack(&dismiss, String::new());
            let _ = inner.send_ctrl(Packet::DismissAck(ack)).await;
            let _ = inner.emit(DialogueEvent::DismissAck);
            false
        }
        Packet::DismissAck(ack) => {
            inner.synchub.ack(ack.header.packet_id, Ok(()));
            if inner.state() == DialogueState::DismissSent {
                let _ = inner.emit(DialogueEvent::DismissAck);
            }
            false
        }
        Packet::Application(app) => {
            if inner.state() != DialogueState::Sessioned {
                tracing::debug!(
                    dialogue_id = inner.dialogue_id(),
                    typ = ?app.header.typ,
                    "application packet outside sessioned state dropped"
                );
                return true;
            }
            match inner.channel(|c| c.read_out_tx.clone()) {
                Some(tx) => {
                    // bounded: blocks the dialogue (and transitively the
                    // connection read pump) when the application lags
                    let _ = tx.send(app).await;
                }
                None => return false,
            }
            true
        }
        other => {
            tracing::warn!(
                dialogue_id = inner.dialogue_id(),
                typ = ?other.typ(),
                "unexpected packet in dialogue read pump"
            );
            true
        }
    }
}

/// Remote open: answer with the authoritative session-id and come online.
async fn on_session(inner: &Arc<DialogueInner>, sess: SessionPacket) -> bool {
    if let Err(e) = inner.emit(DialogueEvent::SessionRecv) {
        tracing::warn!(
            dialogue_id = inner.dialogue_id(),
            error = %e,
            "dropping session packet"
        );
        return true;
    }
    let ack = inner
        .factory
        .new_session_ack(&sess, inner.dialogue_id(), String::new());
    if inner.send_ctrl(Packet::SessionAck(ack)).await.is_err() {
        return false;
    }
    let _ = inner.emit(DialogueEvent::SessionAck);
    inner.online();
    if let Some(accepted) = inner.accepted.clone() {
        let dialogue = Dialogue {
            inner: inner.clone(),
        };
        if accepted.send(dialogue).await.is_err() {
            tracing::debug!(
                dialogue_id = inner.dialogue_id(),
                "accept queue gone, dialogue kept running"
            );
        }
    }
    true
}

/// Local open completing: adopt the session-id and wake the opener.
async fn on_session_ack(inner: &Arc<DialogueInner>, ack: SessionAckPacket) -> bool {
    if !ack.data.error.is_empty() {
        let _ = inner.emit(DialogueEvent::Error);
        inner
            .synchub
            .ack(ack.header.packet_id, Err(Error::Remote(ack.data.error)));
        return false;
    }
    inner.dialogue_id.store(ack.session_id, Ordering::SeqCst);
    if let Err(e) = inner.emit(DialogueEvent::SessionAck) {
        tracing::warn!(
            dialogue_id = ack.session_id,
            error = %e,
            "dropping session ack"
        );
        return true;
    }
    inner.online();
    inner.synchub.ack(ack.header.packet_id, Ok(()));
    true
}

async fn write_pump(
    inner: Arc<DialogueInner>,
    mut write_ctrl: mpsc::Receiver<Packet>,
    mut write_in: mpsc::Receiver<AppPacket>,
) {
    loop {
        let pkt = tokio::select! {
            biased;
            ctrl = write_ctrl.recv() => match ctrl {
                Some(pkt) => pkt,
                None => break,
            },
            data = write_in.recv() => match data {
                Some(app) => Packet::Application(app),
                None => break,
            },
        };
        let outbound = match inner.channel(|c| c.outbound.clone()) {
            Some(tx) => tx,
            None => break,
        };
        if outbound.send(pkt).await.is_err() {
            // connection writer is gone; this dialogue ends here
            let _ = inner.emit(DialogueEvent::Eof);
            inner.fini();
            break;
        }
    }
}

#[cfg(test)]
mod fsm_tests {
    use super::*;
    use std::collections::{HashSet, VecDeque};

    const EVENTS: [DialogueEvent; 9] = [
        DialogueEvent::SessionSent,
        DialogueEvent::SessionRecv,
        DialogueEvent::SessionAck,
        DialogueEvent::DismissSent,
        DialogueEvent::DismissRecv,
        DialogueEvent::DismissAck,
        DialogueEvent::Error,
        DialogueEvent::Eof,
        DialogueEvent::Fini,
    ];

    #[test]
    fn canonical_walks_follow_the_table() {
        let mut fsm = dialogue_fsm(DialogueState::Init);
        assert_eq!(fsm.emit(DialogueEvent::SessionSent).unwrap(), DialogueState::SessionSent);
        assert_eq!(fsm.emit(DialogueEvent::SessionAck).unwrap(), DialogueState::Sessioned);
        assert_eq!(fsm.emit(DialogueEvent::DismissSent).unwrap(), DialogueState::DismissSent);
        assert_eq!(fsm.emit(DialogueEvent::DismissAck).unwrap(), DialogueState::Dismissed);
        assert_eq!(fsm.emit(DialogueEvent::Fini).unwrap(), DialogueState::Fini);

        let mut fsm = dialogue_fsm(DialogueState::Init);
        assert_eq!(fsm.emit(DialogueEvent::SessionRecv).unwrap(), DialogueState::SessionRecv);
        assert_eq!(fsm.emit(DialogueEvent::SessionAck).unwrap(), DialogueState::Sessioned);
        assert_eq!(fsm.emit(DialogueEvent::DismissRecv).unwrap(), DialogueState::DismissRecv);
        assert_eq!(fsm.emit(DialogueEvent::DismissAck).unwrap(), DialogueState::Dismissed);
    }

    #[test]
    fn protocol_invalid_events_are_rejected() {
        let mut fsm = dialogue_fsm(DialogueState::Init);
        // e.g. a session ack before anything was sent
        assert!(fsm.emit(DialogueEvent::SessionAck).is_err());
        assert!(fsm.in_state(DialogueState::Init));
        // dismiss before the dialogue is up
        assert!(fsm.emit(DialogueEvent::DismissRecv).is_err());
    }

    #[test]
    fn fini_is_reachable_from_every_reachable_state() {
        // breadth-first walk of the legal event space; every state found
        // must admit the terminal event
        let mut seen = HashSet::new();
        let mut queue: VecDeque<Vec<DialogueEvent>> = VecDeque::from([Vec::new()]);
        while let Some(prefix) = queue.pop_front() {
            let mut fsm = dialogue_fsm(DialogueState::Init);
            for event in &prefix {
                let _ = fsm.emit(*event);
            }
            let state = fsm.current();
            assert!(
                fsm.can_emit(DialogueEvent::Fini),
                "fini unreachable from {state:?}"
            );
            if seen.insert(state) {
                for event in EVENTS {
                    if event == DialogueEvent::Fini {
                        continue;
                    }
                    let mut next = prefix.clone();
                    next.push(event);
                    queue.push_back(next);
                }
            }
        }
        assert!(seen.contains(&DialogueState::Dismissed));
        assert!(seen.contains(&DialogueState::Sessioned));
    }
}
