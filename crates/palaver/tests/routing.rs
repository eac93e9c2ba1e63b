//! Dispatch edge cases driven by a hand-rolled peer.

use std::time::Duration;

use bytes::Bytes;
use tokio::time::timeout;

use palaver::packet::{Packet, PacketFactory, PacketType};
use palaver::{Connection, ConnectionOptions, DialogueOptions, Error};
use palaver_core::Parity;
use palaver_testkit::{loopback, raw, RecordingDelegate};

const WAIT: Duration = Duration::from_secs(5);

/// A packet for an unregistered dialogue is dropped with a log entry; the
/// connection itself stays healthy.
#[tokio::test]
async fn unknown_dialogue_packets_are_not_fatal() {
    let (client_stream, server_stream) = loopback();
    let accept = tokio::spawn(Connection::accept(
        server_stream,
        ConnectionOptions::default(),
        RecordingDelegate::resolving(3),
    ));

    let (mut rh, mut wh) = tokio::io::split(client_stream);
    let factory = PacketFactory::new(Parity::Even);

    // handshake by hand
    let conn = factory.new_conn(0, Vec::new());
    raw::write_packet(&mut wh, &Packet::Conn(conn)).await.unwrap();
    let ack = timeout(WAIT, raw::read_packet(&mut rh)).await.unwrap().unwrap();
    assert!(matches!(ack, Packet::ConnAck(_)));
    let server = timeout(WAIT, accept).await.unwrap().unwrap().unwrap();

    // reference a dialogue that was never opened
    let stray = factory.new_application(PacketType::Message, 4242, Bytes::from_static(b"stray"));
    raw::write_packet(&mut wh, &Packet::Application(stray))
        .await
        .unwrap();

    // the connection still answers liveness afterwards
    let hb = factory.new_heartbeat();
    let pid = hb.header.packet_id;
    raw::write_packet(&mut wh, &Packet::Heartbeat(hb)).await.unwrap();
    let reply = timeout(WAIT, raw::read_packet(&mut rh)).await.unwrap().unwrap();
    match reply {
        Packet::HeartbeatAck(ack) => assert_eq!(ack.header.packet_id, pid),
        other => panic!("expected heartbeat ack, got {other:?}"),
    }
    assert!(!server.is_closed());

    // dropping the pipe is the transport failing; the server must notice
    drop((rh, wh));
    timeout(WAIT, server.wait_closed()).await.unwrap();
}

/// An out-of-band resume must not squat on the negotiate-id of an open
/// that is still waiting for its ack.
#[tokio::test]
async fn resume_conflicts_with_an_in_flight_open() {
    let (client_stream, server_stream) = loopback();

    // acceptor that completes the handshake but never answers a Session
    let mute_server = tokio::spawn(async move {
        let (mut rh, mut wh) = tokio::io::split(server_stream);
        let factory = PacketFactory::new(Parity::Odd);
        loop {
            let pkt = match raw::read_packet(&mut rh).await {
                Ok(pkt) => pkt,
                Err(_) => return,
            };
            if let Packet::Conn(conn) = pkt {
                let ack = factory.new_conn_ack(conn.header.packet_id, 7, String::new());
                raw::write_packet(&mut wh, &Packet::ConnAck(ack))
                    .await
                    .unwrap();
            }
        }
    });

    let client = Connection::dial(
        client_stream,
        ConnectionOptions::default(),
        RecordingDelegate::new(),
    )
    .await
    .unwrap();

    let negotiate_id = 0x1234;
    let opener = client.clone();
    let pending_open = tokio::spawn(async move {
        opener
            .open_dialogue_with(DialogueOptions {
                negotiating_id: Some(negotiate_id),
                ..DialogueOptions::default()
            })
            .await
    });

    // the open registers its negotiate-id, then hangs on the missing ack
    let deadline = tokio::time::Instant::now() + WAIT;
    while client.dialogue_count() == 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "open never registered"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(matches!(
        client
            .open_dialogue_with(DialogueOptions::default().with_resumed_id(negotiate_id))
            .await,
        Err(Error::DialogueIdConflict(id)) if id == negotiate_id
    ));

    pending_open.abort();
    mute_server.abort();
}

/// A dismissed dialogue acks late dismisses so a slow peer can always
/// terminate its side.
#[tokio::test]
async fn dismiss_is_acked_even_when_already_closing() {
    let (client_stream, server_stream) = loopback();
    let accept = tokio::spawn(Connection::accept(
        server_stream,
        ConnectionOptions::default(),
        RecordingDelegate::resolving(3),
    ));

    let (mut rh, mut wh) = tokio::io::split(client_stream);
    let factory = PacketFactory::new(Parity::Even);

    let conn = factory.new_conn(0, Vec::new());
    raw::write_packet(&mut wh, &Packet::Conn(conn)).await.unwrap();
    let _ack = timeout(WAIT, raw::read_packet(&mut rh)).await.unwrap().unwrap();
    let server = timeout(WAIT, accept).await.unwrap().unwrap().unwrap();

    // open a dialogue by hand
    let sess = factory.new_session(Default::default(), b"manual".to_vec());
    let session_id = sess.negotiate_id;
    raw::write_packet(&mut wh, &Packet::Session(sess)).await.unwrap();
    let sess_ack = timeout(WAIT, raw::read_packet(&mut rh)).await.unwrap().unwrap();
    match sess_ack {
        Packet::SessionAck(ack) => assert_eq!(ack.session_id, session_id),
        other => panic!("expected session ack, got {other:?}"),
    }

    // dismiss it twice without waiting: the first transitions the server
    // dialogue, the second races its teardown. both must be answered or
    // dropped without killing the connection
    let dismiss = factory.new_dismiss(session_id);
    raw::write_packet(&mut wh, &Packet::Dismiss(dismiss)).await.unwrap();
    let reply = timeout(WAIT, raw::read_packet(&mut rh)).await.unwrap().unwrap();
    match reply {
        Packet::DismissAck(ack) => assert_eq!(ack.session_id, session_id),
        other => panic!("expected dismiss ack, got {other:?}"),
    }

    let dismiss = factory.new_dismiss(session_id);
    raw::write_packet(&mut wh, &Packet::Dismiss(dismiss)).await.unwrap();

    // liveness proves the connection survived
    let hb = factory.new_heartbeat();
    let pid = hb.header.packet_id;
    raw::write_packet(&mut wh, &Packet::Heartbeat(hb)).await.unwrap();
    loop {
        let pkt = timeout(WAIT, raw::read_packet(&mut rh)).await.unwrap().unwrap();
        match pkt {
            Packet::HeartbeatAck(ack) if ack.header.packet_id == pid => break,
            // a second dismiss ack may arrive if the dialogue was still
            // tearing down; anything else is a protocol violation
            Packet::DismissAck(ack) => assert_eq!(ack.session_id, session_id),
            other => panic!("unexpected packet {other:?}"),
        }
    }
    assert!(!server.is_closed());

    drop((rh, wh));
    timeout(WAIT, server.wait_closed()).await.unwrap();
}
