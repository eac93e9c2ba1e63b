//! Bounded-queue back-pressure and per-dialogue ordering.

use std::time::Duration;

use bytes::Bytes;
use tokio::time::timeout;

use palaver::packet::PacketType;
use palaver::ConnectionOptions;
use palaver_testkit::{connected_pair, RecordingDelegate};

const WAIT: Duration = Duration::from_secs(30);
const PACKETS: u64 = 10_000;

#[tokio::test]
async fn writer_blocks_and_order_is_preserved() {
    let (client, server) = connected_pair(
        ConnectionOptions::default(),
        ConnectionOptions::default(),
        RecordingDelegate::new(),
        RecordingDelegate::new(),
    )
    .await;

    let acceptor = server.clone();
    let accept = tokio::spawn(async move { acceptor.accept_dialogue().await });
    let dialogue = client.open_dialogue(b"flood".to_vec()).await.unwrap();
    let server_dialogue = accept.await.unwrap().unwrap();

    let producer_dialogue = dialogue.clone();
    let producer = tokio::spawn(async move {
        for i in 0..PACKETS {
            let pkt = producer_dialogue.app_packet(
                PacketType::Message,
                Bytes::copy_from_slice(&i.to_be_bytes()),
            );
            producer_dialogue.write(pkt).await.unwrap();
        }
    });

    // nobody reads yet: the queues (128 per hop) and the pipe must fill
    // and hold the producer well short of 10k packets
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        !producer.is_finished(),
        "producer should be blocked by back-pressure"
    );

    // drain everything; nothing dropped, nothing reordered
    for i in 0..PACKETS {
        let pkt = timeout(WAIT, server_dialogue.read())
            .await
            .expect("reader starved")
            .unwrap();
        assert_eq!(pkt.data.as_ref(), &i.to_be_bytes(), "packet {i} out of order");
    }
    timeout(WAIT, producer).await.unwrap().unwrap();

    timeout(WAIT, dialogue.close()).await.unwrap().unwrap();
    client.close().await.unwrap();
}

#[tokio::test]
async fn slow_reader_loses_nothing() {
    let (client, server) = connected_pair(
        ConnectionOptions::default(),
        ConnectionOptions::default(),
        RecordingDelegate::new(),
        RecordingDelegate::new(),
    )
    .await;

    let acceptor = server.clone();
    let accept = tokio::spawn(async move { acceptor.accept_dialogue().await });
    let dialogue = client.open_dialogue(Vec::new()).await.unwrap();
    let server_dialogue = accept.await.unwrap().unwrap();

    const N: u64 = 500;
    let producer_dialogue = dialogue.clone();
    let producer = tokio::spawn(async move {
        for i in 0..N {
            let pkt = producer_dialogue.app_packet(
                PacketType::Message,
                Bytes::copy_from_slice(&i.to_be_bytes()),
            );
            producer_dialogue.write(pkt).await.unwrap();
        }
    });

    for i in 0..N {
        // a reader that lags behind every packet
        tokio::time::sleep(Duration::from_millis(1)).await;
        let pkt = timeout(WAIT, server_dialogue.read()).await.unwrap().unwrap();
        assert_eq!(pkt.data.as_ref(), &i.to_be_bytes());
    }
    timeout(WAIT, producer).await.unwrap().unwrap();

    timeout(WAIT, dialogue.close()).await.unwrap().unwrap();
    client.close().await.unwrap();
}
