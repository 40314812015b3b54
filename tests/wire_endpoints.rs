//! Channel endpoints over loopback sockets

use bytes::Bytes;
use gimbalcam::codec::{fragment, Reassembler};
use gimbalcam::control::{
    format_record, ControlChannel, ControlListener, ControlMessage, GimbalAngles,
};
use gimbalcam::data::{DataChannel, DataListener};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn data_rendezvous_then_frames_flow() {
    let listener = DataListener::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let producer_addr = listener.local_addr().unwrap();

    let accept = tokio::spawn(async move { listener.accept().await });

    let consumer = timeout(TEST_TIMEOUT, DataChannel::rendezvous(producer_addr, 800, 600))
        .await
        .unwrap()
        .unwrap();

    let (producer, (width, height)) = timeout(TEST_TIMEOUT, accept)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!((width, height), (800, 600));

    // a fragmented frame crosses the established channel intact
    let blob: Bytes = (0..2000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>().into();
    let packets = fragment(blob.clone(), 128).unwrap();
    producer.send_packets(&packets).await.unwrap();

    let mut reassembler = Reassembler::new();
    let received = timeout(TEST_TIMEOUT, async {
        loop {
            let datagram = consumer.recv().await.unwrap();
            let packet = gimbalcam::codec::Packet::from_bytes(datagram).unwrap();
            if let Some(blob) = reassembler.push(packet).unwrap() {
                return blob;
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(received, blob);
}

#[tokio::test]
async fn control_record_reaches_producer() {
    let listener = ControlListener::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();

    let accept = tokio::spawn(async move { listener.accept().await });
    let mut raw_peer = TcpStream::connect(addr).await.unwrap();
    let channel = timeout(TEST_TIMEOUT, accept).await.unwrap().unwrap().unwrap();
    let (_tx, mut rx) = channel.split();

    // exactly the 13 bytes of the scenario, space-padded
    raw_peer.write_all(b" 12.34  -5.67").await.unwrap();

    let message = timeout(TEST_TIMEOUT, rx.recv()).await.unwrap().unwrap();
    let ControlMessage::Angles(angles) = message else {
        panic!("expected angles, got {message:?}");
    };
    assert!((angles.x - 12.34).abs() < 0.005);
    assert!((angles.y + 5.67).abs() < 0.005);
}

#[tokio::test]
async fn coalesced_records_yield_freshest() {
    let listener = ControlListener::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();

    let accept = tokio::spawn(async move { listener.accept().await });
    let mut raw_peer = TcpStream::connect(addr).await.unwrap();
    let channel = timeout(TEST_TIMEOUT, accept).await.unwrap().unwrap().unwrap();
    let (_tx, mut rx) = channel.split();

    // three records in one burst: only the last one matters
    let mut burst = Vec::new();
    burst.extend_from_slice(&format_record(GimbalAngles { x: 1.0, y: 1.0 }));
    burst.extend_from_slice(&format_record(GimbalAngles { x: 2.0, y: 2.0 }));
    burst.extend_from_slice(&format_record(GimbalAngles { x: -45.5, y: 30.25 }));
    raw_peer.write_all(&burst).await.unwrap();

    let message = timeout(TEST_TIMEOUT, rx.recv()).await.unwrap().unwrap();
    let ControlMessage::Angles(angles) = message else {
        panic!("expected angles, got {message:?}");
    };
    assert!((angles.x + 45.5).abs() < 0.005);
    assert!((angles.y - 30.25).abs() < 0.005);
}

#[tokio::test]
async fn sender_record_parses_on_raw_peer() {
    let listener = ControlListener::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();

    let accept = tokio::spawn(async move { listener.accept().await });
    let mut raw_peer = TcpStream::connect(addr).await.unwrap();
    let channel = timeout(TEST_TIMEOUT, accept).await.unwrap().unwrap().unwrap();
    let (mut tx, _rx) = channel.split();

    tx.send(GimbalAngles { x: -7.5, y: 12.0 }).await.unwrap();

    let mut record = [0u8; 13];
    timeout(TEST_TIMEOUT, raw_peer.read_exact(&mut record))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&record, b"-07.50 012.00");
}

#[tokio::test]
async fn end_hint_and_close_surface_in_order() {
    let listener = ControlListener::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();

    let accept = tokio::spawn(async move { listener.accept().await });
    let consumer = ControlChannel::connect(addr).await.unwrap();
    let producer = timeout(TEST_TIMEOUT, accept).await.unwrap().unwrap().unwrap();

    let (mut consumer_tx, _consumer_rx) = consumer.split();
    let (_producer_tx, mut producer_rx) = producer.split();

    consumer_tx.send_end_hint().await;
    consumer_tx.close().await;
    // close twice: must stay idempotent
    consumer_tx.close().await;

    let message = timeout(TEST_TIMEOUT, producer_rx.recv()).await.unwrap().unwrap();
    assert_eq!(message, ControlMessage::EndOfSession);

    let closed = timeout(TEST_TIMEOUT, producer_rx.recv()).await.unwrap();
    assert!(matches!(
        closed,
        Err(gimbalcam::control::ControlError::Closed)
    ));
}

#[tokio::test]
async fn malformed_record_is_protocol_error() {
    let listener = ControlListener::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();

    let accept = tokio::spawn(async move { listener.accept().await });
    let mut raw_peer = TcpStream::connect(addr).await.unwrap();
    let channel = timeout(TEST_TIMEOUT, accept).await.unwrap().unwrap().unwrap();
    let (_tx, mut rx) = channel.split();

    raw_peer.write_all(b"glorp windmill").await.unwrap();

    let result = timeout(TEST_TIMEOUT, rx.recv()).await.unwrap();
    assert!(matches!(
        result,
        Err(gimbalcam::control::ControlError::Protocol(_))
    ));
}
