//! Rendezvous broker integration tests over loopback UDP.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};

use burrow::rendezvous::run_with_socket;
use burrow_proto::packet::{Control, Packet};

async fn start_broker() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = run_with_socket(socket).await;
    });
    addr
}

async fn recv_peer_addr(socket: &UdpSocket, broker: SocketAddr) -> SocketAddr {
    let mut buf = [0u8; 64];
    let (count, from) = timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for the broker's reply")
        .unwrap();
    assert_eq!(from, broker, "reply must come from the broker");

    match Packet::parse(&buf[..count]).unwrap() {
        Packet::Control(Control::PeerAddr(addr)) => addr,
        other => panic!("expected a peer address packet, got {other:?}"),
    }
}

#[tokio::test]
async fn two_registrants_learn_each_others_addresses() {
    let broker = start_broker().await;

    let first = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let second = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    first.send_to(b"pairing-room", broker).await.unwrap();
    sleep(Duration::from_millis(50)).await;
    second.send_to(b"pairing-room", broker).await.unwrap();

    assert_eq!(recv_peer_addr(&first, broker).await, second.local_addr().unwrap());
    assert_eq!(recv_peer_addr(&second, broker).await, first.local_addr().unwrap());
}

#[tokio::test]
async fn a_lone_registrant_gets_no_reply() {
    let broker = start_broker().await;

    let lone = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    lone.send_to(b"lonely-room", broker).await.unwrap();

    let mut buf = [0u8; 64];
    let result = timeout(Duration::from_millis(300), lone.recv_from(&mut buf)).await;
    assert!(result.is_err(), "the broker must stay silent until a second registrant arrives");
}

#[tokio::test]
async fn invalid_identifiers_are_ignored() {
    let broker = start_broker().await;

    let first = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let second = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    // Path-like identifiers never occupy a room, so presenting one twice
    // from distinct addresses pairs nobody.
    first.send_to(b"../etc/passwd", broker).await.unwrap();
    sleep(Duration::from_millis(50)).await;
    second.send_to(b"../etc/passwd", broker).await.unwrap();

    let mut buf = [0u8; 64];
    let result = timeout(Duration::from_millis(300), second.recv_from(&mut buf)).await;
    assert!(result.is_err(), "an invalid identifier must be dropped silently");
}

#[tokio::test]
async fn rooms_do_not_cross_pair() {
    let broker = start_broker().await;

    let first = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let second = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    first.send_to(b"room-one", broker).await.unwrap();
    sleep(Duration::from_millis(50)).await;
    second.send_to(b"room-two", broker).await.unwrap();

    let mut buf = [0u8; 64];
    let result = timeout(Duration::from_millis(300), first.recv_from(&mut buf)).await;
    assert!(result.is_err(), "different rooms must not pair");
}
