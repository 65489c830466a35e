//! End-to-end tunnel tests over loopback: a rendezvous broker, an origin,
//! a terminus and an echo service, all in one single-threaded runtime.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::LocalSet;
use tokio::time::timeout;

use burrow::rendezvous::run_with_socket;
use burrow::worker::origin::{self, OriginConfig};
use burrow::worker::terminus::{self, TerminusConfig};

fn spool_dir(name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("burrow-tunnel-{}-{name}", std::process::id()));
    std::fs::create_dir_all(&path).unwrap();
    path
}

async fn start_broker() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::task::spawn_local(async move {
        let _ = run_with_socket(socket).await;
    });
    addr
}

/// A TCP service that echoes everything back, one task per connection.
async fn start_echo_service() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::task::spawn_local(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };

            tokio::task::spawn_local(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(count) => {
                            if stream.write_all(&buf[..count]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}

/// Brings up broker + origin + terminus around an echo destination and
/// returns the origin's local TCP address.
async fn start_tunnel(room: &str) -> SocketAddr {
    let broker = start_broker().await;
    let destination = start_echo_service().await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = listener.local_addr().unwrap();

    let origin_config = OriginConfig {
        rendezvous: broker,
        room: room.to_string(),
        listen: origin_addr,
        spool_dir: spool_dir(&format!("{room}-origin")),
    };
    tokio::task::spawn_local(async move {
        let _ = origin::run_with_listener(listener, origin_config).await;
    });

    let terminus_config = TerminusConfig {
        rendezvous: broker,
        room: room.to_string(),
        destination,
        spool_dir: spool_dir(&format!("{room}-terminus")),
    };
    tokio::task::spawn_local(async move {
        let _ = terminus::run(terminus_config).await;
    });

    origin_addr
}

async fn echo_roundtrip(origin_addr: SocketAddr, message: &[u8]) -> Vec<u8> {
    let mut client = TcpStream::connect(origin_addr).await.unwrap();
    client.write_all(message).await.unwrap();

    let mut echoed = vec![0u8; message.len()];
    timeout(Duration::from_secs(30), client.read_exact(&mut echoed))
        .await
        .expect("timed out waiting for the echo")
        .unwrap();
    echoed
}

#[tokio::test]
async fn bytes_travel_the_tunnel_and_back() {
    LocalSet::new()
        .run_until(async {
            let origin_addr = start_tunnel("e2e-single").await;

            let message = b"knock knock, anyone on the other network?";
            let echoed = echo_roundtrip(origin_addr, message).await;
            assert_eq!(echoed, message);
        })
        .await;
}

#[tokio::test]
async fn a_multi_packet_payload_arrives_intact_and_ordered() {
    LocalSet::new()
        .run_until(async {
            let origin_addr = start_tunnel("e2e-bulk").await;

            // Several packets worth of patterned data; any loss, reorder or
            // duplication in the transport would corrupt the comparison.
            let message: Vec<u8> = (0u32..8000).flat_map(|i| i.to_le_bytes()).collect();
            let echoed = echo_roundtrip(origin_addr, &message).await;
            assert_eq!(echoed, message);
        })
        .await;
}

#[tokio::test]
async fn concurrent_streams_stay_isolated() {
    LocalSet::new()
        .run_until(async {
            let origin_addr = start_tunnel("e2e-multi").await;

            let first = tokio::task::spawn_local(async move {
                echo_roundtrip(origin_addr, &[0xaa; 2000]).await
            });
            let second = tokio::task::spawn_local(async move {
                echo_roundtrip(origin_addr, &[0x55; 2000]).await
            });

            assert_eq!(first.await.unwrap(), vec![0xaa; 2000]);
            assert_eq!(second.await.unwrap(), vec![0x55; 2000]);
        })
        .await;
}

#[tokio::test]
async fn streams_outlive_their_predecessors() {
    LocalSet::new()
        .run_until(async {
            let origin_addr = start_tunnel("e2e-serial").await;

            // Open, use and close three connections in a row; each close
            // runs the two-phase teardown and must not take the tunnel or
            // later streams down with it.
            for round in 0u8..3 {
                let message = vec![round; 1500];
                let echoed = echo_roundtrip(origin_addr, &message).await;
                assert_eq!(echoed, message);
            }
        })
        .await;
}
