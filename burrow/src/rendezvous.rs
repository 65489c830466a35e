//! The rendezvous address broker.
//!
//! Two endpoint processes that present the same room identifier from behind
//! their NATs each get told the other's observed public address, and
//! nothing more; the broker carries no tunnel traffic. A registration
//! datagram is the raw identifier; the reply, sent only once both parties
//! are present, is a `PeerAddr` control packet.
//!
//! A room is held by its first registrant until a *different* address
//! presents the same identifier (which pairs the two and clears the room),
//! the holder re-registers (which refreshes the hold), or the hold goes
//! stale and is overwritten by whoever shows up next.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::Instant;

use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use burrow_proto::packet::Control;
use burrow_proto::{EXPIRE_AFTER, ROOM_LIMIT};

pub struct RendezvousConfig {
    pub listen: SocketAddr,
}

/// What a registration datagram did to the room table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomOutcome {
    /// First (or post-expiry) registrant; now holding the room.
    Occupied,

    /// The holder re-registered; the hold is refreshed.
    Refreshed,

    /// A second, distinct registrant arrived: both parties get the other's
    /// address and the room is cleared.
    Paired(SocketAddr),

    /// Not a valid room identifier; ignored without a response.
    Rejected,
}

/// The in-memory room table.
#[derive(Debug, Default)]
pub struct RoomTable {
    rooms: HashMap<Vec<u8>, (SocketAddr, Instant)>,
}

/// A registration must be 2..=255 bytes — a single byte is line noise, not
/// an identifier — and free of path-like and line-breaking characters.
pub fn valid_title(title: &[u8]) -> bool {
    (2..=ROOM_LIMIT).contains(&title.len())
        && !title.iter().any(|&byte| matches!(byte, b'/' | b'.' | b' ' | b'\r' | b'\n' | 0))
}

impl RoomTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, title: &[u8], from: SocketAddr, now: Instant) -> RoomOutcome {
        if !valid_title(title) {
            return RoomOutcome::Rejected;
        }

        match self.rooms.get(title) {
            Some(&(holder, held_at)) if now.duration_since(held_at) <= EXPIRE_AFTER => {
                if holder == from {
                    self.rooms.insert(title.to_vec(), (from, now));
                    RoomOutcome::Refreshed
                } else {
                    self.rooms.remove(title);
                    RoomOutcome::Paired(holder)
                }
            }
            _ => {
                self.rooms.insert(title.to_vec(), (from, now));
                RoomOutcome::Occupied
            }
        }
    }
}

pub async fn run(config: RendezvousConfig) -> io::Result<()> {
    let socket = UdpSocket::bind(config.listen).await?;
    info!(listen = %socket.local_addr()?, "rendezvous listening");
    run_with_socket(socket).await
}

/// Runs the broker around an already-bound socket.
pub async fn run_with_socket(socket: UdpSocket) -> io::Result<()> {
    let mut table = RoomTable::new();
    // Room identifiers are at most 255 bytes; anything longer fills the
    // buffer and fails validation by length.
    let mut buf = [0u8; 512];

    loop {
        let (count, from) = socket.recv_from(&mut buf).await?;

        match table.register(&buf[..count], from, Instant::now()) {
            RoomOutcome::Paired(other) => {
                info!(%from, %other, "paired");

                let to_from = Control::PeerAddr(other).to_datagram();
                let to_other = Control::PeerAddr(from).to_datagram();
                if let Err(error) = socket.send_to(&to_from, from).await {
                    warn!(%from, %error, "failed to deliver peer address");
                }
                if let Err(error) = socket.send_to(&to_other, other).await {
                    warn!(to = %other, %error, "failed to deliver peer address");
                }
            }
            RoomOutcome::Occupied => debug!(%from, "room occupied"),
            RoomOutcome::Refreshed => debug!(%from, "room refreshed"),
            RoomOutcome::Rejected => debug!(%from, "rejected registration"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn addr(last: u8, port: u16) -> SocketAddr {
        format!("203.0.113.{last}:{port}").parse().unwrap()
    }

    #[test]
    fn first_registrant_occupies_then_a_distinct_one_pairs() {
        let mut table = RoomTable::new();
        let now = Instant::now();

        assert_eq!(table.register(b"alpha", addr(1, 100), now), RoomOutcome::Occupied);
        assert_eq!(table.register(b"alpha", addr(2, 200), now), RoomOutcome::Paired(addr(1, 100)));

        // Pairing clears the room; the next registrant starts over.
        assert_eq!(table.register(b"alpha", addr(3, 300), now), RoomOutcome::Occupied);
    }

    #[test]
    fn the_holder_refreshes_instead_of_pairing_with_itself() {
        let mut table = RoomTable::new();
        let now = Instant::now();

        assert_eq!(table.register(b"alpha", addr(1, 100), now), RoomOutcome::Occupied);
        assert_eq!(table.register(b"alpha", addr(1, 100), now), RoomOutcome::Refreshed);
    }

    #[test]
    fn same_host_different_port_pairs() {
        // Two processes behind the same NAT observe the same public ip but
        // different ports; they are distinct registrants.
        let mut table = RoomTable::new();
        let now = Instant::now();

        assert_eq!(table.register(b"alpha", addr(1, 100), now), RoomOutcome::Occupied);
        assert_eq!(table.register(b"alpha", addr(1, 101), now), RoomOutcome::Paired(addr(1, 100)));
    }

    #[test]
    fn stale_holds_are_overwritten() {
        let mut table = RoomTable::new();
        let early = Instant::now();
        let late = early + EXPIRE_AFTER + Duration::from_secs(1);

        assert_eq!(table.register(b"alpha", addr(1, 100), early), RoomOutcome::Occupied);
        assert_eq!(table.register(b"alpha", addr(2, 200), late), RoomOutcome::Occupied);

        // The stale holder is gone; the overwriting party holds the room.
        assert_eq!(table.register(b"alpha", addr(3, 300), late), RoomOutcome::Paired(addr(2, 200)));
    }

    #[test]
    fn rooms_are_distinct_by_title() {
        let mut table = RoomTable::new();
        let now = Instant::now();

        assert_eq!(table.register(b"alpha", addr(1, 100), now), RoomOutcome::Occupied);
        assert_eq!(table.register(b"beta", addr(2, 200), now), RoomOutcome::Occupied);
        assert_eq!(table.register(b"beta", addr(3, 300), now), RoomOutcome::Paired(addr(2, 200)));
    }

    #[test]
    fn invalid_titles_are_rejected() {
        let mut table = RoomTable::new();
        let now = Instant::now();
        let long = vec![b'x'; ROOM_LIMIT + 1];

        for title in [&b""[..], b"a", b"with/slash", b"with.dot", b"with space", b"with\nnewline", b"nul\0led", &long] {
            assert_eq!(table.register(title, addr(1, 100), now), RoomOutcome::Rejected, "{title:?}");
        }

        let max = vec![b'x'; ROOM_LIMIT];
        assert_eq!(table.register(&max, addr(1, 100), now), RoomOutcome::Occupied);
    }
}
