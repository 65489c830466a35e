//! Sans-I/O building blocks of the burrow tunneling protocol.
//!
//! A burrow tunnel is a single UDP socket pair punched through NAT, carrying
//! any number of multiplexed logical byte-streams. Since UDP gives neither
//! ordering nor delivery guarantees, this crate reimplements both on top of
//! it: per-stream sequence numbers, duplicate suppression, fragment
//! reordering, selective retransmission of reported gaps, coarse
//! pause/resume flow control and a two-phase cooperative close handshake.
//!
//! Nothing in this crate performs I/O or talks to a clock on its own; state
//! machines take the current [`Instant`](std::time::Instant) as an argument
//! where timing matters. The `burrow` binary crate owns the sockets, the
//! timers and the event loop.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `packet` | On-wire layout: data packets, control packets, parsing |
//! | `reliability` | Per-stream ordering, retransmission and ack state |
//! | `flow` | Session-wide unacked-byte gauge with pause/resume hysteresis |
//! | `teardown` | The FIN1/FIN2 two-phase close state machine |
//! | `scramble` | The pluggable first-packet obfuscation seam |

use std::time::Duration;

pub mod flow;
pub mod packet;
pub mod reliability;
pub mod scramble;
pub mod teardown;

/// Largest data payload carried in one packet: 1400 (console MTU) - 8
/// (PPPoE header) - 40 (IPv6 header) - 8 (UDP header) - 16 (data header).
///
/// Local endpoints are read in chunks of at most this size, so a chunk of
/// endpoint data always fits in exactly one packet.
pub const MAX_PAYLOAD: usize = 1328;

/// Byte length of the data packet header: sequence (8) + stream id (8).
pub const DATA_HEADER_LEN: usize = 16;

/// Largest datagram this protocol ever produces.
pub const MAX_DATAGRAM: usize = DATA_HEADER_LEN + MAX_PAYLOAD;

/// Packets with a sequence number up to this value pass through the
/// obfuscation transform. Only the opening packet of a stream is scrambled;
/// everything after it goes out as-is.
pub const SCRAMBLE_UNTIL: u64 = 1;

/// Keystream seed shared by both endpoints for the default scrambler.
pub const SCRAMBLE_SEED: u64 = 0x9e37_79b9_7f4a_7c15;

/// How often per-stream status reports go out, and the minimum age a sent
/// packet must reach before a MISS request may trigger its retransmission.
pub const STATUS_INTERVAL: Duration = Duration::from_millis(300);

/// Status reports for a stream stop once it has seen no traffic for this
/// long; they resume as soon as traffic flows again.
pub const STATUS_TRAFFIC_WINDOW: Duration = Duration::from_secs(20);

/// Base period of the slow timer driving punches, retries and heartbeats.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// A confirmed tunnel sends a keepalive heartbeat every this many ticks.
pub const HEARTBEAT_TICKS: u64 = 3;

/// Attempt budget shared by the bounded 1/s retry loops: NAT punches,
/// new-stream announcements, FIN1 and FIN2.
pub const RETRY_LIMIT: u32 = 10;

/// A session with no authenticated inbound traffic for this long is expired
/// and renewed; a stream context idle for this long is forced closed.
pub const EXPIRE_AFTER: Duration = Duration::from_secs(1800);

/// The expiry sweep runs every this many ticks.
pub const EXPIRE_SWEEP_TICKS: u64 = 60;

/// An unpaired session re-sends its room registration every this many ticks.
pub const REGISTER_TICKS: u64 = 60;

/// At most this many missing sequence numbers are requested per status
/// round, so a huge gap cannot flood the tunnel with control traffic.
pub const MISS_BREAK: u64 = 120;

/// Aggregate unacked bytes at which a session pauses dequeuing new data.
pub const HIGH_WATER: usize = 128 * 1024 * 1024;

/// Aggregate unacked bytes at which a paused session resumes. Strictly
/// below [`HIGH_WATER`] so throughput near the threshold cannot oscillate.
pub const LOW_WATER: usize = 64 * 1024 * 1024;

/// Longest accepted room identifier, in bytes.
pub const ROOM_LIMIT: usize = 255;

/// Size at which a stream's endpoint-bound write buffer spills to a disk
/// chunk: one thousand full packets worth of bytes.
pub const CHUNK_CAP: usize = MAX_PAYLOAD * 1000;

/// Number of queued outbound records at which a session's outbound queue
/// spills to a disk chunk.
pub const RECORD_SPILL: usize = 1000;
