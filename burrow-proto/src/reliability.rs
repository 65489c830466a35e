//! Per-stream ordering, acknowledgement and retransmission state.
//!
//! One [`StreamReliability`] lives inside every stream context and tracks
//! both directions of that stream:
//!
//! - Outbound: sequence numbers are assigned when a chunk of local endpoint
//!   data is accepted, starting at 1 and increasing by exactly 1. Built
//!   packets stay in the unacked store from the moment they are transmitted
//!   until the peer's status report acknowledges them; a retransmission
//!   never removes anything, only an acknowledgement does.
//! - Inbound: the highest contiguous sequence accepted so far
//!   (`continue_seq`) splits arrivals into duplicates (at or below it, or
//!   already buffered), the next expected packet (exactly one past it, which
//!   also drains any directly following buffered fragments), and
//!   out-of-order fragments parked in a map until the gap closes.
//!
//! The owner is responsible for clocks and I/O; methods that depend on time
//! take the current [`Instant`] as an argument.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// What became of an inbound data packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Already delivered or already buffered; dropped without effect.
    Duplicate,

    /// Ahead of the contiguous run; parked until the gap closes.
    Fragment,

    /// Extended the contiguous run. `bytes` is the packet's payload followed
    /// by every directly adjacent fragment drained from the buffer, in
    /// sequence order; `continue_seq` is the new highest contiguous value.
    Delivered { bytes: Vec<u8>, continue_seq: u64 },
}

/// Ordering, ack and retransmission state for one logical stream.
#[derive(Debug, Default)]
pub struct StreamReliability {
    /// Highest outbound sequence assigned so far.
    assigned: u64,
    /// Highest outbound sequence actually transmitted so far.
    highest_sent: u64,
    /// Highest sequence the peer has confirmed receiving contiguously.
    acked_continue: u64,
    /// Transmitted-but-unacknowledged packets, keyed by sequence.
    unacked: HashMap<u64, Vec<u8>>,
    /// Last transmission time of each unacked sequence.
    send_stamps: HashMap<u64, Instant>,
    /// Highest contiguous inbound sequence accepted.
    continue_seq: u64,
    /// Out-of-order inbound payloads awaiting the gap to close.
    fragments: BTreeMap<u64, Vec<u8>>,
    /// Highest sequence the peer reports having transmitted.
    peer_highest_sent: u64,
}

impl StreamReliability {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns the next outbound sequence number.
    pub fn assign_seq(&mut self) -> u64 {
        self.assigned += 1;
        self.assigned
    }

    /// Highest outbound sequence assigned so far. This is the stream's final
    /// sequence once the local endpoint has closed.
    pub fn last_assigned(&self) -> u64 {
        self.assigned
    }

    /// Highest outbound sequence transmitted so far, as reported in status.
    pub fn highest_sent(&self) -> u64 {
        self.highest_sent
    }

    /// Highest contiguous inbound sequence accepted so far.
    pub fn continue_seq(&self) -> u64 {
        self.continue_seq
    }

    pub fn note_peer_highest(&mut self, highest: u64) {
        self.peer_highest_sent = self.peer_highest_sent.max(highest);
    }

    pub fn peer_highest_sent(&self) -> u64 {
        self.peer_highest_sent
    }

    /// Records a packet as transmitted: it enters the unacked store with the
    /// given timestamp and stays there until acknowledged.
    pub fn record_sent(&mut self, sequence: u64, packet: Vec<u8>, now: Instant) {
        self.highest_sent = self.highest_sent.max(sequence);
        self.unacked.insert(sequence, packet);
        self.send_stamps.insert(sequence, now);
    }

    /// The stored bytes of a still-unacknowledged packet, for retransmission.
    pub fn unacked_packet(&self, sequence: u64) -> Option<&[u8]> {
        self.unacked.get(&sequence).map(Vec::as_slice)
    }

    pub fn unacked_count(&self) -> usize {
        self.unacked.len()
    }

    /// Releases every unacked packet at or below the peer's reported
    /// contiguous sequence. Returns the number of stored bytes freed, for
    /// the session's flow gauge. Reports older than one already processed
    /// are no-ops.
    pub fn release_acked(&mut self, peer_continue: u64) -> usize {
        if peer_continue <= self.acked_continue {
            return 0;
        }

        let released: Vec<u64> = self.unacked.keys().copied().filter(|&seq| seq <= peer_continue).collect();

        let mut freed = 0;
        for seq in released {
            freed += self.unacked.remove(&seq).map_or(0, |packet| packet.len());
            self.send_stamps.remove(&seq);
        }

        self.acked_continue = peer_continue;
        freed
    }

    /// Processes an inbound data payload.
    pub fn accept(&mut self, sequence: u64, payload: Vec<u8>) -> Inbound {
        if sequence <= self.continue_seq || self.fragments.contains_key(&sequence) {
            return Inbound::Duplicate;
        }

        if sequence != self.continue_seq + 1 {
            self.fragments.insert(sequence, payload);
            return Inbound::Fragment;
        }

        let mut bytes = payload;
        let mut reached = sequence;
        while let Some(next) = self.fragments.remove(&(reached + 1)) {
            bytes.extend_from_slice(&next);
            reached += 1;
        }

        self.continue_seq = reached;
        Inbound::Delivered { bytes, continue_seq: reached }
    }

    /// Computes the gaps between the contiguous run and the peer's reported
    /// highest transmitted sequence, as inclusive ranges derived from the
    /// fragment buffer. At most `cap` missing sequence numbers are named;
    /// the tail of a very large gap waits for the next status round.
    pub fn gap_ranges(&self, cap: u64) -> Vec<(u64, u64)> {
        let mut ranges = Vec::new();
        let mut named = 0u64;
        let mut curr = self.continue_seq + 1;

        for &seq in self.fragments.keys() {
            if seq > curr {
                if named >= cap {
                    return ranges;
                }

                ranges.push((curr, seq - 1));
                named += seq - curr;
            }

            curr = seq + 1;
        }

        if curr <= self.peer_highest_sent && named < cap {
            ranges.push((curr, self.peer_highest_sent));
        }

        ranges
    }

    /// Answers a MISS request for `first..=last`: the sequences still held
    /// in the unacked store whose last transmission is at least `min_age`
    /// old. Chosen sequences are re-stamped with `now`, so overlapping MISS
    /// requests arriving within `min_age` of each other cannot trigger a
    /// second retransmission. A too-recently-sent entry ends the scan; the
    /// rest of the range was sent even later.
    pub fn resendable(&mut self, first: u64, last: u64, now: Instant, min_age: Duration) -> Vec<u64> {
        let mut sequences = Vec::new();

        // Nothing past the highest transmitted sequence can be in the
        // store; clamping also bounds the scan against nonsense ranges.
        let last = last.min(self.highest_sent);

        for seq in first..=last {
            let Some(stamp) = self.send_stamps.get_mut(&seq) else {
                continue;
            };

            if now.duration_since(*stamp) < min_age {
                break;
            }

            *stamp = now;
            sequences.push(seq);
        }

        sequences
    }
}
