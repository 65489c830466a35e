//! Per-stream context: one multiplexed logical connection.

use std::time::Instant;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::AbortHandle;

use burrow_proto::reliability::StreamReliability;
use burrow_proto::teardown::Teardown;

use crate::endpoint::WriteCmd;

/// Everything a worker tracks about one logical stream: the reliability and
/// teardown state machines, the handles to its endpoint tasks, and the
/// pairing/closing flags the event loop steers by.
pub struct StreamContext {
    /// Random nonzero id chosen by the originating side, unique per session.
    pub id: u64,

    /// Whether the peer has confirmed this stream. Always true on the
    /// terminating side; on the originating side set by `Paired`.
    pub paired: bool,

    /// The peer's local dial port from `Paired` (terminating side: our own
    /// dialed socket's port). Informational once nonzero.
    pub dial_port: u16,

    /// New-stream announcements sent so far (originating side).
    pub announce_attempts: u32,

    pub reliability: StreamReliability,
    pub teardown: Teardown,

    /// Data read from the local endpoint before the peer confirmed the
    /// stream. Sequences are already assigned; drained to the session's
    /// outbound queue on pairing.
    pub pending: Vec<(u64, Vec<u8>)>,

    /// Last time this stream moved traffic in either direction.
    pub last_activity: Instant,

    /// Command channel of the writer task. Dropping it makes the writer
    /// flush and shut the endpoint down.
    pub writer: UnboundedSender<WriteCmd>,

    /// Abort handle of the reader task.
    pub reader_abort: AbortHandle,

    /// `Finish` has been sent to the writer; inbound data for this stream
    /// is dropped from here on.
    pub finishing: bool,

    /// The endpoint is fully closed: reader gone, writer flushed and shut
    /// down. The context only remains for the close handshake.
    pub endpoint_closed: bool,
}

impl StreamContext {
    pub fn new(id: u64, writer: UnboundedSender<WriteCmd>, reader_abort: AbortHandle, paired: bool) -> Self {
        Self {
            id,
            paired,
            dial_port: 0,
            announce_attempts: 0,
            reliability: StreamReliability::new(),
            teardown: Teardown::new(),
            pending: Vec::new(),
            last_activity: Instant::now(),
            writer,
            reader_abort,
            finishing: false,
            endpoint_closed: false,
        }
    }

    /// Starts closing the local endpoint: the reader stops immediately, the
    /// writer flushes its backlog and then shuts the endpoint down,
    /// reporting back to the worker when done. Idempotent.
    pub fn begin_endpoint_close(&mut self) {
        if self.finishing {
            return;
        }

        self.finishing = true;
        self.reader_abort.abort();
        let _ = self.writer.send(WriteCmd::Finish);
    }
}
