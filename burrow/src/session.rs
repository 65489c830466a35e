//! One UDP tunnel session.
//!
//! A session owns the tunnel socket and everything scoped to one punched
//! hole: the rendezvous/punch address state, the authentication filter, the
//! pending control and outbound data queues, the flow gauge and the stream
//! registry. Sessions are renewed wholesale — a punch failure or expiry
//! tears the whole thing down and a fresh one binds a fresh ephemeral port.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::rc::Rc;
use std::time::Instant;

use tokio::net::UdpSocket;
use tracing::info;

use burrow_proto::flow::FlowGauge;
use burrow_proto::packet::Control;
use burrow_proto::teardown::Fin2Pending;
use burrow_proto::{EXPIRE_AFTER, HIGH_WATER, LOW_WATER, RECORD_SPILL};

use crate::spool::RecordQueue;
use crate::stream::StreamContext;

pub struct Session {
    pub socket: Rc<UdpSocket>,

    /// Where room registrations go, and the only address `PeerAddr` is
    /// accepted from.
    pub rendezvous_addr: SocketAddr,

    /// The peer's public address as reported by the rendezvous service.
    /// Set at most once; punch heartbeats are aimed here.
    pub candidate_addr: Option<SocketAddr>,

    /// The authenticated remote address: the candidate, once any packet
    /// has actually arrived from it. All sends go here and all receives
    /// are filtered against it.
    pub remote_addr: Option<SocketAddr>,

    pub created_at: Instant,

    /// Last time an authenticated packet arrived; drives expiry.
    pub last_recv_at: Instant,

    /// Pending control messages, each with an explicit destination.
    pub ctl_queue: VecDeque<(SocketAddr, Vec<u8>)>,

    /// Pending new outbound data, spilling to disk under backlog.
    pub outbound: RecordQueue,

    /// Retransmissions owed from MISS requests, `(stream id, sequence)`.
    /// Sent ahead of new data and never gated by the flow gauge.
    pub resendings: VecDeque<(u64, u64)>,

    pub flow: FlowGauge,
    pub streams: HashMap<u64, StreamContext>,

    /// FIN2 retry loops for streams whose contexts are already gone.
    pub fin2_pending: Fin2Pending,

    /// Punch heartbeats sent towards the candidate so far.
    pub punch_attempts: u32,

    /// Slow ticks since creation; schedules heartbeats, registration
    /// refreshes and the expiry sweep.
    pub ticks: u64,
}

impl Session {
    /// Binds a fresh tunnel socket on an ephemeral port and queues the
    /// initial room registration.
    pub async fn create(rendezvous_addr: SocketAddr, room: &str, spool_dir: &Path) -> io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let port = socket.local_addr()?.port();
        info!(port, "tunnel socket bound");

        let now = Instant::now();
        let mut session = Self {
            socket: Rc::new(socket),
            rendezvous_addr,
            candidate_addr: None,
            remote_addr: None,
            created_at: now,
            last_recv_at: now,
            ctl_queue: VecDeque::new(),
            outbound: RecordQueue::new(spool_dir.to_path_buf(), format!("s{port}"), RECORD_SPILL),
            resendings: VecDeque::new(),
            flow: FlowGauge::new(HIGH_WATER, LOW_WATER),
            streams: HashMap::new(),
            fin2_pending: Fin2Pending::new(),
            punch_attempts: 0,
            ticks: 0,
        };

        session.queue_raw(rendezvous_addr, room.as_bytes().to_vec());
        Ok(session)
    }

    /// Queues a control message to the confirmed remote. Silently dropped
    /// while the tunnel is unconfirmed; every such message is either
    /// retried on a timer or meaningless without a peer.
    pub fn queue_ctl(&mut self, control: &Control) {
        if let Some(remote) = self.remote_addr {
            self.ctl_queue.push_back((remote, control.to_datagram()));
        }
    }

    /// Queues raw bytes to an explicit destination (registrations, punch
    /// heartbeats).
    pub fn queue_raw(&mut self, to: SocketAddr, data: Vec<u8>) {
        self.ctl_queue.push_back((to, data));
    }

    /// Validates an inbound packet's source address, confirming the tunnel
    /// on first contact from the candidate. Any accepted packet refreshes
    /// the expiry clock. Packets failing this check must be dropped without
    /// a response.
    pub fn authenticate(&mut self, from: SocketAddr) -> bool {
        match self.remote_addr {
            Some(remote) if from == remote => {
                self.last_recv_at = Instant::now();
                true
            }
            Some(_) => false,
            None => {
                if self.candidate_addr != Some(from) {
                    return false;
                }

                info!(remote = %from, "tunnel confirmed");
                self.remote_addr = Some(from);
                self.last_recv_at = Instant::now();
                true
            }
        }
    }

    /// Whether the confirmed tunnel has gone silent past the expiry window.
    pub fn expired(&self, now: Instant) -> bool {
        self.remote_addr.is_some() && now.duration_since(self.last_recv_at) > EXPIRE_AFTER
    }
}
