//! The endpoint workers driving a tunnel.
//!
//! Both roles run the same single-threaded event loop: one task owns the
//! session and the stream registry outright and selects over the tunnel
//! socket, its event mailbox and two timers. Auxiliary tasks — endpoint
//! readers and writers, the origin's accept loop, the terminus's dial
//! attempts — never touch that state; they only post [`Event`]s into the
//! mailbox, which both wakes the loop and serializes their effects with
//! everything else.
//!
//! [`Relay`] is the role-independent core: datagram dispatch, the
//! reliability and flow-control plumbing, the close handshake, timers and
//! session renewal. What differs between the roles is who creates streams
//! (the origin accepts local connections and announces them; the terminus
//! answers announcements by dialing the destination), kept in the
//! [`origin`] and [`terminus`] modules.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Instant;

use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, info, trace, warn};

use burrow_proto::packet::{data_packet, Control, Packet};
use burrow_proto::reliability::Inbound;
use burrow_proto::scramble::{Scramble, XorScramble};
use burrow_proto::teardown::CloseAction;
use burrow_proto::{
    EXPIRE_AFTER, EXPIRE_SWEEP_TICKS, HEARTBEAT_TICKS, MISS_BREAK, REGISTER_TICKS, RETRY_LIMIT, SCRAMBLE_SEED,
    SCRAMBLE_UNTIL, STATUS_INTERVAL, STATUS_TRAFFIC_WINDOW,
};

use crate::endpoint::WriteCmd;
use crate::session::Session;
use crate::spool::Record;
use crate::stream::StreamContext;

pub mod origin;
pub mod terminus;

/// Mailbox messages posted to a worker by its auxiliary tasks.
#[derive(Debug)]
pub enum Event {
    /// The origin's accept loop took a new local connection.
    Accepted(TcpStream),

    /// A terminus dial attempt concluded.
    DialDone { stream_id: u64, result: io::Result<TcpStream> },

    /// A reader task pulled a chunk from its local endpoint.
    LocalData { stream_id: u64, data: Vec<u8> },

    /// A reader task saw end-of-stream.
    LocalEof { stream_id: u64 },

    /// A reader task failed; treated the same as end-of-stream.
    LocalError { stream_id: u64, error: io::Error },

    /// A writer task flushed everything and shut its endpoint down.
    WriterFinished { stream_id: u64 },

    /// A writer task failed (endpoint write or spool); the endpoint is as
    /// closed as it will ever be.
    WriterError { stream_id: u64, error: io::Error },
}

/// Control packets the shared dispatch hands to the role-specific layer.
#[derive(Debug, Clone, Copy)]
pub enum RoleMsg {
    /// The peer announced a new stream (terminus handles this).
    NewStream { stream_id: u64 },

    /// The peer confirmed a stream announcement (origin handles this).
    Paired { stream_id: u64, dial_port: u16 },
}

/// The role-independent core of an endpoint worker.
pub struct Relay {
    pub session: Session,
    rendezvous_addr: SocketAddr,
    room: String,
    pub spool_dir: PathBuf,
    scramble: Box<dyn Scramble>,
    /// The session is beyond use (expired, punch failed, peer sent
    /// session-FIN, disk error); renewed at the end of the loop iteration.
    dead: bool,
}

impl Relay {
    pub async fn new(rendezvous_addr: SocketAddr, room: String, spool_dir: PathBuf) -> io::Result<Self> {
        let session = Session::create(rendezvous_addr, &room, &spool_dir).await?;

        Ok(Self {
            session,
            rendezvous_addr,
            room,
            spool_dir,
            scramble: Box::new(XorScramble::new(SCRAMBLE_SEED)),
            dead: false,
        })
    }

    /// The tunnel socket, cloned out so the select loop can receive on it
    /// without borrowing the relay.
    pub fn socket(&self) -> Rc<UdpSocket> {
        Rc::clone(&self.session.socket)
    }

    pub fn mark_dead(&mut self) {
        self.dead = true;
    }

    /// Tears down a dead session and starts over: every stream is closed,
    /// leftover chunks are deleted, and a fresh socket on a fresh ephemeral
    /// port re-registers with the rendezvous service.
    pub async fn renew_if_dead(&mut self) -> io::Result<()> {
        if !self.dead {
            return Ok(());
        }

        info!("renewing tunnel session");
        self.close_all_streams();
        self.session.outbound.discard_chunks();
        self.session = Session::create(self.rendezvous_addr, &self.room, &self.spool_dir).await?;
        self.dead = false;
        Ok(())
    }

    /// Graceful shutdown: tell the peer the whole session is over, then
    /// release everything.
    pub async fn shutdown(&mut self) {
        if let Some(remote) = self.session.remote_addr {
            let socket = Rc::clone(&self.session.socket);
            let _ = socket.send_to(&Control::SessionFin.to_datagram(), remote).await;
        }

        self.close_all_streams();
        self.session.outbound.discard_chunks();
    }

    fn close_all_streams(&mut self) {
        for (_, ctx) in self.session.streams.drain() {
            // Dropping the writer sender flushes and closes the endpoint;
            // the reader must be stopped explicitly.
            ctx.reader_abort.abort();
        }
    }

    /// Dispatches one received datagram. Returns a [`RoleMsg`] for the
    /// control codes only one role knows what to do with.
    pub fn handle_datagram(&mut self, buf: &[u8], from: SocketAddr) -> Option<RoleMsg> {
        let packet = match Packet::parse(buf) {
            Ok(packet) => packet,
            Err(error) => {
                debug!(%from, %error, "dropping malformed datagram");
                return None;
            }
        };

        // The peer address delivery is the one packet not judged against
        // the tunnel peer: it must come from the rendezvous service, and
        // only the first one counts.
        if let Packet::Control(Control::PeerAddr(peer)) = &packet {
            let peer = *peer;
            if from != self.rendezvous_addr || self.session.candidate_addr.is_some() {
                debug!(%from, "ignoring peer address");
                return None;
            }

            info!(%peer, "got peer address, punching");
            self.session.candidate_addr = Some(peer);
            self.session.punch_attempts = 1;
            self.session.queue_raw(peer, Control::Heartbeat(rand::random()).to_datagram());
            return None;
        }

        if !self.session.authenticate(from) {
            debug!(%from, "dropping datagram from unauthenticated source");
            return None;
        }

        match packet {
            Packet::Data { sequence, stream_id, payload } => {
                self.on_data(sequence, stream_id, payload);
                None
            }
            Packet::Control(control) => match control {
                Control::PeerAddr(_) | Control::Heartbeat(_) => None,
                Control::NewStream { stream_id } => Some(RoleMsg::NewStream { stream_id }),
                Control::Paired { stream_id, dial_port } => Some(RoleMsg::Paired { stream_id, dial_port }),
                Control::Status { stream_id, highest_sent, continue_seq } => {
                    self.on_status(stream_id, highest_sent, continue_seq);
                    None
                }
                Control::Miss { stream_id, first, last } => {
                    self.on_miss(stream_id, first, last);
                    None
                }
                Control::Fin1 { stream_id, highest_sent, continue_seq } => {
                    self.on_fin1(stream_id, highest_sent, continue_seq);
                    None
                }
                Control::GotFin1 { stream_id } => {
                    if let Some(ctx) = self.session.streams.get_mut(&stream_id) {
                        ctx.teardown.on_got_fin1();
                    }
                    None
                }
                Control::Fin2 { stream_id } => {
                    self.on_fin2(stream_id);
                    None
                }
                Control::GotFin2 { stream_id } => {
                    self.session.fin2_pending.acked(stream_id);
                    None
                }
                Control::SessionFin => {
                    info!("peer closed the session");
                    self.mark_dead();
                    None
                }
            },
        }
    }

    fn on_data(&mut self, sequence: u64, stream_id: u64, payload: &[u8]) {
        let Some(ctx) = self.session.streams.get_mut(&stream_id) else {
            trace!(stream = stream_id, "data for unknown stream");
            return;
        };

        if ctx.finishing {
            return;
        }

        let payload = if sequence <= SCRAMBLE_UNTIL {
            self.scramble.decode(payload)
        } else {
            payload.to_vec()
        };

        match ctx.reliability.accept(sequence, payload) {
            Inbound::Duplicate | Inbound::Fragment => {}
            Inbound::Delivered { bytes, continue_seq } => {
                ctx.last_activity = Instant::now();
                let _ = ctx.writer.send(WriteCmd::Data(bytes));

                // With the peer's endpoint closed and its final sequence now
                // reached, nothing more will arrive: drain and close ours.
                if ctx.teardown.drained(continue_seq) {
                    ctx.begin_endpoint_close();
                }
            }
        }
    }

    fn on_status(&mut self, stream_id: u64, peer_highest: u64, peer_continue: u64) {
        let Some(ctx) = self.session.streams.get_mut(&stream_id) else {
            return;
        };

        let freed = ctx.reliability.release_acked(peer_continue);
        ctx.reliability.note_peer_highest(peer_highest);

        self.session.flow.on_released(freed);
        self.queue_gap_misses(stream_id);
    }

    /// Requests retransmission of whatever is missing between the
    /// contiguous run and the peer's reported highest sequence. The peer's
    /// per-sequence send stamps keep overlapping requests from triggering
    /// duplicate retransmissions.
    fn queue_gap_misses(&mut self, stream_id: u64) {
        let Some(ctx) = self.session.streams.get_mut(&stream_id) else {
            return;
        };

        if ctx.finishing || ctx.reliability.continue_seq() >= ctx.reliability.peer_highest_sent() {
            return;
        }

        let gaps = ctx.reliability.gap_ranges(MISS_BREAK);
        for (first, last) in gaps {
            self.session.queue_ctl(&Control::Miss { stream_id, first, last });
        }
    }

    fn on_miss(&mut self, stream_id: u64, first: u64, last: u64) {
        let Some(ctx) = self.session.streams.get_mut(&stream_id) else {
            return;
        };

        let sequences = ctx.reliability.resendable(first, last, Instant::now(), STATUS_INTERVAL);
        for sequence in sequences {
            self.session.resendings.push_back((stream_id, sequence));
        }
    }

    fn on_fin1(&mut self, stream_id: u64, peer_final: u64, peer_continue: u64) {
        // Answered even for a deleted context, so the peer's retry loop
        // terminates after a crossed close.
        self.session.queue_ctl(&Control::GotFin1 { stream_id });

        let mut freed = 0;
        let mut crossed = false;

        if let Some(ctx) = self.session.streams.get_mut(&stream_id) {
            debug!(stream = stream_id, final_seq = peer_final, "peer closed stream");
            ctx.teardown.on_fin1(peer_final);
            ctx.reliability.note_peer_highest(peer_final);
            freed = ctx.reliability.release_acked(peer_continue);

            if ctx.endpoint_closed {
                crossed = true;
            } else if ctx.teardown.drained(ctx.reliability.continue_seq()) {
                ctx.begin_endpoint_close();
            }
        }

        self.session.flow.on_released(freed);
        // The peer's status reports will dry up now that its endpoint is
        // gone; its final sequence drives the remaining gap fill.
        self.queue_gap_misses(stream_id);

        if crossed {
            self.delete_stream(stream_id);
            self.session.fin2_pending.begin(stream_id);
            self.session.queue_ctl(&Control::Fin2 { stream_id });
        }
    }

    fn on_fin2(&mut self, stream_id: u64) {
        // Like GOT_FIN1 this is answered unconditionally; after a
        // simultaneous close both sides run a FIN2 loop against a peer that
        // already deleted the stream.
        self.session.queue_ctl(&Control::GotFin2 { stream_id });

        if self.session.streams.contains_key(&stream_id) {
            debug!(stream = stream_id, "stream closed by peer");
            self.delete_stream(stream_id);
        }
    }

    /// Handles the mailbox events common to both roles. `Accepted` and
    /// `DialDone` must be taken out by the role loop beforehand.
    pub fn handle_common_event(&mut self, event: Event) {
        match event {
            Event::LocalData { stream_id, data } => self.on_local_data(stream_id, data),
            Event::LocalEof { stream_id } => self.on_local_closed(stream_id),
            Event::LocalError { stream_id, error } => {
                debug!(stream = stream_id, %error, "local endpoint error");
                self.on_local_closed(stream_id);
            }
            Event::WriterFinished { stream_id } => self.on_endpoint_closed(stream_id),
            Event::WriterError { stream_id, error } => {
                debug!(stream = stream_id, %error, "endpoint writer failed");
                if let Some(ctx) = self.session.streams.get_mut(&stream_id) {
                    ctx.finishing = true;
                    ctx.reader_abort.abort();
                }
                self.on_endpoint_closed(stream_id);
            }
            Event::Accepted(_) | Event::DialDone { .. } => unreachable!("role event reached the shared handler"),
        }
    }

    fn on_local_data(&mut self, stream_id: u64, data: Vec<u8>) {
        let Some(ctx) = self.session.streams.get_mut(&stream_id) else {
            return;
        };

        if ctx.finishing {
            return;
        }

        let sequence = ctx.reliability.assign_seq();
        ctx.last_activity = Instant::now();

        if !ctx.paired {
            // The peer has not confirmed the stream yet; nothing may be
            // transmitted, but nothing is dropped either.
            ctx.pending.push((sequence, data));
            return;
        }

        let record = Record { stream_id, sequence, payload: data };
        if let Err(error) = self.session.outbound.push(record) {
            warn!(%error, "outbound spool failed, closing session");
            self.mark_dead();
        }
    }

    /// The local endpoint's read side ended (EOF or error): stop reading
    /// and have the writer flush and close. The close handshake starts once
    /// the writer reports back.
    fn on_local_closed(&mut self, stream_id: u64) {
        if let Some(ctx) = self.session.streams.get_mut(&stream_id) {
            ctx.begin_endpoint_close();
        }
    }

    /// The endpoint is fully closed; enter the close handshake.
    fn on_endpoint_closed(&mut self, stream_id: u64) {
        let Some(ctx) = self.session.streams.get_mut(&stream_id) else {
            return;
        };

        ctx.finishing = true;
        ctx.endpoint_closed = true;

        if !ctx.paired {
            // The peer never learned about this stream; nothing to hand
            // shake over.
            self.delete_stream(stream_id);
            return;
        }

        match ctx.teardown.on_endpoint_closed() {
            CloseAction::SendFin1 => {
                let control = Control::Fin1 {
                    stream_id,
                    highest_sent: ctx.reliability.last_assigned(),
                    continue_seq: ctx.reliability.continue_seq(),
                };
                debug!(stream = stream_id, "local endpoint closed, sending FIN1");
                self.session.queue_ctl(&control);
            }
            CloseAction::SendFin2AndDelete => {
                debug!(stream = stream_id, "drained after peer close, sending FIN2");
                self.delete_stream(stream_id);
                self.session.fin2_pending.begin(stream_id);
                self.session.queue_ctl(&Control::Fin2 { stream_id });
            }
        }
    }

    pub fn delete_stream(&mut self, stream_id: u64) {
        if let Some(ctx) = self.session.streams.remove(&stream_id) {
            ctx.reader_abort.abort();
        }
    }

    /// The once-per-second timer: punch and registration retries,
    /// keepalive heartbeats, FIN retry loops and the expiry sweep.
    pub fn on_slow_tick(&mut self) {
        self.session.ticks += 1;
        let now = Instant::now();

        if self.session.remote_addr.is_some() {
            if self.session.ticks % HEARTBEAT_TICKS == 0 {
                self.session.queue_ctl(&Control::Heartbeat(rand::random()));
            }
        } else if let Some(candidate) = self.session.candidate_addr {
            if self.session.punch_attempts >= RETRY_LIMIT {
                warn!(%candidate, "NAT punch exhausted its attempts");
                self.mark_dead();
                return;
            }

            self.session.punch_attempts += 1;
            self.session.queue_raw(candidate, Control::Heartbeat(rand::random()).to_datagram());
        } else if self.session.ticks % REGISTER_TICKS == 0 {
            debug!("refreshing room registration");
            let rendezvous = self.rendezvous_addr;
            self.session.queue_raw(rendezvous, self.room.as_bytes().to_vec());
        }

        let mut fin1s = Vec::new();
        for (&stream_id, ctx) in self.session.streams.iter_mut() {
            if ctx.teardown.fin1_due(RETRY_LIMIT) {
                fin1s.push(Control::Fin1 {
                    stream_id,
                    highest_sent: ctx.reliability.last_assigned(),
                    continue_seq: ctx.reliability.continue_seq(),
                });
            }
        }
        for control in fin1s {
            self.session.queue_ctl(&control);
        }

        for stream_id in self.session.fin2_pending.due(RETRY_LIMIT) {
            self.session.queue_ctl(&Control::Fin2 { stream_id });
        }

        if self.session.ticks % EXPIRE_SWEEP_TICKS == 0 {
            if self.session.expired(now) {
                warn!("tunnel expired without traffic");
                self.mark_dead();
                return;
            }

            let stale: Vec<u64> = self
                .session
                .streams
                .iter()
                .filter(|(_, ctx)| now.duration_since(ctx.last_activity) > EXPIRE_AFTER)
                .map(|(&stream_id, _)| stream_id)
                .collect();

            for stream_id in stale {
                debug!(stream = stream_id, "expiring idle stream");
                if let Some(ctx) = self.session.streams.get_mut(&stream_id) {
                    if ctx.endpoint_closed {
                        self.delete_stream(stream_id);
                    } else {
                        ctx.begin_endpoint_close();
                    }
                }
            }
        }
    }

    /// The 300 ms timer: per-stream status reports while traffic is
    /// recent, and the flow-control resume check.
    pub fn on_status_tick(&mut self) {
        let now = Instant::now();
        let mut reports = Vec::new();
        let mut closed_with_gaps = Vec::new();

        for (&stream_id, ctx) in &self.session.streams {
            if ctx.paired && now.duration_since(ctx.last_activity) < STATUS_TRAFFIC_WINDOW {
                reports.push(Control::Status {
                    stream_id,
                    highest_sent: ctx.reliability.highest_sent(),
                    continue_seq: ctx.reliability.continue_seq(),
                });
            }

            // A closed peer no longer reports status; keep chasing its
            // remaining packets from here.
            if ctx.teardown.remote_closed() && !ctx.finishing {
                closed_with_gaps.push(stream_id);
            }
        }

        for control in reports {
            self.session.queue_ctl(&control);
        }

        for stream_id in closed_with_gaps {
            self.queue_gap_misses(stream_id);
        }

        if self.session.flow.try_resume() {
            info!(unacked = self.session.flow.unacked_bytes(), "resuming tunnel transmission");
        }
    }

    /// Drains the pending queues out of the socket: control messages
    /// first, then owed retransmissions, then — unless the flow gauge says
    /// pause — new data from the outbound queue. Any socket or spool error
    /// here kills the session.
    pub async fn flush(&mut self) {
        if self.dead {
            return;
        }

        while let Some((to, data)) = self.session.ctl_queue.pop_front() {
            let socket = Rc::clone(&self.session.socket);
            if let Err(error) = socket.send_to(&data, to).await {
                warn!(%error, "tunnel send failed, closing session");
                self.mark_dead();
                return;
            }
        }

        let Some(remote) = self.session.remote_addr else {
            return;
        };

        while let Some((stream_id, sequence)) = self.session.resendings.pop_front() {
            let packet = match self.session.streams.get(&stream_id) {
                Some(ctx) => match ctx.reliability.unacked_packet(sequence) {
                    Some(packet) => packet.to_vec(),
                    // Acknowledged in the meantime; nothing to resend.
                    None => continue,
                },
                None => continue,
            };

            trace!(stream = stream_id, sequence, "retransmitting");
            let socket = Rc::clone(&self.session.socket);
            if let Err(error) = socket.send_to(&packet, remote).await {
                warn!(%error, "tunnel send failed, closing session");
                self.mark_dead();
                return;
            }
        }

        loop {
            let was_paused = self.session.flow.is_paused();
            if self.session.flow.should_pause() {
                if !was_paused {
                    info!(unacked = self.session.flow.unacked_bytes(), "pausing tunnel transmission");
                }
                return;
            }

            let record = match self.session.outbound.next() {
                Ok(Some(record)) => record,
                Ok(None) => return,
                Err(error) => {
                    warn!(%error, "outbound spool failed, closing session");
                    self.mark_dead();
                    return;
                }
            };

            // The stream may be gone by the time its backlog surfaces.
            if !self.session.streams.contains_key(&record.stream_id) {
                continue;
            }

            let payload = if record.sequence <= SCRAMBLE_UNTIL {
                self.scramble.encode(&record.payload)
            } else {
                record.payload
            };
            let packet = data_packet(record.sequence, record.stream_id, &payload);

            let socket = Rc::clone(&self.session.socket);
            if let Err(error) = socket.send_to(&packet, remote).await {
                warn!(%error, "tunnel send failed, closing session");
                self.mark_dead();
                return;
            }

            let now = Instant::now();
            self.session.flow.on_sent(packet.len());
            if let Some(ctx) = self.session.streams.get_mut(&record.stream_id) {
                ctx.reliability.record_sent(record.sequence, packet, now);
                ctx.last_activity = now;
            }
        }
    }

    /// Registers a fresh stream context around an endpoint's task handles.
    pub fn insert_stream(&mut self, ctx: StreamContext) {
        self.session.streams.insert(ctx.id, ctx);
    }
}
