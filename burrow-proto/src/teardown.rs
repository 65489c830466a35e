//! The two-phase per-stream close handshake.
//!
//! Closing is cooperative and symmetric: whichever side's local endpoint
//! closes first announces FIN1 (retried once per second until GOT_FIN1);
//! the other side drains the remaining data, closes its own endpoint, then
//! deletes its context and announces FIN2 (retried until GOT_FIN2), upon
//! which the first side deletes its context too:
//!
//! ```text
//! A: endpoint closed ──FIN1──▶ B: reply GOT_FIN1, drain, close endpoint
//! A: keep context    ◀─FIN2── B: delete context, retry until GOT_FIN2
//! A: delete context  ──GOT_FIN2──▶
//! ```
//!
//! When both endpoints close at once the FIN1s cross: each side answers
//! GOT_FIN1, finds its endpoint already closed, and proceeds straight to
//! the FIN2 loop. GOT_FIN2 is also sent for stream ids that no longer have
//! a context, so the crossed case converges.
//!
//! [`Teardown`] lives inside a stream context and tracks that stream's
//! close progress; [`Fin2Pending`] outlives contexts (FIN2 is retried
//! *after* deletion) and is owned by the session.

use std::collections::HashMap;

/// What the owner must do when the local endpoint has fully closed (reader
/// gone and writer flushed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    /// The peer has not announced closing: start the FIN1 retry loop and
    /// keep the context around for the peer's eventual FIN2.
    SendFin1,

    /// The peer's FIN1 was already recorded: delete the context now and
    /// start the FIN2 retry loop.
    SendFin2AndDelete,
}

/// Close-handshake progress of one stream.
#[derive(Debug, Default)]
pub struct Teardown {
    local_closed: bool,
    fin1_acked: bool,
    fin1_attempts: u32,
    remote_closed: bool,
    remote_final_seq: u64,
}

impl Teardown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the local endpoint has closed and FIN1 has been announced.
    pub fn local_closed(&self) -> bool {
        self.local_closed
    }

    /// Whether the peer has announced closing via FIN1.
    pub fn remote_closed(&self) -> bool {
        self.remote_closed
    }

    /// The peer's final sequence number. Meaningful only once
    /// [`Teardown::remote_closed`] is true.
    pub fn remote_final_seq(&self) -> u64 {
        self.remote_final_seq
    }

    /// The local endpoint has fully closed; returns which half of the
    /// handshake to enter.
    pub fn on_endpoint_closed(&mut self) -> CloseAction {
        if self.remote_closed {
            CloseAction::SendFin2AndDelete
        } else {
            self.local_closed = true;
            self.fin1_attempts = 1;
            CloseAction::SendFin1
        }
    }

    /// Records the peer's FIN1 and its final sequence number.
    pub fn on_fin1(&mut self, final_seq: u64) {
        self.remote_closed = true;
        self.remote_final_seq = final_seq;
    }

    /// The peer acknowledged FIN1; the retry loop stops.
    pub fn on_got_fin1(&mut self) {
        self.fin1_acked = true;
    }

    /// Ticked once per second: whether another FIN1 should go out. Counts
    /// against the attempt budget; once exhausted the stream waits for the
    /// peer's FIN2 or the expiry sweep.
    pub fn fin1_due(&mut self, limit: u32) -> bool {
        if self.local_closed && !self.fin1_acked && self.fin1_attempts < limit {
            self.fin1_attempts += 1;
            return true;
        }

        false
    }

    /// Whether everything the peer will ever send has been accepted
    /// contiguously. Always false before the peer announces closing.
    pub fn drained(&self, continue_seq: u64) -> bool {
        self.remote_closed && continue_seq >= self.remote_final_seq
    }
}

/// The session-level FIN2 retry set. A stream's context is already deleted
/// while its FIN2 is still being retried, so this state lives beside the
/// stream registry rather than in it.
#[derive(Debug, Default)]
pub struct Fin2Pending {
    attempts: HashMap<u64, u32>,
}

impl Fin2Pending {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the retry loop for a stream (the first FIN2 counts as sent).
    pub fn begin(&mut self, stream_id: u64) {
        self.attempts.insert(stream_id, 1);
    }

    /// GOT_FIN2 arrived; the loop for this stream stops.
    pub fn acked(&mut self, stream_id: u64) {
        self.attempts.remove(&stream_id);
    }

    /// Ticked once per second: the stream ids whose FIN2 should go out
    /// again. Streams that exhaust the attempt budget are dropped; the peer
    /// has its own expiry sweep.
    pub fn due(&mut self, limit: u32) -> Vec<u64> {
        let mut resend = Vec::new();

        self.attempts.retain(|&stream_id, attempts| {
            if *attempts >= limit {
                return false;
            }

            *attempts += 1;
            resend.push(stream_id);
            true
        });

        resend
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RETRY_LIMIT;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Msg {
        Fin1 { final_seq: u64 },
        GotFin1,
        Fin2,
        GotFin2,
    }

    /// One endpoint worker's view of a single stream, reduced to the close
    /// handshake: the same transitions the real workers perform, minus the
    /// data plane (draining is instantaneous here).
    struct Side {
        teardown: Teardown,
        context_alive: bool,
        endpoint_open: bool,
        fin2: Fin2Pending,
        outbox: Vec<Msg>,
    }

    impl Side {
        fn new() -> Self {
            Side {
                teardown: Teardown::new(),
                context_alive: true,
                endpoint_open: true,
                fin2: Fin2Pending::new(),
                outbox: Vec::new(),
            }
        }

        /// The local endpoint finished closing (reader gone, writer flushed).
        fn endpoint_closed(&mut self) {
            self.endpoint_open = false;
            match self.teardown.on_endpoint_closed() {
                CloseAction::SendFin1 => self.outbox.push(Msg::Fin1 { final_seq: 0 }),
                CloseAction::SendFin2AndDelete => {
                    self.context_alive = false;
                    self.fin2.begin(7);
                    self.outbox.push(Msg::Fin2);
                }
            }
        }

        fn recv(&mut self, msg: Msg) {
            match msg {
                Msg::Fin1 { final_seq } => {
                    // GOT_FIN1 goes out even for a deleted context, so the
                    // peer's retry loop always terminates.
                    self.outbox.push(Msg::GotFin1);

                    if !self.context_alive {
                        return;
                    }

                    self.teardown.on_fin1(final_seq);
                    if self.endpoint_open {
                        // Everything is drained in this model; close now.
                        self.endpoint_closed();
                    } else if self.teardown.local_closed() {
                        // Crossed FIN1s: our endpoint is long gone.
                        self.context_alive = false;
                        self.fin2.begin(7);
                        self.outbox.push(Msg::Fin2);
                    }
                }
                Msg::GotFin1 => self.teardown.on_got_fin1(),
                Msg::Fin2 => {
                    self.outbox.push(Msg::GotFin2);
                    self.context_alive = false;
                }
                Msg::GotFin2 => self.fin2.acked(7),
            }
        }

        fn tick(&mut self) {
            if self.teardown.fin1_due(RETRY_LIMIT) {
                self.outbox.push(Msg::Fin1 { final_seq: 0 });
            }

            for _ in self.fin2.due(RETRY_LIMIT) {
                self.outbox.push(Msg::Fin2);
            }
        }

        fn done(&self) -> bool {
            !self.context_alive && self.fin2.is_empty()
        }
    }

    /// Runs both sides to quiescence. `drop_first` states how many messages
    /// to lose off the front of the combined delivery sequence, exercising
    /// the retry loops.
    fn converge(a: &mut Side, b: &mut Side, mut drop_first: u32) {
        for _ in 0..200 {
            let mut moved = false;

            for msg in a.outbox.drain(..).collect::<Vec<_>>() {
                moved = true;
                if drop_first > 0 {
                    drop_first -= 1;
                } else {
                    b.recv(msg);
                }
            }

            for msg in b.outbox.drain(..).collect::<Vec<_>>() {
                moved = true;
                if drop_first > 0 {
                    drop_first -= 1;
                } else {
                    a.recv(msg);
                }
            }

            if a.done() && b.done() {
                return;
            }

            if !moved {
                a.tick();
                b.tick();
            }
        }

        panic!("teardown failed to converge: a={:?} b={:?}", a.done(), b.done());
    }

    #[test]
    fn one_sided_close_deletes_both_contexts() {
        let mut a = Side::new();
        let mut b = Side::new();

        a.endpoint_closed();
        converge(&mut a, &mut b, 0);

        assert!(!a.context_alive && !b.context_alive);
    }

    #[test]
    fn simultaneous_close_converges() {
        let mut a = Side::new();
        let mut b = Side::new();

        a.endpoint_closed();
        b.endpoint_closed();
        converge(&mut a, &mut b, 0);

        assert!(!a.context_alive && !b.context_alive);
    }

    #[test]
    fn lost_messages_are_retried_until_the_handshake_completes() {
        // Dropping each prefix of the delivery sequence covers a lost FIN1,
        // a lost GOT_FIN1, a lost FIN2 and a lost GOT_FIN2 in turn.
        for lost in 1..=4 {
            let mut a = Side::new();
            let mut b = Side::new();

            a.endpoint_closed();
            converge(&mut a, &mut b, lost);

            assert!(!a.context_alive && !b.context_alive, "lost={lost}");
        }
    }

    #[test]
    fn lossy_simultaneous_close_converges() {
        for lost in 1..=4 {
            let mut a = Side::new();
            let mut b = Side::new();

            a.endpoint_closed();
            b.endpoint_closed();
            converge(&mut a, &mut b, lost);

            assert!(!a.context_alive && !b.context_alive, "lost={lost}");
        }
    }

    #[test]
    fn stray_fin1_after_deletion_is_answered_without_revival() {
        let mut a = Side::new();
        let mut b = Side::new();

        a.endpoint_closed();
        converge(&mut a, &mut b, 0);

        b.recv(Msg::Fin1 { final_seq: 0 });
        assert_eq!(b.outbox, vec![Msg::GotFin1]);
        assert!(!b.context_alive);
    }

    #[test]
    fn fin1_retries_stop_after_ack_and_after_the_budget() {
        let mut teardown = Teardown::new();
        assert_eq!(teardown.on_endpoint_closed(), CloseAction::SendFin1);

        // The initial send consumed one attempt.
        let mut sent = 1;
        while teardown.fin1_due(RETRY_LIMIT) {
            sent += 1;
        }
        assert_eq!(sent, RETRY_LIMIT);

        let mut acked = Teardown::new();
        assert_eq!(acked.on_endpoint_closed(), CloseAction::SendFin1);
        acked.on_got_fin1();
        assert!(!acked.fin1_due(RETRY_LIMIT));
    }

    #[test]
    fn drained_needs_the_remote_final_sequence() {
        let mut teardown = Teardown::new();
        assert!(!teardown.drained(u64::MAX));

        teardown.on_fin1(12);
        assert!(!teardown.drained(11));
        assert!(teardown.drained(12));
    }

    #[test]
    fn fin2_retry_set_gives_up_after_the_budget() {
        let mut fin2 = Fin2Pending::new();
        fin2.begin(42);

        let mut sent = 1;
        loop {
            let due = fin2.due(RETRY_LIMIT);
            if due.is_empty() {
                break;
            }
            assert_eq!(due, vec![42]);
            sent += 1;
        }

        assert_eq!(sent, RETRY_LIMIT);
        assert!(fin2.is_empty());
    }
}
