//! The terminating endpoint worker: the process sitting next to the
//! service being exposed.
//!
//! It answers the peer's new-stream announcements by dialing the fixed
//! destination address. A successful dial registers the stream and replies
//! with a pairing confirmation carrying the dialed socket's local port; a
//! dial that stays refused through its retry budget replies with the 0
//! sentinel, telling the originator to abandon the stream id.

use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};

use burrow_proto::packet::Control;
use burrow_proto::{STATUS_INTERVAL, TICK_INTERVAL};

use crate::endpoint;
use crate::stream::StreamContext;
use crate::worker::{Event, Relay, RoleMsg};

/// Connect attempts per announced stream before giving up on the
/// destination and sending the pairing failure sentinel.
const DIAL_ATTEMPTS: u32 = 3;

pub struct TerminusConfig {
    pub rendezvous: SocketAddr,
    pub room: String,
    pub destination: SocketAddr,
    pub spool_dir: PathBuf,
}

pub async fn run(config: TerminusConfig) -> io::Result<()> {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut relay = Relay::new(config.rendezvous, config.room, config.spool_dir).await?;
    info!(destination = %config.destination, "terminus ready");

    // Streams with a dial task in flight; announcements for them are
    // answered once the dial concludes.
    let mut dialing: HashSet<u64> = HashSet::new();

    let mut slow_tick = interval(TICK_INTERVAL);
    let mut status_tick = interval(STATUS_INTERVAL);
    slow_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    status_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut buf = vec![0u8; 2048];

    loop {
        let socket = relay.socket();

        select! {
            biased;
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                relay.shutdown().await;
                break;
            }
            received = socket.recv_from(&mut buf) => match received {
                Ok((count, from)) => {
                    if let Some(msg) = relay.handle_datagram(&buf[..count], from) {
                        handle_role_msg(&mut relay, &mut dialing, &events_tx, config.destination, msg);
                    }
                }
                Err(error) => {
                    warn!(%error, "tunnel receive failed");
                    relay.mark_dead();
                }
            },
            Some(event) = events_rx.recv() => match event {
                Event::DialDone { stream_id, result } => {
                    dialing.remove(&stream_id);
                    on_dial_done(&mut relay, &events_tx, stream_id, result);
                }
                event => relay.handle_common_event(event),
            },
            _ = slow_tick.tick() => relay.on_slow_tick(),
            _ = status_tick.tick() => relay.on_status_tick(),
        }

        relay.flush().await;
        relay.renew_if_dead().await?;
    }

    Ok(())
}

fn handle_role_msg(
    relay: &mut Relay,
    dialing: &mut HashSet<u64>,
    events_tx: &UnboundedSender<Event>,
    destination: SocketAddr,
    msg: RoleMsg,
) {
    let RoleMsg::NewStream { stream_id } = msg else {
        debug!("ignoring control message meant for the originating side");
        return;
    };

    // Announcements are retried by the peer; for a stream already set up
    // just re-send the confirmation (the first one may have been lost).
    if let Some(ctx) = relay.session.streams.get(&stream_id) {
        let dial_port = ctx.dial_port;
        relay.session.queue_ctl(&Control::Paired { stream_id, dial_port });
        return;
    }

    if stream_id == 0 || !dialing.insert(stream_id) {
        return;
    }

    debug!(stream = stream_id, "peer announced a stream, dialing destination");
    let events_tx = events_tx.clone();
    tokio::task::spawn_local(async move {
        let mut last_error = None;

        for attempt in 0..DIAL_ATTEMPTS {
            if attempt > 0 {
                sleep(TICK_INTERVAL).await;
            }

            match TcpStream::connect(destination).await {
                Ok(stream) => {
                    let _ = events_tx.send(Event::DialDone { stream_id, result: Ok(stream) });
                    return;
                }
                Err(error) => last_error = Some(error),
            }
        }

        let _ = events_tx.send(Event::DialDone {
            stream_id,
            result: Err(last_error.expect("at least one dial attempt ran")),
        });
    });
}

fn on_dial_done(relay: &mut Relay, events_tx: &UnboundedSender<Event>, stream_id: u64, result: io::Result<TcpStream>) {
    let stream = match result {
        Ok(stream) => stream,
        Err(error) => {
            warn!(stream = stream_id, %error, "destination dial failed");
            relay.session.queue_ctl(&Control::Paired { stream_id, dial_port: 0 });
            return;
        }
    };

    let _ = stream.set_nodelay(true);
    let dial_port = stream.local_addr().map(|addr| addr.port()).unwrap_or(0);

    let (read_half, write_half) = stream.into_split();
    let reader_abort = endpoint::spawn_reader(stream_id, read_half, events_tx.clone());
    let writer = endpoint::spawn_writer(stream_id, write_half, relay.spool_dir.clone(), events_tx.clone());

    let mut ctx = StreamContext::new(stream_id, writer, reader_abort, true);
    ctx.dial_port = dial_port;

    info!(stream = stream_id, dial_port, "stream paired");
    relay.insert_stream(ctx);
    relay.session.queue_ctl(&Control::Paired { stream_id, dial_port });
}
