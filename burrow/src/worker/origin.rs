//! The originating endpoint worker: the process sitting next to the
//! applications that want to reach the far service.
//!
//! It listens on a local TCP address; every accepted connection becomes a
//! logical stream with a random id, announced to the peer once per second
//! until the peer pairs it with a destination dial (or until the attempt
//! budget runs out, which abandons the connection). Data read before the
//! pairing confirmation is queued, never dropped.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use burrow_proto::packet::Control;
use burrow_proto::{RETRY_LIMIT, STATUS_INTERVAL, TICK_INTERVAL};

use crate::endpoint;
use crate::spool::Record;
use crate::stream::StreamContext;
use crate::worker::{Event, Relay, RoleMsg};

pub struct OriginConfig {
    pub rendezvous: SocketAddr,
    pub room: String,
    pub listen: SocketAddr,
    pub spool_dir: PathBuf,
}

pub async fn run(config: OriginConfig) -> io::Result<()> {
    let listener = TcpListener::bind(config.listen).await?;
    info!(listen = %listener.local_addr()?, "origin listening");
    run_with_listener(listener, config).await
}

/// Runs the origin worker around an already-bound listener.
pub async fn run_with_listener(listener: TcpListener, config: OriginConfig) -> io::Result<()> {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut relay = Relay::new(config.rendezvous, config.room, config.spool_dir).await?;

    let accept_tx = events_tx.clone();
    let accept_task = tokio::task::spawn_local(async move {
        loop {
            match listener.accept().await {
                Ok((stream, from)) => {
                    debug!(%from, "accepted local connection");
                    if accept_tx.send(Event::Accepted(stream)).is_err() {
                        return;
                    }
                }
                // Transient accept failures (fd pressure, aborted
                // connections) must not kill the loop.
                Err(error) => warn!(%error, "accept failed"),
            }
        }
    });

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
                        handle_role_msg(&mut relay, msg);
                    }
                }
                Err(error) => {
                    warn!(%error, "tunnel receive failed");
                    relay.mark_dead();
                }
            },
            Some(event) = events_rx.recv() => match event {
                Event::Accepted(stream) => on_accepted(&mut relay, &events_tx, stream),
                event => relay.handle_common_event(event),
            },
            _ = slow_tick.tick() => {
                relay.on_slow_tick();
                announce_unpaired(&mut relay);
            }
            _ = status_tick.tick() => relay.on_status_tick(),
        }

        relay.flush().await;
        relay.renew_if_dead().await?;
    }

    accept_task.abort();
    Ok(())
}

fn on_accepted(relay: &mut Relay, events_tx: &UnboundedSender<Event>, stream: TcpStream) {
    let _ = stream.set_nodelay(true);

    let stream_id = loop {
        let id: u64 = rand::random();
        if id != 0 && !relay.session.streams.contains_key(&id) {
            break id;
        }
    };

    let (read_half, write_half) = stream.into_split();
    let reader_abort = endpoint::spawn_reader(stream_id, read_half, events_tx.clone());
    let writer = endpoint::spawn_writer(stream_id, write_half, relay.spool_dir.clone(), events_tx.clone());

    info!(stream = stream_id, "new stream");
    relay.insert_stream(StreamContext::new(stream_id, writer, reader_abort, false));

    // First announcement right away if the tunnel is up; the slow tick
    // retries until the peer pairs it.
    relay.session.queue_ctl(&Control::NewStream { stream_id });
}

/// Re-announces unconfirmed streams once per second over a confirmed
/// tunnel; a stream nobody pairs within the attempt budget is abandoned.
fn announce_unpaired(relay: &mut Relay) {
    if relay.session.remote_addr.is_none() {
        return;
    }

    let mut announce = Vec::new();
    let mut abandoned = Vec::new();

    for (&stream_id, ctx) in relay.session.streams.iter_mut() {
        if ctx.paired || ctx.finishing {
            continue;
        }

        if ctx.announce_attempts >= RETRY_LIMIT {
            abandoned.push(stream_id);
        } else {
            ctx.announce_attempts += 1;
            announce.push(stream_id);
        }
    }

    for stream_id in announce {
        relay.session.queue_ctl(&Control::NewStream { stream_id });
    }

    for stream_id in abandoned {
        warn!(stream = stream_id, "peer never paired the stream, abandoning");
        relay.delete_stream(stream_id);
    }
}

fn handle_role_msg(relay: &mut Relay, msg: RoleMsg) {
    let RoleMsg::Paired { stream_id, dial_port } = msg else {
        debug!("ignoring control message meant for the terminating side");
        return;
    };

    let Some(ctx) = relay.session.streams.get_mut(&stream_id) else {
        return;
    };

    if ctx.paired {
        return;
    }

    if dial_port == 0 {
        // The peer could not reach the destination; nothing this side can
        // do for the local connection.
        warn!(stream = stream_id, "peer failed to dial the destination, abandoning");
        relay.delete_stream(stream_id);
        return;
    }

    info!(stream = stream_id, dial_port, "stream paired");
    ctx.paired = true;
    ctx.dial_port = dial_port;

    // Everything read before the confirmation can finally go out.
    let pending = std::mem::take(&mut ctx.pending);
    for (sequence, payload) in pending {
        let record = Record { stream_id, sequence, payload };
        if let Err(error) = relay.session.outbound.push(record) {
            warn!(%error, "outbound spool failed, closing session");
            relay.mark_dead();
            return;
        }
    }
}
