//! Reader and writer tasks wrapping one local byte-stream endpoint.
//!
//! The workers never touch a local connection directly; each stream gets a
//! reader task feeding chunks into the worker's mailbox and a writer task
//! draining ordered tunnel data out to the endpoint. Both are generic over
//! [`AsyncRead`]/[`AsyncWrite`] — nothing here assumes TCP, any ordered
//! byte-stream transport works. The worker holds a reader's [`AbortHandle`]
//! (readers block in `read` and must be cancelled externally) and a
//! writer's command channel; dropping that channel asks the writer to
//! flush whatever is queued and shut the endpoint down.

use std::path::PathBuf;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::AbortHandle;

use burrow_proto::{CHUNK_CAP, MAX_PAYLOAD};

use crate::spool::ByteQueue;
use crate::worker::Event;

/// Commands a worker sends to a stream's writer task.
#[derive(Debug)]
pub enum WriteCmd {
    /// Ordered bytes to deliver to the endpoint.
    Data(Vec<u8>),

    /// Flush everything queued, shut the endpoint's write side down, then
    /// report [`Event::WriterFinished`].
    Finish,
}

/// Spawns the reader task for one stream. Chunks are capped at
/// [`MAX_PAYLOAD`] so every chunk maps to exactly one tunnel packet.
pub fn spawn_reader<R>(stream_id: u64, mut reader: R, events: UnboundedSender<Event>) -> AbortHandle
where
    R: AsyncRead + Unpin + 'static,
{
    let task = tokio::task::spawn_local(async move {
        let mut buf = vec![0u8; MAX_PAYLOAD];

        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    let _ = events.send(Event::LocalEof { stream_id });
                    return;
                }
                Ok(count) => {
                    let data = buf[..count].to_vec();
                    if events.send(Event::LocalData { stream_id, data }).is_err() {
                        return;
                    }
                }
                Err(error) => {
                    let _ = events.send(Event::LocalError { stream_id, error });
                    return;
                }
            }
        }
    });

    task.abort_handle()
}

/// Spawns the writer task for one stream and returns its command channel.
///
/// The writer owns the stream's endpoint-bound [`ByteQueue`]: commands
/// already sitting in the channel are always ingested before the next
/// endpoint write, so a backlog accumulates in the queue (spilling to disk
/// past [`CHUNK_CAP`]) instead of in channel memory. Partial writes just
/// requeue the remainder. A disk or endpoint write error is reported as
/// [`Event::WriterError`] and ends the task; leftover chunks are deleted.
pub fn spawn_writer<W>(
    stream_id: u64,
    mut writer: W,
    spool_dir: PathBuf,
    events: UnboundedSender<Event>,
) -> UnboundedSender<WriteCmd>
where
    W: AsyncWrite + Unpin + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel();

    tokio::task::spawn_local(async move {
        let mut queue = ByteQueue::new(spool_dir, format!("w{stream_id:016x}"), CHUNK_CAP);
        let mut finish = false;

        loop {
            loop {
                match rx.try_recv() {
                    Ok(WriteCmd::Data(data)) => {
                        if let Err(error) = queue.push(&data) {
                            let _ = events.send(Event::WriterError { stream_id, error: error.into() });
                            queue.discard_chunks();
                            return;
                        }
                    }
                    Ok(WriteCmd::Finish) => finish = true,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        finish = true;
                        break;
                    }
                }
            }

            if queue.is_empty() {
                if finish {
                    let _ = writer.shutdown().await;
                    let _ = events.send(Event::WriterFinished { stream_id });
                    return;
                }

                match rx.recv().await {
                    Some(command) => {
                        // Reprocess through the ingest loop above.
                        if let WriteCmd::Data(data) = command {
                            if let Err(error) = queue.push(&data) {
                                let _ = events.send(Event::WriterError { stream_id, error: error.into() });
                                queue.discard_chunks();
                                return;
                            }
                        } else {
                            finish = true;
                        }
                    }
                    None => finish = true,
                }

                continue;
            }

            let write_result = {
                let front = match queue.front() {
                    Ok(front) => front,
                    Err(error) => {
                        let _ = events.send(Event::WriterError { stream_id, error: error.into() });
                        return;
                    }
                };

                writer.write(front).await
            };

            match write_result {
                Ok(0) => {
                    let error = std::io::Error::new(std::io::ErrorKind::WriteZero, "endpoint accepted no bytes");
                    let _ = events.send(Event::WriterError { stream_id, error });
                    queue.discard_chunks();
                    return;
                }
                Ok(count) => queue.consume(count),
                Err(error) => {
                    let _ = events.send(Event::WriterError { stream_id, error });
                    queue.discard_chunks();
                    return;
                }
            }
        }
    });

    tx
}
