//! Disk-backed overflow queues.
//!
//! Backlog that outgrows its in-memory buffer is sealed into an append-only
//! chunk file and the filename queued; chunks are consumed strictly FIFO,
//! one chunk fully drained before the next is opened, and deleted as soon
//! as they are read back. This turns an unbounded backlog into bounded
//! memory plus sequential disk I/O. All file operations are synchronous and
//! happen on the event-loop thread.
//!
//! Two shapes are needed:
//! - [`RecordQueue`] holds a session's outbound `(stream, sequence,
//!   payload)` records, spilling when the in-memory queue reaches a record
//!   count limit.
//! - [`ByteQueue`] holds a raw byte backlog bound for one local endpoint,
//!   spilling when the buffer reaches a byte size limit.
//!
//! Chunk files are named `<pid>-<tag>.<spring>`; the spring suffix
//! increments while older chunks are still queued and resets to zero once
//! the queue clears, so names never collide with a chunk not yet deleted.
//!
//! Every error here (including out-of-space while spilling) is fatal for
//! the owning session or stream: the owner is forced into its closing path
//! and [`RecordQueue::discard_chunks`]/[`ByteQueue::discard_chunks`] clean
//! the directory up.

use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::{fs, process};

use thiserror::Error;

/// A chunk file could not be written, read back or deleted. Always fatal
/// for the queue's owner; an out-of-space spill is never retried.
#[derive(Debug, Error)]
#[error("overflow chunk {path}: {source}")]
pub struct SpoolError {
    pub path: String,
    #[source]
    pub source: io::Error,
}

impl From<SpoolError> for io::Error {
    fn from(error: SpoolError) -> Self {
        io::Error::new(error.source.kind(), error.to_string())
    }
}

/// One queued outbound packet-to-be: the payload plus the header fields it
/// will be framed with once it is dequeued for transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub stream_id: u64,
    pub sequence: u64,
    pub payload: Vec<u8>,
}

/// Byte length of a record's framing inside a chunk file:
/// stream id (8) + sequence (8) + payload length (2).
const RECORD_HEADER_LEN: usize = 18;

/// FIFO queue of outbound records with disk overflow.
#[derive(Debug)]
pub struct RecordQueue {
    dir: PathBuf,
    tag: String,
    spring: u32,
    /// Records loaded back from the oldest chunk, drained first.
    cache: VecDeque<Record>,
    /// Filenames of sealed chunks, oldest first.
    chunks: VecDeque<String>,
    /// Not-yet-spilled tail of the queue, drained last.
    pending: VecDeque<Record>,
    spill_at: usize,
}

impl RecordQueue {
    pub fn new(dir: PathBuf, tag: String, spill_at: usize) -> Self {
        Self {
            dir,
            tag,
            spring: 0,
            cache: VecDeque::new(),
            chunks: VecDeque::new(),
            pending: VecDeque::new(),
            spill_at,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty() && self.chunks.is_empty() && self.pending.is_empty()
    }

    /// Appends a record, sealing the in-memory tail into a chunk file when
    /// it reaches the spill limit.
    pub fn push(&mut self, record: Record) -> Result<(), SpoolError> {
        self.pending.push_back(record);
        if self.pending.len() < self.spill_at {
            return Ok(());
        }

        let spring = if self.chunks.is_empty() { 0 } else { self.spring + 1 };
        let filename = format!("{}-{}.{}", process::id(), self.tag, spring);
        let path = self.dir.join(&filename);

        let mut data = Vec::new();
        for record in &self.pending {
            data.extend_from_slice(&record.stream_id.to_be_bytes());
            data.extend_from_slice(&record.sequence.to_be_bytes());
            data.extend_from_slice(&(record.payload.len() as u16).to_be_bytes());
            data.extend_from_slice(&record.payload);
        }

        fs::write(&path, data).map_err(|source| SpoolError {
            path: path.display().to_string(),
            source,
        })?;

        self.chunks.push_back(filename);
        self.spring = spring;
        self.pending.clear();
        Ok(())
    }

    /// Dequeues the oldest record: loaded-chunk cache first, then the next
    /// chunk file (read back whole and deleted), then the in-memory tail.
    pub fn next(&mut self) -> Result<Option<Record>, SpoolError> {
        if let Some(record) = self.cache.pop_front() {
            return Ok(Some(record));
        }

        if let Some(filename) = self.chunks.pop_front() {
            let path = self.dir.join(&filename);
            let as_error = |source| SpoolError {
                path: path.display().to_string(),
                source,
            };

            let data = fs::read(&path).map_err(as_error)?;
            fs::remove_file(&path).map_err(as_error)?;
            self.cache = parse_chunk(&data).map_err(as_error)?;

            return Ok(self.cache.pop_front());
        }

        Ok(self.pending.pop_front())
    }

    /// Deletes any chunk files still on disk. Called when the owning
    /// session closes; queued data is gone along with it.
    pub fn discard_chunks(&mut self) {
        for filename in self.chunks.drain(..) {
            let _ = fs::remove_file(self.dir.join(filename));
        }
    }
}

fn parse_chunk(mut data: &[u8]) -> io::Result<VecDeque<Record>> {
    let mut records = VecDeque::new();

    while !data.is_empty() {
        let truncated = || io::Error::new(io::ErrorKind::UnexpectedEof, "truncated chunk record");

        let header = data.get(..RECORD_HEADER_LEN).ok_or_else(truncated)?;
        let stream_id = u64::from_be_bytes(header[..8].try_into().unwrap());
        let sequence = u64::from_be_bytes(header[8..16].try_into().unwrap());
        let len = u16::from_be_bytes(header[16..18].try_into().unwrap()) as usize;

        let payload = data.get(RECORD_HEADER_LEN..RECORD_HEADER_LEN + len).ok_or_else(truncated)?;
        records.push_back(Record {
            stream_id,
            sequence,
            payload: payload.to_vec(),
        });

        data = &data[RECORD_HEADER_LEN + len..];
    }

    Ok(records)
}

/// FIFO byte backlog with disk overflow, bound for one local endpoint.
/// Supports partial consumption so short writes just requeue the remainder.
#[derive(Debug)]
pub struct ByteQueue {
    dir: PathBuf,
    tag: String,
    spring: u32,
    /// Bytes loaded back from the oldest chunk, drained first.
    cache: Vec<u8>,
    cache_pos: usize,
    chunks: VecDeque<String>,
    /// Not-yet-spilled tail, drained last.
    buffer: Vec<u8>,
    spill_at: usize,
}

impl ByteQueue {
    pub fn new(dir: PathBuf, tag: String, spill_at: usize) -> Self {
        Self {
            dir,
            tag,
            spring: 0,
            cache: Vec::new(),
            cache_pos: 0,
            chunks: VecDeque::new(),
            buffer: Vec::new(),
            spill_at,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cache_pos >= self.cache.len() && self.chunks.is_empty() && self.buffer.is_empty()
    }

    /// Appends bytes, sealing the buffer into a chunk file when it reaches
    /// the spill limit.
    pub fn push(&mut self, data: &[u8]) -> Result<(), SpoolError> {
        self.buffer.extend_from_slice(data);
        if self.buffer.len() < self.spill_at {
            return Ok(());
        }

        let spring = if self.chunks.is_empty() { 0 } else { self.spring + 1 };
        let filename = format!("{}-{}.{}", process::id(), self.tag, spring);
        let path = self.dir.join(&filename);

        fs::write(&path, &self.buffer).map_err(|source| SpoolError {
            path: path.display().to_string(),
            source,
        })?;

        self.chunks.push_back(filename);
        self.spring = spring;
        self.buffer.clear();
        Ok(())
    }

    /// The oldest run of queued bytes, loading (and deleting) the next
    /// chunk file if the cache is spent. Empty only if the queue is empty.
    pub fn front(&mut self) -> Result<&[u8], SpoolError> {
        if self.cache_pos >= self.cache.len() {
            if let Some(filename) = self.chunks.pop_front() {
                let path = self.dir.join(&filename);
                let as_error = |source| SpoolError {
                    path: path.display().to_string(),
                    source,
                };

                self.cache = fs::read(&path).map_err(as_error)?;
                self.cache_pos = 0;
                fs::remove_file(&path).map_err(as_error)?;
            } else {
                return Ok(&self.buffer);
            }
        }

        Ok(&self.cache[self.cache_pos..])
    }

    /// Consumes `count` bytes off the front, after a (possibly partial)
    /// write of the slice returned by [`ByteQueue::front`].
    pub fn consume(&mut self, count: usize) {
        if self.cache_pos < self.cache.len() {
            self.cache_pos += count;
            if self.cache_pos >= self.cache.len() {
                self.cache.clear();
                self.cache_pos = 0;
            }
        } else {
            self.buffer.drain(..count);
        }
    }

    /// Deletes any chunk files still on disk.
    pub fn discard_chunks(&mut self) {
        for filename in self.chunks.drain(..) {
            let _ = fs::remove_file(self.dir.join(filename));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TempDir(PathBuf);

    impl TempDir {
        fn new(name: &str) -> Self {
            let path = std::env::temp_dir().join(format!("burrow-spool-{}-{name}", process::id()));
            fs::create_dir_all(&path).unwrap();
            TempDir(path)
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.0);
        }
    }

    fn record(stream_id: u64, sequence: u64) -> Record {
        Record {
            stream_id,
            sequence,
            payload: format!("{stream_id}/{sequence}").into_bytes(),
        }
    }

    #[test]
    fn records_come_back_in_fifo_order_across_spills() {
        let dir = TempDir::new("record-fifo");
        let mut queue = RecordQueue::new(dir.0.clone(), "t".into(), 4);

        for sequence in 1..=11 {
            queue.push(record(9, sequence)).unwrap();
        }

        // 11 records with a spill threshold of 4: two sealed chunks plus an
        // in-memory tail of three.
        assert_eq!(fs::read_dir(&dir.0).unwrap().count(), 2);

        for sequence in 1..=11 {
            assert_eq!(queue.next().unwrap(), Some(record(9, sequence)));
        }
        assert_eq!(queue.next().unwrap(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn chunks_are_deleted_after_being_read() {
        let dir = TempDir::new("record-delete");
        let mut queue = RecordQueue::new(dir.0.clone(), "t".into(), 2);

        for sequence in 1..=2 {
            queue.push(record(1, sequence)).unwrap();
        }
        assert_eq!(fs::read_dir(&dir.0).unwrap().count(), 1);

        queue.next().unwrap();
        assert_eq!(fs::read_dir(&dir.0).unwrap().count(), 0);
    }

    #[test]
    fn spring_suffix_resets_once_the_chunk_queue_clears() {
        let dir = TempDir::new("record-spring");
        let mut queue = RecordQueue::new(dir.0.clone(), "t".into(), 2);
        let pid = process::id();

        // Two spills with the first chunk still queued: springs 0 then 1.
        for sequence in 1..=4 {
            queue.push(record(1, sequence)).unwrap();
        }
        assert!(dir.0.join(format!("{pid}-t.0")).exists());
        assert!(dir.0.join(format!("{pid}-t.1")).exists());

        // Drain everything, then spill again: the suffix starts over.
        while queue.next().unwrap().is_some() {}
        for sequence in 5..=6 {
            queue.push(record(1, sequence)).unwrap();
        }
        assert!(dir.0.join(format!("{pid}-t.0")).exists());
    }

    #[test]
    fn empty_payload_records_survive_the_disk_roundtrip() {
        let dir = TempDir::new("record-empty");
        let mut queue = RecordQueue::new(dir.0.clone(), "t".into(), 2);

        let empty = Record { stream_id: 3, sequence: 1, payload: Vec::new() };
        queue.push(empty.clone()).unwrap();
        queue.push(record(3, 2)).unwrap();

        assert_eq!(queue.next().unwrap(), Some(empty));
        assert_eq!(queue.next().unwrap(), Some(record(3, 2)));
    }

    #[test]
    fn discard_chunks_removes_leftover_files() {
        let dir = TempDir::new("record-discard");
        let mut queue = RecordQueue::new(dir.0.clone(), "t".into(), 2);

        for sequence in 1..=4 {
            queue.push(record(1, sequence)).unwrap();
        }
        assert_eq!(fs::read_dir(&dir.0).unwrap().count(), 2);

        queue.discard_chunks();
        assert_eq!(fs::read_dir(&dir.0).unwrap().count(), 0);
    }

    #[test]
    fn bytes_come_back_in_order_across_spills_and_partial_consumes() {
        let dir = TempDir::new("byte-fifo");
        let mut queue = ByteQueue::new(dir.0.clone(), "b".into(), 8);

        queue.push(b"abcdefgh").unwrap(); // spills
        queue.push(b"ijk").unwrap();
        assert_eq!(fs::read_dir(&dir.0).unwrap().count(), 1);

        // Drain with deliberately awkward partial consumes.
        let mut drained = Vec::new();
        loop {
            let front = queue.front().unwrap();
            if front.is_empty() {
                break;
            }

            let take = front.len().min(3);
            drained.extend_from_slice(&front[..take]);
            queue.consume(take);
        }

        assert_eq!(drained, b"abcdefghijk");
        assert!(queue.is_empty());
        assert_eq!(fs::read_dir(&dir.0).unwrap().count(), 0);
    }

    #[test]
    fn byte_queue_front_is_empty_only_when_drained() {
        let dir = TempDir::new("byte-empty");
        let mut queue = ByteQueue::new(dir.0.clone(), "b".into(), 1024);
        assert!(queue.front().unwrap().is_empty());

        queue.push(b"xy").unwrap();
        assert_eq!(queue.front().unwrap(), b"xy");
        queue.consume(2);
        assert!(queue.front().unwrap().is_empty());
    }
}
