//! In-memory chunked log

use super::{
    BulkRead, BulkReader, CHUNK_HEADER_SIZE, Chunk, ChunkHeader, ChunkManager, ReplicaLog,
};
use crate::checkpoint::{Checkpoint, MemoryCheckpoint};
use crate::epoch::Epoch;
use crate::framing::{FRAME_OVERHEAD, LengthPrefixSuffixFramer, LogRecordFramer};
use crate::log_record::{LogRecord, PrepareFlags, PrepareRecord, SystemRecord};
use crate::{Error, Result};
use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use uuid::Uuid;

#[derive(Debug)]
struct ChunkData {
    header: ChunkHeader,
    data: RwLock<Vec<u8>>,
    completed: AtomicBool,
    deletion_failures: AtomicU32,
}

impl ChunkData {
    fn new(header: ChunkHeader, data: Vec<u8>, completed: bool) -> Self {
        Self {
            header,
            data: RwLock::new(data),
            completed: AtomicBool::new(completed),
            deletion_failures: AtomicU32::new(0),
        }
    }
}

/// Chunk of a [`MemoryLog`]
#[derive(Debug, Clone)]
pub struct MemoryChunk {
    data: Arc<ChunkData>,
    live_readers: Arc<AtomicUsize>,
}

impl Chunk for MemoryChunk {
    fn header(&self) -> ChunkHeader {
        self.data.header
    }

    fn file_size(&self) -> i64 {
        (CHUNK_HEADER_SIZE + self.data.data.read().len()) as i64
    }

    fn is_completed(&self) -> bool {
        self.data.completed.load(Ordering::SeqCst)
    }

    fn acquire_reader(&self) -> Result<Box<dyn BulkReader>> {
        let failing = self
            .data
            .deletion_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::ChunkBeingDeleted {
                chunk: self.data.header.chunk_start_number,
            });
        }

        self.live_readers.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryReader {
            chunk: self.data.clone(),
            position: 0,
            _lease: Lease(self.live_readers.clone()),
        }))
    }
}

#[derive(Debug)]
struct Lease(Arc<AtomicUsize>);

impl Drop for Lease {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct MemoryReader {
    chunk: Arc<ChunkData>,
    position: i64,
    _lease: Lease,
}

impl BulkReader for MemoryReader {
    fn chunk_header(&self) -> ChunkHeader {
        self.chunk.header
    }

    fn set_raw_position(&mut self, raw_position: i64) -> Result<()> {
        let file_size = (CHUNK_HEADER_SIZE + self.chunk.data.read().len()) as i64;
        if raw_position < 0 || raw_position > file_size {
            return Err(Error::storage(format!(
                "Raw position {} outside chunk #{} of size {}",
                raw_position, self.chunk.header.chunk_start_number, file_size
            )));
        }
        self.position = raw_position;
        Ok(())
    }

    fn set_data_position(&mut self, data_position: i64) -> Result<()> {
        let len = self.chunk.data.read().len() as i64;
        if data_position < 0 || data_position > len {
            return Err(Error::storage(format!(
                "Data position {} outside chunk #{} with {} bytes",
                data_position, self.chunk.header.chunk_start_number, len
            )));
        }
        self.position = data_position;
        Ok(())
    }

    fn read_next_raw_bytes(&mut self, count: usize) -> Result<BulkRead> {
        let header = self.chunk.header.encode();
        let data = self.chunk.data.read();
        let file_size = CHUNK_HEADER_SIZE + data.len();

        let start = self.position as usize;
        let end = (start + count).min(file_size);
        let mut out = BytesMut::with_capacity(end - start);
        if start < CHUNK_HEADER_SIZE {
            out.extend_from_slice(&header[start..end.min(CHUNK_HEADER_SIZE)]);
        }
        if end > CHUNK_HEADER_SIZE {
            let from = start.max(CHUNK_HEADER_SIZE) - CHUNK_HEADER_SIZE;
            out.extend_from_slice(&data[from..end - CHUNK_HEADER_SIZE]);
        }

        let completed = self.chunk.completed.load(Ordering::SeqCst);
        self.position = end as i64;
        Ok(BulkRead {
            old_position: start as i64,
            data: out.freeze(),
            is_eof: completed && end == file_size,
        })
    }

    fn read_next_data_bytes(&mut self, count: usize) -> Result<BulkRead> {
        let data = self.chunk.data.read();
        let start = self.position as usize;
        let end = (start + count).min(data.len());
        let bytes = Bytes::copy_from_slice(&data[start..end]);

        let completed = self.chunk.completed.load(Ordering::SeqCst);
        self.position = end as i64;
        Ok(BulkRead {
            old_position: start as i64,
            data: bytes,
            is_eof: completed && end == data.len(),
        })
    }
}

#[derive(Debug)]
struct LogState {
    chunks: Vec<Arc<ChunkData>>,
    writer_position: i64,
}

impl LogState {
    fn current(&self) -> Result<&Arc<ChunkData>> {
        self.chunks
            .last()
            .ok_or_else(|| Error::storage("Log has no chunks"))
    }
}

/// In-memory chunked transaction log
///
/// Serves the leader as a [`ChunkManager`] and the replica as a [`ReplicaLog`].
/// Every record is stored framed as `len | record | len` and never spans chunks.
#[derive(Debug)]
pub struct MemoryLog {
    chunk_size: i32,
    state: RwLock<LogState>,
    writer: Arc<MemoryCheckpoint>,
    live_readers: Arc<AtomicUsize>,
}

impl MemoryLog {
    /// Empty log with one ongoing chunk
    pub fn new(chunk_size: i32) -> Self {
        let first = ChunkData::new(ChunkHeader::new(0, chunk_size), Vec::new(), false);
        Self {
            chunk_size,
            state: RwLock::new(LogState {
                chunks: vec![Arc::new(first)],
                writer_position: 0,
            }),
            writer: Arc::new(MemoryCheckpoint::new("writer", 0)),
            live_readers: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Logical bytes per chunk
    pub fn chunk_size(&self) -> i32 {
        self.chunk_size
    }

    /// Writer checkpoint; only flushed positions are visible to readers of `read()`
    pub fn writer_checkpoint(&self) -> Arc<MemoryCheckpoint> {
        self.writer.clone()
    }

    /// Readers currently leased
    pub fn live_readers(&self) -> usize {
        self.live_readers.load(Ordering::SeqCst)
    }

    /// Headers of all chunks, oldest first
    pub fn chunk_headers(&self) -> Vec<ChunkHeader> {
        self.state.read().chunks.iter().map(|c| c.header).collect()
    }

    /// Append a record built for the position it will occupy, rolling over to a
    /// new chunk when it does not fit. Returns the new writer position.
    pub fn append_with<F>(&self, build: F) -> Result<i64>
    where
        F: Fn(i64) -> LogRecord,
    {
        let mut state = self.state.write();
        let size = (build(state.writer_position).encode().len() + FRAME_OVERHEAD) as i64;
        if size > self.chunk_size as i64 {
            return Err(Error::storage(format!(
                "Record of {} bytes does not fit a chunk of {}",
                size, self.chunk_size
            )));
        }
        if state.writer_position + size > state.current()?.header.chunk_end_position() {
            self.complete_locked(&mut state)?;
        }
        let record = build(state.writer_position);
        self.write_locked(&mut state, std::slice::from_ref(&record))?;
        Ok(state.writer_position)
    }

    /// Append a single-event transaction
    pub fn append_event(&self, stream_id: &str, event_type: &str, data: &[u8]) -> Result<i64> {
        let event_id = Uuid::new_v4();
        let data = Bytes::copy_from_slice(data);
        self.append_with(|log_position| {
            LogRecord::Prepare(PrepareRecord {
                log_position,
                transaction_position: log_position,
                transaction_offset: 0,
                flags: PrepareFlags::single_write(),
                timestamp: 0,
                event_id,
                stream_id: stream_id.to_string(),
                event_type: event_type.to_string(),
                data: data.clone(),
                metadata: Bytes::new(),
            })
        })
    }

    /// Write an epoch record at the current position
    pub fn append_epoch(&self, epoch_number: i64, leader_id: Uuid) -> Result<Epoch> {
        let epoch_id = Uuid::new_v4();
        let written = Cell::new(None);
        self.append_with(|log_position| {
            let epoch = Epoch::new(epoch_number, log_position, epoch_id, leader_id);
            written.set(Some(epoch));
            LogRecord::System(SystemRecord::epoch(&epoch, 0))
        })?;
        written
            .get()
            .ok_or_else(|| Error::storage("Epoch record was not written"))
    }

    /// Replace a completed chunk with a scavenged copy carrying a new id
    pub fn scavenge_chunk(&self, chunk_number: i32) -> Result<ChunkHeader> {
        let mut state = self.state.write();
        let index = state
            .chunks
            .iter()
            .position(|c| c.header.chunk_start_number == chunk_number)
            .ok_or(Error::ChunkNotFound {
                log_position: chunk_number as i64 * self.chunk_size as i64,
            })?;

        let old = &state.chunks[index];
        if !old.completed.load(Ordering::SeqCst) {
            return Err(Error::storage(format!(
                "Chunk #{} is not completed",
                chunk_number
            )));
        }

        let header = ChunkHeader {
            is_scavenged: true,
            chunk_id: Uuid::new_v4(),
            ..old.header
        };
        let data = old.data.read().clone();
        state.chunks[index] = Arc::new(ChunkData::new(header, data, true));
        tracing::debug!("Scavenged chunk #{} as {}", chunk_number, header.chunk_id);
        Ok(header)
    }

    /// Make the next `times` reader acquisitions on a chunk fail as if it were being deleted
    pub fn fail_reader_acquisitions(&self, chunk_number: i32, times: u32) -> Result<()> {
        let state = self.state.read();
        let chunk = state
            .chunks
            .iter()
            .find(|c| c.header.chunk_start_number == chunk_number)
            .ok_or(Error::ChunkNotFound {
                log_position: chunk_number as i64 * self.chunk_size as i64,
            })?;
        chunk.deletion_failures.store(times, Ordering::SeqCst);
        Ok(())
    }

    /// Decode every record in the log
    pub fn read_records(&self) -> Result<Vec<LogRecord>> {
        let state = self.state.read();
        let mut records = Vec::new();
        for chunk in &state.chunks {
            let mut framer =
                LogRecordFramer::new(LengthPrefixSuffixFramer::new(self.chunk_size as usize));
            framer.unframe_data(&chunk.data.read(), |record| {
                records.push(record);
                Ok(())
            })?;
        }
        Ok(records)
    }

    /// Logical bytes of every chunk, for byte-exact comparisons
    pub fn chunk_data(&self) -> Vec<(ChunkHeader, Bytes)> {
        self.state
            .read()
            .chunks
            .iter()
            .map(|c| (c.header, Bytes::copy_from_slice(&c.data.read())))
            .collect()
    }

    fn write_locked(&self, state: &mut LogState, records: &[LogRecord]) -> Result<()> {
        let chunk = state.current()?.clone();
        let mut framed = BytesMut::new();
        let mut position = state.writer_position;
        for record in records {
            if record.log_position() != position {
                return Err(Error::invariant(format!(
                    "Record at {} written at writer position {}",
                    record.log_position(),
                    position
                )));
            }
            let encoded = record.encode();
            LengthPrefixSuffixFramer::frame_into(&encoded, &mut framed);
            position += (encoded.len() + FRAME_OVERHEAD) as i64;
        }

        if position > chunk.header.chunk_end_position() {
            return Err(Error::storage(format!(
                "Transaction ending at {} overflows chunk #{}",
                position, chunk.header.chunk_start_number
            )));
        }

        chunk.data.write().extend_from_slice(&framed);
        state.writer_position = position;
        Ok(())
    }

    fn complete_locked(&self, state: &mut LogState) -> Result<i64> {
        let current = state.current()?.clone();
        {
            let _data = current.data.write();
            current.completed.store(true, Ordering::SeqCst);
        }
        let next = ChunkHeader::new(current.header.chunk_end_number + 1, self.chunk_size);
        state.writer_position = current.header.chunk_end_position();
        state
            .chunks
            .push(Arc::new(ChunkData::new(next, Vec::new(), false)));
        tracing::debug!(
            "Completed chunk #{}-{}, writer at {}",
            current.header.chunk_start_number,
            current.header.chunk_end_number,
            state.writer_position
        );
        Ok(state.writer_position)
    }
}

impl ChunkManager for MemoryLog {
    fn chunk_for(&self, log_position: i64) -> Result<Arc<dyn Chunk>> {
        let state = self.state.read();
        state
            .chunks
            .iter()
            .find(|c| c.header.contains(log_position))
            .map(|c| {
                Arc::new(MemoryChunk {
                    data: c.clone(),
                    live_readers: self.live_readers.clone(),
                }) as Arc<dyn Chunk>
            })
            .ok_or(Error::ChunkNotFound { log_position })
    }
}

impl ReplicaLog for MemoryLog {
    fn writer_position(&self) -> i64 {
        self.state.read().writer_position
    }

    fn current_chunk(&self) -> ChunkHeader {
        let state = self.state.read();
        match state.chunks.last() {
            Some(chunk) => chunk.header,
            None => ChunkHeader::new(0, self.chunk_size),
        }
    }

    fn write_records(&self, records: &[LogRecord]) -> Result<()> {
        let mut state = self.state.write();
        self.write_locked(&mut state, records)
    }

    fn create_chunk(&self, header: &ChunkHeader) -> Result<()> {
        let mut state = self.state.write();
        if state
            .chunks
            .iter()
            .any(|c| c.header.chunk_start_number == header.chunk_start_number)
        {
            return Ok(());
        }

        let last = state.current()?;
        if header.chunk_start_number != last.header.chunk_end_number + 1
            || !last.completed.load(Ordering::SeqCst)
        {
            return Err(Error::storage(format!(
                "Cannot create chunk #{} after chunk #{}",
                header.chunk_start_number, last.header.chunk_end_number
            )));
        }

        state
            .chunks
            .push(Arc::new(ChunkData::new(*header, Vec::new(), false)));
        state.writer_position = header.chunk_start_position();
        Ok(())
    }

    fn complete_chunk(&self) -> Result<i64> {
        let mut state = self.state.write();
        self.complete_locked(&mut state)
    }

    fn install_raw_chunk(&self, header: &ChunkHeader, image: Bytes) -> Result<i64> {
        let decoded = ChunkHeader::decode(&image)?;
        if decoded.chunk_start_number != header.chunk_start_number
            || decoded.chunk_end_number != header.chunk_end_number
        {
            return Err(Error::storage(format!(
                "Raw image is chunk #{}-{}, expected #{}-{}",
                decoded.chunk_start_number,
                decoded.chunk_end_number,
                header.chunk_start_number,
                header.chunk_end_number
            )));
        }

        let mut state = self.state.write();
        let data = image.slice(CHUNK_HEADER_SIZE..).to_vec();
        let index = state
            .chunks
            .iter()
            .position(|c| c.header.chunk_start_number >= header.chunk_start_number)
            .unwrap_or(state.chunks.len());
        state.chunks.retain(|c| {
            c.header.chunk_start_number < header.chunk_start_number
                || c.header.chunk_start_number > header.chunk_end_number
        });
        state
            .chunks
            .insert(index, Arc::new(ChunkData::new(*header, data, true)));

        if index + 1 == state.chunks.len() {
            let next = ChunkHeader::new(header.chunk_end_number + 1, self.chunk_size);
            state
                .chunks
                .push(Arc::new(ChunkData::new(next, Vec::new(), false)));
            state.writer_position = header.chunk_end_position();
        }
        Ok(state.writer_position)
    }

    fn flush(&self) -> Result<()> {
        let position = self.state.read().writer_position;
        self.writer.write(position);
        self.writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_read_back() {
        let log = MemoryLog::new(4096);
        let first = log.append_event("orders", "Placed", b"a").unwrap();
        let second = log.append_event("orders", "Placed", b"bb").unwrap();
        assert!(second > first);

        let records = log.read_records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].log_position(), 0);
        assert_eq!(records[1].log_position(), first);
    }

    #[test]
    fn test_writer_checkpoint_follows_flush() {
        let log = MemoryLog::new(4096);
        let position = log.append_event("s", "t", b"x").unwrap();
        assert_eq!(log.writer_checkpoint().read(), 0);
        ReplicaLog::flush(&log).unwrap();
        assert_eq!(log.writer_checkpoint().read(), position);
    }

    #[test]
    fn test_rollover_to_next_chunk() {
        let log = MemoryLog::new(256);
        let mut last = 0;
        for _ in 0..6 {
            last = log.append_event("s", "t", &[0u8; 40]).unwrap();
        }
        let headers = log.chunk_headers();
        assert!(headers.len() >= 2);
        assert!(last > 256);
        assert_eq!(log.read_records().unwrap().len(), 6);
    }

    #[test]
    fn test_data_reader_eof_once_completed() {
        let log = MemoryLog::new(1024);
        log.append_event("s", "t", b"payload").unwrap();
        let chunk = log.chunk_for(0).unwrap();
        let mut reader = chunk.acquire_reader().unwrap();
        reader.set_data_position(0).unwrap();

        let read = reader.read_next_data_bytes(4096).unwrap();
        assert!(!read.data.is_empty());
        assert!(!read.is_eof);

        log.complete_chunk().unwrap();
        let read = reader.read_next_data_bytes(4096).unwrap();
        assert!(read.data.is_empty());
        assert!(read.is_eof);
    }

    #[test]
    fn test_raw_reader_returns_image() {
        let log = MemoryLog::new(1024);
        log.append_event("s", "t", b"payload").unwrap();
        log.complete_chunk().unwrap();
        let header = log.scavenge_chunk(0).unwrap();
        assert!(header.is_scavenged);

        let chunk = log.chunk_for(0).unwrap();
        let mut reader = chunk.acquire_reader().unwrap();
        let mut image = BytesMut::new();
        loop {
            let read = reader.read_next_raw_bytes(50).unwrap();
            image.extend_from_slice(&read.data);
            if read.is_eof {
                break;
            }
        }
        assert_eq!(image.len() as i64, chunk.file_size());
        assert_eq!(ChunkHeader::decode(&image).unwrap(), header);
    }

    #[test]
    fn test_readers_are_released_on_drop() {
        let log = MemoryLog::new(1024);
        let chunk = log.chunk_for(0).unwrap();
        let reader = chunk.acquire_reader().unwrap();
        assert_eq!(log.live_readers(), 1);
        drop(reader);
        assert_eq!(log.live_readers(), 0);
    }

    #[test]
    fn test_injected_deletion_failures() {
        let log = MemoryLog::new(1024);
        log.fail_reader_acquisitions(0, 2).unwrap();
        let chunk = log.chunk_for(0).unwrap();
        assert!(matches!(
            chunk.acquire_reader(),
            Err(Error::ChunkBeingDeleted { chunk: 0 })
        ));
        assert!(chunk.acquire_reader().is_err());
        assert!(chunk.acquire_reader().is_ok());
    }

    #[test]
    fn test_install_raw_chunk_replaces_local_chunk() {
        let leader = MemoryLog::new(1024);
        leader.append_event("s", "t", b"one").unwrap();
        leader.complete_chunk().unwrap();
        let header = leader.scavenge_chunk(0).unwrap();

        let chunk = leader.chunk_for(0).unwrap();
        let mut reader = chunk.acquire_reader().unwrap();
        let image = reader.read_next_raw_bytes(usize::MAX / 2).unwrap().data;

        let replica = MemoryLog::new(1024);
        let position = replica.install_raw_chunk(&header, image).unwrap();
        assert_eq!(position, 1024);
        assert_eq!(replica.writer_position(), 1024);
        assert_eq!(replica.current_chunk().chunk_start_number, 1);
        assert_eq!(replica.read_records().unwrap(), leader.read_records().unwrap());
    }

    #[test]
    fn test_create_chunk_is_idempotent() {
        let log = MemoryLog::new(1024);
        log.complete_chunk().unwrap();
        let header = log.current_chunk();
        log.create_chunk(&header).unwrap();
        log.create_chunk(&header).unwrap();
        assert_eq!(log.chunk_headers().len(), 2);
    }

    #[test]
    fn test_write_at_wrong_position_rejected() {
        let log = MemoryLog::new(1024);
        let record = {
            let other = MemoryLog::new(1024);
            other.append_event("s", "t", b"x").unwrap();
            other.append_event("s", "t", b"y").unwrap();
            other.read_records().unwrap().pop().unwrap()
        };
        let result = log.write_records(&[record]);
        assert!(matches!(result, Err(Error::ReplicationInvariant(_))));
    }

    #[test]
    fn test_epoch_record_written_at_position() {
        let log = MemoryLog::new(1024);
        log.append_event("s", "t", b"x").unwrap();
        let position = log.writer_position();
        let epoch = log.append_epoch(1, Uuid::new_v4()).unwrap();
        assert_eq!(epoch.epoch_position, position);
        assert_eq!(epoch.epoch_number, 1);
    }
}
