//! Chunked log storage interface
//!
//! The log is split into fixed-size chunks. The leader reads them through
//! leased [`BulkReader`]s, either as raw on-disk images (scavenged chunks) or
//! as logical data ranges. The replica writes through [`ReplicaLog`].

mod memory;

pub use memory::MemoryLog;

use crate::log_record::LogRecord;
use crate::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Size of the on-disk chunk header
pub const CHUNK_HEADER_SIZE: usize = 128;

const CHUNK_HEADER_VERSION: u8 = 3;

/// Chunk identity and geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkHeader {
    /// First chunk number covered
    pub chunk_start_number: i32,
    /// Last chunk number covered (merged chunks span several)
    pub chunk_end_number: i32,
    /// Logical bytes per chunk number
    pub chunk_size: i32,
    /// Produced by a scavenge; positions are sparse and the image is immutable
    pub is_scavenged: bool,
    /// Identity of this physical chunk
    pub chunk_id: Uuid,
}

impl ChunkHeader {
    /// Header of an ongoing chunk
    pub fn new(chunk_number: i32, chunk_size: i32) -> Self {
        Self {
            chunk_start_number: chunk_number,
            chunk_end_number: chunk_number,
            chunk_size,
            is_scavenged: false,
            chunk_id: Uuid::new_v4(),
        }
    }

    /// First global position of the chunk
    pub fn chunk_start_position(&self) -> i64 {
        self.chunk_start_number as i64 * self.chunk_size as i64
    }

    /// Global position just past the chunk
    pub fn chunk_end_position(&self) -> i64 {
        (self.chunk_end_number as i64 + 1) * self.chunk_size as i64
    }

    /// Offset of a global position inside this chunk
    pub fn local_log_position(&self, global_position: i64) -> i64 {
        global_position - self.chunk_start_position()
    }

    /// Whether the chunk covers `global_position`
    pub fn contains(&self, global_position: i64) -> bool {
        global_position >= self.chunk_start_position() && global_position < self.chunk_end_position()
    }

    /// Encode to the fixed-size on-disk form
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(CHUNK_HEADER_SIZE);
        buf.put_u8(CHUNK_HEADER_VERSION);
        buf.put_i32_le(self.chunk_size);
        buf.put_i32_le(self.chunk_start_number);
        buf.put_i32_le(self.chunk_end_number);
        buf.put_u8(self.is_scavenged as u8);
        buf.put_slice(self.chunk_id.as_bytes());
        buf.resize(CHUNK_HEADER_SIZE, 0);
        buf.freeze()
    }

    /// Decode the on-disk form
    pub fn decode(mut data: &[u8]) -> Result<Self> {
        if data.len() < CHUNK_HEADER_SIZE {
            return Err(Error::storage(format!(
                "Chunk header needs {} bytes, got {}",
                CHUNK_HEADER_SIZE,
                data.len()
            )));
        }
        let version = data.get_u8();
        if version != CHUNK_HEADER_VERSION {
            return Err(Error::storage(format!("Unsupported chunk version {}", version)));
        }
        let chunk_size = data.get_i32_le();
        let chunk_start_number = data.get_i32_le();
        let chunk_end_number = data.get_i32_le();
        let is_scavenged = data.get_u8() != 0;
        let mut id = [0u8; 16];
        data.copy_to_slice(&mut id);
        Ok(Self {
            chunk_start_number,
            chunk_end_number,
            chunk_size,
            is_scavenged,
            chunk_id: Uuid::from_bytes(id),
        })
    }
}

/// Result of one bulk read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkRead {
    /// Reader position before the read (raw offset or local data position)
    pub old_position: i64,
    /// Bytes read, possibly empty
    pub data: Bytes,
    /// Reader reached the end of a completed chunk
    pub is_eof: bool,
}

/// Leased reader over one chunk. Dropping it releases the lease.
pub trait BulkReader: Send {
    /// Header of the chunk being read
    fn chunk_header(&self) -> ChunkHeader;

    /// Position the reader at a raw file offset
    fn set_raw_position(&mut self, raw_position: i64) -> Result<()>;

    /// Position the reader at a local data offset
    fn set_data_position(&mut self, data_position: i64) -> Result<()>;

    /// Read up to `count` bytes of the raw image
    fn read_next_raw_bytes(&mut self, count: usize) -> Result<BulkRead>;

    /// Read up to `count` bytes of logical data
    fn read_next_data_bytes(&mut self, count: usize) -> Result<BulkRead>;
}

/// One chunk of the log
pub trait Chunk: Send + Sync {
    /// Chunk header
    fn header(&self) -> ChunkHeader;

    /// Size of the raw image in bytes
    fn file_size(&self) -> i64;

    /// Chunk is complete and will not grow
    fn is_completed(&self) -> bool;

    /// Lease a reader; fails with [`Error::ChunkBeingDeleted`] while a scavenge replaces the chunk
    fn acquire_reader(&self) -> Result<Box<dyn BulkReader>>;
}

/// Leader-side chunk lookup
pub trait ChunkManager: Send + Sync {
    /// Chunk covering `log_position`
    fn chunk_for(&self, log_position: i64) -> Result<Arc<dyn Chunk>>;
}

/// Replica-side log writer
pub trait ReplicaLog: Send + Sync {
    /// Current unflushed writer position
    fn writer_position(&self) -> i64;

    /// Header of the chunk currently being written
    fn current_chunk(&self) -> ChunkHeader;

    /// Append one whole transaction
    fn write_records(&self, records: &[LogRecord]) -> Result<()>;

    /// Ensure the ongoing chunk `header` exists. Idempotent.
    fn create_chunk(&self, header: &ChunkHeader) -> Result<()>;

    /// Complete the current chunk and start the next one; returns the new writer position
    fn complete_chunk(&self) -> Result<i64>;

    /// Replace the chunk described by `header` with a complete raw image
    fn install_raw_chunk(&self, header: &ChunkHeader, image: Bytes) -> Result<i64>;

    /// Make written data durable and publish the writer position
    fn flush(&self) -> Result<()>;
}
