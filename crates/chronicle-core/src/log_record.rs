//! Log records as stored in chunks and shipped to replicas
//!
//! Every record starts with `[record_type: u8][version: u8][log_position: i64 LE]`
//! followed by a type-specific body. All integers are little endian, strings
//! are `u16` length prefixed UTF-8 and blobs are `u32` length prefixed.

use crate::epoch::Epoch;
use crate::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

/// Current record format version
pub const LOG_RECORD_VERSION: u8 = 1;

const PREPARE: u8 = 0;
const COMMIT: u8 = 1;
const SYSTEM: u8 = 2;

/// Flags carried by a prepare record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PrepareFlags(u16);

impl PrepareFlags {
    /// No flags
    pub const NONE: Self = Self(0);
    /// Record carries event data
    pub const DATA: Self = Self(0x01);
    /// First record of a transaction
    pub const TRANSACTION_BEGIN: Self = Self(0x02);
    /// Last record of a transaction
    pub const TRANSACTION_END: Self = Self(0x04);
    /// Committed implicitly, no commit record follows
    pub const IS_COMMITTED: Self = Self(0x20);
    /// Payload is JSON
    pub const IS_JSON: Self = Self(0x100);

    /// Raw bits
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Flags from raw bits
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    /// Whether all bits of `other` are set
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Single-record implicit transaction
    pub const fn single_write() -> Self {
        Self(Self::DATA.0 | Self::TRANSACTION_BEGIN.0 | Self::TRANSACTION_END.0 | Self::IS_COMMITTED.0)
    }
}

impl std::ops::BitOr for PrepareFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Kind of system record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SystemRecordType {
    /// Start of a leader epoch
    Epoch = 1,
}

/// One event write within a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareRecord {
    /// Position of this record
    pub log_position: i64,
    /// Position of the first prepare of the transaction
    pub transaction_position: i64,
    /// Index of this prepare within the transaction
    pub transaction_offset: i32,
    /// Transaction and payload flags
    pub flags: PrepareFlags,
    /// Write time, ticks since epoch
    pub timestamp: i64,
    /// Client supplied event id
    pub event_id: Uuid,
    /// Target stream
    pub stream_id: String,
    /// Event type name
    pub event_type: String,
    /// Event payload
    pub data: Bytes,
    /// Event metadata
    pub metadata: Bytes,
}

/// Commit of the transaction started at `transaction_position`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    /// Position of this record
    pub log_position: i64,
    /// Position of the transaction being committed
    pub transaction_position: i64,
    /// Stream event number assigned to the first prepare
    pub first_event_number: i64,
    /// Commit time
    pub timestamp: i64,
}

/// Node-level record such as an epoch marker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemRecord {
    /// Position of this record
    pub log_position: i64,
    /// Write time
    pub timestamp: i64,
    /// Payload kind
    pub system_record_type: SystemRecordType,
    /// Encoded payload
    pub data: Bytes,
}

impl SystemRecord {
    /// Epoch marker record
    pub fn epoch(epoch: &Epoch, timestamp: i64) -> Self {
        Self {
            log_position: epoch.epoch_position,
            timestamp,
            system_record_type: SystemRecordType::Epoch,
            data: epoch.encode(),
        }
    }

    /// Decode the epoch carried by this record
    pub fn as_epoch(&self) -> Result<Epoch> {
        match self.system_record_type {
            SystemRecordType::Epoch => Epoch::decode(&self.data),
        }
    }
}

/// Structured log record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    /// Event write
    Prepare(PrepareRecord),
    /// Transaction commit
    Commit(CommitRecord),
    /// System record
    System(SystemRecord),
}

impl LogRecord {
    /// Position of the record in the log
    pub fn log_position(&self) -> i64 {
        match self {
            Self::Prepare(r) => r.log_position,
            Self::Commit(r) => r.log_position,
            Self::System(r) => r.log_position,
        }
    }

    /// Whether the record closes a transaction
    pub fn is_transaction_boundary(&self) -> bool {
        match self {
            Self::Prepare(r) => r.flags.contains(PrepareFlags::TRANSACTION_END),
            Self::Commit(_) | Self::System(_) => true,
        }
    }

    /// Encode without framing
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Append the encoded record to `buf`
    pub fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Self::Prepare(r) => {
                put_header(buf, PREPARE, r.log_position);
                buf.put_u16_le(r.flags.bits());
                buf.put_i64_le(r.transaction_position);
                buf.put_i32_le(r.transaction_offset);
                buf.put_i64_le(r.timestamp);
                buf.put_slice(r.event_id.as_bytes());
                put_str(buf, &r.stream_id);
                put_str(buf, &r.event_type);
                put_blob(buf, &r.data);
                put_blob(buf, &r.metadata);
            }
            Self::Commit(r) => {
                put_header(buf, COMMIT, r.log_position);
                buf.put_i64_le(r.transaction_position);
                buf.put_i64_le(r.first_event_number);
                buf.put_i64_le(r.timestamp);
            }
            Self::System(r) => {
                put_header(buf, SYSTEM, r.log_position);
                buf.put_i64_le(r.timestamp);
                buf.put_u8(r.system_record_type as u8);
                put_blob(buf, &r.data);
            }
        }
    }

    /// Decode a record occupying exactly `frame`
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let mut r = Reader { buf: frame };
        let record_type = r.u8()?;
        let version = r.u8()?;
        if version != LOG_RECORD_VERSION {
            return Err(Error::log_record(format!(
                "Unsupported record version {}",
                version
            )));
        }
        let log_position = r.i64()?;

        let record = match record_type {
            PREPARE => Self::Prepare(PrepareRecord {
                log_position,
                flags: PrepareFlags::from_bits(r.u16()?),
                transaction_position: r.i64()?,
                transaction_offset: r.i32()?,
                timestamp: r.i64()?,
                event_id: r.uuid()?,
                stream_id: r.string()?,
                event_type: r.string()?,
                data: r.blob()?,
                metadata: r.blob()?,
            }),
            COMMIT => Self::Commit(CommitRecord {
                log_position,
                transaction_position: r.i64()?,
                first_event_number: r.i64()?,
                timestamp: r.i64()?,
            }),
            SYSTEM => {
                let timestamp = r.i64()?;
                let system_record_type = match r.u8()? {
                    1 => SystemRecordType::Epoch,
                    other => {
                        return Err(Error::log_record(format!(
                            "Unknown system record type {}",
                            other
                        )));
                    }
                };
                Self::System(SystemRecord {
                    log_position,
                    timestamp,
                    system_record_type,
                    data: r.blob()?,
                })
            }
            other => {
                return Err(Error::log_record(format!("Unknown record type {}", other)));
            }
        };

        if !r.buf.is_empty() {
            return Err(Error::log_record(format!(
                "{} trailing bytes after record at {}",
                r.buf.len(),
                log_position
            )));
        }

        Ok(record)
    }
}

fn put_header(buf: &mut BytesMut, record_type: u8, log_position: i64) {
    buf.put_u8(record_type);
    buf.put_u8(LOG_RECORD_VERSION);
    buf.put_i64_le(log_position);
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u16_le(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn put_blob(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32_le(data.len() as u32);
    buf.put_slice(data);
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl Reader<'_> {
    fn need(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(Error::log_record(format!(
                "Record truncated: needed {} bytes, {} left",
                n,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> Result<u16> {
        self.need(2)?;
        Ok(self.buf.get_u16_le())
    }

    fn i32(&mut self) -> Result<i32> {
        self.need(4)?;
        Ok(self.buf.get_i32_le())
    }

    fn i64(&mut self) -> Result<i64> {
        self.need(8)?;
        Ok(self.buf.get_i64_le())
    }

    fn uuid(&mut self) -> Result<Uuid> {
        self.need(16)?;
        let mut id = [0u8; 16];
        self.buf.copy_to_slice(&mut id);
        Ok(Uuid::from_bytes(id))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        self.need(len)?;
        let s = std::str::from_utf8(&self.buf[..len])
            .map_err(|e| Error::log_record(format!("Invalid UTF-8 in record: {}", e)))?
            .to_string();
        self.buf.advance(len);
        Ok(s)
    }

    fn blob(&mut self) -> Result<Bytes> {
        let len = self.u32()? as usize;
        self.need(len)?;
        let data = Bytes::copy_from_slice(&self.buf[..len]);
        self.buf.advance(len);
        Ok(data)
    }

    fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prepare(log_position: i64, flags: PrepareFlags) -> LogRecord {
        LogRecord::Prepare(PrepareRecord {
            log_position,
            transaction_position: log_position,
            transaction_offset: 0,
            flags,
            timestamp: 1_700_000_000,
            event_id: Uuid::new_v4(),
            stream_id: "orders-1".into(),
            event_type: "OrderPlaced".into(),
            data: Bytes::from_static(b"{\"qty\":3}"),
            metadata: Bytes::new(),
        })
    }

    #[test]
    fn test_prepare_header_layout() {
        let encoded = prepare(0x1234, PrepareFlags::single_write()).encode();
        assert_eq!(encoded[0], PREPARE);
        assert_eq!(encoded[1], LOG_RECORD_VERSION);
        assert_eq!(&encoded[2..10], &0x1234i64.to_le_bytes());
    }

    #[test]
    fn test_decode_each_type() {
        let records = vec![
            prepare(10, PrepareFlags::DATA | PrepareFlags::IS_JSON),
            LogRecord::Commit(CommitRecord {
                log_position: 200,
                transaction_position: 10,
                first_event_number: 7,
                timestamp: 5,
            }),
            LogRecord::System(SystemRecord::epoch(
                &Epoch::new(2, 300, Uuid::new_v4(), Uuid::new_v4()),
                9,
            )),
        ];

        for record in records {
            assert_eq!(LogRecord::decode(&record.encode()).unwrap(), record);
        }
    }

    #[test]
    fn test_epoch_system_record() {
        let epoch = Epoch::new(4, 1024, Uuid::new_v4(), Uuid::new_v4());
        let record = SystemRecord::epoch(&epoch, 0);
        assert_eq!(record.log_position, 1024);
        assert_eq!(record.as_epoch().unwrap(), epoch);
    }

    #[test]
    fn test_transaction_boundaries() {
        assert!(!prepare(0, PrepareFlags::DATA | PrepareFlags::TRANSACTION_BEGIN).is_transaction_boundary());
        assert!(prepare(0, PrepareFlags::single_write()).is_transaction_boundary());
        assert!(
            LogRecord::Commit(CommitRecord {
                log_position: 0,
                transaction_position: 0,
                first_event_number: 0,
                timestamp: 0,
            })
            .is_transaction_boundary()
        );
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut encoded = BytesMut::from(&prepare(0, PrepareFlags::single_write()).encode()[..]);
        encoded.put_u8(0);
        let err = LogRecord::decode(&encoded).unwrap_err();
        assert!(err.to_string().contains("trailing"));
    }

    #[test]
    fn test_truncated_record_rejected() {
        let encoded = prepare(0, PrepareFlags::single_write()).encode();
        let result = LogRecord::decode(&encoded[..encoded.len() - 3]);
        assert!(matches!(result, Err(Error::LogRecord(_))));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut buf = BytesMut::new();
        put_header(&mut buf, 9, 0);
        assert!(LogRecord::decode(&buf).is_err());
    }
}
