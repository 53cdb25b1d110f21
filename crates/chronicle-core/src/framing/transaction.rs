//! Transaction framer
//!
//! Groups consecutive log records into whole transactions. A batch is handed
//! over only when a boundary record arrives, so a consumer never sees half a
//! transaction unless it asks for the pending records explicitly.

use super::record::LogRecordFramer;
use crate::Result;
use crate::log_record::LogRecord;

/// Buffers records until a transaction boundary
#[derive(Debug)]
pub struct TransactionFramer {
    framer: LogRecordFramer,
    pending: Vec<LogRecord>,
}

impl TransactionFramer {
    /// Wrap a log record framer
    pub fn new(framer: LogRecordFramer) -> Self {
        Self {
            framer,
            pending: Vec::new(),
        }
    }

    /// Feed bytes; `on_transaction` runs once per completed transaction
    pub fn unframe_data<F>(&mut self, data: &[u8], mut on_transaction: F) -> Result<()>
    where
        F: FnMut(Vec<LogRecord>) -> Result<()>,
    {
        let Self { framer, pending } = self;
        framer.unframe_data(data, |record| {
            let boundary = record.is_transaction_boundary();
            pending.push(record);
            if boundary {
                on_transaction(std::mem::take(pending))?;
            }
            Ok(())
        })
    }

    /// Hand over any buffered partial transaction.
    ///
    /// Returns the number of records flushed, `None` when nothing was pending.
    pub fn flush_pending<F>(&mut self, on_transaction: F) -> Result<Option<usize>>
    where
        F: FnOnce(Vec<LogRecord>) -> Result<()>,
    {
        if self.pending.is_empty() {
            return Ok(None);
        }
        let records = std::mem::take(&mut self.pending);
        let count = records.len();
        on_transaction(records)?;
        Ok(Some(count))
    }

    /// Records waiting for a boundary
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Drop pending records and any partial frame
    pub fn reset(&mut self) {
        self.pending.clear();
        self.framer.reset();
    }

    /// Whether a partial frame is buffered
    pub fn has_data(&self) -> bool {
        self.framer.has_data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::LengthPrefixSuffixFramer;
    use crate::log_record::{CommitRecord, PrepareFlags, PrepareRecord};
    use bytes::{Bytes, BytesMut};
    use uuid::Uuid;

    fn prepare(log_position: i64, flags: PrepareFlags) -> LogRecord {
        LogRecord::Prepare(PrepareRecord {
            log_position,
            transaction_position: 0,
            transaction_offset: 0,
            flags,
            timestamp: 0,
            event_id: Uuid::new_v4(),
            stream_id: "s".into(),
            event_type: "t".into(),
            data: Bytes::from_static(b"x"),
            metadata: Bytes::new(),
        })
    }

    fn framed(records: &[LogRecord]) -> BytesMut {
        let mut buf = BytesMut::new();
        for record in records {
            LengthPrefixSuffixFramer::frame_into(&record.encode(), &mut buf);
        }
        buf
    }

    fn new_framer() -> TransactionFramer {
        TransactionFramer::new(LogRecordFramer::new(LengthPrefixSuffixFramer::new(4096)))
    }

    #[test]
    fn test_batch_only_at_boundary() {
        let begin = prepare(0, PrepareFlags::DATA | PrepareFlags::TRANSACTION_BEGIN);
        let middle = prepare(100, PrepareFlags::DATA);
        let commit = LogRecord::Commit(CommitRecord {
            log_position: 200,
            transaction_position: 0,
            first_event_number: 0,
            timestamp: 0,
        });

        let mut framer = new_framer();
        let mut batches = Vec::new();

        framer
            .unframe_data(&framed(&[begin.clone(), middle.clone()]), |batch| {
                batches.push(batch);
                Ok(())
            })
            .unwrap();
        assert!(batches.is_empty());
        assert_eq!(framer.pending_count(), 2);

        framer
            .unframe_data(&framed(&[commit.clone()]), |batch| {
                batches.push(batch);
                Ok(())
            })
            .unwrap();
        assert_eq!(batches, vec![vec![begin, middle, commit]]);
        assert_eq!(framer.pending_count(), 0);
    }

    #[test]
    fn test_single_writes_are_their_own_batches() {
        let records = [
            prepare(0, PrepareFlags::single_write()),
            prepare(80, PrepareFlags::single_write()),
        ];
        let mut framer = new_framer();
        let mut sizes = Vec::new();
        framer
            .unframe_data(&framed(&records), |batch| {
                sizes.push(batch.len());
                Ok(())
            })
            .unwrap();
        assert_eq!(sizes, vec![1, 1]);
    }

    #[test]
    fn test_flush_pending_reports_count() {
        let mut framer = new_framer();
        framer
            .unframe_data(
                &framed(&[
                    prepare(0, PrepareFlags::TRANSACTION_BEGIN),
                    prepare(10, PrepareFlags::DATA),
                ]),
                |_| panic!("no boundary yet"),
            )
            .unwrap();

        let mut flushed = Vec::new();
        let count = framer
            .flush_pending(|batch| {
                flushed = batch;
                Ok(())
            })
            .unwrap();
        assert_eq!(count, Some(2));
        assert_eq!(flushed.len(), 2);
        assert_eq!(framer.flush_pending(|_| Ok(())).unwrap(), None);
    }

    #[test]
    fn test_reset_drops_partial_transaction() {
        let mut framer = new_framer();
        let data = framed(&[prepare(0, PrepareFlags::TRANSACTION_BEGIN)]);
        framer.unframe_data(&data, |_| Ok(())).unwrap();
        framer.unframe_data(&data[..3], |_| Ok(())).unwrap();
        assert!(framer.has_data());

        framer.reset();
        assert_eq!(framer.pending_count(), 0);
        assert!(!framer.has_data());
    }
}
