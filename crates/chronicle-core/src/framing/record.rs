//! Log record framer

use super::binary::LengthPrefixSuffixFramer;
use crate::Result;
use crate::log_record::LogRecord;

/// Decodes binary frames into log records
#[derive(Debug)]
pub struct LogRecordFramer {
    framer: LengthPrefixSuffixFramer,
}

impl LogRecordFramer {
    /// Wrap a binary framer
    pub fn new(framer: LengthPrefixSuffixFramer) -> Self {
        Self { framer }
    }

    /// Feed bytes; `on_record` runs once per decoded record.
    ///
    /// A record that fails to decode aborts the feed and the framer is reset.
    pub fn unframe_data<F>(&mut self, data: &[u8], mut on_record: F) -> Result<()>
    where
        F: FnMut(LogRecord) -> Result<()>,
    {
        self.framer
            .unframe_data(data, |frame| on_record(LogRecord::decode(&frame)?))
    }

    /// Drop any partially received record
    pub fn reset(&mut self) {
        self.framer.reset();
    }

    /// Whether a partial record is buffered
    pub fn has_data(&self) -> bool {
        self.framer.has_data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::log_record::CommitRecord;
    use bytes::BytesMut;

    fn commit(log_position: i64) -> LogRecord {
        LogRecord::Commit(CommitRecord {
            log_position,
            transaction_position: 0,
            first_event_number: 0,
            timestamp: 0,
        })
    }

    #[test]
    fn test_records_decoded_in_order() {
        let mut stream = BytesMut::new();
        for pos in [0i64, 50, 100] {
            LengthPrefixSuffixFramer::frame_into(&commit(pos).encode(), &mut stream);
        }

        let mut framer = LogRecordFramer::new(LengthPrefixSuffixFramer::new(1024));
        let mut positions = Vec::new();
        for piece in stream.chunks(7) {
            framer
                .unframe_data(piece, |record| {
                    positions.push(record.log_position());
                    Ok(())
                })
                .unwrap();
        }

        assert_eq!(positions, vec![0, 50, 100]);
        assert!(!framer.has_data());
    }

    #[test]
    fn test_garbage_frame_is_fatal() {
        let framed = LengthPrefixSuffixFramer::frame(&[9, 9, 9]);
        let mut framer = LogRecordFramer::new(LengthPrefixSuffixFramer::new(1024));
        let result = framer.unframe_data(&framed, |_| Ok(()));
        assert!(matches!(result, Err(Error::LogRecord(_))));
    }
}
