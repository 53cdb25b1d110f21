//! Framing tests over real chunk bytes
//!
//! Feeds the bytes of a populated chunk through the framer stack at arbitrary
//! split points and checks that the same records come out, in whole
//! transactions.

use chronicle_core::chunk::{MemoryLog, ReplicaLog};
use chronicle_core::framing::{LengthPrefixSuffixFramer, transaction_framer};
use chronicle_core::log_record::LogRecord;
use proptest::prelude::*;

fn populated_log(events: usize) -> MemoryLog {
    let log = MemoryLog::new(1 << 20);
    log.append_epoch(0, uuid::Uuid::new_v4()).unwrap();
    for i in 0..events {
        log.append_event("stream", "Event", format!("payload-{}", i).as_bytes())
            .unwrap();
    }
    log.flush().unwrap();
    log
}

fn split_points(len: usize, cuts: &[usize]) -> Vec<usize> {
    let mut points: Vec<usize> = cuts.iter().map(|c| c % (len + 1)).collect();
    points.push(0);
    points.push(len);
    points.sort_unstable();
    points.dedup();
    points
}

#[test]
fn test_three_byte_payload_framed_to_eleven_bytes() {
    let framed = LengthPrefixSuffixFramer::frame(&[0x07, 0x17, 0x27]);
    assert_eq!(
        framed.as_ref(),
        &[3, 0, 0, 0, 0x07, 0x17, 0x27, 3, 0, 0, 0]
    );

    let mut framer = LengthPrefixSuffixFramer::new(1024);
    let mut frames = Vec::new();
    let mut offset = 0;
    for piece in [2, 2, 3, 2, 2] {
        framer
            .unframe_data(&framed[offset..offset + piece], |frame| {
                frames.push(frame);
                Ok(())
            })
            .unwrap();
        offset += piece;
    }
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].as_ref(), &[0x07, 0x17, 0x27]);
}

proptest! {
    #[test]
    fn prop_chunk_bytes_reassemble_at_any_split(
        events in 1usize..20,
        cuts in prop::collection::vec(any::<usize>(), 0..12),
    ) {
        let log = populated_log(events);
        let (_, bytes) = log.chunk_data().remove(0);
        let expected = log.read_records().unwrap();

        let mut framer = transaction_framer(1 << 20);
        let mut transactions: Vec<Vec<LogRecord>> = Vec::new();
        let points = split_points(bytes.len(), &cuts);
        for window in points.windows(2) {
            framer
                .unframe_data(&bytes[window[0]..window[1]], |records| {
                    transactions.push(records);
                    Ok(())
                })
                .unwrap();
        }

        prop_assert!(!framer.has_data());
        prop_assert_eq!(transactions.len(), events + 1);
        for transaction in &transactions {
            prop_assert!(transaction.last().is_some_and(|r| r.is_transaction_boundary()));
        }
        let records: Vec<LogRecord> = transactions.into_iter().flatten().collect();
        prop_assert_eq!(records, expected);
    }

    #[test]
    fn prop_reset_discards_partial_record(
        events in 1usize..10,
        cut in 1usize..64,
    ) {
        let log = populated_log(events);
        let (_, bytes) = log.chunk_data().remove(0);
        let cut = cut.min(bytes.len() - 1);

        let mut framer = transaction_framer(1 << 20);
        framer.unframe_data(&bytes[..cut], |_| Ok(())).unwrap();
        framer.reset();

        let mut count = 0;
        framer
            .unframe_data(&bytes, |records| {
                count += records.len();
                Ok(())
            })
            .unwrap();
        prop_assert_eq!(count, events + 1);
    }
}
