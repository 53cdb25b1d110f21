//! Framing layer
//!
//! Three stacked framers turn a raw byte stream into whole transactions:
//!
//! ```text
//! bytes ──► LengthPrefixSuffixFramer ──► LogRecordFramer ──► TransactionFramer
//!            (frames)                     (records)            (transactions)
//! ```

mod binary;
mod record;
mod transaction;

pub use binary::{FRAME_OVERHEAD, LENGTH_SIZE, LengthPrefixSuffixFramer};
pub use record::LogRecordFramer;
pub use transaction::TransactionFramer;

/// Build the full framer stack
pub fn transaction_framer(max_frame_size: usize) -> TransactionFramer {
    TransactionFramer::new(LogRecordFramer::new(LengthPrefixSuffixFramer::new(
        max_frame_size,
    )))
}
