//! Leader epochs
//!
//! An epoch marks the position at which a leader term started. Epochs are
//! written into the log as system records and are the only evidence a leader
//! has that a replica's history matches its own.

use crate::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Encoded size of an epoch payload
pub const EPOCH_ENCODED_SIZE: usize = 8 + 8 + 16 + 16;

/// Leader term boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Epoch {
    /// Monotonic term number
    pub epoch_number: i64,
    /// Log position of the epoch record
    pub epoch_position: i64,
    /// Unique id of this epoch
    pub epoch_id: Uuid,
    /// Leader that wrote the epoch
    pub leader_id: Uuid,
}

impl Epoch {
    /// Create an epoch
    pub fn new(epoch_number: i64, epoch_position: i64, epoch_id: Uuid, leader_id: Uuid) -> Self {
        Self {
            epoch_number,
            epoch_position,
            epoch_id,
            leader_id,
        }
    }

    /// Encode as a system record payload
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(EPOCH_ENCODED_SIZE);
        buf.put_i64_le(self.epoch_position);
        buf.put_i64_le(self.epoch_number);
        buf.put_slice(self.epoch_id.as_bytes());
        buf.put_slice(self.leader_id.as_bytes());
        buf.freeze()
    }

    /// Decode a system record payload
    pub fn decode(mut data: &[u8]) -> Result<Self> {
        if data.len() != EPOCH_ENCODED_SIZE {
            return Err(Error::log_record(format!(
                "Epoch payload must be {} bytes, got {}",
                EPOCH_ENCODED_SIZE,
                data.len()
            )));
        }
        let epoch_position = data.get_i64_le();
        let epoch_number = data.get_i64_le();
        let mut id = [0u8; 16];
        data.copy_to_slice(&mut id);
        let mut leader = [0u8; 16];
        data.copy_to_slice(&mut leader);
        Ok(Self {
            epoch_number,
            epoch_position,
            epoch_id: Uuid::from_bytes(id),
            leader_id: Uuid::from_bytes(leader),
        })
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "E{}@{}:{:?} (L={:?})",
            self.epoch_number, self.epoch_position, self.epoch_id, self.leader_id
        )
    }
}

/// Join epochs for log output
pub fn format_epochs(epochs: &[Epoch]) -> String {
    epochs
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// The leader's view of its epoch history
pub trait EpochManager: Send + Sync {
    /// Whether an epoch with this position, number and id exists
    fn is_correct_epoch_at(&self, epoch_position: i64, epoch_number: i64, epoch_id: Uuid) -> bool;

    /// Number of the newest epoch, -1 when there is none
    fn last_epoch_number(&self) -> i64;

    /// Epoch numbered `epoch_number + 1`, if still known
    fn epoch_after(&self, epoch_number: i64) -> Option<Epoch>;

    /// Up to `count` newest epochs, newest first
    fn last_epochs(&self, count: usize) -> Vec<Epoch>;

    /// Append an epoch written by a new leader term
    fn add_epoch(&self, epoch: Epoch) -> Result<()>;
}

/// Epoch history kept in memory
#[derive(Debug, Default)]
pub struct MemoryEpochManager {
    epochs: RwLock<Vec<Epoch>>,
}

impl MemoryEpochManager {
    /// Empty history
    pub fn new() -> Self {
        Self::default()
    }

    /// History seeded with `epochs` in ascending order
    pub fn with_epochs(epochs: impl IntoIterator<Item = Epoch>) -> Result<Self> {
        let manager = Self::new();
        for epoch in epochs {
            manager.add_epoch(epoch)?;
        }
        Ok(manager)
    }
}

impl EpochManager for MemoryEpochManager {
    fn is_correct_epoch_at(&self, epoch_position: i64, epoch_number: i64, epoch_id: Uuid) -> bool {
        self.epochs.read().iter().any(|e| {
            e.epoch_number == epoch_number
                && e.epoch_position == epoch_position
                && e.epoch_id == epoch_id
        })
    }

    fn last_epoch_number(&self) -> i64 {
        self.epochs.read().last().map_or(-1, |e| e.epoch_number)
    }

    fn epoch_after(&self, epoch_number: i64) -> Option<Epoch> {
        self.epochs
            .read()
            .iter()
            .find(|e| e.epoch_number == epoch_number + 1)
            .copied()
    }

    fn last_epochs(&self, count: usize) -> Vec<Epoch> {
        self.epochs.read().iter().rev().take(count).copied().collect()
    }

    fn add_epoch(&self, epoch: Epoch) -> Result<()> {
        let mut epochs = self.epochs.write();
        if let Some(last) = epochs.last() {
            if epoch.epoch_number <= last.epoch_number || epoch.epoch_position < last.epoch_position {
                return Err(Error::invariant(format!(
                    "Epoch {} does not follow {}",
                    epoch, last
                )));
            }
        }
        epochs.push(epoch);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn epoch(number: i64, position: i64) -> Epoch {
        Epoch::new(number, position, Uuid::new_v4(), Uuid::new_v4())
    }

    #[test]
    fn test_encode_decode() {
        let e = epoch(3, 4096);
        let encoded = e.encode();
        assert_eq!(encoded.len(), EPOCH_ENCODED_SIZE);
        assert_eq!(Epoch::decode(&encoded).unwrap(), e);
    }

    #[test]
    fn test_decode_wrong_size() {
        assert!(matches!(Epoch::decode(&[0u8; 10]), Err(Error::LogRecord(_))));
    }

    #[test]
    fn test_manager_queries() {
        let (e0, e1, e2) = (epoch(0, 0), epoch(1, 100), epoch(2, 250));
        let manager = MemoryEpochManager::with_epochs([e0, e1, e2]).unwrap();

        assert_eq!(manager.last_epoch_number(), 2);
        assert!(manager.is_correct_epoch_at(100, 1, e1.epoch_id));
        assert!(!manager.is_correct_epoch_at(100, 1, Uuid::new_v4()));
        assert!(!manager.is_correct_epoch_at(101, 1, e1.epoch_id));
        assert_eq!(manager.epoch_after(1), Some(e2));
        assert_eq!(manager.epoch_after(2), None);
        assert_eq!(manager.last_epochs(2), vec![e2, e1]);
    }

    #[test]
    fn test_empty_manager() {
        let manager = MemoryEpochManager::new();
        assert_eq!(manager.last_epoch_number(), -1);
        assert!(manager.last_epochs(5).is_empty());
    }

    #[test]
    fn test_out_of_order_epoch_rejected() {
        let manager = MemoryEpochManager::new();
        manager.add_epoch(epoch(2, 200)).unwrap();
        assert!(manager.add_epoch(epoch(1, 300)).is_err());
        assert!(manager.add_epoch(epoch(3, 100)).is_err());
    }
}
