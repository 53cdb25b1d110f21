//! Subscribe position reconciliation
//!
//! Given what a replica reports about itself, find the position from which
//! the leader can stream without the replica ever holding bytes the leader's
//! history does not contain.

use crate::epoch::{Epoch, EpochManager, format_epochs};
use crate::{Error, Result};

/// Outcome of reconciling a replica's history against the leader's epochs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciliation {
    /// Position to resume streaming from
    pub position: i64,
    /// Newest epoch both sides agree on
    pub common_epoch: Option<Epoch>,
}

/// Resolve the position a replica must resume from.
///
/// `epochs` are the replica's newest epochs, newest first.
pub fn resolve_subscribe_position(
    epoch_manager: &dyn EpochManager,
    leader_checkpoint: i64,
    log_position: i64,
    epochs: &[Epoch],
) -> Result<Reconciliation> {
    if epochs.is_empty() {
        if log_position > 0 {
            return Err(Error::InconsistentReplicaState { log_position });
        }
        return Ok(Reconciliation {
            position: 0,
            common_epoch: None,
        });
    }

    let found = epochs.iter().enumerate().find(|(_, epoch)| {
        epoch_manager.is_correct_epoch_at(epoch.epoch_position, epoch.epoch_number, epoch.epoch_id)
    });

    let Some((index, common)) = found else {
        tracing::warn!(
            log_position,
            leader_checkpoint,
            "No common epoch found for replica epochs [{}]. Subscribing at 0. Known epochs: [{}]",
            format_epochs(epochs),
            format_epochs(&epoch_manager.last_epochs(usize::MAX))
        );
        return Ok(Reconciliation {
            position: 0,
            common_epoch: None,
        });
    };

    let common = *common;
    let after_common = index.checked_sub(1).map(|i| epochs[i]);

    // Anything the replica wrote after the next epoch it knows of may not exist on this leader.
    let replica_position = after_common.map_or(log_position, |e| e.epoch_position);

    if common.epoch_number == epoch_manager.last_epoch_number() {
        return Ok(Reconciliation {
            position: replica_position.min(leader_checkpoint),
            common_epoch: Some(common),
        });
    }

    let Some(next) = epoch_manager.epoch_after(common.epoch_number) else {
        tracing::error!(
            log_position,
            leader_checkpoint,
            common_epoch = %common,
            "Replica provided epochs [{}] which are not in the epoch manager (possibly too old). Known epochs: [{}]",
            format_epochs(epochs),
            format_epochs(&epoch_manager.last_epochs(usize::MAX))
        );
        return Err(Error::TooOldForResync {
            common_epoch_number: common.epoch_number,
            leader_checkpoint,
        });
    };

    Ok(Reconciliation {
        position: replica_position.min(next.epoch_position),
        common_epoch: Some(common),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epoch::MemoryEpochManager;
    use proptest::prelude::*;
    use uuid::Uuid;

    fn chain(positions: &[i64]) -> Vec<Epoch> {
        let leader = Uuid::new_v4();
        positions
            .iter()
            .enumerate()
            .map(|(n, &p)| Epoch::new(n as i64, p, Uuid::new_v4(), leader))
            .collect()
    }

    fn newest_first(epochs: &[Epoch]) -> Vec<Epoch> {
        epochs.iter().rev().copied().collect()
    }

    #[test]
    fn test_new_replica_starts_at_zero() {
        let manager = MemoryEpochManager::with_epochs(chain(&[0, 100])).unwrap();
        let result = resolve_subscribe_position(&manager, 500, 0, &[]).unwrap();
        assert_eq!(result.position, 0);
        assert_eq!(result.common_epoch, None);
    }

    #[test]
    fn test_data_without_epochs_is_inconsistent() {
        let manager = MemoryEpochManager::new();
        let err = resolve_subscribe_position(&manager, 500, 42, &[]).unwrap_err();
        assert!(matches!(
            err,
            Error::InconsistentReplicaState { log_position: 42 }
        ));
    }

    #[test]
    fn test_same_last_epoch_is_capped_by_leader_checkpoint() {
        let epochs = chain(&[0, 100, 200]);
        let manager = MemoryEpochManager::with_epochs(epochs.clone()).unwrap();
        let replica = newest_first(&epochs);

        let behind = resolve_subscribe_position(&manager, 500, 350, &replica).unwrap();
        assert_eq!(behind.position, 350);
        assert_eq!(behind.common_epoch, Some(epochs[2]));

        let ahead = resolve_subscribe_position(&manager, 500, 800, &replica).unwrap();
        assert_eq!(ahead.position, 500);
    }

    #[test]
    fn test_replica_with_uncommitted_epoch_resumes_at_its_start() {
        let leader_epochs = chain(&[0, 100, 200]);
        let manager = MemoryEpochManager::with_epochs(leader_epochs.clone()).unwrap();

        // Replica had a term at 150 that the leader never saw.
        let mut replica = leader_epochs[..2].to_vec();
        replica.push(Epoch::new(2, 150, Uuid::new_v4(), Uuid::new_v4()));
        let result =
            resolve_subscribe_position(&manager, 500, 180, &newest_first(&replica)).unwrap();

        assert_eq!(result.common_epoch, Some(leader_epochs[1]));
        assert_eq!(result.position, 150);
    }

    #[test]
    fn test_older_common_epoch_capped_by_next_leader_epoch() {
        let leader_epochs = chain(&[0, 100, 200]);
        let manager = MemoryEpochManager::with_epochs(leader_epochs.clone()).unwrap();

        // Replica only knows epochs 0 and 1 and wrote past the leader's epoch 2.
        let replica = newest_first(&leader_epochs[..2]);
        let result = resolve_subscribe_position(&manager, 500, 260, &replica).unwrap();
        assert_eq!(result.position, 200);
    }

    #[test]
    fn test_no_common_epoch_resubscribes_from_zero() {
        let manager = MemoryEpochManager::with_epochs(chain(&[0, 100])).unwrap();
        let replica = chain(&[0, 100]);
        let result =
            resolve_subscribe_position(&manager, 500, 150, &newest_first(&replica)).unwrap();
        assert_eq!(result.position, 0);
        assert_eq!(result.common_epoch, None);
    }

    #[test]
    fn test_common_epoch_without_successor_is_too_old() {
        // The leader knows epoch 1 and epoch 3 but lost epoch 2.
        let leader = Uuid::new_v4();
        let e1 = Epoch::new(1, 100, Uuid::new_v4(), leader);
        let e3 = Epoch::new(3, 300, Uuid::new_v4(), leader);
        let manager = MemoryEpochManager::with_epochs([e1, e3]).unwrap();

        let err = resolve_subscribe_position(&manager, 400, 150, &[e1]).unwrap_err();
        assert!(matches!(
            err,
            Error::TooOldForResync {
                common_epoch_number: 1,
                leader_checkpoint: 400
            }
        ));
    }

    proptest! {
        #[test]
        fn prop_resolution_is_bounded_and_idempotent(
            gaps in prop::collection::vec(1i64..1000, 1..8),
            known in 1usize..8,
            extra in 0i64..2000,
            checkpoint_extra in 0i64..2000,
        ) {
            let mut positions = Vec::new();
            let mut p = 0;
            for gap in &gaps {
                positions.push(p);
                p += gap;
            }
            let leader_epochs = chain(&positions);
            let manager = MemoryEpochManager::with_epochs(leader_epochs.clone()).unwrap();

            let known = known.min(leader_epochs.len());
            let replica = newest_first(&leader_epochs[..known]);
            let last_known = leader_epochs[known - 1].epoch_position;
            let log_position = last_known + extra;
            let leader_checkpoint = leader_epochs.last().unwrap().epoch_position + checkpoint_extra;

            let first = resolve_subscribe_position(&manager, leader_checkpoint, log_position, &replica).unwrap();
            let second = resolve_subscribe_position(&manager, leader_checkpoint, log_position, &replica).unwrap();
            prop_assert_eq!(first, second);

            let bound = if known == leader_epochs.len() {
                leader_checkpoint
            } else {
                leader_epochs[known].epoch_position
            };
            prop_assert!(first.position <= log_position.min(bound));
        }
    }
}
