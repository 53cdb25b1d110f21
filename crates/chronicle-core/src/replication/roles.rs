//! Role assignment policy
//!
//! Greedy, rank-based: candidates are ordered by how far they have
//! replicated and the most caught-up clones are promoted first.

use crate::config::ReplicationConfig;
use crate::state::ReplicaRole;
use uuid::Uuid;

/// Snapshot of one promotable, caught-up subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleCandidate {
    /// Subscription id
    pub subscription_id: Uuid,
    /// Next position the leader will send
    pub log_position: i64,
    /// Current role, never `CatchingUp`
    pub role: ReplicaRole,
    /// Consecutive passes ranked outside the follower set
    pub lag_occurrences: u32,
}

/// Role change decided by a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleAction {
    /// Clone becomes follower
    Promote(Uuid),
    /// Lagging follower becomes clone
    Demote(Uuid),
    /// Surplus clone should disconnect
    Drop(Uuid),
}

/// Thresholds driving role assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RolePolicy {
    /// Followers to keep, `cluster_size - 1`
    pub desired_follower_count: usize,
    /// Passes outside the follower ranks before a follower counts as lagging
    pub lag_occurrences_threshold: u32,
    /// Bytes behind the leader before a follower counts as lagging
    pub follower_lag_threshold: i64,
    /// Keep surplus clones
    pub allow_surplus_nodes: bool,
}

impl From<&ReplicationConfig> for RolePolicy {
    fn from(config: &ReplicationConfig) -> Self {
        Self {
            desired_follower_count: config.desired_follower_count(),
            lag_occurrences_threshold: config.lag_occurrences_threshold,
            follower_lag_threshold: config.follower_lag_threshold,
            allow_surplus_nodes: config.unsafe_allow_surplus_nodes,
        }
    }
}

/// Run one assignment pass.
///
/// Candidates are sorted by descending position and updated in place; the
/// returned actions must be sent to the affected replicas.
pub fn assign_roles(
    policy: &RolePolicy,
    candidates: &mut [RoleCandidate],
    leader_checkpoint: i64,
) -> Vec<RoleAction> {
    candidates.sort_by(|a, b| b.log_position.cmp(&a.log_position));
    let desired = policy.desired_follower_count;
    let mut actions = Vec::new();

    let mut follower_count = 0;
    let mut lagging_followers = 0;
    for (rank, candidate) in candidates.iter_mut().enumerate() {
        if candidate.role != ReplicaRole::Follower {
            continue;
        }
        follower_count += 1;
        candidate.lag_occurrences = if rank < desired {
            0
        } else {
            candidate.lag_occurrences + 1
        };
        if candidate.lag_occurrences >= policy.lag_occurrences_threshold
            && leader_checkpoint - candidate.log_position >= policy.follower_lag_threshold
        {
            lagging_followers += 1;
        }
    }

    // Fill the follower set with the best clones.
    let mut clone_index = 0;
    for _ in follower_count..desired {
        clone_index = next_clone(candidates, clone_index);
        if clone_index >= candidates.len() {
            break;
        }
        promote(&mut candidates[clone_index], &mut actions);
        clone_index += 1;
    }

    // Swap the worst lagging followers for the best remaining clones.
    let mut follower_index = candidates.len() as isize - 1;
    for _ in 0..lagging_followers {
        clone_index = next_clone(candidates, clone_index);
        while follower_index >= 0 && candidates[follower_index as usize].role != ReplicaRole::Follower {
            follower_index -= 1;
        }
        if clone_index as isize > follower_index {
            break;
        }

        let old = &mut candidates[follower_index as usize];
        old.role = ReplicaRole::Clone;
        old.lag_occurrences = 0;
        actions.push(RoleAction::Demote(old.subscription_id));
        follower_index -= 1;

        promote(&mut candidates[clone_index], &mut actions);
        clone_index += 1;
    }

    if !policy.allow_surplus_nodes {
        clone_index = next_clone(candidates, clone_index);
        while clone_index < candidates.len() && candidates[clone_index].role == ReplicaRole::Clone {
            actions.push(RoleAction::Drop(candidates[clone_index].subscription_id));
            clone_index += 1;
        }
    }

    actions
}

fn next_clone(candidates: &[RoleCandidate], mut index: usize) -> usize {
    while index < candidates.len() && candidates[index].role != ReplicaRole::Clone {
        index += 1;
    }
    index
}

fn promote(candidate: &mut RoleCandidate, actions: &mut Vec<RoleAction>) {
    candidate.role = ReplicaRole::Follower;
    candidate.lag_occurrences = 0;
    actions.push(RoleAction::Promote(candidate.subscription_id));
}
