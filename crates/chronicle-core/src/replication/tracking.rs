//! Replication tracking service
//!
//! On the leader, turns replica acks into the replicated-to checkpoint: the
//! highest position held by a quorum, leader included. On a replica, mirrors
//! the value the leader publishes.

use crate::checkpoint::Checkpoint;
use crate::replication::ReplicationStorage;
use crate::replication::events::{EventSender, NodeEvent, publish};
use crate::state::NodeState;
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

const SERVICE_NAME: &str = "Replication Tracking Service";

/// Position durable on `min_replicas_needed` replicas plus the leader.
///
/// Returns `None` when the checkpoint cannot move: the writer is not ahead of
/// `current`, or too few replicas have reported.
pub fn compute_replicated_to(
    writer_checkpoint: i64,
    current: i64,
    replica_positions: &[i64],
    min_replicas_needed: usize,
) -> Option<i64> {
    if writer_checkpoint <= current {
        return None;
    }
    if min_replicas_needed == 0 {
        return Some(writer_checkpoint);
    }
    if replica_positions.len() < min_replicas_needed {
        return None;
    }

    let mut positions = replica_positions.to_vec();
    positions.sort_unstable();
    let furthest_quorum = positions[positions.len() - min_replicas_needed];
    let candidate = writer_checkpoint.min(furthest_quorum);
    (candidate > current).then_some(candidate)
}

enum TrackingCommand {
    StateChanged(NodeState),
    ReplicaAck { subscription_id: Uuid, log_position: i64 },
    ReplicaGone(Uuid),
    LeaderReplicatedTo(i64),
}

/// Cloneable handle on a running tracking service
#[derive(Clone)]
pub struct TrackingHandle {
    commands: mpsc::UnboundedSender<TrackingCommand>,
    replication_checkpoint: Arc<dyn Checkpoint>,
}

impl TrackingHandle {
    /// Announce a node state change
    pub fn set_state(&self, state: NodeState) -> Result<()> {
        self.send(TrackingCommand::StateChanged(state))
    }

    /// Record a promotable replica's ack
    pub fn replica_ack(&self, subscription_id: Uuid, log_position: i64) -> Result<()> {
        self.send(TrackingCommand::ReplicaAck {
            subscription_id,
            log_position,
        })
    }

    /// Stop counting a replica
    pub fn replica_gone(&self, subscription_id: Uuid) -> Result<()> {
        self.send(TrackingCommand::ReplicaGone(subscription_id))
    }

    /// Mirror the leader's checkpoint on a replica
    pub fn leader_replicated_to(&self, log_position: i64) -> Result<()> {
        self.send(TrackingCommand::LeaderReplicatedTo(log_position))
    }

    /// Current flushed replicated-to checkpoint
    pub fn replicated_to(&self) -> i64 {
        self.replication_checkpoint.read()
    }

    fn send(&self, command: TrackingCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::service_stopped(SERVICE_NAME))
    }
}

/// Maintains the replicated-to checkpoint
pub struct ReplicationTrackingService;

impl ReplicationTrackingService {
    /// Spawn the service task
    pub fn start(
        quorum_size: usize,
        tracking_wait: Duration,
        storage: &ReplicationStorage,
        events: EventSender,
    ) -> (TrackingHandle, JoinHandle<Result<()>>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let handle = TrackingHandle {
            commands: commands_tx,
            replication_checkpoint: storage.replication_checkpoint.clone(),
        };
        let service = TrackingLoop {
            min_replicas_needed: quorum_size.saturating_sub(1),
            tracking_wait,
            writer: storage.writer_checkpoint.clone(),
            replication_checkpoint: storage.replication_checkpoint.clone(),
            commands: commands_rx,
            events,
            state: NodeState::Initializing,
            replica_positions: HashMap::new(),
        };
        (handle, tokio::spawn(service.run()))
    }
}

struct TrackingLoop {
    min_replicas_needed: usize,
    tracking_wait: Duration,
    writer: Arc<dyn Checkpoint>,
    replication_checkpoint: Arc<dyn Checkpoint>,
    commands: mpsc::UnboundedReceiver<TrackingCommand>,
    events: EventSender,
    state: NodeState,
    replica_positions: HashMap<Uuid, i64>,
}

impl TrackingLoop {
    async fn run(mut self) -> Result<()> {
        let mut flushed = self.writer.subscribe();
        let result = loop {
            let outcome = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break Ok(()),
                },
                changed = flushed.changed() => match changed {
                    Ok(()) => self.update_replication_position(),
                    Err(_) => break Ok(()),
                },
                _ = tokio::time::sleep(self.tracking_wait) => self.update_replication_position(),
            };
            if let Err(e) = outcome {
                tracing::error!("{} failed: {}", SERVICE_NAME, e);
                break Err(e);
            }
            if self.state.is_shutting_down() {
                break Ok(());
            }
        };

        publish(
            &self.events,
            NodeEvent::ServiceShutdown {
                name: SERVICE_NAME.to_string(),
            },
        );
        result
    }

    fn handle_command(&mut self, command: TrackingCommand) -> Result<()> {
        match command {
            TrackingCommand::StateChanged(state) => {
                if self.state == NodeState::Leader && state != NodeState::Leader {
                    self.replica_positions.clear();
                }
                self.state = state;
                Ok(())
            }
            TrackingCommand::ReplicaAck {
                subscription_id,
                log_position,
            } => {
                let position = self.replica_positions.entry(subscription_id).or_insert(log_position);
                *position = (*position).max(log_position);
                self.update_replication_position()
            }
            TrackingCommand::ReplicaGone(subscription_id) => {
                self.replica_positions.remove(&subscription_id);
                Ok(())
            }
            TrackingCommand::LeaderReplicatedTo(log_position) => {
                if self.state == NodeState::Leader {
                    return Ok(());
                }
                self.advance_to(log_position)
            }
        }
    }

    fn update_replication_position(&mut self) -> Result<()> {
        if self.state != NodeState::Leader {
            return Ok(());
        }
        let positions: Vec<i64> = self.replica_positions.values().copied().collect();
        match compute_replicated_to(
            self.writer.read(),
            self.replication_checkpoint.read(),
            &positions,
            self.min_replicas_needed,
        ) {
            Some(position) => self.advance_to(position),
            None => Ok(()),
        }
    }

    fn advance_to(&self, log_position: i64) -> Result<()> {
        if log_position <= self.replication_checkpoint.read() {
            return Ok(());
        }
        self.replication_checkpoint.write(log_position);
        self.replication_checkpoint.flush()?;
        tracing::debug!("Replicated to {} (0x{:X})", log_position, log_position);
        publish(&self.events, NodeEvent::ReplicatedTo { log_position });
        Ok(())
    }
}
