//! Leader replication service
//!
//! One task owns every replica subscription. Each pass it:
//! - ships one bulk to every subscription with room in its send window
//! - promotes caught-up replicas from CatchingUp to Clone
//! - watches for quorum loss
//! - reassigns Clone/Follower roles
//!
//! When nothing was shipped it waits for the writer checkpoint to move, a
//! command, or the idle timeout.
//!
//! Acks do not go through the task: [`LeaderHandle::ack`] updates the
//! subscription's [`AckCell`] directly and the loop reads it on its next pass.

use crate::checkpoint::Checkpoint;
use crate::config::ReplicationConfig;
use crate::epoch::{Epoch, EpochManager, format_epochs};
use crate::replication::ReplicationStorage;
use crate::replication::events::{EventSender, NodeEvent, publish};
use crate::replication::messages::{ReplicationMessage, ReplicationStats};
use crate::replication::reconcile::resolve_subscribe_position;
use crate::replication::roles::{RoleAction, RoleCandidate, RolePolicy, assign_roles};
use crate::replication::shipper::ChunkShipper;
use crate::replication::subscription::{AckCell, ReplicaSubscription};
use crate::state::{NodeState, ReplicaRole};
use crate::transport::{AcceptedConnection, ReplicaConnectionRef};
use crate::{Error, Result};
use dashmap::DashMap;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

const SERVICE_NAME: &str = "Leader Replication Service";

/// A replica's request to stream the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRequest {
    /// Leader the replica believes is current
    pub leader_id: Uuid,
    /// Unique per subscription attempt
    pub subscription_id: Uuid,
    /// Replica writer position
    pub log_position: i64,
    /// Replica's chunk at `log_position`
    pub chunk_id: Option<Uuid>,
    /// Replica's newest epochs, newest first
    pub last_epochs: Vec<Epoch>,
    /// Replica's advertised endpoint
    pub replica_endpoint: SocketAddr,
    /// Read-only replicas are never promoted
    pub is_promotable: bool,
}

impl SubscribeRequest {
    /// Extract a request from a `SubscribeReplica` message
    pub fn from_message(message: ReplicationMessage) -> Option<Self> {
        match message {
            ReplicationMessage::SubscribeReplica {
                leader_id,
                subscription_id,
                log_position,
                chunk_id,
                last_epochs,
                replica_endpoint,
                is_promotable,
            } => Some(Self {
                leader_id,
                subscription_id,
                log_position,
                chunk_id,
                last_epochs,
                replica_endpoint,
                is_promotable,
            }),
            _ => None,
        }
    }
}

enum LeaderCommand {
    StateChanged(NodeState),
    Subscribe {
        connection: ReplicaConnectionRef,
        correlation_id: Uuid,
        request: SubscribeRequest,
    },
    ReplicatedTo(i64),
    GetStats(oneshot::Sender<Vec<ReplicationStats>>),
}

/// Cloneable handle on a running leader service
#[derive(Clone)]
pub struct LeaderHandle {
    instance_id: Uuid,
    commands: mpsc::UnboundedSender<LeaderCommand>,
    acks: Arc<DashMap<Uuid, Arc<AckCell>>>,
    events: EventSender,
}

impl LeaderHandle {
    /// Instance id of this leader
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Announce a node state change
    pub fn set_state(&self, state: NodeState) -> Result<()> {
        self.send(LeaderCommand::StateChanged(state))
    }

    /// Hand a subscription request to the service
    pub fn subscribe(
        &self,
        connection: ReplicaConnectionRef,
        correlation_id: Uuid,
        request: SubscribeRequest,
    ) -> Result<()> {
        self.send(LeaderCommand::Subscribe {
            connection,
            correlation_id,
            request,
        })
    }

    /// Record an ack; returns the subscription's acked position afterwards,
    /// or `None` for an unknown subscription
    pub fn ack(&self, subscription_id: Uuid, replication_log_position: i64) -> Option<i64> {
        // The entry stays locked until the ack is published so that a
        // concurrent removal is always published after it.
        let cell = self.acks.get(&subscription_id)?;
        let acked = cell.advance(replication_log_position);
        if cell.is_promotable() {
            publish(
                &self.events,
                NodeEvent::ReplicaWriteAck {
                    subscription_id,
                    log_position: acked,
                },
            );
        }
        Some(acked)
    }

    /// Broadcast the replicated-to checkpoint to replicas
    pub fn replicated_to(&self, log_position: i64) -> Result<()> {
        self.send(LeaderCommand::ReplicatedTo(log_position))
    }

    /// Per-subscription statistics
    pub async fn stats(&self) -> Result<Vec<ReplicationStats>> {
        let (tx, rx) = oneshot::channel();
        self.send(LeaderCommand::GetStats(tx))?;
        rx.await
            .map_err(|_| Error::service_stopped(SERVICE_NAME))
    }

    /// Whether a subscription is live
    pub fn is_subscribed(&self, subscription_id: Uuid) -> bool {
        self.acks.contains_key(&subscription_id)
    }

    /// Pass a write forwarded by a replica to the node
    pub fn forwarded_write(
        &self,
        connection_id: Uuid,
        stream_id: String,
        event_type: String,
        data: Vec<u8>,
    ) {
        publish(
            &self.events,
            NodeEvent::ForwardedWrite {
                connection_id,
                stream_id,
                event_type,
                data,
            },
        );
    }

    fn send(&self, command: LeaderCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::service_stopped(SERVICE_NAME))
    }
}

/// Streams the leader's log to replica subscriptions
pub struct LeaderReplicationService;

impl LeaderReplicationService {
    /// Spawn the service task. It starts in `Initializing` and ships only
    /// while the node is `Leader`.
    pub fn start(
        instance_id: Uuid,
        config: ReplicationConfig,
        storage: &ReplicationStorage,
        events: EventSender,
    ) -> (LeaderHandle, JoinHandle<Result<()>>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let acks = Arc::new(DashMap::new());
        let handle = LeaderHandle {
            instance_id,
            commands: commands_tx,
            acks: acks.clone(),
            events: events.clone(),
        };

        let shipper = ChunkShipper::new(
            instance_id,
            storage.chunks.clone(),
            config.bulk_size,
            config.reader_acquire_retries,
        );
        let service = LeaderLoop {
            instance_id,
            policy: RolePolicy::from(&config),
            config,
            shipper,
            writer: storage.writer_checkpoint.clone(),
            replication_checkpoint: storage.replication_checkpoint.clone(),
            epochs: storage.epochs.clone(),
            commands: commands_rx,
            acks,
            events,
            state: NodeState::Initializing,
            subscriptions: HashMap::new(),
            new_subscriptions: false,
            no_quorum_since: None,
            no_quorum_notified: false,
            last_role_assignment: Instant::now(),
        };

        (handle, tokio::spawn(service.run()))
    }
}

struct LeaderLoop {
    instance_id: Uuid,
    config: ReplicationConfig,
    policy: RolePolicy,
    shipper: ChunkShipper,
    writer: Arc<dyn Checkpoint>,
    replication_checkpoint: Arc<dyn Checkpoint>,
    epochs: Arc<dyn EpochManager>,
    commands: mpsc::UnboundedReceiver<LeaderCommand>,
    acks: Arc<DashMap<Uuid, Arc<AckCell>>>,
    events: EventSender,
    state: NodeState,
    subscriptions: HashMap<Uuid, ReplicaSubscription>,
    new_subscriptions: bool,
    no_quorum_since: Option<Instant>,
    no_quorum_notified: bool,
    last_role_assignment: Instant,
}

impl LeaderLoop {
    async fn run(mut self) -> Result<()> {
        let mut flushed = self.writer.subscribe();
        let result = self.main_loop(&mut flushed).await;
        if let Err(e) = &result {
            tracing::error!("{} stopped with error: {}", SERVICE_NAME, e);
        }

        self.dispose_all("Leader replication service is shutting down");
        publish(
            &self.events,
            NodeEvent::ServiceShutdown {
                name: SERVICE_NAME.to_string(),
            },
        );
        result
    }

    async fn main_loop(&mut self, flushed: &mut watch::Receiver<i64>) -> Result<()> {
        loop {
            // Pending commands first, so new subscriptions ship in this pass.
            loop {
                match self.commands.try_recv() {
                    Ok(command) => self.handle_command(command),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return Ok(()),
                }
            }
            if self.state.is_shutting_down() {
                return Ok(());
            }

            drop(flushed.borrow_and_update());
            let data_found = match self.iterate() {
                Ok(found) => found,
                Err(e) => {
                    tracing::error!("Error during leader replication iteration: {}", e);
                    if cfg!(debug_assertions) {
                        return Err(e);
                    }
                    false
                }
            };
            if data_found {
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => return Ok(()),
                },
                _ = flushed.changed() => {}
                _ = tokio::time::sleep(self.config.idle_wait) => {}
            }
        }
    }

    fn iterate(&mut self) -> Result<bool> {
        if self.state != NodeState::Leader {
            return Ok(false);
        }
        let now = Instant::now();
        let data_found = self.manage_subscriptions()?;
        self.manage_no_quorum(now);
        let force = std::mem::take(&mut self.new_subscriptions);
        self.manage_role_assignments(force, now);
        Ok(data_found)
    }

    fn handle_command(&mut self, command: LeaderCommand) {
        match command {
            LeaderCommand::StateChanged(state) => self.handle_state_change(state),
            LeaderCommand::Subscribe {
                connection,
                correlation_id,
                request,
            } => self.handle_subscribe(connection, correlation_id, request),
            LeaderCommand::ReplicatedTo(log_position) => self.broadcast_replicated_to(log_position),
            LeaderCommand::GetStats(reply) => {
                let stats = self.subscriptions.values().map(|s| s.stats()).collect();
                if reply.send(stats).is_err() {
                    tracing::debug!("Stats requester went away");
                }
            }
        }
    }

    fn handle_state_change(&mut self, state: NodeState) {
        let previous = self.state;
        self.state = state;
        if previous == state {
            return;
        }
        tracing::info!(
            "{}: node state changed from {} to {}",
            SERVICE_NAME,
            self.config.terminology.state(previous),
            self.config.terminology.state(state)
        );

        if state == NodeState::Leader {
            self.last_role_assignment = Instant::now();
        } else if previous == NodeState::Leader {
            self.dispose_all(&format!(
                "Node state changed to {}. Closing replication connection.",
                self.config.terminology.state(state)
            ));
        }
        self.no_quorum_since = None;
        self.no_quorum_notified = false;
    }

    fn handle_subscribe(
        &mut self,
        connection: ReplicaConnectionRef,
        correlation_id: Uuid,
        request: SubscribeRequest,
    ) {
        if self.state != NodeState::Leader || request.leader_id != self.instance_id {
            tracing::debug!(
                subscription_id = %request.subscription_id,
                "Rejecting subscription from {}: node is {} with id {}, request addressed to {}",
                request.replica_endpoint,
                self.config.terminology.state(self.state),
                self.instance_id,
                request.leader_id
            );
            connection.reply(
                correlation_id,
                ReplicationMessage::ReplicaSubscriptionRetry {
                    leader_id: self.instance_id,
                    subscription_id: request.subscription_id,
                },
            );
            return;
        }

        if self.subscriptions.contains_key(&request.subscription_id) {
            tracing::error!(
                subscription_id = %request.subscription_id,
                "There is already a subscription with id {}, rejecting request from {}",
                request.subscription_id,
                request.replica_endpoint
            );
            connection.send_bad_request_and_close(
                correlation_id,
                &format!("Duplicate subscription id {}", request.subscription_id),
            );
            return;
        }

        // A connection carries at most one subscription.
        let connection_id = connection.connection_id();
        for other in self.subscriptions.values_mut() {
            if other.connection_id() == connection_id {
                other.should_dispose = true;
            }
        }

        publish(
            &self.events,
            NodeEvent::ConnectionEstablished {
                endpoint: request.replica_endpoint,
                connection_id,
            },
        );

        let mut subscription = ReplicaSubscription::new(
            connection.clone(),
            request.subscription_id,
            request.replica_endpoint,
            request.is_promotable,
        );
        match self.subscribe_replica(&mut subscription, &request) {
            Ok(position) => {
                subscription.reset_ack(position);
                self.acks
                    .insert(subscription.subscription_id, subscription.ack_cell());
                subscription.send(ReplicationMessage::ReplicatedTo {
                    log_position: self.replication_checkpoint.read(),
                });
                self.subscriptions
                    .insert(subscription.subscription_id, subscription);
                self.new_subscriptions = true;
            }
            Err(e) => {
                tracing::error!(
                    subscription_id = %request.subscription_id,
                    "Error while subscribing replica {}. Connection will be dropped: {}",
                    subscription,
                    e
                );
                connection.send_bad_request_and_close(correlation_id, &e.to_string());
            }
        }
    }

    fn subscribe_replica(
        &self,
        subscription: &mut ReplicaSubscription,
        request: &SubscribeRequest,
    ) -> Result<i64> {
        let leader_checkpoint = self.writer.read();
        tracing::info!(
            subscription_id = %request.subscription_id,
            "SUBSCRIBE REQUEST from {} at {} (0x{:X}), epochs: [{}], leader checkpoint: {} (0x{:X})",
            subscription,
            request.log_position,
            request.log_position,
            format_epochs(&request.last_epochs),
            leader_checkpoint,
            leader_checkpoint
        );

        let reconciliation = resolve_subscribe_position(
            self.epochs.as_ref(),
            leader_checkpoint,
            request.log_position,
            &request.last_epochs,
        )?;
        self.shipper.set_subscription_position(
            subscription,
            reconciliation.position,
            request.chunk_id,
            true,
            true,
        )
    }

    fn manage_subscriptions(&mut self) -> Result<bool> {
        let leader_checkpoint = self.writer.read();
        let mut data_found = false;

        let ids: Vec<Uuid> = self.subscriptions.keys().copied().collect();
        for id in ids {
            let Some(subscription) = self.subscriptions.get_mut(&id) else {
                continue;
            };

            let lost = subscription.is_connection_closed();
            if lost || subscription.should_dispose {
                if let Some(subscription) = self.subscriptions.remove(&id) {
                    self.remove_subscription(subscription, lost);
                }
                continue;
            }

            // Backpressure
            if subscription.send_queue_size() >= self.config.max_queue_size
                || subscription.log_position() - subscription.acked_log_position()
                    >= self.config.replica_send_window
            {
                continue;
            }

            match self.shipper.try_send_log_bulk(subscription, leader_checkpoint) {
                Ok(found) => data_found |= found,
                Err(e) => {
                    tracing::error!(
                        subscription_id = %id,
                        "Error during replication send to replica {}: {}",
                        subscription,
                        e
                    );
                    subscription.should_dispose = true;
                    if cfg!(debug_assertions) && matches!(e, Error::ReplicationInvariant(_)) {
                        return Err(e);
                    }
                    continue;
                }
            }

            if subscription.role == ReplicaRole::CatchingUp
                && leader_checkpoint - subscription.log_position() <= self.config.clone_threshold
            {
                subscription.role = ReplicaRole::Clone;
                subscription.send(ReplicationMessage::CloneAssignment {
                    leader_id: self.instance_id,
                    subscription_id: id,
                });
                tracing::info!(
                    subscription_id = %id,
                    "Replica {} caught up at {}, assigned role {}",
                    subscription,
                    subscription.log_position(),
                    self.config.terminology.role(ReplicaRole::Clone)
                );
                publish(
                    &self.events,
                    NodeEvent::RoleAssigned {
                        subscription_id: id,
                        role: ReplicaRole::Clone,
                    },
                );
                self.new_subscriptions = true;
            }
        }

        Ok(data_found)
    }

    fn manage_no_quorum(&mut self, now: Instant) {
        let voting = self
            .subscriptions
            .values()
            .filter(|s| s.is_promotable && s.role != ReplicaRole::CatchingUp)
            .count();

        if voting >= self.config.cluster_size / 2 {
            if self.no_quorum_notified {
                tracing::info!("{} has quorum again with {} replicas", self.config.terminology.leader(), voting);
            }
            self.no_quorum_since = None;
            self.no_quorum_notified = false;
            return;
        }

        let since = *self.no_quorum_since.get_or_insert(now);
        if !self.no_quorum_notified && now.duration_since(since) >= self.config.no_quorum_timeout {
            tracing::warn!(
                "{} has no quorum: {} caught-up replicas for cluster size {} for {:?}",
                self.config.terminology.leader(),
                voting,
                self.config.cluster_size,
                now.duration_since(since)
            );
            publish(&self.events, NodeEvent::NoQuorum);
            self.no_quorum_notified = true;
        }
    }

    fn manage_role_assignments(&mut self, force: bool, now: Instant) {
        if !force && now.duration_since(self.last_role_assignment) < self.config.role_assignments_interval {
            return;
        }
        self.last_role_assignment = now;

        let mut candidates: Vec<RoleCandidate> = self
            .subscriptions
            .values()
            .filter(|s| s.is_promotable && s.role != ReplicaRole::CatchingUp)
            .map(|s| RoleCandidate {
                subscription_id: s.subscription_id,
                log_position: s.log_position(),
                role: s.role,
                lag_occurrences: s.lag_occurrences,
            })
            .collect();
        if candidates.is_empty() {
            return;
        }

        let actions = assign_roles(&self.policy, &mut candidates, self.writer.read());
        for candidate in &candidates {
            if let Some(subscription) = self.subscriptions.get_mut(&candidate.subscription_id) {
                subscription.role = candidate.role;
                subscription.lag_occurrences = candidate.lag_occurrences;
            }
        }

        for action in actions {
            self.apply_role_action(action);
        }
    }

    fn apply_role_action(&self, action: RoleAction) {
        let terminology = self.config.terminology;
        let (subscription_id, message, role) = match action {
            RoleAction::Promote(id) => (
                id,
                ReplicationMessage::FollowerAssignment {
                    leader_id: self.instance_id,
                    subscription_id: id,
                },
                Some(ReplicaRole::Follower),
            ),
            RoleAction::Demote(id) => (
                id,
                ReplicationMessage::CloneAssignment {
                    leader_id: self.instance_id,
                    subscription_id: id,
                },
                Some(ReplicaRole::Clone),
            ),
            RoleAction::Drop(id) => (
                id,
                ReplicationMessage::DropSubscription {
                    leader_id: self.instance_id,
                    subscription_id: id,
                },
                None,
            ),
        };

        let Some(subscription) = self.subscriptions.get(&subscription_id) else {
            return;
        };
        match role {
            Some(role) => {
                tracing::info!(
                    subscription_id = %subscription_id,
                    "Assigning role {} to replica {} at {}",
                    terminology.role(role),
                    subscription,
                    subscription.log_position()
                );
                publish(&self.events, NodeEvent::RoleAssigned { subscription_id, role });
            }
            None => {
                tracing::info!(
                    subscription_id = %subscription_id,
                    "Dropping surplus {} {}",
                    terminology.role(ReplicaRole::Clone),
                    subscription
                );
            }
        }
        subscription.send(message);
    }

    fn broadcast_replicated_to(&self, log_position: i64) {
        for subscription in self.subscriptions.values() {
            if subscription.is_connection_closed()
                || subscription.send_queue_size() >= self.config.max_queue_size
            {
                continue;
            }
            subscription.send(ReplicationMessage::ReplicatedTo { log_position });
        }
    }

    fn remove_subscription(&mut self, mut subscription: ReplicaSubscription, lost: bool) {
        self.forget(subscription.subscription_id);
        if lost {
            tracing::info!(
                subscription_id = %subscription.subscription_id,
                "Connection to replica {} lost",
                subscription
            );
            publish(
                &self.events,
                NodeEvent::ConnectionLost {
                    endpoint: subscription.replica_endpoint,
                    connection_id: subscription.connection_id(),
                    subscription_id: Some(subscription.subscription_id),
                },
            );
            subscription.dispose("Connection lost");
        } else {
            tracing::info!(
                subscription_id = %subscription.subscription_id,
                "Disposing subscription for replica {}",
                subscription
            );
            subscription.dispose("Subscription disposed");
        }
    }

    fn dispose_all(&mut self, reason: &str) {
        let subscriptions: Vec<_> = self.subscriptions.drain().collect();
        for (id, mut subscription) in subscriptions {
            self.forget(id);
            subscription.dispose(reason);
        }
    }

    fn forget(&self, subscription_id: Uuid) {
        self.acks.remove(&subscription_id);
        publish(&self.events, NodeEvent::SubscriptionRemoved { subscription_id });
    }
}

/// Dispatch messages arriving on one replica connection to the leader
/// service until the replica goes away.
pub async fn serve_connection(handle: LeaderHandle, accepted: AcceptedConnection) {
    let AcceptedConnection {
        connection,
        mut inbound,
    } = accepted;
    let connection_id = connection.connection_id();

    while let Some(envelope) = inbound.recv().await {
        let correlation_id = envelope.correlation_id;
        let name = envelope.message.name();
        let result = match envelope.message {
            message @ ReplicationMessage::SubscribeReplica { .. } => {
                match SubscribeRequest::from_message(message) {
                    Some(request) => handle.subscribe(connection.clone(), correlation_id, request),
                    None => Ok(()),
                }
            }
            ReplicationMessage::ReplicaLogPositionAck {
                subscription_id,
                replication_log_position,
                ..
            } => {
                if handle.ack(subscription_id, replication_log_position).is_none() {
                    tracing::debug!(
                        subscription_id = %subscription_id,
                        "Ack for unknown subscription ignored"
                    );
                }
                Ok(())
            }
            ReplicationMessage::ForwardedWrite {
                stream_id,
                event_type,
                data,
            } => {
                handle.forwarded_write(connection_id, stream_id, event_type, data);
                Ok(())
            }
            ReplicationMessage::GetReplicationStats => match handle.stats().await {
                Ok(stats) => {
                    connection.reply(
                        correlation_id,
                        ReplicationMessage::GetReplicationStatsCompleted { stats },
                    );
                    Ok(())
                }
                Err(e) => Err(e),
            },
            _ => {
                tracing::warn!(
                    connection_id = %connection_id,
                    "Unexpected {} from replica connection",
                    name
                );
                connection.send_bad_request_and_close(
                    correlation_id,
                    &format!("Unexpected message {}", name),
                );
                return;
            }
        };

        if let Err(e) = result {
            tracing::debug!(connection_id = %connection_id, "Leader service gone: {}", e);
            break;
        }
    }

    connection.stop("Replica connection closed");
}

/// Serve every connection accepted by a listener
pub async fn accept_loop(
    handle: LeaderHandle,
    mut listener: mpsc::UnboundedReceiver<AcceptedConnection>,
) {
    while let Some(accepted) = listener.recv().await {
        tokio::spawn(serve_connection(handle.clone(), accepted));
    }
}
