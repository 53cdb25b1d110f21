//! Replica service
//!
//! Follows the leader named by the election: subscribes when the node enters
//! a pre-replica state, hands shipped bytes to the [`ReplicaApplier`] and acks
//! what became durable. A lost or rejected subscription is retried after
//! `reconnect_delay` for as long as the node stays a replica.

use crate::chunk::ReplicaLog;
use crate::config::ReplicationConfig;
use crate::epoch::EpochManager;
use crate::replication::ReplicationStorage;
use crate::replication::applier::{ApplyOutcome, ReplicaApplier};
use crate::replication::events::{EventSender, NodeEvent, publish};
use crate::replication::messages::{Envelope, ReplicationMessage};
use crate::state::{MemberInfo, NodeState, ReplicaRole};
use crate::transport::LeaderConnector;
use crate::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

const SERVICE_NAME: &str = "Replica Service";

enum ReplicaCommand {
    StateChanged {
        state: NodeState,
        leader: Option<MemberInfo>,
    },
    ForwardWrite {
        stream_id: String,
        event_type: String,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Cloneable handle on a running replica service
#[derive(Clone)]
pub struct ReplicaHandle {
    commands: mpsc::UnboundedSender<ReplicaCommand>,
}

impl ReplicaHandle {
    /// Announce a node state change and the leader to follow
    pub fn set_state(&self, state: NodeState, leader: Option<MemberInfo>) -> Result<()> {
        self.send(ReplicaCommand::StateChanged { state, leader })
    }

    /// Forward a client write to the leader over the replication link
    pub async fn forward_write(
        &self,
        stream_id: impl Into<String>,
        event_type: impl Into<String>,
        data: Vec<u8>,
    ) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(ReplicaCommand::ForwardWrite {
            stream_id: stream_id.into(),
            event_type: event_type.into(),
            data,
            reply,
        })?;
        rx.await
            .map_err(|_| Error::service_stopped(SERVICE_NAME))?
    }

    fn send(&self, command: ReplicaCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::service_stopped(SERVICE_NAME))
    }
}

/// Subscribes to the leader and applies its log locally
pub struct ReplicaService;

impl ReplicaService {
    /// Spawn the service task.
    ///
    /// `endpoint` is advertised to the leader in subscription requests.
    pub fn start(
        config: ReplicationConfig,
        endpoint: SocketAddr,
        storage: &ReplicationStorage,
        connector: Arc<dyn LeaderConnector>,
        events: EventSender,
    ) -> (ReplicaHandle, JoinHandle<Result<()>>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let applier = ReplicaApplier::new(
            storage.log.clone(),
            storage.epochs.clone(),
            config.max_frame_size,
        );
        let service = ReplicaLoop {
            config,
            endpoint,
            log: storage.log.clone(),
            epochs: storage.epochs.clone(),
            connector,
            applier,
            commands: commands_rx,
            events,
            state: NodeState::Initializing,
            leader: None,
            link: None,
            reconnect_at: None,
        };
        (
            ReplicaHandle {
                commands: commands_tx,
            },
            tokio::spawn(service.run()),
        )
    }
}

struct ActiveLink {
    leader: MemberInfo,
    endpoint: SocketAddr,
    connection_id: Uuid,
    subscription_id: Uuid,
    outbound: mpsc::UnboundedSender<Envelope>,
    inbound: mpsc::UnboundedReceiver<Envelope>,
}

impl ActiveLink {
    fn send(&self, message: ReplicationMessage) -> bool {
        self.outbound.send(Envelope::new(message)).is_ok()
    }
}

struct ReplicaLoop {
    config: ReplicationConfig,
    endpoint: SocketAddr,
    log: Arc<dyn ReplicaLog>,
    epochs: Arc<dyn EpochManager>,
    connector: Arc<dyn LeaderConnector>,
    applier: ReplicaApplier,
    commands: mpsc::UnboundedReceiver<ReplicaCommand>,
    events: EventSender,
    state: NodeState,
    leader: Option<MemberInfo>,
    link: Option<ActiveLink>,
    reconnect_at: Option<Instant>,
}

async fn recv_link(link: &mut Option<ActiveLink>) -> Option<Envelope> {
    match link {
        Some(link) => link.inbound.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl ReplicaLoop {
    async fn run(mut self) -> Result<()> {
        let result = loop {
            let outcome = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break Ok(()),
                },
                envelope = recv_link(&mut self.link) => match envelope {
                    Some(envelope) => self.handle_leader_message(envelope),
                    None => {
                        self.connection_lost();
                        Ok(())
                    }
                },
                _ = wait_until(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.connect().await;
                    Ok(())
                }
            };

            if let Err(e) = outcome {
                tracing::error!("{}: replication from leader failed: {}", SERVICE_NAME, e);
                if cfg!(debug_assertions) && matches!(e, Error::ReplicationInvariant(_)) {
                    break Err(e);
                }
                self.disconnect(&format!("Replication failed: {}", e));
                self.schedule_reconnect();
            }
            if self.state.is_shutting_down() {
                break Ok(());
            }
        };

        self.disconnect("Replica service is shutting down");
        publish(
            &self.events,
            NodeEvent::ServiceShutdown {
                name: SERVICE_NAME.to_string(),
            },
        );
        result
    }

    async fn handle_command(&mut self, command: ReplicaCommand) -> Result<()> {
        match command {
            ReplicaCommand::StateChanged { state, leader } => {
                self.handle_state_change(state, leader).await;
                Ok(())
            }
            ReplicaCommand::ForwardWrite {
                stream_id,
                event_type,
                data,
                reply,
            } => {
                let message = ReplicationMessage::ForwardedWrite {
                    stream_id,
                    event_type,
                    data,
                };
                let sent = self.link.as_ref().is_some_and(|link| link.send(message));
                let result = if sent {
                    Ok(())
                } else {
                    Err(Error::connection_closed("Not connected to a leader"))
                };
                if reply.send(result).is_err() {
                    tracing::debug!("Forwarded write requester went away");
                }
                Ok(())
            }
        }
    }

    async fn handle_state_change(&mut self, state: NodeState, leader: Option<MemberInfo>) {
        let previous = self.state;
        self.state = state;
        if previous != state {
            tracing::info!(
                "{}: node state changed from {} to {}",
                SERVICE_NAME,
                self.config.terminology.state(previous),
                self.config.terminology.state(state)
            );
        }

        if state.is_pre_replica() {
            if let Some(leader) = leader {
                self.leader = Some(leader);
            }
            self.disconnect(&format!(
                "Node state changed to {}. Resubscribing to {}.",
                self.config.terminology.state(state),
                self.config.terminology.leader()
            ));
            self.reconnect_at = None;
            self.connect().await;
        } else if state.is_replica() {
            if let Some(leader) = leader {
                self.leader = Some(leader);
            }
        } else {
            self.leader = None;
            self.reconnect_at = None;
            self.disconnect(&format!(
                "Node state changed to {}. Closing replication connection.",
                self.config.terminology.state(state)
            ));
        }
    }

    async fn connect(&mut self) {
        if !self.state.is_replica() {
            return;
        }
        let Some(leader) = self.leader.clone() else {
            tracing::warn!(
                "{}: no {} to subscribe to",
                SERVICE_NAME,
                self.config.terminology.leader()
            );
            return;
        };
        let prefer_secure = self.config.prefer_secure_endpoint;
        let Some((endpoint, secure)) = leader.replication_endpoint(prefer_secure) else {
            tracing::error!(
                "{} {} has no replication endpoint",
                self.config.terminology.leader(),
                leader
            );
            return;
        };
        if prefer_secure && !secure {
            tracing::warn!(
                "Secure endpoint not available for {} {}, connecting over plain TCP",
                self.config.terminology.leader(),
                leader
            );
        }

        let link = match self.connector.connect(endpoint, secure).await {
            Ok(link) => link,
            Err(e) => {
                tracing::warn!(
                    "Failed to connect to {} at {}: {}",
                    self.config.terminology.leader(),
                    endpoint,
                    e
                );
                self.schedule_reconnect();
                return;
            }
        };

        let subscription_id = Uuid::new_v4();
        let log_position = self.log.writer_position();
        let current = self.log.current_chunk();
        let chunk_id = current.contains(log_position).then_some(current.chunk_id);
        let is_promotable = !is_read_only(self.state);
        let active = ActiveLink {
            leader: leader.clone(),
            endpoint,
            connection_id: link.connection_id,
            subscription_id,
            outbound: link.outbound,
            inbound: link.inbound,
        };

        tracing::info!(
            subscription_id = %subscription_id,
            "Subscribing at {} (0x{:X}) to {} {}",
            log_position,
            log_position,
            self.config.terminology.leader(),
            leader
        );
        self.applier.reset();
        let sent = active.send(ReplicationMessage::SubscribeReplica {
            leader_id: leader.instance_id,
            subscription_id,
            log_position,
            chunk_id,
            last_epochs: self.epochs.last_epochs(self.config.last_epochs_count),
            replica_endpoint: self.endpoint,
            is_promotable,
        });
        publish(
            &self.events,
            NodeEvent::ConnectionEstablished {
                endpoint,
                connection_id: active.connection_id,
            },
        );
        self.link = Some(active);
        if !sent {
            self.connection_lost();
        }
    }

    fn handle_leader_message(&mut self, envelope: Envelope) -> Result<()> {
        let Some(link) = &self.link else {
            return Ok(());
        };
        let current = link.subscription_id;
        let message = envelope.message;
        if let Some(subscription_id) = message.subscription_id() {
            if subscription_id != current {
                tracing::debug!(
                    subscription_id = %subscription_id,
                    "Ignoring {} for stale subscription",
                    message.name()
                );
                return Ok(());
            }
        }

        match message {
            ReplicationMessage::ReplicaSubscriptionRetry { leader_id, .. } => {
                tracing::info!(
                    subscription_id = %current,
                    "{} {} asked us to retry the subscription",
                    self.config.terminology.leader(),
                    leader_id
                );
                self.resubscribe_later("Subscription retry requested");
            }
            ReplicationMessage::DropSubscription { .. } => {
                tracing::info!(
                    subscription_id = %current,
                    "{} dropped our subscription",
                    self.config.terminology.leader()
                );
                publish(
                    &self.events,
                    NodeEvent::SubscriptionDropped {
                        subscription_id: current,
                    },
                );
                self.resubscribe_later("Subscription dropped");
            }
            ReplicationMessage::BadRequest { reason } => {
                tracing::error!(
                    subscription_id = %current,
                    "{} rejected our request: {}",
                    self.config.terminology.leader(),
                    reason
                );
                self.resubscribe_later(&format!("Bad request: {}", reason));
            }
            ReplicationMessage::CloneAssignment { .. } => {
                self.role_assigned(current, ReplicaRole::Clone);
            }
            ReplicationMessage::FollowerAssignment { .. } => {
                self.role_assigned(current, ReplicaRole::Follower);
            }
            ReplicationMessage::ReplicatedTo { log_position } => {
                publish(&self.events, NodeEvent::LeaderReplicatedTo { log_position });
            }
            message @ (ReplicationMessage::ReplicaSubscribed { .. }
            | ReplicationMessage::CreateChunk { .. }
            | ReplicationMessage::RawChunkBulk { .. }
            | ReplicationMessage::DataChunkBulk { .. }) => {
                if let ReplicationMessage::ReplicaSubscribed { log_position, .. } = &message {
                    tracing::info!(
                        subscription_id = %current,
                        "Subscribed to {} {} at {} (0x{:X})",
                        self.config.terminology.leader(),
                        link.leader,
                        log_position,
                        log_position
                    );
                    publish(
                        &self.events,
                        NodeEvent::SubscribedToLeader {
                            subscription_id: current,
                            log_position: *log_position,
                        },
                    );
                }
                match self.applier.apply(message)? {
                    ApplyOutcome::Nothing => {}
                    ApplyOutcome::Ack(ack) => {
                        if !link.send(ack.to_message()) {
                            tracing::debug!("Leader link closed while acking");
                        }
                    }
                    ApplyOutcome::TruncationRequired { position } => {
                        tracing::error!(
                            subscription_id = %current,
                            "Local log must be truncated to {} (0x{:X}) before replication can continue",
                            position,
                            position
                        );
                        publish(&self.events, NodeEvent::TruncationRequired { position });
                    }
                }
            }
            other => {
                tracing::warn!(
                    subscription_id = %current,
                    "Unexpected {} from {}",
                    other.name(),
                    self.config.terminology.leader()
                );
            }
        }
        Ok(())
    }

    fn role_assigned(&self, subscription_id: Uuid, role: ReplicaRole) {
        tracing::info!(
            subscription_id = %subscription_id,
            "Assigned role {}",
            self.config.terminology.role(role)
        );
        publish(&self.events, NodeEvent::RoleAssigned { subscription_id, role });
    }

    fn connection_lost(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };
        tracing::warn!(
            subscription_id = %link.subscription_id,
            "Connection to {} {} lost",
            self.config.terminology.leader(),
            link.endpoint
        );
        self.applier.reset();
        publish(
            &self.events,
            NodeEvent::ConnectionLost {
                endpoint: link.endpoint,
                connection_id: link.connection_id,
                subscription_id: Some(link.subscription_id),
            },
        );
        self.schedule_reconnect();
    }

    fn resubscribe_later(&mut self, reason: &str) {
        self.disconnect(reason);
        self.schedule_reconnect();
    }

    fn disconnect(&mut self, reason: &str) {
        if let Some(link) = self.link.take() {
            tracing::info!(
                subscription_id = %link.subscription_id,
                "Disconnecting from {}: {}",
                link.endpoint,
                reason
            );
            self.applier.reset();
        }
    }

    fn schedule_reconnect(&mut self) {
        if self.state.is_replica() && self.reconnect_at.is_none() {
            self.reconnect_at = Some(Instant::now() + self.config.reconnect_delay);
        }
    }
}

fn is_read_only(state: NodeState) -> bool {
    matches!(
        state,
        NodeState::PreReadOnlyReplica | NodeState::ReadOnlyReplica | NodeState::ReadOnlyLeaderless
    )
}
