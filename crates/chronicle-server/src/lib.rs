//! Chronicle Server - replication node process
//!
//! Hosts one [`ReplicationNode`] over an in-memory chunked log and the TCP
//! transport. The server plays the part of the hosting node: it picks the
//! starting role from configuration, writes the leader's epoch, applies
//! writes forwarded by replicas and stops when a replica diverges.

pub mod config;
pub mod tcp;

use anyhow::Context;
use chronicle_core::chunk::{MemoryLog, ReplicaLog};
use chronicle_core::epoch::{EpochManager, MemoryEpochManager};
use chronicle_core::replication::{EventReceiver, NodeEvent, ReplicationStorage};
use chronicle_core::{NodeState, ReplicaRole, ReplicationNode};
use config::{NodeRole, ServerConfig};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tcp::TcpConnector;
use tokio::task::JoinHandle;
use uuid::Uuid;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A running replication node
pub struct ChronicleServer {
    config: ServerConfig,
    node: ReplicationNode,
    log: Arc<MemoryLog>,
    local_addr: SocketAddr,
    listener: JoinHandle<()>,
    acceptor: JoinHandle<()>,
}

impl ChronicleServer {
    /// Bind the replication listener, start the services and enter the
    /// configured role
    pub async fn start(config: ServerConfig) -> anyhow::Result<(Self, EventReceiver)> {
        config.validate()?;
        let instance_id = config.node.instance_id.unwrap_or_else(Uuid::new_v4);
        let max_frame_size = config.replication.max_frame_size;

        let (local_addr, accepted, listener) = tcp::listen(config.node.bind_addr, max_frame_size)
            .await
            .with_context(|| format!("Failed to bind {}", config.node.bind_addr))?;

        let log = Arc::new(MemoryLog::new(config.node.chunk_size));
        let epochs = Arc::new(MemoryEpochManager::new());
        let storage = ReplicationStorage::memory(log.clone(), epochs.clone());
        let mut member = config.member(instance_id);
        member.internal_tcp = Some(local_addr);

        let (node, events) = ReplicationNode::start(
            config.replication.clone(),
            member,
            storage,
            Arc::new(TcpConnector::new(max_frame_size, CONNECT_TIMEOUT)),
        )?;
        let acceptor = node.serve(accepted);

        if config.node.role == NodeRole::Leader {
            let epoch = log.append_epoch(epochs.last_epoch_number() + 1, instance_id)?;
            epochs.add_epoch(epoch)?;
            log.flush()?;
            tracing::info!("Wrote {}", epoch);
        }
        node.set_state(config.node.role.initial_state(), config.leader())?;

        let server = Self {
            config,
            node,
            log,
            local_addr,
            listener,
            acceptor,
        };
        Ok((server, events))
    }

    /// Replication node
    pub fn node(&self) -> &ReplicationNode {
        &self.node
    }

    /// Local log
    pub fn log(&self) -> &Arc<MemoryLog> {
        &self.log
    }

    /// Address the replication listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Effective configuration
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Append one event and flush it; only valid on the leader
    pub fn append(&self, stream_id: &str, event_type: &str, data: &[u8]) -> anyhow::Result<i64> {
        let state = self.node.state();
        if state != NodeState::Leader {
            anyhow::bail!("Cannot write while {:?}", state);
        }
        let position = self.log.append_event(stream_id, event_type, data)?;
        self.log.flush()?;
        Ok(position)
    }

    /// React to one node event.
    ///
    /// Replica roles move through CatchingUp, Clone and Follower as the
    /// leader accepts the subscription and assigns roles. Fails when the
    /// node can no longer continue, which is the case once a replica learns
    /// its log diverged from the leader's.
    pub fn handle_event(&self, event: &NodeEvent) -> anyhow::Result<()> {
        match event {
            NodeEvent::ForwardedWrite {
                connection_id,
                stream_id,
                event_type,
                data,
            } => match self.append(stream_id, event_type, data) {
                Ok(position) => tracing::debug!(
                    connection_id = %connection_id,
                    log_position = position,
                    "Applied forwarded write to {}",
                    stream_id
                ),
                Err(e) => tracing::warn!(
                    connection_id = %connection_id,
                    "Dropped forwarded write to {}: {}",
                    stream_id,
                    e
                ),
            },
            NodeEvent::SubscribedToLeader { .. } => {
                let next = match self.node.state() {
                    NodeState::PreReplica => Some(NodeState::CatchingUp),
                    NodeState::PreReadOnlyReplica => Some(NodeState::ReadOnlyReplica),
                    _ => None,
                };
                if let Some(state) = next {
                    self.node.set_state(state, self.config.leader())?;
                }
            }
            NodeEvent::RoleAssigned { role, .. } => {
                // The leader publishes assignments it makes to its replicas.
                let state = self.node.state();
                if state.is_replica() && !self.node.member().is_read_only {
                    let next = match role {
                        ReplicaRole::CatchingUp => NodeState::CatchingUp,
                        ReplicaRole::Clone => NodeState::Clone,
                        ReplicaRole::Follower => NodeState::Follower,
                    };
                    if next != state {
                        self.node.set_state(next, self.config.leader())?;
                    }
                }
            }
            NodeEvent::TruncationRequired { position } => {
                anyhow::bail!(
                    "Local log diverged from the leader; truncate to {} (0x{:X}) and restart",
                    position,
                    position
                );
            }
            NodeEvent::NoQuorum => {
                tracing::warn!("No quorum of replicas for {:?}", self.config.replication.no_quorum_timeout);
            }
            NodeEvent::ServiceShutdown { name } => {
                tracing::debug!("{} stopped", name);
            }
            _ => {}
        }
        Ok(())
    }

    /// Handle events until `shutdown` resolves or the node fails, then stop
    pub async fn run(
        self,
        mut events: EventReceiver,
        shutdown: impl Future<Output = ()>,
    ) -> anyhow::Result<()> {
        tokio::pin!(shutdown);
        let outcome = loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        if let Err(e) = self.handle_event(&event) {
                            break Err(e);
                        }
                    }
                    None => break Ok(()),
                },
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested");
                    break Ok(());
                }
            }
        };
        let stopped = self.shutdown().await;
        outcome.and(stopped)
    }

    /// Stop accepting connections and stop the node
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.listener.abort();
        self.acceptor.abort();
        self.node.shutdown().await?;
        Ok(())
    }
}
