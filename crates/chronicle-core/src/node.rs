//! Replication node
//!
//! Starts the leader, replica and tracking services for one cluster member
//! and routes events between them. Every event is also re-published to the
//! host, which owns elections, client writes and truncation.

use crate::config::ReplicationConfig;
use crate::replication::events::{EventReceiver, EventSender, NodeEvent, publish};
use crate::replication::{
    LeaderHandle, LeaderReplicationService, ReplicaHandle, ReplicaService, ReplicationStorage,
    ReplicationTrackingService, TrackingHandle, accept_loop,
};
use crate::state::{MemberInfo, NodeState};
use crate::transport::{AcceptedConnection, LeaderConnector};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// One cluster member running the replication services
pub struct ReplicationNode {
    member: MemberInfo,
    config: ReplicationConfig,
    leader: LeaderHandle,
    replica: ReplicaHandle,
    tracking: TrackingHandle,
    events: EventSender,
    state: Mutex<NodeState>,
    services: Vec<(&'static str, JoinHandle<Result<()>>)>,
    router: JoinHandle<()>,
    stop_router: oneshot::Sender<()>,
}

impl ReplicationNode {
    /// Start the services for `member`.
    ///
    /// Returns the node and the receiver of every event it publishes. The
    /// node starts in `Initializing`; call [`set_state`](Self::set_state)
    /// once the election has decided its role.
    pub fn start(
        config: ReplicationConfig,
        member: MemberInfo,
        storage: ReplicationStorage,
        connector: Arc<dyn LeaderConnector>,
    ) -> Result<(Self, EventReceiver)> {
        config.validate()?;
        let endpoint = member
            .internal_tcp
            .or(member.internal_secure_tcp)
            .ok_or_else(|| Error::config(format!("Member {} has no replication endpoint", member.instance_id)))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (host_tx, host_rx) = mpsc::unbounded_channel();

        let (leader, leader_task) = LeaderReplicationService::start(
            member.instance_id,
            config.clone(),
            &storage,
            events_tx.clone(),
        );
        let (tracking, tracking_task) = ReplicationTrackingService::start(
            config.quorum_size(),
            config.tracking_wait,
            &storage,
            events_tx.clone(),
        );
        let (replica, replica_task) = ReplicaService::start(
            config.clone(),
            endpoint,
            &storage,
            connector,
            events_tx.clone(),
        );
        let (stop_router, router_stopped) = oneshot::channel();
        let router = tokio::spawn(route_events(
            events_rx,
            leader.clone(),
            tracking.clone(),
            host_tx,
            router_stopped,
        ));

        tracing::info!(
            "Replication node {} started (cluster size {}, quorum {})",
            member,
            config.cluster_size,
            config.quorum_size()
        );

        let node = Self {
            member,
            config,
            leader,
            replica,
            tracking,
            events: events_tx,
            state: Mutex::new(NodeState::Initializing),
            services: vec![
                ("leader", leader_task),
                ("tracking", tracking_task),
                ("replica", replica_task),
            ],
            router,
            stop_router,
        };
        Ok((node, host_rx))
    }

    /// Identity of this member
    pub fn member(&self) -> &MemberInfo {
        &self.member
    }

    /// Current node state
    pub fn state(&self) -> NodeState {
        *self.state.lock()
    }

    /// Leader service handle
    pub fn leader(&self) -> &LeaderHandle {
        &self.leader
    }

    /// Replica service handle
    pub fn replica(&self) -> &ReplicaHandle {
        &self.replica
    }

    /// Tracking service handle
    pub fn tracking(&self) -> &TrackingHandle {
        &self.tracking
    }

    /// Quorum-replicated position
    pub fn replicated_to(&self) -> i64 {
        self.tracking.replicated_to()
    }

    /// Fan a role signal out to every service.
    ///
    /// `leader` names the member to subscribe to in replica states.
    pub fn set_state(&self, state: NodeState, leader: Option<MemberInfo>) -> Result<()> {
        let previous = std::mem::replace(&mut *self.state.lock(), state);
        if previous != state {
            tracing::info!(
                "Node {} is now {}",
                self.member,
                self.config.terminology.state(state)
            );
        }
        self.leader.set_state(state)?;
        self.tracking.set_state(state)?;
        self.replica.set_state(state, leader)?;
        publish(&self.events, NodeEvent::StateChanged { state });
        Ok(())
    }

    /// Serve replica connections accepted by `listener`
    pub fn serve(&self, listener: mpsc::UnboundedReceiver<AcceptedConnection>) -> JoinHandle<()> {
        tokio::spawn(accept_loop(self.leader.clone(), listener))
    }

    /// Stop every service and wait for them to finish.
    ///
    /// Returns the first service failure, if any.
    pub async fn shutdown(self) -> Result<()> {
        if let Err(e) = self.set_state(NodeState::ShuttingDown, None) {
            tracing::debug!("Service already stopped during shutdown: {}", e);
        }

        let mut first_error = None;
        for (name, task) in self.services {
            let outcome = match task.await {
                Ok(result) => result,
                Err(e) => Err(Error::service_stopped(format!("{} task failed: {}", name, e))),
            };
            if let Err(e) = outcome {
                tracing::error!("{} service stopped with error: {}", name, e);
                first_error.get_or_insert(e);
            }
        }

        // Every service has published its last event by now.
        if self.stop_router.send(()).is_err() {
            tracing::debug!("Event router already stopped");
        }
        if let Err(e) = self.router.await {
            tracing::warn!("Event router failed: {}", e);
        }
        tracing::info!("Replication node {} stopped", self.member);

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

async fn route_events(
    mut inbound: EventReceiver,
    leader: LeaderHandle,
    tracking: TrackingHandle,
    host: EventSender,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            event = inbound.recv() => match event {
                Some(event) => route_event(event, &leader, &tracking, &host),
                None => break,
            },
            _ = &mut stop => {
                while let Ok(event) = inbound.try_recv() {
                    route_event(event, &leader, &tracking, &host);
                }
                break;
            }
        }
    }
}

fn route_event(event: NodeEvent, leader: &LeaderHandle, tracking: &TrackingHandle, host: &EventSender) {
    let routed = match &event {
        NodeEvent::ReplicaWriteAck {
            subscription_id,
            log_position,
        } => tracking.replica_ack(*subscription_id, *log_position),
        NodeEvent::ReplicatedTo { log_position } => leader.replicated_to(*log_position),
        NodeEvent::LeaderReplicatedTo { log_position } => {
            tracking.leader_replicated_to(*log_position)
        }
        NodeEvent::SubscriptionRemoved { subscription_id } => {
            tracking.replica_gone(*subscription_id)
        }
        _ => Ok(()),
    };
    if let Err(e) = routed {
        tracing::debug!("Could not route {:?}: {}", event, e);
    }
    publish(host, event);
}
