//! Events published by the replication services to the hosting node

use crate::state::{NodeState, ReplicaRole};
use std::net::SocketAddr;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Something the hosting node may need to react to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// The node role changed
    StateChanged {
        /// New state
        state: NodeState,
    },

    /// A replica opened a subscription on this leader
    ConnectionEstablished {
        /// Replica endpoint
        endpoint: SocketAddr,
        /// Connection id
        connection_id: Uuid,
    },

    /// A replication connection went away
    ConnectionLost {
        /// Peer endpoint
        endpoint: SocketAddr,
        /// Connection id
        connection_id: Uuid,
        /// Subscription that was streaming over it, if any
        subscription_id: Option<Uuid>,
    },

    /// The leader has lacked a quorum of caught-up replicas for too long
    NoQuorum,

    /// The replicated-to checkpoint was flushed
    ReplicatedTo {
        /// New checkpoint value
        log_position: i64,
    },

    /// The leader published its replicated-to checkpoint to this replica
    LeaderReplicatedTo {
        /// Leader's checkpoint value
        log_position: i64,
    },

    /// A promotable replica acknowledged a position
    ReplicaWriteAck {
        /// Acknowledging subscription
        subscription_id: Uuid,
        /// Acknowledged position
        log_position: i64,
    },

    /// A subscription was given a new role
    RoleAssigned {
        /// Subscription
        subscription_id: Uuid,
        /// Assigned role
        role: ReplicaRole,
    },

    /// This replica's subscription was accepted by the leader
    SubscribedToLeader {
        /// Accepted subscription
        subscription_id: Uuid,
        /// Position replication resumes from
        log_position: i64,
    },

    /// The leader stopped streaming to a subscription, for any reason
    SubscriptionRemoved {
        /// Removed subscription
        subscription_id: Uuid,
    },

    /// The leader no longer needs this subscription
    SubscriptionDropped {
        /// Dropped subscription
        subscription_id: Uuid,
    },

    /// The leader resumed this replica below its writer position
    TruncationRequired {
        /// Position to truncate the local log to
        position: i64,
    },

    /// A service loop ended
    ServiceShutdown {
        /// Service name
        name: String,
    },

    /// A replica forwarded a client write
    ForwardedWrite {
        /// Connection it arrived on
        connection_id: Uuid,
        /// Target stream
        stream_id: String,
        /// Event type
        event_type: String,
        /// Event payload
        data: Vec<u8>,
    },
}

/// Sending half of the event channel
pub type EventSender = mpsc::UnboundedSender<NodeEvent>;

/// Receiving half of the event channel
pub type EventReceiver = mpsc::UnboundedReceiver<NodeEvent>;

/// Publish an event, ignoring a closed channel
pub(crate) fn publish(events: &EventSender, event: NodeEvent) {
    if events.send(event).is_err() {
        tracing::trace!("Event channel closed");
    }
}
