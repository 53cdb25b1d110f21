//! Node roles and cluster membership signals

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use uuid::Uuid;

/// Cluster role of the local node, as announced by leader election
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    /// Node is starting up
    Initializing,
    /// No leader is known
    Unknown,
    /// Elected, not yet accepting writes
    PreLeader,
    /// Owns the authoritative log
    Leader,
    /// About to subscribe to a leader
    PreReplica,
    /// Subscribed and catching up
    CatchingUp,
    /// Caught up, not voting
    Clone,
    /// Caught up and voting
    Follower,
    /// About to subscribe as a read-only replica
    PreReadOnlyReplica,
    /// Subscribed read-only replica
    ReadOnlyReplica,
    /// Read-only replica without a leader
    ReadOnlyLeaderless,
    /// Shutdown requested
    ShuttingDown,
    /// Node stopped
    Shutdown,
}

impl NodeState {
    /// States in which the node follows a leader's log
    pub fn is_replica(self) -> bool {
        matches!(
            self,
            Self::PreReplica
                | Self::CatchingUp
                | Self::Clone
                | Self::Follower
                | Self::PreReadOnlyReplica
                | Self::ReadOnlyReplica
        )
    }

    /// States that open a fresh subscription
    pub fn is_pre_replica(self) -> bool {
        matches!(self, Self::PreReplica | Self::PreReadOnlyReplica)
    }

    /// Whether the service loops should stop
    pub fn is_shutting_down(self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Shutdown)
    }
}

/// Role a leader assigns to one replica subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicaRole {
    /// Still streaming the backlog
    CatchingUp,
    /// Caught up but not counted towards quorum
    Clone,
    /// Counted towards quorum
    Follower,
}

/// How roles are named in logs and stats
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Terminology {
    /// Leader / Follower
    #[default]
    Leader,
    /// Master / Slave
    Legacy,
}

impl Terminology {
    /// Name of the node owning the log
    pub fn leader(self) -> &'static str {
        match self {
            Self::Leader => "Leader",
            Self::Legacy => "Master",
        }
    }

    /// Name of a replica subscription role
    pub fn role(self, role: ReplicaRole) -> &'static str {
        match (self, role) {
            (_, ReplicaRole::CatchingUp) => "CatchingUp",
            (_, ReplicaRole::Clone) => "Clone",
            (Self::Leader, ReplicaRole::Follower) => "Follower",
            (Self::Legacy, ReplicaRole::Follower) => "Slave",
        }
    }

    /// Name of a node state
    pub fn state(self, state: NodeState) -> String {
        match (self, state) {
            (Self::Legacy, NodeState::Leader) => "Master".to_string(),
            (Self::Legacy, NodeState::PreLeader) => "PreMaster".to_string(),
            (Self::Legacy, NodeState::Follower) => "Slave".to_string(),
            (Self::Legacy, NodeState::PreReplica) => "PreReplica".to_string(),
            _ => format!("{:?}", state),
        }
    }
}

/// Identity and endpoints of a cluster member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    /// Instance id used in subscription requests
    pub instance_id: Uuid,
    /// Plain internal replication endpoint
    pub internal_tcp: Option<SocketAddr>,
    /// Secure internal replication endpoint
    pub internal_secure_tcp: Option<SocketAddr>,
    /// Read-only members never vote
    pub is_read_only: bool,
}

impl MemberInfo {
    /// Member reachable on a plain endpoint
    pub fn new(instance_id: Uuid, internal_tcp: SocketAddr) -> Self {
        Self {
            instance_id,
            internal_tcp: Some(internal_tcp),
            internal_secure_tcp: None,
            is_read_only: false,
        }
    }

    /// Add a secure endpoint
    pub fn with_secure_tcp(mut self, endpoint: SocketAddr) -> Self {
        self.internal_secure_tcp = Some(endpoint);
        self
    }

    /// Pick the endpoint to connect to, and whether it is the secure one
    pub fn replication_endpoint(&self, prefer_secure: bool) -> Option<(SocketAddr, bool)> {
        if prefer_secure {
            if let Some(secure) = self.internal_secure_tcp {
                return Some((secure, true));
            }
        }
        match (self.internal_tcp, self.internal_secure_tcp) {
            (Some(plain), _) => Some((plain, false)),
            (None, Some(secure)) => Some((secure, true)),
            (None, None) => None,
        }
    }
}

impl fmt::Display for MemberInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.internal_tcp.or(self.internal_secure_tcp) {
            Some(endpoint) => write!(f, "[{}, {}]", self.instance_id, endpoint),
            None => write!(f, "[{}, <no endpoint>]", self.instance_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replica_states() {
        assert!(NodeState::PreReplica.is_replica());
        assert!(NodeState::Follower.is_replica());
        assert!(NodeState::ReadOnlyReplica.is_replica());
        assert!(!NodeState::Leader.is_replica());
        assert!(!NodeState::Unknown.is_replica());
        assert!(NodeState::PreReadOnlyReplica.is_pre_replica());
    }

    #[test]
    fn test_terminology() {
        assert_eq!(Terminology::Leader.role(ReplicaRole::Follower), "Follower");
        assert_eq!(Terminology::Legacy.role(ReplicaRole::Follower), "Slave");
        assert_eq!(Terminology::Legacy.leader(), "Master");
        assert_eq!(Terminology::Legacy.state(NodeState::Leader), "Master");
        assert_eq!(Terminology::Leader.state(NodeState::Leader), "Leader");
    }

    #[test]
    fn test_endpoint_preference() {
        let plain: SocketAddr = "127.0.0.1:1112".parse().unwrap();
        let secure: SocketAddr = "127.0.0.1:1113".parse().unwrap();
        let member = MemberInfo::new(Uuid::new_v4(), plain).with_secure_tcp(secure);

        assert_eq!(member.replication_endpoint(true), Some((secure, true)));
        assert_eq!(member.replication_endpoint(false), Some((plain, false)));

        let plain_only = MemberInfo::new(Uuid::new_v4(), plain);
        assert_eq!(plain_only.replication_endpoint(true), Some((plain, false)));
    }
}
