//! Transport seams
//!
//! The leader talks to each replica through a [`ReplicaConnection`]; a replica
//! reaches the leader through a [`LeaderConnector`]. Connection lifecycle,
//! TLS and heartbeats live behind these traits.

pub mod channel;

use crate::Result;
use crate::replication::messages::{Envelope, ReplicationMessage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Byte counters of one connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStats {
    /// Bytes written to the peer
    pub total_bytes_sent: u64,
    /// Bytes read from the peer
    pub total_bytes_received: u64,
    /// Bytes queued but not written
    pub pending_send_bytes: u64,
    /// Bytes read but not yet dispatched
    pub pending_received_bytes: u64,
}

/// Leader-side handle on one replica connection
pub trait ReplicaConnection: Send + Sync {
    /// Connection identity
    fn connection_id(&self) -> Uuid;

    /// Queue an envelope; dropped silently once the connection is closed
    fn send_envelope(&self, envelope: Envelope);

    /// Queue a message under a fresh correlation id
    fn send(&self, message: ReplicationMessage) {
        self.send_envelope(Envelope::new(message));
    }

    /// Queue a reply to `correlation_id`
    fn reply(&self, correlation_id: Uuid, message: ReplicationMessage) {
        self.send_envelope(Envelope::reply(correlation_id, message));
    }

    /// Messages queued but not yet written
    fn send_queue_size(&self) -> usize;

    /// Peer is gone or the connection was stopped
    fn is_closed(&self) -> bool;

    /// Close the connection
    fn stop(&self, reason: &str);

    /// Reply with a bad request and close
    fn send_bad_request_and_close(&self, correlation_id: Uuid, reason: &str);

    /// Byte counters
    fn stats(&self) -> ConnectionStats;
}

/// Shared connection handle
pub type ReplicaConnectionRef = Arc<dyn ReplicaConnection>;

/// Replica-side duplex link to a leader
#[derive(Debug)]
pub struct LeaderLink {
    /// Connection identity
    pub connection_id: Uuid,
    /// Messages to the leader
    pub outbound: mpsc::UnboundedSender<Envelope>,
    /// Messages from the leader
    pub inbound: mpsc::UnboundedReceiver<Envelope>,
}

/// Opens replica connections to a leader endpoint
#[async_trait]
pub trait LeaderConnector: Send + Sync {
    /// Connect to `endpoint`, over TLS when `secure`
    async fn connect(&self, endpoint: SocketAddr, secure: bool) -> Result<LeaderLink>;
}

/// Connection accepted by a leader listener
pub struct AcceptedConnection {
    /// Leader-side handle
    pub connection: ReplicaConnectionRef,
    /// Messages from the replica
    pub inbound: mpsc::UnboundedReceiver<Envelope>,
}
