//! In-process transport over tokio channels
//!
//! Used by tests and by single-process clusters. A [`ChannelNetwork`] maps
//! endpoints to listeners; connecting creates a duplex pair of unbounded
//! channels. A [`ChannelConnection`] can be paused so that outgoing messages
//! pile up in its send queue, which is how backpressure is exercised.

use super::{AcceptedConnection, ConnectionStats, LeaderConnector, LeaderLink, ReplicaConnection};
use crate::replication::messages::{Envelope, ReplicationMessage};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug)]
struct Outgoing {
    tx: Option<mpsc::UnboundedSender<Envelope>>,
    paused: bool,
    held: VecDeque<(Envelope, u64)>,
}

/// Leader-side end of an in-process connection
#[derive(Debug)]
pub struct ChannelConnection {
    connection_id: Uuid,
    outgoing: Mutex<Outgoing>,
    closed: AtomicBool,
    close_reason: Mutex<Option<String>>,
    stats: Mutex<ConnectionStats>,
}

impl ChannelConnection {
    fn new(connection_id: Uuid, tx: mpsc::UnboundedSender<Envelope>) -> Self {
        Self {
            connection_id,
            outgoing: Mutex::new(Outgoing {
                tx: Some(tx),
                paused: false,
                held: VecDeque::new(),
            }),
            closed: AtomicBool::new(false),
            close_reason: Mutex::new(None),
            stats: Mutex::new(ConnectionStats::default()),
        }
    }

    /// Hold outgoing messages in the send queue
    pub fn pause(&self) {
        self.outgoing.lock().paused = true;
    }

    /// Deliver held messages and stop holding
    pub fn resume(&self) {
        let mut outgoing = self.outgoing.lock();
        outgoing.paused = false;
        while let Some((envelope, size)) = outgoing.held.pop_front() {
            self.deliver(&mut outgoing, envelope, size);
        }
    }

    /// Reason given when the connection was stopped
    pub fn close_reason(&self) -> Option<String> {
        self.close_reason.lock().clone()
    }

    /// Record bytes received from the replica
    pub fn record_received(&self, bytes: u64) {
        self.stats.lock().total_bytes_received += bytes;
    }

    fn deliver(&self, outgoing: &mut Outgoing, envelope: Envelope, size: u64) {
        let delivered = outgoing
            .tx
            .as_ref()
            .is_some_and(|tx| tx.send(envelope).is_ok());
        let mut stats = self.stats.lock();
        stats.pending_send_bytes = stats.pending_send_bytes.saturating_sub(size);
        if delivered {
            stats.total_bytes_sent += size;
        } else {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn enqueue(&self, envelope: Envelope) {
        if self.is_closed() {
            return;
        }
        let size = bincode::serialized_size(&envelope).unwrap_or(0);
        self.stats.lock().pending_send_bytes += size;

        let mut outgoing = self.outgoing.lock();
        if outgoing.paused {
            outgoing.held.push_back((envelope, size));
        } else {
            self.deliver(&mut outgoing, envelope, size);
        }
    }
}

impl ReplicaConnection for ChannelConnection {
    fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    fn send_envelope(&self, envelope: Envelope) {
        self.enqueue(envelope);
    }

    fn send_queue_size(&self) -> usize {
        self.outgoing.lock().held.len()
    }

    fn is_closed(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return true;
        }
        let outgoing = self.outgoing.lock();
        outgoing.tx.as_ref().is_none_or(|tx| tx.is_closed())
    }

    fn stop(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(
            connection_id = %self.connection_id,
            "Closing channel connection: {}",
            reason
        );
        *self.close_reason.lock() = Some(reason.to_string());
        let mut outgoing = self.outgoing.lock();
        outgoing.held.clear();
        outgoing.tx = None;
    }

    fn send_bad_request_and_close(&self, correlation_id: Uuid, reason: &str) {
        {
            let mut outgoing = self.outgoing.lock();
            let envelope = Envelope::reply(
                correlation_id,
                ReplicationMessage::BadRequest {
                    reason: reason.to_string(),
                },
            );
            self.deliver(&mut outgoing, envelope, 0);
        }
        self.stop(reason);
    }

    fn stats(&self) -> ConnectionStats {
        *self.stats.lock()
    }
}

/// Endpoint registry for in-process connections
#[derive(Clone, Default)]
pub struct ChannelNetwork {
    listeners: Arc<Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<AcceptedConnection>>>>,
}

impl ChannelNetwork {
    /// Empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept connections made to `endpoint`
    pub fn listen(&self, endpoint: SocketAddr) -> mpsc::UnboundedReceiver<AcceptedConnection> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().insert(endpoint, tx);
        rx
    }

    /// Remove the listener at `endpoint`
    pub fn unlisten(&self, endpoint: SocketAddr) {
        self.listeners.lock().remove(&endpoint);
    }

    /// Build a connected pair without a listener
    pub fn pair() -> (
        Arc<ChannelConnection>,
        mpsc::UnboundedReceiver<Envelope>,
        LeaderLink,
    ) {
        let connection_id = Uuid::new_v4();
        let (to_leader_tx, to_leader_rx) = mpsc::unbounded_channel();
        let (to_replica_tx, to_replica_rx) = mpsc::unbounded_channel();
        let connection = Arc::new(ChannelConnection::new(connection_id, to_replica_tx));
        let link = LeaderLink {
            connection_id,
            outbound: to_leader_tx,
            inbound: to_replica_rx,
        };
        (connection, to_leader_rx, link)
    }
}

#[async_trait]
impl LeaderConnector for ChannelNetwork {
    async fn connect(&self, endpoint: SocketAddr, _secure: bool) -> Result<LeaderLink> {
        let listener = self
            .listeners
            .lock()
            .get(&endpoint)
            .cloned()
            .ok_or_else(|| Error::connection_closed(format!("No listener at {}", endpoint)))?;

        let (connection, inbound, link) = Self::pair();
        listener
            .send(AcceptedConnection {
                connection,
                inbound,
            })
            .map_err(|_| Error::connection_closed(format!("Listener at {} is gone", endpoint)))?;
        Ok(link)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_delivers_both_ways() {
        let (connection, mut from_replica, mut link) = ChannelNetwork::pair();

        connection.send(ReplicationMessage::ReplicatedTo { log_position: 5 });
        let envelope = link.inbound.recv().await.unwrap();
        assert_eq!(
            envelope.message,
            ReplicationMessage::ReplicatedTo { log_position: 5 }
        );

        link.outbound
            .send(Envelope::new(ReplicationMessage::GetReplicationStats))
            .unwrap();
        let envelope = from_replica.recv().await.unwrap();
        assert_eq!(envelope.message, ReplicationMessage::GetReplicationStats);
        assert!(connection.stats().total_bytes_sent > 0);
    }

    #[tokio::test]
    async fn test_paused_connection_queues() {
        let (connection, _from_replica, mut link) = ChannelNetwork::pair();
        connection.pause();
        for i in 0..3 {
            connection.send(ReplicationMessage::ReplicatedTo { log_position: i });
        }
        assert_eq!(connection.send_queue_size(), 3);
        assert!(link.inbound.try_recv().is_err());

        connection.resume();
        assert_eq!(connection.send_queue_size(), 0);
        for i in 0..3 {
            let envelope = link.inbound.recv().await.unwrap();
            assert_eq!(
                envelope.message,
                ReplicationMessage::ReplicatedTo { log_position: i }
            );
        }
    }

    #[tokio::test]
    async fn test_stop_closes_replica_side() {
        let (connection, _from_replica, mut link) = ChannelNetwork::pair();
        connection.stop("test");
        assert!(connection.is_closed());
        assert_eq!(connection.close_reason().as_deref(), Some("test"));
        assert!(link.inbound.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_replica_drop_is_detected() {
        let (connection, _from_replica, link) = ChannelNetwork::pair();
        assert!(!connection.is_closed());
        drop(link);
        assert!(connection.is_closed());
    }

    #[tokio::test]
    async fn test_bad_request_then_close() {
        let (connection, _from_replica, mut link) = ChannelNetwork::pair();
        let correlation_id = Uuid::new_v4();
        connection.send_bad_request_and_close(correlation_id, "no epochs");

        let envelope = link.inbound.recv().await.unwrap();
        assert_eq!(envelope.correlation_id, correlation_id);
        assert!(matches!(
            envelope.message,
            ReplicationMessage::BadRequest { .. }
        ));
        assert!(link.inbound.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_connect_through_listener() {
        let network = ChannelNetwork::new();
        let endpoint: SocketAddr = "127.0.0.1:1112".parse().unwrap();
        let mut accepted = network.listen(endpoint);

        let link = network.connect(endpoint, false).await.unwrap();
        let connection = accepted.recv().await.unwrap();
        assert_eq!(connection.connection.connection_id(), link.connection_id);

        let missing: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        assert!(network.connect(missing, false).await.is_err());
    }
}
