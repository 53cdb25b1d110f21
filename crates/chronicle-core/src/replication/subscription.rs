//! Leader-side state of one replica subscription

use crate::chunk::BulkReader;
use crate::replication::messages::{ReplicationMessage, ReplicationStats};
use crate::state::ReplicaRole;
use crate::transport::ReplicaConnectionRef;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use uuid::Uuid;

/// Acknowledged position of a subscription.
///
/// Written by the ack path and read by the shipping loop. Acks never regress
/// the position and never move it past what has been sent.
#[derive(Debug)]
pub struct AckCell {
    acked: AtomicI64,
    sent: AtomicI64,
    is_promotable: bool,
}

impl AckCell {
    /// Cell starting at `position` for both sent and acked
    pub fn new(position: i64, is_promotable: bool) -> Self {
        Self {
            acked: AtomicI64::new(position),
            sent: AtomicI64::new(position),
            is_promotable,
        }
    }

    /// Highest acknowledged position
    pub fn acked(&self) -> i64 {
        self.acked.load(Ordering::Acquire)
    }

    /// Position the leader has shipped up to
    pub fn sent(&self) -> i64 {
        self.sent.load(Ordering::Acquire)
    }

    /// Whether acks feed quorum tracking
    pub fn is_promotable(&self) -> bool {
        self.is_promotable
    }

    /// Apply an ack; returns the acked position afterwards
    pub fn advance(&self, position: i64) -> i64 {
        let bounded = position.min(self.sent());
        let previous = self.acked.fetch_max(bounded, Ordering::AcqRel);
        previous.max(bounded)
    }

    fn set_sent(&self, position: i64) {
        self.sent.store(position, Ordering::Release);
    }
}

/// One replica streaming from the leader
pub(crate) struct ReplicaSubscription {
    pub connection: ReplicaConnectionRef,
    pub subscription_id: Uuid,
    pub replica_endpoint: SocketAddr,
    pub is_promotable: bool,
    pub reader: Option<Box<dyn BulkReader>>,
    pub raw_send: bool,
    pub eof_sent: bool,
    pub role: ReplicaRole,
    pub lag_occurrences: u32,
    pub should_dispose: bool,
    log_position: i64,
    ack: Arc<AckCell>,
}

impl ReplicaSubscription {
    pub fn new(
        connection: ReplicaConnectionRef,
        subscription_id: Uuid,
        replica_endpoint: SocketAddr,
        is_promotable: bool,
    ) -> Self {
        Self {
            connection,
            subscription_id,
            replica_endpoint,
            is_promotable,
            reader: None,
            raw_send: false,
            eof_sent: false,
            role: ReplicaRole::CatchingUp,
            lag_occurrences: 0,
            should_dispose: false,
            log_position: 0,
            ack: Arc::new(AckCell::new(0, is_promotable)),
        }
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection.connection_id()
    }

    pub fn log_position(&self) -> i64 {
        self.log_position
    }

    pub fn set_log_position(&mut self, position: i64) {
        self.log_position = position;
        self.ack.set_sent(position);
    }

    pub fn acked_log_position(&self) -> i64 {
        self.ack.acked()
    }

    /// Start the ack cell over at the resolved subscribe position
    pub fn reset_ack(&mut self, position: i64) {
        self.ack = Arc::new(AckCell::new(position, self.is_promotable));
    }

    pub fn ack_cell(&self) -> Arc<AckCell> {
        self.ack.clone()
    }

    pub fn send(&self, message: ReplicationMessage) {
        self.connection.send(message);
    }

    pub fn send_queue_size(&self) -> usize {
        self.connection.send_queue_size()
    }

    pub fn is_connection_closed(&self) -> bool {
        self.connection.is_closed()
    }

    /// Swap in a new leased reader, releasing the previous one
    pub fn replace_reader(&mut self, reader: Box<dyn BulkReader>) {
        drop(self.reader.replace(reader));
    }

    pub fn stats(&self) -> ReplicationStats {
        let stats = self.connection.stats();
        ReplicationStats {
            subscription_id: self.subscription_id,
            connection_id: self.connection_id(),
            subscription_endpoint: self.replica_endpoint.to_string(),
            send_queue_size: self.send_queue_size(),
            total_bytes_sent: stats.total_bytes_sent,
            total_bytes_received: stats.total_bytes_received,
            pending_send_bytes: stats.pending_send_bytes,
            pending_received_bytes: stats.pending_received_bytes,
        }
    }

    /// Release the reader and close the connection
    pub fn dispose(&mut self, reason: &str) {
        self.reader = None;
        self.connection.stop(reason);
    }
}

impl std::fmt::Display for ReplicaSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{},C:{},S:{}]",
            self.replica_endpoint,
            self.connection_id(),
            self.subscription_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::channel::ChannelNetwork;
    use proptest::prelude::*;

    #[test]
    fn test_ack_is_capped_by_sent_position() {
        let cell = AckCell::new(100, true);
        cell.set_sent(500);
        assert_eq!(cell.advance(300), 300);
        assert_eq!(cell.advance(900), 500);
        assert_eq!(cell.acked(), 500);
    }

    #[test]
    fn test_dispose_releases_reader_and_closes() {
        let (connection, _inbound, _link) = ChannelNetwork::pair();
        let mut subscription = ReplicaSubscription::new(
            connection.clone(),
            Uuid::new_v4(),
            "127.0.0.1:2000".parse().unwrap(),
            true,
        );
        subscription.dispose("done");
        assert!(subscription.reader.is_none());
        assert!(subscription.is_connection_closed());
        assert_eq!(connection.close_reason().as_deref(), Some("done"));
    }

    proptest! {
        #[test]
        fn prop_acks_never_regress(acks in prop::collection::vec(0i64..10_000, 0..50)) {
            let cell = AckCell::new(0, true);
            cell.set_sent(10_000);
            let mut last = cell.acked();
            for ack in acks {
                let now = cell.advance(ack);
                prop_assert!(now >= last);
                prop_assert_eq!(now, cell.acked());
                last = now;
            }
        }
    }
}
