//! Replication configuration

use crate::state::Terminology;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Replication tunables shared by the leader, replica and tracking services
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Number of voting nodes in the cluster, leader included
    pub cluster_size: usize,

    /// Acks needed (leader included) before a position is durable.
    /// Defaults to a majority of `cluster_size`.
    pub quorum_size: Option<usize>,

    /// Keep surplus clones connected instead of dropping them
    pub unsafe_allow_surplus_nodes: bool,

    /// Outstanding messages per replica before shipping pauses
    pub max_queue_size: usize,

    /// Distance from the leader checkpoint at which a catching-up replica becomes a clone
    pub clone_threshold: i64,

    /// Lag in bytes after which a follower counts as lagging
    pub follower_lag_threshold: i64,

    /// Consecutive lagging role passes before a follower is swapped out
    pub lag_occurrences_threshold: u32,

    /// Bytes read per bulk message
    pub bulk_size: usize,

    /// Unacknowledged bytes allowed in flight per replica
    pub replica_send_window: i64,

    /// Interval between periodic role assignment passes
    #[serde(with = "duration_ms")]
    pub role_assignments_interval: Duration,

    /// How long the leader may run without quorum before raising the signal
    #[serde(with = "duration_ms")]
    pub no_quorum_timeout: Duration,

    /// Leader loop wait when no data was shipped
    #[serde(with = "duration_ms")]
    pub idle_wait: Duration,

    /// Tracking service wait between checks
    #[serde(with = "duration_ms")]
    pub tracking_wait: Duration,

    /// Attempts to acquire a chunk reader racing a chunk deletion
    pub reader_acquire_retries: u32,

    /// Epochs a replica sends with its subscription request
    pub last_epochs_count: usize,

    /// Delay before a replica reconnects after a retry or connection loss
    #[serde(with = "duration_ms")]
    pub reconnect_delay: Duration,

    /// Largest frame accepted from the wire
    pub max_frame_size: usize,

    /// Prefer the leader's secure internal endpoint when one is advertised
    pub prefer_secure_endpoint: bool,

    /// Role naming used in logs and stats
    pub terminology: Terminology,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            cluster_size: 1,
            quorum_size: None,
            unsafe_allow_surplus_nodes: false,
            max_queue_size: 100,
            clone_threshold: 1024,
            follower_lag_threshold: 256 * 1024,
            lag_occurrences_threshold: 2,
            bulk_size: 8192,
            replica_send_window: 16 * 1024 * 1024,
            role_assignments_interval: Duration::from_millis(1000),
            no_quorum_timeout: Duration::from_millis(3000),
            idle_wait: Duration::from_millis(500),
            tracking_wait: Duration::from_millis(100),
            reader_acquire_retries: 10,
            last_epochs_count: 20,
            reconnect_delay: Duration::from_millis(1000),
            max_frame_size: 16 * 1024 * 1024,
            prefer_secure_endpoint: true,
            terminology: Terminology::Leader,
        }
    }
}

impl ReplicationConfig {
    /// Configuration for a cluster of `cluster_size` voting nodes
    pub fn cluster(cluster_size: usize) -> Self {
        Self {
            cluster_size,
            ..Default::default()
        }
    }

    /// Effective quorum size, leader included
    pub fn quorum_size(&self) -> usize {
        self.quorum_size.unwrap_or(self.cluster_size / 2 + 1)
    }

    /// Followers the leader tries to keep
    pub fn desired_follower_count(&self) -> usize {
        self.cluster_size.saturating_sub(1)
    }

    /// Set an explicit quorum size
    pub fn with_quorum_size(mut self, quorum_size: usize) -> Self {
        self.quorum_size = Some(quorum_size);
        self
    }

    /// Keep or drop surplus clones
    pub fn with_unsafe_allow_surplus_nodes(mut self, allow: bool) -> Self {
        self.unsafe_allow_surplus_nodes = allow;
        self
    }

    /// Set bytes per bulk
    pub fn with_bulk_size(mut self, bulk_size: usize) -> Self {
        self.bulk_size = bulk_size;
        self
    }

    /// Set the no-quorum timeout
    pub fn with_no_quorum_timeout(mut self, timeout: Duration) -> Self {
        self.no_quorum_timeout = timeout;
        self
    }

    /// Set the leader idle wait
    pub fn with_idle_wait(mut self, wait: Duration) -> Self {
        self.idle_wait = wait;
        self
    }

    /// Set reader acquisition attempts
    pub fn with_reader_acquire_retries(mut self, retries: u32) -> Self {
        self.reader_acquire_retries = retries;
        self
    }

    /// Set the replica reconnect delay
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Set role terminology
    pub fn with_terminology(mut self, terminology: Terminology) -> Self {
        self.terminology = terminology;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.cluster_size == 0 {
            return Err(Error::config("cluster_size must be at least 1"));
        }

        let quorum = self.quorum_size();
        if quorum == 0 || quorum > self.cluster_size {
            return Err(Error::config(format!(
                "quorum_size {} must be between 1 and cluster_size {}",
                quorum, self.cluster_size
            )));
        }

        if self.max_queue_size == 0 {
            return Err(Error::config("max_queue_size must be at least 1"));
        }

        if self.bulk_size == 0 {
            return Err(Error::config("bulk_size must be at least 1"));
        }

        if self.replica_send_window <= 0 {
            return Err(Error::config("replica_send_window must be positive"));
        }

        if self.reader_acquire_retries == 0 {
            return Err(Error::config("reader_acquire_retries must be at least 1"));
        }

        if self.max_frame_size < self.bulk_size {
            return Err(Error::config("max_frame_size must not be smaller than bulk_size"));
        }

        Ok(())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
