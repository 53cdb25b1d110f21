//! Replication wire messages
//!
//! Every message travels inside an [`Envelope`] carrying a correlation id. The
//! envelope is serialized with bincode and framed by the length prefix/suffix
//! framer:
//!
//! ```text
//! [len:u32 LE][bincode(Envelope):len][len:u32 LE]
//! ```

use crate::chunk::ChunkHeader;
use crate::epoch::Epoch;
use crate::framing::LengthPrefixSuffixFramer;
use crate::{Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

/// Message exchanged between leader and replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationMessage {
    /// Replica asks to stream the log from `log_position`
    SubscribeReplica {
        /// Leader the replica believes is current
        leader_id: Uuid,
        /// Unique per subscription attempt
        subscription_id: Uuid,
        /// Replica writer position
        log_position: i64,
        /// Id of the replica's chunk at `log_position`, if any
        chunk_id: Option<Uuid>,
        /// Replica's newest epochs, newest first
        last_epochs: Vec<Epoch>,
        /// Replica's advertised endpoint
        replica_endpoint: SocketAddr,
        /// Read-only replicas are never promoted
        is_promotable: bool,
    },

    /// Subscription accepted; streaming starts at `log_position`
    ReplicaSubscribed {
        /// Leader instance id
        leader_id: Uuid,
        /// Accepted subscription
        subscription_id: Uuid,
        /// Position the leader will stream from
        log_position: i64,
    },

    /// Wrong or stale leader; the replica should look for the real one
    ReplicaSubscriptionRetry {
        /// Instance that rejected the request
        leader_id: Uuid,
        /// Rejected subscription
        subscription_id: Uuid,
    },

    /// Start of a raw chunk transfer
    CreateChunk {
        /// Leader instance id
        leader_id: Uuid,
        /// Target subscription
        subscription_id: Uuid,
        /// Header of the chunk being shipped
        chunk_header: ChunkHeader,
        /// Raw image size
        file_size: i64,
        /// Chunk is complete on the leader
        is_completed: bool,
    },

    /// Bytes of a raw chunk image
    RawChunkBulk {
        /// Leader instance id
        leader_id: Uuid,
        /// Target subscription
        subscription_id: Uuid,
        /// First chunk number of the image
        chunk_start_number: i32,
        /// Last chunk number of the image
        chunk_end_number: i32,
        /// Raw file offset of `data`
        raw_position: i64,
        /// Image bytes
        data: Vec<u8>,
        /// Last bulk of the image
        is_eof: bool,
    },

    /// Logical log bytes
    DataChunkBulk {
        /// Leader instance id
        leader_id: Uuid,
        /// Target subscription
        subscription_id: Uuid,
        /// First chunk number of the source chunk
        chunk_start_number: i32,
        /// Last chunk number of the source chunk
        chunk_end_number: i32,
        /// Global position of `data`
        subscription_position: i64,
        /// Framed records, possibly split at any point
        data: Vec<u8>,
        /// Source chunk is complete and fully shipped
        is_eof: bool,
    },

    /// Replica confirms durable receipt
    ReplicaLogPositionAck {
        /// Acknowledging subscription
        subscription_id: Uuid,
        /// Durable replicated position
        replication_log_position: i64,
        /// Replica writer position
        writer_log_position: i64,
    },

    /// Replica is now a clone
    CloneAssignment {
        /// Leader instance id
        leader_id: Uuid,
        /// Target subscription
        subscription_id: Uuid,
    },

    /// Replica is now a voting follower
    FollowerAssignment {
        /// Leader instance id
        leader_id: Uuid,
        /// Target subscription
        subscription_id: Uuid,
    },

    /// Surplus replica should disconnect
    DropSubscription {
        /// Leader instance id
        leader_id: Uuid,
        /// Target subscription
        subscription_id: Uuid,
    },

    /// Quorum-durable position published by the leader
    ReplicatedTo {
        /// Replicated-to checkpoint
        log_position: i64,
    },

    /// Client write received by a replica, forwarded to the leader
    ForwardedWrite {
        /// Target stream
        stream_id: String,
        /// Event type
        event_type: String,
        /// Event payload
        data: Vec<u8>,
    },

    /// Request rejected; the sender closes the connection
    BadRequest {
        /// Human readable reason
        reason: String,
    },

    /// Ask for per-subscription statistics
    GetReplicationStats,

    /// Per-subscription statistics
    GetReplicationStatsCompleted {
        /// One entry per live subscription
        stats: Vec<ReplicationStats>,
    },
}

impl ReplicationMessage {
    /// Short message name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::SubscribeReplica { .. } => "SubscribeReplica",
            Self::ReplicaSubscribed { .. } => "ReplicaSubscribed",
            Self::ReplicaSubscriptionRetry { .. } => "ReplicaSubscriptionRetry",
            Self::CreateChunk { .. } => "CreateChunk",
            Self::RawChunkBulk { .. } => "RawChunkBulk",
            Self::DataChunkBulk { .. } => "DataChunkBulk",
            Self::ReplicaLogPositionAck { .. } => "ReplicaLogPositionAck",
            Self::CloneAssignment { .. } => "CloneAssignment",
            Self::FollowerAssignment { .. } => "FollowerAssignment",
            Self::DropSubscription { .. } => "DropSubscription",
            Self::ReplicatedTo { .. } => "ReplicatedTo",
            Self::ForwardedWrite { .. } => "ForwardedWrite",
            Self::BadRequest { .. } => "BadRequest",
            Self::GetReplicationStats => "GetReplicationStats",
            Self::GetReplicationStatsCompleted { .. } => "GetReplicationStatsCompleted",
        }
    }

    /// Subscription a leader message is addressed to
    pub fn subscription_id(&self) -> Option<Uuid> {
        match self {
            Self::SubscribeReplica { subscription_id, .. }
            | Self::ReplicaSubscribed { subscription_id, .. }
            | Self::ReplicaSubscriptionRetry { subscription_id, .. }
            | Self::CreateChunk { subscription_id, .. }
            | Self::RawChunkBulk { subscription_id, .. }
            | Self::DataChunkBulk { subscription_id, .. }
            | Self::ReplicaLogPositionAck { subscription_id, .. }
            | Self::CloneAssignment { subscription_id, .. }
            | Self::FollowerAssignment { subscription_id, .. }
            | Self::DropSubscription { subscription_id, .. } => Some(*subscription_id),
            _ => None,
        }
    }
}

/// Statistics for one replica subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationStats {
    /// Subscription id
    pub subscription_id: Uuid,
    /// Connection id
    pub connection_id: Uuid,
    /// Replica endpoint
    pub subscription_endpoint: String,
    /// Messages waiting to be sent
    pub send_queue_size: usize,
    /// Bytes sent over the connection
    pub total_bytes_sent: u64,
    /// Bytes received over the connection
    pub total_bytes_received: u64,
    /// Bytes queued for sending
    pub pending_send_bytes: u64,
    /// Bytes received but not yet processed
    pub pending_received_bytes: u64,
}

/// Correlated wire message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Correlation id; replies reuse the request's id
    pub correlation_id: Uuid,
    /// Payload
    pub message: ReplicationMessage,
}

impl Envelope {
    /// Wrap with a fresh correlation id
    pub fn new(message: ReplicationMessage) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            message,
        }
    }

    /// Wrap as a reply to `correlation_id`
    pub fn reply(correlation_id: Uuid, message: ReplicationMessage) -> Self {
        Self {
            correlation_id,
            message,
        }
    }

    /// Serialize without framing
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize one unframed payload
    pub fn from_bytes(payload: &[u8]) -> Result<Self> {
        bincode::deserialize(payload)
            .map_err(|e| Error::protocol(format!("Deserialization failed: {}", e)))
    }

    /// Serialize and frame for the wire
    pub fn encode(&self) -> Result<Bytes> {
        Ok(LengthPrefixSuffixFramer::frame(&self.to_bytes()?))
    }

    /// Write one framed envelope to an async stream
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<usize> {
        let buf = self.encode()?;
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(buf.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_request_encoding() {
        let envelope = Envelope::new(ReplicationMessage::SubscribeReplica {
            leader_id: Uuid::new_v4(),
            subscription_id: Uuid::new_v4(),
            log_position: 4096,
            chunk_id: None,
            last_epochs: vec![Epoch::new(1, 0, Uuid::new_v4(), Uuid::new_v4())],
            replica_endpoint: "127.0.0.1:1112".parse().unwrap(),
            is_promotable: true,
        });

        let framed = envelope.encode().unwrap();
        let mut framer = LengthPrefixSuffixFramer::new(1 << 20);
        let mut decoded = Vec::new();
        framer
            .unframe_data(&framed, |payload| {
                decoded.push(Envelope::from_bytes(&payload)?);
                Ok(())
            })
            .unwrap();

        assert_eq!(decoded, vec![envelope]);
    }

    #[test]
    fn test_reply_keeps_correlation() {
        let request = Envelope::new(ReplicationMessage::GetReplicationStats);
        let reply = Envelope::reply(
            request.correlation_id,
            ReplicationMessage::GetReplicationStatsCompleted { stats: Vec::new() },
        );
        assert_eq!(reply.correlation_id, request.correlation_id);
    }

    #[test]
    fn test_subscription_id_lookup() {
        let id = Uuid::new_v4();
        let message = ReplicationMessage::DropSubscription {
            leader_id: Uuid::new_v4(),
            subscription_id: id,
        };
        assert_eq!(message.subscription_id(), Some(id));
        assert_eq!(message.name(), "DropSubscription");
        assert_eq!(
            ReplicationMessage::ReplicatedTo { log_position: 1 }.subscription_id(),
            None
        );
    }

    #[test]
    fn test_garbage_payload_is_protocol_error() {
        let result = Envelope::from_bytes(&[0xFF; 3]);
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_write_to_stream() {
        let envelope = Envelope::new(ReplicationMessage::ReplicatedTo { log_position: 77 });
        let mut out = Vec::new();
        let written = envelope.write_to(&mut out).await.unwrap();
        assert_eq!(written, out.len());
        assert_eq!(&out[..4], &out[out.len() - 4..]);
    }
}
