//! Leader/replica log replication
//!
//! The leader streams its chunked transaction log to every subscribed
//! replica; replicas write what they receive and ack durable positions; the
//! tracking service turns those acks into the quorum-replicated checkpoint.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐   DataChunkBulk / RawChunkBulk   ┌──────────────────┐
//! │ LeaderReplication    │ ───────────────────────────────► │  ReplicaService  │
//! │ Service              │                                  │   + Applier      │
//! │  (shipper, roles,    │ ◄─────────────────────────────── │                  │
//! │   no-quorum watch)   │       ReplicaLogPositionAck      └──────────────────┘
//! └──────────┬───────────┘
//!            │ ReplicaWriteAck
//! ┌──────────┴───────────┐
//! │ ReplicationTracking  │ ──► replicated-to checkpoint
//! └──────────────────────┘
//! ```
//!
//! # Subscription flow
//!
//! 1. The replica sends `SubscribeReplica` with its writer position and
//!    newest epochs.
//! 2. The leader reconciles the epochs against its own and answers
//!    `ReplicaSubscribed` with the position streaming resumes from.
//! 3. Scavenged chunks go out as raw images (`CreateChunk` + `RawChunkBulk`),
//!    everything else as logical bytes (`DataChunkBulk`).
//! 4. Acks advance the subscription's window and feed quorum tracking.

pub mod applier;
pub mod events;
pub mod leader;
pub mod messages;
pub mod reconcile;
pub mod replica;
pub mod roles;
pub(crate) mod shipper;
pub(crate) mod subscription;
pub mod tracking;

pub use applier::{ApplyOutcome, ReplicaAck, ReplicaApplier};
pub use events::{EventReceiver, EventSender, NodeEvent};
pub use leader::{LeaderHandle, LeaderReplicationService, SubscribeRequest, accept_loop, serve_connection};
pub use messages::{Envelope, ReplicationMessage, ReplicationStats};
pub use reconcile::resolve_subscribe_position;
pub use replica::{ReplicaHandle, ReplicaService};
pub use roles::{RoleAction, RoleCandidate, RolePolicy, assign_roles};
pub use subscription::AckCell;
pub use tracking::{ReplicationTrackingService, TrackingHandle, compute_replicated_to};

use crate::checkpoint::{Checkpoint, MemoryCheckpoint};
use crate::chunk::{ChunkManager, MemoryLog, ReplicaLog};
use crate::epoch::{EpochManager, MemoryEpochManager};
use std::sync::Arc;

/// Storage collaborators shared by the replication services
#[derive(Clone)]
pub struct ReplicationStorage {
    /// Chunk lookup for shipping
    pub chunks: Arc<dyn ChunkManager>,
    /// Local log replicas write into
    pub log: Arc<dyn ReplicaLog>,
    /// Flushed writer position
    pub writer_checkpoint: Arc<dyn Checkpoint>,
    /// Quorum-replicated position
    pub replication_checkpoint: Arc<dyn Checkpoint>,
    /// Epoch history
    pub epochs: Arc<dyn EpochManager>,
}

impl ReplicationStorage {
    /// Storage backed by an in-memory log, with a fresh replication checkpoint
    pub fn memory(log: Arc<MemoryLog>, epochs: Arc<MemoryEpochManager>) -> Self {
        Self {
            chunks: log.clone(),
            writer_checkpoint: log.writer_checkpoint(),
            log,
            replication_checkpoint: Arc::new(MemoryCheckpoint::new("replication", 0)),
            epochs,
        }
    }
}
