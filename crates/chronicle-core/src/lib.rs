//! Chronicle Core - Transaction Log Replication Engine
//!
//! This crate replicates a chunked, append-only transaction log from one
//! leader to many replicas:
//! - Epoch reconciliation to find where a returning replica resumes
//! - Chunk shipping, as logical data or as raw images of scavenged chunks
//! - Clone/Follower role assignment with lag detection
//! - Quorum tracking of the replicated-to checkpoint
//! - Incremental framing of records and whole transactions
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │            ReplicationNode                   │
//! │   (service wiring, event routing)           │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │          Replication Services                │
//! │   (Leader, Replica + Applier, Tracking)     │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │       Framing / Log Records / Epochs         │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │   Chunk Storage, Checkpoints, Transport      │
//! └─────────────────────────────────────────────┘
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod checkpoint;
pub mod chunk;
pub mod config;
pub mod epoch;
pub mod error;
pub mod framing;
pub mod log_record;
pub mod node;
pub mod replication;
pub mod state;
pub mod transport;

pub use config::ReplicationConfig;
pub use error::{Error, Result};
pub use node::ReplicationNode;
pub use state::{MemberInfo, NodeState, ReplicaRole, Terminology};
