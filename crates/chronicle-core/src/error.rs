//! Error types for Chronicle Core

use thiserror::Error;
use uuid::Uuid;

/// Result type alias using Chronicle Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for the replication engine
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from checkpoints and transports
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// bincode (de)serialization of wire messages
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Binary framer errors (bad lengths, oversized frames)
    #[error("Framing error: {0}")]
    Framing(String),

    /// Log record decode errors
    #[error("Log record error: {0}")]
    LogRecord(String),

    /// Replica reports data but carries no epochs
    #[error(
        "Replica has positive log position {log_position} (0x{log_position:X}) but does not have epochs"
    )]
    InconsistentReplicaState {
        /// Position reported by the replica
        log_position: i64,
    },

    /// Replica epochs are not known to the leader's epoch manager
    #[error(
        "Replica provided epochs which are not in the epoch manager (possibly too old). Common epoch: E{common_epoch_number}, leader checkpoint: {leader_checkpoint}"
    )]
    TooOldForResync {
        /// Newest epoch both sides agree on
        common_epoch_number: i64,
        /// Leader writer checkpoint at the time of the request
        leader_checkpoint: i64,
    },

    /// Chunk is being deleted by a scavenge/merge while acquiring a reader
    #[error("Chunk #{chunk} is being deleted")]
    ChunkBeingDeleted {
        /// Chunk start number
        chunk: i32,
    },

    /// Reader acquisition kept racing with chunk deletion
    #[error("Too many retries ({attempts}) to acquire reader for subscription {subscription_id}")]
    ReaderAcquisition {
        /// Subscription that could not get a reader
        subscription_id: Uuid,
        /// Attempts performed
        attempts: u32,
    },

    /// No chunk covers the requested position
    #[error("No chunk for log position {log_position} (0x{log_position:X})")]
    ChunkNotFound {
        /// Requested position
        log_position: i64,
    },

    /// Replication invariant violated (positions out of step)
    #[error("Replication invariant failure: {0}")]
    ReplicationInvariant(String),

    /// Unexpected or malformed protocol message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Peer connection is closed
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Service inbox is gone
    #[error("Service stopped: {0}")]
    ServiceStopped(String),

    /// Local log storage errors
    #[error("Storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Create a framing error
    pub fn framing(msg: impl Into<String>) -> Self {
        Self::Framing(msg.into())
    }

    /// Create a log record error
    pub fn log_record(msg: impl Into<String>) -> Self {
        Self::LogRecord(msg.into())
    }

    /// Create a replication invariant error
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::ReplicationInvariant(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a connection closed error
    pub fn connection_closed(msg: impl Into<String>) -> Self {
        Self::ConnectionClosed(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a service stopped error
    pub fn service_stopped(msg: impl Into<String>) -> Self {
        Self::ServiceStopped(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Errors that are fatal to one replica connection but never to the leader
    pub fn is_consistency_error(&self) -> bool {
        matches!(
            self,
            Self::InconsistentReplicaState { .. } | Self::TooOldForResync { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_constructors() {
        assert!(matches!(Error::framing("x"), Error::Framing(_)));
        assert!(matches!(Error::storage("x"), Error::Storage(_)));
    }

    #[test]
    fn test_consistency_errors() {
        assert!(Error::InconsistentReplicaState { log_position: 10 }.is_consistency_error());
        assert!(
            Error::TooOldForResync {
                common_epoch_number: 1,
                leader_checkpoint: 0
            }
            .is_consistency_error()
        );
        assert!(!Error::protocol("bad").is_consistency_error());
    }

    #[test]
    fn test_inconsistent_state_message() {
        let err = Error::InconsistentReplicaState { log_position: 255 };
        assert!(err.to_string().contains("0xFF"));
    }
}
