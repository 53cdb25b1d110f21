//! Replica-side log applier
//!
//! Writes what the leader ships into the local log. Data bulks go through a
//! transaction framer so that only whole transactions reach the log; raw
//! bulks rebuild a scavenged chunk image and replace the local chunk once
//! the image is complete. Epoch records are registered with the local epoch
//! manager as they are written.

use crate::chunk::{CHUNK_HEADER_SIZE, ChunkHeader, ReplicaLog};
use crate::epoch::EpochManager;
use crate::framing::{LengthPrefixSuffixFramer, LogRecordFramer, TransactionFramer, transaction_framer};
use crate::log_record::LogRecord;
use crate::replication::messages::ReplicationMessage;
use crate::{Error, Result};
use bytes::BytesMut;
use std::sync::Arc;
use uuid::Uuid;

/// Ack the replica owes the leader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaAck {
    /// Subscription being acknowledged
    pub subscription_id: Uuid,
    /// Durable position
    pub replication_log_position: i64,
    /// Local writer position
    pub writer_log_position: i64,
}

impl ReplicaAck {
    /// Wire form of the ack
    pub fn to_message(self) -> ReplicationMessage {
        ReplicationMessage::ReplicaLogPositionAck {
            subscription_id: self.subscription_id,
            replication_log_position: self.replication_log_position,
            writer_log_position: self.writer_log_position,
        }
    }
}

/// Result of applying one leader message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Nothing to report
    Nothing,
    /// Durable position advanced
    Ack(ReplicaAck),
    /// The leader resumed below the local writer; the log must be truncated
    /// to `position` before replication can continue
    TruncationRequired {
        /// Position to truncate to
        position: i64,
    },
}

struct RawChunk {
    header: ChunkHeader,
    file_size: i64,
    image: BytesMut,
}

/// Applies leader messages to the local log
pub struct ReplicaApplier {
    log: Arc<dyn ReplicaLog>,
    epochs: Arc<dyn EpochManager>,
    framer: TransactionFramer,
    max_frame_size: usize,
    subscription_id: Option<Uuid>,
    subscription_position: i64,
    raw_chunk: Option<RawChunk>,
    truncation_required: bool,
    last_acked: i64,
}

impl ReplicaApplier {
    /// Applier writing to `log`
    pub fn new(log: Arc<dyn ReplicaLog>, epochs: Arc<dyn EpochManager>, max_frame_size: usize) -> Self {
        Self {
            log,
            epochs,
            framer: transaction_framer(max_frame_size),
            max_frame_size,
            subscription_id: None,
            subscription_position: -1,
            raw_chunk: None,
            truncation_required: false,
            last_acked: -1,
        }
    }

    /// Subscription currently being applied
    pub fn subscription_id(&self) -> Option<Uuid> {
        self.subscription_id
    }

    /// Next global position expected from the leader
    pub fn subscription_position(&self) -> i64 {
        self.subscription_position
    }

    /// Whether writes are blocked pending truncation
    pub fn truncation_required(&self) -> bool {
        self.truncation_required
    }

    /// Forget the current subscription
    pub fn reset(&mut self) {
        self.subscription_id = None;
        self.raw_chunk = None;
        self.framer.reset();
    }

    /// Apply one leader message
    pub fn apply(&mut self, message: ReplicationMessage) -> Result<ApplyOutcome> {
        match message {
            ReplicationMessage::ReplicaSubscribed {
                subscription_id,
                log_position,
                ..
            } => self.subscribed(subscription_id, log_position),
            ReplicationMessage::CreateChunk {
                subscription_id,
                chunk_header,
                file_size,
                ..
            } => self.create_chunk(subscription_id, chunk_header, file_size),
            ReplicationMessage::RawChunkBulk {
                subscription_id,
                chunk_start_number,
                chunk_end_number,
                raw_position,
                data,
                is_eof,
                ..
            } => self.raw_chunk_bulk(
                subscription_id,
                chunk_start_number,
                chunk_end_number,
                raw_position,
                &data,
                is_eof,
            ),
            ReplicationMessage::DataChunkBulk {
                subscription_id,
                chunk_start_number,
                chunk_end_number,
                subscription_position,
                data,
                is_eof,
                ..
            } => self.data_chunk_bulk(
                subscription_id,
                chunk_start_number,
                chunk_end_number,
                subscription_position,
                &data,
                is_eof,
            ),
            other => Err(Error::protocol(format!(
                "{} is not a log shipping message",
                other.name()
            ))),
        }
    }

    fn subscribed(&mut self, subscription_id: Uuid, log_position: i64) -> Result<ApplyOutcome> {
        self.raw_chunk = None;
        self.framer.reset();
        self.subscription_id = Some(subscription_id);
        self.subscription_position = log_position;

        let writer = self.log.writer_position();
        if log_position > writer {
            return Err(Error::invariant(format!(
                "Leader subscribed us at {} (0x{:X}), which is greater than our writer position {} (0x{:X})",
                log_position, log_position, writer, writer
            )));
        }
        if log_position < writer {
            tracing::warn!(
                subscription_id = %subscription_id,
                "Leader subscribed us at {} (0x{:X}), which is less than our writer position {} (0x{:X}). Truncation required.",
                log_position,
                log_position,
                writer,
                writer
            );
            self.truncation_required = true;
            return Ok(ApplyOutcome::TruncationRequired {
                position: log_position,
            });
        }

        self.truncation_required = false;
        self.last_acked = -1;
        Ok(self.ack_if_advanced(log_position))
    }

    fn create_chunk(
        &mut self,
        subscription_id: Uuid,
        header: ChunkHeader,
        file_size: i64,
    ) -> Result<ApplyOutcome> {
        if !self.accepts(subscription_id) {
            return Ok(ApplyOutcome::Nothing);
        }

        if header.is_scavenged {
            self.raw_chunk = Some(RawChunk {
                header,
                file_size,
                image: BytesMut::from(&header.encode()[..]),
            });
        } else {
            if self.raw_chunk.is_some() {
                return Err(Error::invariant(format!(
                    "Received request to create chunk #{}-{} while a raw chunk is being received",
                    header.chunk_start_number, header.chunk_end_number
                )));
            }
            self.log.create_chunk(&header)?;
        }

        self.framer.reset();
        self.subscription_position = header.chunk_start_position();
        Ok(self.ack_if_advanced(self.log.writer_position()))
    }

    fn raw_chunk_bulk(
        &mut self,
        subscription_id: Uuid,
        chunk_start_number: i32,
        chunk_end_number: i32,
        raw_position: i64,
        data: &[u8],
        is_eof: bool,
    ) -> Result<ApplyOutcome> {
        if !self.accepts(subscription_id) {
            return Ok(ApplyOutcome::Nothing);
        }

        let Some(raw) = self.raw_chunk.as_mut() else {
            return Err(Error::invariant(format!(
                "Raw chunk bulk for #{}-{} received without an active raw chunk",
                chunk_start_number, chunk_end_number
            )));
        };
        if raw.header.chunk_start_number != chunk_start_number
            || raw.header.chunk_end_number != chunk_end_number
        {
            return Err(Error::invariant(format!(
                "Received raw bulk for chunk #{}-{}, but active raw chunk is #{}-{}",
                chunk_start_number,
                chunk_end_number,
                raw.header.chunk_start_number,
                raw.header.chunk_end_number
            )));
        }
        if raw_position != raw.image.len() as i64 {
            return Err(Error::invariant(format!(
                "Received raw bulk at raw position {} (0x{:X}) while expecting {} (0x{:X})",
                raw_position,
                raw_position,
                raw.image.len(),
                raw.image.len()
            )));
        }
        raw.image.extend_from_slice(data);

        if !is_eof {
            return Ok(ApplyOutcome::Nothing);
        }

        let Some(raw) = self.raw_chunk.take() else {
            return Ok(ApplyOutcome::Nothing);
        };
        if raw.image.len() as i64 != raw.file_size {
            return Err(Error::invariant(format!(
                "Raw chunk #{}-{} completed with {} bytes, expected {}",
                raw.header.chunk_start_number,
                raw.header.chunk_end_number,
                raw.image.len(),
                raw.file_size
            )));
        }

        let image = raw.image.freeze();
        self.register_epochs_in_image(&image[CHUNK_HEADER_SIZE..])?;
        self.log.install_raw_chunk(&raw.header, image)?;
        tracing::info!(
            "Completed raw chunk #{}-{} ({})",
            raw.header.chunk_start_number,
            raw.header.chunk_end_number,
            raw.header.chunk_id
        );

        self.framer.reset();
        self.subscription_position = raw.header.chunk_end_position();
        self.log.flush()?;
        Ok(self.ack_if_advanced(self.log.writer_position()))
    }

    fn data_chunk_bulk(
        &mut self,
        subscription_id: Uuid,
        chunk_start_number: i32,
        chunk_end_number: i32,
        subscription_position: i64,
        data: &[u8],
        is_eof: bool,
    ) -> Result<ApplyOutcome> {
        if !self.accepts(subscription_id) {
            return Ok(ApplyOutcome::Nothing);
        }
        if self.raw_chunk.is_some() {
            return Err(Error::invariant(
                "Data chunk bulk received, but we have active chunk for receiving raw chunk bulks",
            ));
        }

        let current = self.log.current_chunk();
        if current.chunk_start_number != chunk_start_number
            || current.chunk_end_number != chunk_end_number
        {
            return Err(Error::invariant(format!(
                "Received data chunk bulk for chunk #{}-{}, but active chunk is #{}-{}",
                chunk_start_number,
                chunk_end_number,
                current.chunk_start_number,
                current.chunk_end_number
            )));
        }
        if subscription_position != self.subscription_position {
            return Err(Error::invariant(format!(
                "Received data chunk bulk at position {} (0x{:X}) while current subscription position is {} (0x{:X})",
                subscription_position,
                subscription_position,
                self.subscription_position,
                self.subscription_position
            )));
        }

        {
            let Self {
                framer,
                log,
                epochs,
                ..
            } = self;
            framer.unframe_data(data, |records| {
                write_transaction(log.as_ref(), epochs.as_ref(), &records)
            })?;
        }
        self.subscription_position += data.len() as i64;

        if is_eof {
            let Self {
                framer,
                log,
                epochs,
                ..
            } = self;
            let flushed = framer.flush_pending(|records| {
                write_transaction(log.as_ref(), epochs.as_ref(), &records)
            })?;
            if let Some(count) = flushed {
                tracing::warn!(
                    "Forced flush of {} pending records at the end of chunk #{}-{}",
                    count,
                    chunk_start_number,
                    chunk_end_number
                );
            }
            if framer.has_data() {
                return Err(Error::invariant(
                    "There is some data left in framer when completing chunk",
                ));
            }

            self.log.complete_chunk()?;
            self.framer.reset();
            self.subscription_position = current.chunk_end_position();
        }

        self.log.flush()?;
        Ok(self.ack_if_advanced(self.log.writer_position()))
    }

    fn accepts(&self, subscription_id: Uuid) -> bool {
        if self.truncation_required {
            return false;
        }
        if self.subscription_id != Some(subscription_id) {
            tracing::debug!(
                subscription_id = %subscription_id,
                "Ignoring message for subscription other than {:?}",
                self.subscription_id
            );
            return false;
        }
        true
    }

    fn ack_if_advanced(&mut self, position: i64) -> ApplyOutcome {
        let Some(subscription_id) = self.subscription_id else {
            return ApplyOutcome::Nothing;
        };
        if position <= self.last_acked {
            return ApplyOutcome::Nothing;
        }
        self.last_acked = position;
        ApplyOutcome::Ack(ReplicaAck {
            subscription_id,
            replication_log_position: position,
            writer_log_position: self.log.writer_position(),
        })
    }

    fn register_epochs_in_image(&self, data: &[u8]) -> Result<()> {
        let mut framer = LogRecordFramer::new(LengthPrefixSuffixFramer::new(self.max_frame_size));
        framer.unframe_data(data, |record| register_epoch(self.epochs.as_ref(), &record))
    }
}

fn write_transaction(
    log: &dyn ReplicaLog,
    epochs: &dyn EpochManager,
    records: &[LogRecord],
) -> Result<()> {
    log.write_records(records)?;
    for record in records {
        register_epoch(epochs, record)?;
    }
    Ok(())
}

fn register_epoch(epochs: &dyn EpochManager, record: &LogRecord) -> Result<()> {
    let LogRecord::System(system) = record else {
        return Ok(());
    };
    let epoch = system.as_epoch()?;
    if epoch.epoch_number <= epochs.last_epoch_number() {
        return Ok(());
    }
    tracing::info!("Replicated epoch {}", epoch);
    epochs.add_epoch(epoch)
}
