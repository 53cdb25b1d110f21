//! Chunk bulk shipping
//!
//! Reads the next bulk for a subscription from its leased chunk reader and
//! sends it. Scavenged chunks the replica does not already hold are shipped
//! raw, header included; everything else is shipped as logical data up to
//! the leader's flushed writer position.

use crate::chunk::{CHUNK_HEADER_SIZE, ChunkManager};
use crate::replication::messages::ReplicationMessage;
use crate::replication::subscription::ReplicaSubscription;
use crate::{Error, Result};
use std::sync::Arc;
use uuid::Uuid;

pub(crate) struct ChunkShipper {
    leader_id: Uuid,
    chunks: Arc<dyn ChunkManager>,
    bulk_size: usize,
    reader_acquire_retries: u32,
}

impl ChunkShipper {
    pub fn new(
        leader_id: Uuid,
        chunks: Arc<dyn ChunkManager>,
        bulk_size: usize,
        reader_acquire_retries: u32,
    ) -> Self {
        Self {
            leader_id,
            chunks,
            bulk_size,
            reader_acquire_retries,
        }
    }

    /// Point the subscription at `log_position`, leasing a reader on its chunk.
    ///
    /// `chunk_id` is the replica's chunk at that position; a scavenged leader
    /// chunk with a different id is shipped raw from its start. Returns the
    /// position streaming resumes from.
    pub fn set_subscription_position(
        &self,
        subscription: &mut ReplicaSubscription,
        log_position: i64,
        chunk_id: Option<Uuid>,
        replication_start: bool,
        verbose: bool,
    ) -> Result<i64> {
        for attempt in 1..=self.reader_acquire_retries {
            match self.try_set_subscription_position(
                subscription,
                log_position,
                chunk_id,
                replication_start,
                verbose,
            ) {
                Err(Error::ChunkBeingDeleted { chunk }) => {
                    tracing::debug!(
                        subscription_id = %subscription.subscription_id,
                        attempt,
                        "Chunk #{} is being deleted while acquiring a reader, retrying",
                        chunk
                    );
                }
                other => return other,
            }
        }
        Err(Error::ReaderAcquisition {
            subscription_id: subscription.subscription_id,
            attempts: self.reader_acquire_retries,
        })
    }

    fn try_set_subscription_position(
        &self,
        subscription: &mut ReplicaSubscription,
        log_position: i64,
        chunk_id: Option<Uuid>,
        replication_start: bool,
        verbose: bool,
    ) -> Result<i64> {
        let chunk = self.chunks.chunk_for(log_position)?;
        let header = chunk.header();
        let mut reader = chunk.acquire_reader()?;

        let raw_send = header.is_scavenged && chunk_id != Some(header.chunk_id);
        let position = if raw_send {
            reader.set_raw_position(CHUNK_HEADER_SIZE as i64)?;
            header.chunk_start_position()
        } else {
            reader.set_data_position(header.local_log_position(log_position))?;
            log_position
        };

        if verbose {
            tracing::info!(
                subscription_id = %subscription.subscription_id,
                "Subscribed replica {} for {} send at {} (0x{:X}) (requested {} (0x{:X}))",
                subscription,
                if raw_send { "raw" } else { "data" },
                position,
                position,
                log_position,
                log_position
            );
        }

        if replication_start {
            subscription.send(ReplicationMessage::ReplicaSubscribed {
                leader_id: self.leader_id,
                subscription_id: subscription.subscription_id,
                log_position: position,
            });
        }
        if raw_send {
            subscription.send(ReplicationMessage::CreateChunk {
                leader_id: self.leader_id,
                subscription_id: subscription.subscription_id,
                chunk_header: header,
                file_size: chunk.file_size(),
                is_completed: true,
            });
        }

        subscription.raw_send = raw_send;
        subscription.eof_sent = false;
        subscription.set_log_position(position);
        subscription.replace_reader(reader);
        Ok(position)
    }

    /// Ship at most one bulk; returns whether anything was sent or the
    /// subscription moved to the next chunk.
    pub fn try_send_log_bulk(
        &self,
        subscription: &mut ReplicaSubscription,
        leader_checkpoint: i64,
    ) -> Result<bool> {
        let subscription_id = subscription.subscription_id;
        let raw_send = subscription.raw_send;
        let log_position = subscription.log_position();
        let Some(reader) = subscription.reader.as_mut() else {
            return Err(Error::invariant(format!(
                "Subscription {} has no chunk reader",
                subscription_id
            )));
        };
        let header = reader.chunk_header();

        if subscription.eof_sent {
            return self.follow_rollover(subscription, header.chunk_end_position(), leader_checkpoint);
        }

        let (bulk, message) = if raw_send {
            let bulk = reader.read_next_raw_bytes(self.bulk_size)?;
            let message = ReplicationMessage::RawChunkBulk {
                leader_id: self.leader_id,
                subscription_id,
                chunk_start_number: header.chunk_start_number,
                chunk_end_number: header.chunk_end_number,
                raw_position: bulk.old_position,
                data: bulk.data.to_vec(),
                is_eof: bulk.is_eof,
            };
            (bulk, message)
        } else {
            let available = (leader_checkpoint - log_position).clamp(0, self.bulk_size as i64);
            let bulk = reader.read_next_data_bytes(available as usize)?;
            let local = header.local_log_position(log_position);
            if bulk.old_position != local {
                return Err(Error::invariant(format!(
                    "Reader is at local position {} but subscription {} expects {} (log position {})",
                    bulk.old_position, subscription_id, local, log_position
                )));
            }
            let message = ReplicationMessage::DataChunkBulk {
                leader_id: self.leader_id,
                subscription_id,
                chunk_start_number: header.chunk_start_number,
                chunk_end_number: header.chunk_end_number,
                subscription_position: log_position,
                data: bulk.data.to_vec(),
                is_eof: bulk.is_eof,
            };
            (bulk, message)
        };

        let bytes_read = bulk.data.len();
        if bytes_read > 0 || bulk.is_eof {
            subscription.send(message);
        }
        if !raw_send {
            subscription.set_log_position(log_position + bytes_read as i64);
        }

        if !bulk.is_eof {
            return Ok(bytes_read > 0);
        }

        subscription.eof_sent = true;
        let chunk_end = header.chunk_end_position();
        subscription.set_log_position(chunk_end);
        self.follow_rollover(subscription, chunk_end, leader_checkpoint)
            .map(|moved| moved || bytes_read > 0)
    }

    fn follow_rollover(
        &self,
        subscription: &mut ReplicaSubscription,
        chunk_end: i64,
        leader_checkpoint: i64,
    ) -> Result<bool> {
        if chunk_end >= leader_checkpoint {
            return Ok(false);
        }
        self.set_subscription_position(subscription, chunk_end, None, false, true)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{ChunkHeader, MemoryLog, ReplicaLog};
    use crate::replication::messages::Envelope;
    use crate::transport::LeaderLink;
    use crate::transport::channel::ChannelNetwork;

    struct Fixture {
        log: Arc<MemoryLog>,
        shipper: ChunkShipper,
        subscription: ReplicaSubscription,
        link: LeaderLink,
    }

    fn fixture(chunk_size: i32, bulk_size: usize) -> Fixture {
        let log = Arc::new(MemoryLog::new(chunk_size));
        let shipper = ChunkShipper::new(Uuid::new_v4(), log.clone(), bulk_size, 10);
        let (connection, _inbound, link) = ChannelNetwork::pair();
        let subscription = ReplicaSubscription::new(
            connection,
            Uuid::new_v4(),
            "127.0.0.1:3000".parse().unwrap(),
            true,
        );
        Fixture {
            log,
            shipper,
            subscription,
            link,
        }
    }

    fn drain(link: &mut LeaderLink) -> Vec<ReplicationMessage> {
        let mut messages = Vec::new();
        while let Ok(Envelope { message, .. }) = link.inbound.try_recv() {
            messages.push(message);
        }
        messages
    }

    #[test]
    fn test_data_send_ships_up_to_checkpoint() {
        let mut f = fixture(4096, 8192);
        f.log.append_event("s", "e", b"one").unwrap();
        let checkpoint = f.log.append_event("s", "e", b"two").unwrap();
        f.log.append_event("s", "e", b"unflushed").unwrap();

        let start = f
            .shipper
            .set_subscription_position(&mut f.subscription, 0, None, true, false)
            .unwrap();
        assert_eq!(start, 0);
        assert!(!f.subscription.raw_send);

        assert!(f.shipper.try_send_log_bulk(&mut f.subscription, checkpoint).unwrap());
        assert_eq!(f.subscription.log_position(), checkpoint);
        // Nothing more below the checkpoint.
        assert!(!f.shipper.try_send_log_bulk(&mut f.subscription, checkpoint).unwrap());

        let messages = drain(&mut f.link);
        assert_eq!(messages.len(), 2);
        assert!(matches!(
            messages[0],
            ReplicationMessage::ReplicaSubscribed { log_position: 0, .. }
        ));
        match &messages[1] {
            ReplicationMessage::DataChunkBulk {
                subscription_position,
                data,
                is_eof,
                ..
            } => {
                assert_eq!(*subscription_position, 0);
                assert_eq!(data.len() as i64, checkpoint);
                assert!(!is_eof);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_eof_sent_once_then_follows_rollover() {
        let mut f = fixture(128, 4096);
        f.log.append_event("s", "e", &[1u8; 40]).unwrap();
        // Second record does not fit, the first chunk completes.
        let checkpoint = f.log.append_event("s", "e", &[2u8; 40]).unwrap();
        assert!(checkpoint > 128);

        f.shipper
            .set_subscription_position(&mut f.subscription, 0, None, true, false)
            .unwrap();

        // First bulk drains chunk 0, hits EOF and moves to chunk 1.
        assert!(f.shipper.try_send_log_bulk(&mut f.subscription, checkpoint).unwrap());
        assert_eq!(f.subscription.log_position(), 128);
        assert!(!f.subscription.eof_sent);

        assert!(f.shipper.try_send_log_bulk(&mut f.subscription, checkpoint).unwrap());
        assert_eq!(f.subscription.log_position(), checkpoint);

        let eofs = drain(&mut f.link)
            .into_iter()
            .filter(|m| matches!(m, ReplicationMessage::DataChunkBulk { is_eof: true, .. }))
            .count();
        assert_eq!(eofs, 1);
        assert_eq!(f.log.live_readers(), 1);
    }

    #[test]
    fn test_parked_at_completed_chunk_end() {
        let mut f = fixture(128, 4096);
        f.log.append_event("s", "e", &[1u8; 40]).unwrap();
        f.log.complete_chunk().unwrap();
        let checkpoint = f.log.writer_position();

        f.shipper
            .set_subscription_position(&mut f.subscription, 0, None, true, false)
            .unwrap();
        assert!(f.shipper.try_send_log_bulk(&mut f.subscription, checkpoint).unwrap());
        assert!(f.subscription.eof_sent);
        assert_eq!(f.subscription.log_position(), 128);

        // Repeated passes send nothing until the leader moves on.
        for _ in 0..3 {
            assert!(!f.shipper.try_send_log_bulk(&mut f.subscription, checkpoint).unwrap());
        }
        let sent = drain(&mut f.link);
        assert_eq!(sent.len(), 2);

        let checkpoint = f.log.append_event("s", "e", b"next").unwrap();
        assert!(f.shipper.try_send_log_bulk(&mut f.subscription, checkpoint).unwrap());
        assert!(!f.subscription.eof_sent);
        assert_eq!(f.subscription.log_position(), 128);
    }

    #[test]
    fn test_scavenged_chunk_shipped_raw() {
        let mut f = fixture(256, 64);
        f.log.append_event("s", "e", &[7u8; 100]).unwrap();
        f.log.complete_chunk().unwrap();
        let header = f.log.scavenge_chunk(0).unwrap();
        let checkpoint = f.log.writer_position();

        let start = f
            .shipper
            .set_subscription_position(&mut f.subscription, 50, Some(Uuid::new_v4()), true, false)
            .unwrap();
        assert_eq!(start, 0);
        assert!(f.subscription.raw_send);

        while !f.subscription.eof_sent && f.subscription.raw_send {
            f.shipper.try_send_log_bulk(&mut f.subscription, checkpoint).unwrap();
        }

        let messages = drain(&mut f.link);
        assert!(matches!(
            messages[1],
            ReplicationMessage::CreateChunk { chunk_header, is_completed: true, .. }
                if chunk_header == header
        ));
        let mut image = Vec::new();
        let mut expected_offset = CHUNK_HEADER_SIZE as i64;
        for message in &messages[2..] {
            if let ReplicationMessage::RawChunkBulk {
                raw_position, data, ..
            } = message
            {
                assert_eq!(*raw_position, expected_offset);
                expected_offset += data.len() as i64;
                image.extend_from_slice(data);
            }
        }
        let (_, data) = &f.log.chunk_data()[0];
        assert_eq!(&image[..], &data[..]);
    }

    #[test]
    fn test_matching_scavenged_chunk_uses_data_send() {
        let mut f = fixture(256, 64);
        f.log.append_event("s", "e", &[7u8; 100]).unwrap();
        f.log.complete_chunk().unwrap();
        let header: ChunkHeader = f.log.scavenge_chunk(0).unwrap();

        let start = f
            .shipper
            .set_subscription_position(&mut f.subscription, 20, Some(header.chunk_id), true, false)
            .unwrap();
        assert_eq!(start, 20);
        assert!(!f.subscription.raw_send);
    }

    #[test]
    fn test_reader_acquisition_retried() {
        let mut f = fixture(4096, 1024);
        f.log.append_event("s", "e", b"x").unwrap();
        f.log.fail_reader_acquisitions(0, 3).unwrap();

        let position = f
            .shipper
            .set_subscription_position(&mut f.subscription, 0, None, true, false)
            .unwrap();
        assert_eq!(position, 0);
        assert_eq!(f.log.live_readers(), 1);
    }

    #[test]
    fn test_reader_acquisition_gives_up() {
        let mut f = fixture(4096, 1024);
        f.log.fail_reader_acquisitions(0, 50).unwrap();

        let err = f
            .shipper
            .set_subscription_position(&mut f.subscription, 0, None, true, false)
            .unwrap_err();
        assert!(matches!(err, Error::ReaderAcquisition { attempts: 10, .. }));
        assert!(drain(&mut f.link).is_empty());
        assert_eq!(f.log.live_readers(), 0);
    }

    #[test]
    fn test_replacing_reader_releases_lease() {
        let mut f = fixture(4096, 1024);
        f.log.append_event("s", "e", b"x").unwrap();
        for _ in 0..3 {
            f.shipper
                .set_subscription_position(&mut f.subscription, 0, None, false, false)
                .unwrap();
        }
        assert_eq!(f.log.live_readers(), 1);
        f.subscription.dispose("test");
        assert_eq!(f.log.live_readers(), 0);
    }
}
