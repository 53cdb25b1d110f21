//! Position checkpoints
//!
//! A checkpoint holds one log position. Writes are staged and only become
//! visible to `read()` and to subscribers once flushed.

use crate::{Error, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::watch;

/// On-disk size of a file checkpoint: value plus crc32
const CHECKPOINT_FILE_SIZE: usize = 12;

/// A single durable log position
pub trait Checkpoint: Send + Sync {
    /// Checkpoint name used in logs
    fn name(&self) -> &str;

    /// Last flushed value
    fn read(&self) -> i64;

    /// Last written value, flushed or not
    fn read_non_flushed(&self) -> i64;

    /// Stage a new value
    fn write(&self, value: i64);

    /// Make the staged value durable and notify subscribers
    fn flush(&self) -> Result<()>;

    /// Receiver that observes every flush
    fn subscribe(&self) -> watch::Receiver<i64>;
}

#[derive(Debug)]
struct Values {
    staged: AtomicI64,
    flushed: watch::Sender<i64>,
}

impl Values {
    fn new(initial: i64) -> Self {
        let (flushed, _) = watch::channel(initial);
        Self {
            staged: AtomicI64::new(initial),
            flushed,
        }
    }

    fn publish(&self, value: i64) {
        self.flushed.send_replace(value);
    }
}

/// Checkpoint held in memory
#[derive(Debug)]
pub struct MemoryCheckpoint {
    name: String,
    values: Values,
}

impl MemoryCheckpoint {
    /// Create with an initial flushed value
    pub fn new(name: impl Into<String>, initial: i64) -> Self {
        Self {
            name: name.into(),
            values: Values::new(initial),
        }
    }
}

impl Checkpoint for MemoryCheckpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&self) -> i64 {
        *self.values.flushed.borrow()
    }

    fn read_non_flushed(&self) -> i64 {
        self.values.staged.load(Ordering::SeqCst)
    }

    fn write(&self, value: i64) {
        self.values.staged.store(value, Ordering::SeqCst);
    }

    fn flush(&self) -> Result<()> {
        self.values.publish(self.read_non_flushed());
        Ok(())
    }

    fn subscribe(&self) -> watch::Receiver<i64> {
        self.values.flushed.subscribe()
    }
}

/// Checkpoint persisted to a 12-byte file (`i64 LE` + `crc32 LE`)
#[derive(Debug)]
pub struct FileCheckpoint {
    name: String,
    path: PathBuf,
    file: Mutex<File>,
    values: Values,
}

impl FileCheckpoint {
    /// Open or create the checkpoint at `path`
    pub fn open(name: impl Into<String>, path: impl AsRef<Path>, initial: i64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let exists = path.exists();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let value = if exists && file.metadata()?.len() > 0 {
            let mut buf = [0u8; CHECKPOINT_FILE_SIZE];
            file.read_exact(&mut buf)?;
            decode(&buf).ok_or_else(|| {
                Error::storage(format!("Checkpoint {} is corrupted", path.display()))
            })?
        } else {
            write_value(&mut file, initial)?;
            initial
        };

        Ok(Self {
            name: name.into(),
            path,
            file: Mutex::new(file),
            values: Values::new(value),
        })
    }

    /// File backing this checkpoint
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Checkpoint for FileCheckpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&self) -> i64 {
        *self.values.flushed.borrow()
    }

    fn read_non_flushed(&self) -> i64 {
        self.values.staged.load(Ordering::SeqCst)
    }

    fn write(&self, value: i64) {
        self.values.staged.store(value, Ordering::SeqCst);
    }

    fn flush(&self) -> Result<()> {
        let value = self.read_non_flushed();
        write_value(&mut self.file.lock(), value)?;
        self.values.publish(value);
        Ok(())
    }

    fn subscribe(&self) -> watch::Receiver<i64> {
        self.values.flushed.subscribe()
    }
}

fn encode(value: i64) -> [u8; CHECKPOINT_FILE_SIZE] {
    let mut buf = [0u8; CHECKPOINT_FILE_SIZE];
    buf[..8].copy_from_slice(&value.to_le_bytes());
    let crc = crc32fast::hash(&buf[..8]);
    buf[8..].copy_from_slice(&crc.to_le_bytes());
    buf
}

fn decode(buf: &[u8; CHECKPOINT_FILE_SIZE]) -> Option<i64> {
    let mut value = [0u8; 8];
    value.copy_from_slice(&buf[..8]);
    let mut crc = [0u8; 4];
    crc.copy_from_slice(&buf[8..]);
    (crc32fast::hash(&value) == u32::from_le_bytes(crc)).then(|| i64::from_le_bytes(value))
}

fn write_value(file: &mut File, value: i64) -> Result<()> {
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&encode(value))?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_memory_checkpoint_flush() {
        let checkpoint = MemoryCheckpoint::new("writer", 0);
        checkpoint.write(100);
        assert_eq!(checkpoint.read(), 0);
        assert_eq!(checkpoint.read_non_flushed(), 100);

        checkpoint.flush().unwrap();
        assert_eq!(checkpoint.read(), 100);
    }

    #[tokio::test]
    async fn test_subscribers_see_flushes() {
        let checkpoint = MemoryCheckpoint::new("writer", 0);
        let mut rx = checkpoint.subscribe();

        checkpoint.write(42);
        checkpoint.flush().unwrap();

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 42);
    }

    #[test]
    fn test_file_checkpoint_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("replication.chk");

        {
            let checkpoint = FileCheckpoint::open("replication", &path, -1).unwrap();
            assert_eq!(checkpoint.read(), -1);
            checkpoint.write(8192);
            checkpoint.flush().unwrap();
        }

        let reopened = FileCheckpoint::open("replication", &path, -1).unwrap();
        assert_eq!(reopened.read(), 8192);
        assert_eq!(reopened.read_non_flushed(), 8192);
    }

    #[test]
    fn test_unflushed_write_not_persisted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("writer.chk");

        {
            let checkpoint = FileCheckpoint::open("writer", &path, 0).unwrap();
            checkpoint.write(10);
        }

        let reopened = FileCheckpoint::open("writer", &path, 0).unwrap();
        assert_eq!(reopened.read(), 0);
    }

    #[test]
    fn test_corrupted_file_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.chk");
        std::fs::write(&path, [1u8; CHECKPOINT_FILE_SIZE]).unwrap();

        let result = FileCheckpoint::open("bad", &path, 0);
        assert!(matches!(result, Err(Error::Storage(_))));
    }
}
