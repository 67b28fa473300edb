//! Write-behind block-device writer.
//!
//! `prepare` queues an IO, `submit` hands every prepared IO to the
//! kernel, and `wait` blocks until one specific IO completes, re-raising
//! its error in the caller's context. At most `queue_size` IOs are in
//! flight.

use std::collections::HashMap;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::{oneshot, Semaphore};
use walb_core::{Error, Result};

/// Default in-flight bound of [`AsyncBdevWriter`].
pub const DEFAULT_WRITER_QUEUE_SIZE: usize = 64;

struct Prepared {
    key: u64,
    offset: u64,
    data: Vec<u8>,
}

/// Bounded write-behind writer over a block device or image file.
pub struct AsyncBdevWriter {
    file: Arc<File>,
    slots: Arc<Semaphore>,
    next_key: u64,
    prepared: Vec<Prepared>,
    completions: HashMap<u64, oneshot::Receiver<std::io::Result<()>>>,
}

impl AsyncBdevWriter {
    /// Open `path` for writing with the default queue size.
    ///
    /// # Errors
    ///
    /// Fails when the target cannot be opened for writing.
    pub fn open(path: &Path) -> Result<Self> {
        Self::with_queue_size(path, DEFAULT_WRITER_QUEUE_SIZE)
    }

    /// Open `path` for writing with an explicit in-flight bound.
    ///
    /// # Errors
    ///
    /// Fails when the target cannot be opened for writing.
    pub fn with_queue_size(path: &Path, queue_size: usize) -> Result<Self> {
        assert!(queue_size > 0);
        let file = std::fs::OpenOptions::new().write(true).open(path)?;
        Ok(Self {
            file: Arc::new(file),
            slots: Arc::new(Semaphore::new(queue_size)),
            next_key: 0,
            prepared: Vec::new(),
            completions: HashMap::new(),
        })
    }

    /// Queue a write of `data` at byte `offset`. Returns the key to
    /// pass to [`wait`](Self::wait).
    pub fn prepare(&mut self, offset: u64, data: Vec<u8>) -> u64 {
        let key = self.next_key;
        self.next_key += 1;
        self.prepared.push(Prepared { key, offset, data });
        key
    }

    /// Hand every prepared IO to the kernel.
    ///
    /// # Errors
    ///
    /// Fails only when the process is shutting down and no slot can be
    /// acquired.
    pub async fn submit(&mut self) -> Result<()> {
        for io in self.prepared.drain(..) {
            let permit = Arc::clone(&self.slots)
                .acquire_owned()
                .await
                .map_err(|e| Error::Io(std::io::Error::other(e)))?;
            let (tx, rx) = oneshot::channel();
            self.completions.insert(io.key, rx);
            let file = Arc::clone(&self.file);
            tokio::task::spawn_blocking(move || {
                let res = file.write_all_at(&io.data, io.offset);
                drop(permit);
                let _ = tx.send(res);
            });
        }
        Ok(())
    }

    /// Wait for the IO identified by `key` and re-raise its error.
    ///
    /// # Errors
    ///
    /// Returns the write error of that IO, or a state error for an
    /// unknown key.
    pub async fn wait(&mut self, key: u64) -> Result<()> {
        let rx = self
            .completions
            .remove(&key)
            .ok_or_else(|| Error::format(format!("unknown IO key {key}")))?;
        rx.await.map_err(|e| Error::Io(std::io::Error::other(e)))??;
        Ok(())
    }

    /// Wait for every outstanding IO.
    ///
    /// # Errors
    ///
    /// Returns the first failure observed.
    pub async fn wait_all(&mut self) -> Result<()> {
        let keys: Vec<u64> = self.completions.keys().copied().collect();
        let mut first_err = None;
        for key in keys {
            if let Err(e) = self.wait(key).await {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Flush device buffers.
    ///
    /// # Errors
    ///
    /// Returns the fdatasync error.
    pub async fn sync_data(&self) -> Result<()> {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || file.sync_data())
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))??;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn test_write_and_wait() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bdev.img");
        std::fs::write(&path, vec![0u8; 1 << 16]).unwrap();

        let mut writer = AsyncBdevWriter::with_queue_size(&path, 4).unwrap();
        let k0 = writer.prepare(0, vec![0xaa; 4096]);
        let k1 = writer.prepare(8192, vec![0xbb; 4096]);
        writer.submit().await.unwrap();
        writer.wait(k0).await.unwrap();
        writer.wait(k1).await.unwrap();
        writer.sync_data().await.unwrap();

        let content = std::fs::read(&path).unwrap();
        assert!(content[..4096].iter().all(|&b| b == 0xaa));
        assert!(content[4096..8192].iter().all(|&b| b == 0));
        assert!(content[8192..12288].iter().all(|&b| b == 0xbb));
    }

    #[tokio::test]
    async fn test_unknown_key() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bdev.img");
        std::fs::write(&path, vec![0u8; 4096]).unwrap();

        let mut writer = AsyncBdevWriter::with_queue_size(&path, 1).unwrap();
        assert!(writer.wait(99).await.is_err());
    }

    #[tokio::test]
    async fn test_wait_all() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bdev.img");
        std::fs::write(&path, vec![0u8; 1 << 20]).unwrap();

        let mut writer = AsyncBdevWriter::with_queue_size(&path, 8).unwrap();
        for i in 0..32u64 {
            writer.prepare(i * 4096, vec![i as u8; 4096]);
        }
        writer.submit().await.unwrap();
        writer.wait_all().await.unwrap();

        let content = std::fs::read(&path).unwrap();
        assert_eq!(content[31 * 4096], 31);
    }
}
