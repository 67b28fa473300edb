//! Dirty full sync: linear copy of a writable volume.
//!
//! The client streams fixed-size bulks; the archive marks the
//! resulting snapshot dirty and relies on subsequent wlog shipments to
//! reach a consistent point. A force stop aborts at the next bulk
//! boundary and returns `false`.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use walb_core::{Result, StopFlag, LOGICAL_BLOCK_SIZE};

use crate::packet::Packet;

/// Handshake payload of both backup protocols. For
/// `dirty-hash-sync` the bulk hash seed is `cur_time as u32`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupParams {
    /// Volume being backed up.
    pub vol_id: String,
    /// Volume size [lb].
    pub size_lb: u64,
    /// Bulk size [lb].
    pub bulk_lb: u16,
    /// Backup start time [unix seconds].
    pub cur_time: u64,
}

/// Run the client role: read `size_lb` blocks from `bdev_path` starting
/// at `start_lb` and stream them in `bulk_lb` bulks.
///
/// Returns `false` when a force stop or shutdown aborted the copy.
///
/// # Errors
///
/// Fails on I/O or transport errors.
pub async fn dirty_full_sync_client<S: AsyncRead + AsyncWrite + Unpin>(
    pkt: &mut Packet<S>,
    bdev_path: &Path,
    start_lb: u64,
    size_lb: u64,
    bulk_lb: u16,
    stop: &StopFlag,
    shutdown: &AtomicBool,
) -> Result<bool> {
    let file = Arc::new(File::open(bdev_path)?);
    let mut offset_lb = start_lb;
    let mut remaining_lb = size_lb;

    while remaining_lb > 0 {
        if stop.is_force() || shutdown.load(Ordering::Acquire) {
            return Ok(false);
        }
        let lb = u64::from(bulk_lb).min(remaining_lb) as u16;
        let bytes = lb as usize * LOGICAL_BLOCK_SIZE;

        let read_file = Arc::clone(&file);
        let read_offset = offset_lb * LOGICAL_BLOCK_SIZE as u64;
        let buf = tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; bytes];
            read_file.read_exact_at(&mut buf, read_offset)?;
            Ok::<_, std::io::Error>(buf)
        })
        .await
        .map_err(|e| walb_core::Error::Io(std::io::Error::other(e)))??;

        pkt.write(&lb).await?;
        pkt.write_buf(&buf).await?;
        offset_lb += u64::from(lb);
        remaining_lb -= u64::from(lb);
    }
    pkt.flush().await?;
    Ok(true)
}

/// Run the server role (archive surface): receive the bulks into
/// `out_path`.
///
/// # Errors
///
/// Fails on a bulk-size mismatch or I/O error.
pub async fn dirty_full_sync_server<S: AsyncRead + AsyncWrite + Unpin>(
    pkt: &mut Packet<S>,
    out_path: &Path,
    size_lb: u64,
    bulk_lb: u16,
) -> Result<()> {
    let file = std::fs::OpenOptions::new().create(true).write(true).truncate(false).open(out_path)?;
    let mut offset_lb = 0u64;
    let mut remaining_lb = size_lb;

    while remaining_lb > 0 {
        let expect_lb = u64::from(bulk_lb).min(remaining_lb) as u16;
        let lb: u16 = pkt.read().await?;
        if lb != expect_lb {
            return Err(walb_core::Error::protocol(format!(
                "received bulk of {lb} lb, expected {expect_lb}"
            )));
        }
        let buf = pkt.read_buf().await?;
        if buf.len() != lb as usize * LOGICAL_BLOCK_SIZE {
            return Err(walb_core::Error::protocol("bulk byte length mismatch"));
        }
        file.write_all_at(&buf, offset_lb * LOGICAL_BLOCK_SIZE as u64)?;
        offset_lb += u64::from(lb);
        remaining_lb -= u64::from(lb);
    }
    file.sync_data()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use tokio::io::duplex;

    use super::*;

    #[tokio::test]
    async fn test_full_copy() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.img");
        let dst = dir.path().join("dst.img");
        let data: Vec<u8> = (0..64 * 512u32).map(|i| (i % 253) as u8).collect();
        std::fs::write(&src, &data).unwrap();

        let (a, b) = duplex(1 << 20);
        let src2 = src.clone();
        let client = tokio::spawn(async move {
            let mut pkt = Packet::new(a);
            let stop = StopFlag::default();
            let shutdown = AtomicBool::new(false);
            dirty_full_sync_client(&mut pkt, &src2, 0, 64, 16, &stop, &shutdown).await
        });

        let mut pkt = Packet::new(b);
        dirty_full_sync_server(&mut pkt, &dst, 64, 16).await.unwrap();
        assert!(client.await.unwrap().unwrap());
        assert_eq!(std::fs::read(&dst).unwrap(), data);
    }

    #[tokio::test]
    async fn test_force_stop_aborts() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.img");
        std::fs::write(&src, vec![1u8; 64 * 512]).unwrap();

        let (a, _b) = duplex(1 << 20);
        let mut pkt = Packet::new(a);
        let flag = Arc::new(StopFlag::default());
        let _guard = walb_core::Stopper::begin(Arc::clone(&flag), true).unwrap();
        let shutdown = AtomicBool::new(false);
        let done =
            dirty_full_sync_client(&mut pkt, &src, 0, 64, 16, &flag, &shutdown).await.unwrap();
        assert!(!done);
    }
}
