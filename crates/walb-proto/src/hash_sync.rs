//! Dirty hash sync: block-hash differential copy.
//!
//! Both sides hash each bulk with seeded 128-bit MurmurHash3; the
//! client sends its hash first and ships the bytes only when the server
//! reports a mismatch. Only diverged regions travel.

use std::fs::File;
use std::io::Cursor;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use walb_core::{Result, StopFlag, LOGICAL_BLOCK_SIZE};

use crate::packet::Packet;

/// Seeded 128-bit bulk hash.
///
/// # Errors
///
/// Never fails on an in-memory source; the signature matches the
/// hasher's `Read`-based API.
pub fn bulk_hash(data: &[u8], seed: u32) -> Result<u128> {
    Ok(murmur3::murmur3_x64_128(&mut Cursor::new(data), seed)?)
}

/// Run the client role: hash every bulk, send bytes only where the
/// server's copy differs.
///
/// Returns `false` when a force stop or shutdown aborted the sync.
///
/// # Errors
///
/// Fails on I/O or transport errors.
#[allow(clippy::too_many_arguments)]
pub async fn dirty_hash_sync_client<S: AsyncRead + AsyncWrite + Unpin>(
    pkt: &mut Packet<S>,
    bdev_path: &Path,
    size_lb: u64,
    bulk_lb: u16,
    seed: u32,
    stop: &StopFlag,
    shutdown: &AtomicBool,
) -> Result<bool> {
    let file = Arc::new(File::open(bdev_path)?);
    let mut offset_lb = 0u64;
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

        let hash = bulk_hash(&buf, seed)?;
        pkt.write(&hash).await?;
        pkt.flush().await?;
        let need: bool = pkt.read().await?;
        if need {
            pkt.write_buf(&buf).await?;
        }
        offset_lb += u64::from(lb);
        remaining_lb -= u64::from(lb);
    }
    pkt.flush().await?;
    Ok(true)
}

/// Run the server role (archive surface): compare the client's hashes
/// with the local base at `base_path` and patch diverged bulks in
/// place.
///
/// # Errors
///
/// Fails on I/O or transport errors.
pub async fn dirty_hash_sync_server<S: AsyncRead + AsyncWrite + Unpin>(
    pkt: &mut Packet<S>,
    base_path: &Path,
    size_lb: u64,
    bulk_lb: u16,
    seed: u32,
) -> Result<()> {
    let file = std::fs::OpenOptions::new().read(true).write(true).open(base_path)?;
    let mut offset_lb = 0u64;
    let mut remaining_lb = size_lb;

    while remaining_lb > 0 {
        let lb = u64::from(bulk_lb).min(remaining_lb) as u16;
        let bytes = lb as usize * LOGICAL_BLOCK_SIZE;

        let mut local = vec![0u8; bytes];
        file.read_exact_at(&mut local, offset_lb * LOGICAL_BLOCK_SIZE as u64)?;
        let local_hash = bulk_hash(&local, seed)?;

        let remote_hash: u128 = pkt.read().await?;
        let need = remote_hash != local_hash;
        pkt.write(&need).await?;
        pkt.flush().await?;
        if need {
            let buf = pkt.read_buf().await?;
            if buf.len() != bytes {
                return Err(walb_core::Error::protocol("bulk byte length mismatch"));
            }
            file.write_all_at(&buf, offset_lb * LOGICAL_BLOCK_SIZE as u64)?;
        }
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
    async fn test_only_diverged_bulks_travel() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.img");
        let base = dir.path().join("base.img");

        // 4 bulks of 16 lb; bulk 1 and 3 diverge.
        let mut src_data = vec![0u8; 64 * 512];
        let mut base_data = src_data.clone();
        src_data[16 * 512] = 0xaa;
        src_data[48 * 512 + 7] = 0xbb;
        base_data[16 * 512] = 0x11;
        std::fs::write(&src, &src_data).unwrap();
        std::fs::write(&base, &base_data).unwrap();

        let (a, b) = duplex(1 << 20);
        let src2 = src.clone();
        let client = tokio::spawn(async move {
            let mut pkt = Packet::new(a);
            let stop = StopFlag::default();
            let shutdown = AtomicBool::new(false);
            dirty_hash_sync_client(&mut pkt, &src2, 64, 16, 777, &stop, &shutdown).await
        });

        let mut pkt = Packet::new(b);
        dirty_hash_sync_server(&mut pkt, &base, 64, 16, 777).await.unwrap();
        assert!(client.await.unwrap().unwrap());
        assert_eq!(std::fs::read(&base).unwrap(), src_data);
    }

    #[tokio::test]
    async fn test_identical_volumes_transfer_nothing() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.img");
        let base = dir.path().join("base.img");
        let data = vec![9u8; 32 * 512];
        std::fs::write(&src, &data).unwrap();
        std::fs::write(&base, &data).unwrap();

        // A small duplex buffer: if any bulk data were shipped the
        // writer would block and the test would hang.
        let (a, b) = duplex(4096);
        let src2 = src.clone();
        let client = tokio::spawn(async move {
            let mut pkt = Packet::new(a);
            let stop = StopFlag::default();
            let shutdown = AtomicBool::new(false);
            dirty_hash_sync_client(&mut pkt, &src2, 32, 8, 1, &stop, &shutdown).await
        });

        let mut pkt = Packet::new(b);
        dirty_hash_sync_server(&mut pkt, &base, 32, 8, 1).await.unwrap();
        assert!(client.await.unwrap().unwrap());
    }

    #[test]
    fn test_hash_seed_sensitivity() {
        let data = vec![1u8; 4096];
        assert_ne!(bulk_hash(&data, 1).unwrap(), bulk_hash(&data, 2).unwrap());
        assert_eq!(bulk_hash(&data, 7).unwrap(), bulk_hash(&data, 7).unwrap());
    }
}
