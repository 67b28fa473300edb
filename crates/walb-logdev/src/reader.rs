//! Log-device readers.
//!
//! [`WldevReader`] is a simple positional reader used by one-shot tools
//! (debug dumps, header inspection). [`AsyncWldevReader`] keeps a
//! bounded window of single-block reads in flight ahead of the consumer
//! and is what the transfer engine uses.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use tokio::task::JoinHandle;
use walb_core::checksum::checksum_partial_finish;
use walb_core::{Error, Result};

use crate::block::AlignedBuf;
use crate::pack::{LogPackHeader, LogRecord, Parsed};
use crate::superblock::SuperBlock;

/// Open a block device or image file for reading, bypassing the page
/// cache when the platform supports it.
fn open_readonly(path: &Path, direct: bool) -> std::io::Result<File> {
    #[cfg(target_os = "linux")]
    if direct {
        use std::os::unix::fs::OpenOptionsExt;
        match std::fs::OpenOptions::new().read(true).custom_flags(libc::O_DIRECT).open(path) {
            Ok(f) => return Ok(f),
            // Filesystems without O_DIRECT support (tmpfs) reject the
            // flag; fall back to a buffered open.
            Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {}
            Err(e) => return Err(e),
        }
    }
    let _ = direct;
    File::open(path)
}

/// Read the superblock of a log device.
///
/// The first copy always starts at byte offset 4096 regardless of pbs
/// (`first_super_offset_pb(pbs) * pbs == 4096` for every valid pbs up
/// to 4096).
fn read_super_block(file: &File) -> Result<SuperBlock> {
    let mut buf = vec![0u8; 4096];
    file.read_exact_at(&mut buf, 4096)?;
    // The pbs field tells us how long the block really is.
    let pbs = u32::from_le_bytes(buf[12..16].try_into().expect("4 bytes"));
    if !crate::block::is_valid_pbs(pbs) || pbs > 4096 {
        return Err(Error::format(format!("implausible physical block size {pbs}")));
    }
    SuperBlock::parse(&buf[..pbs as usize]).into_result()
}

fn read_pb_at(file: &File, sb: &SuperBlock, lsid: u64, buf: &mut [u8]) -> Result<()> {
    let pbs = sb.physical_bs as u64;
    let offset_pb = sb.offset_of_lsid_pb(lsid)?;
    file.read_exact_at(buf, offset_pb * pbs)?;
    Ok(())
}

/// Synchronous positional reader over a log device.
pub struct WldevReader {
    file: File,
    sb: SuperBlock,
}

impl WldevReader {
    /// Open a log device and read its superblock.
    ///
    /// # Errors
    ///
    /// Fails when the device cannot be opened or the superblock is
    /// invalid.
    pub fn open(path: &Path) -> Result<Self> {
        let file = open_readonly(path, false)?;
        let sb = read_super_block(&file)?;
        Ok(Self { file, sb })
    }

    /// The device superblock.
    #[must_use]
    pub const fn super_block(&self) -> &SuperBlock {
        &self.sb
    }

    /// Read `n_pb` physical blocks starting at `lsid`, wrapping around
    /// the ring buffer.
    ///
    /// # Errors
    ///
    /// Returns I/O and mapping errors.
    pub fn read_pb(&self, lsid: u64, n_pb: u64) -> Result<Vec<u8>> {
        let pbs = self.sb.physical_bs as usize;
        let mut out = vec![0u8; pbs * n_pb as usize];
        for i in 0..n_pb {
            let chunk = &mut out[i as usize * pbs..(i as usize + 1) * pbs];
            read_pb_at(&self.file, &self.sb, lsid + i, chunk)?;
        }
        Ok(out)
    }

    /// Read and parse the logpack header at `lsid`.
    ///
    /// # Errors
    ///
    /// Returns I/O errors; validation failures are reported in the
    /// returned [`Parsed`].
    pub fn read_logpack_header(&self, lsid: u64) -> Result<Parsed<LogPackHeader>> {
        let block = self.read_pb(lsid, 1)?;
        let parsed = LogPackHeader::parse(&block, self.sb.physical_bs, self.sb.log_checksum_salt);
        if let Parsed::Valid(ref h) | Parsed::Shrunken(ref h) = parsed {
            if h.logpack_lsid() != lsid {
                return Ok(Parsed::Invalid(format!(
                    "logpack lsid {} does not match requested {lsid}",
                    h.logpack_lsid()
                )));
            }
        }
        Ok(parsed)
    }

    /// Read the IO data of record `idx`, verifying its salted checksum
    /// for normal records. Discard records yield no data.
    ///
    /// # Errors
    ///
    /// Fails on checksum mismatch or I/O error.
    pub fn read_logpack_io(&self, header: &LogPackHeader, idx: usize) -> Result<Option<Vec<u8>>> {
        let rec = header.record(idx);
        if !rec.has_data() {
            return Ok(None);
        }
        let data = self.read_pb(rec.lsid, u64::from(rec.io_size_pb(header.pbs())))?;
        verify_io_checksum(header, rec, &data)?;
        Ok(Some(data))
    }

    /// Raw (unvalidated) header block at `lsid`, for debug dumps.
    ///
    /// # Errors
    ///
    /// Returns I/O and mapping errors.
    pub fn read_raw_header_block(&self, lsid: u64) -> Result<Vec<u8>> {
        self.read_pb(lsid, 1)
    }
}

/// Verify the salted data checksum of a normal record.
fn verify_io_checksum(header: &LogPackHeader, rec: &LogRecord, data: &[u8]) -> Result<()> {
    if !rec.has_data_for_checksum() {
        return Ok(());
    }
    let io_bytes = rec.io_size as usize * walb_core::LOGICAL_BLOCK_SIZE;
    let csum = checksum_partial_finish(
        data[..io_bytes].chunks(header.pbs() as usize),
        header.salt(),
    );
    if csum != rec.checksum {
        return Err(Error::format(format!(
            "logpack IO checksum mismatch at lsid {}: computed {csum:#010x} stored {:#010x}",
            rec.lsid, rec.checksum
        )));
    }
    Ok(())
}

/// Read-ahead async reader over the log ring buffer.
///
/// Up to `queue_size` single-block reads are kept in flight, consumed
/// strictly in lsid order, and the queue is refilled whenever it drops
/// below half capacity. `reset` discards everything in flight and
/// seeks.
pub struct AsyncWldevReader {
    file: Arc<File>,
    sb: SuperBlock,
    queue_size: usize,
    /// Next lsid to hand to the consumer.
    read_lsid: u64,
    /// Next lsid to submit.
    submit_lsid: u64,
    /// One past the last lsid the consumer asked us to prefetch.
    ahead_lsid: u64,
    inflight: std::collections::VecDeque<JoinHandle<std::io::Result<Vec<u8>>>>,
}

/// Default in-flight queue size of [`AsyncWldevReader`].
pub const DEFAULT_READER_QUEUE_SIZE: usize = 32;

impl AsyncWldevReader {
    /// Open a log device with the default queue size.
    ///
    /// # Errors
    ///
    /// Fails when the device cannot be opened or the superblock is
    /// invalid.
    pub fn open(path: &Path) -> Result<Self> {
        Self::with_queue_size(path, DEFAULT_READER_QUEUE_SIZE)
    }

    /// Open a log device with an explicit queue size.
    ///
    /// # Errors
    ///
    /// Fails when the device cannot be opened or the superblock is
    /// invalid.
    pub fn with_queue_size(path: &Path, queue_size: usize) -> Result<Self> {
        assert!(queue_size > 0);
        let file = open_readonly(path, true)?;
        let sb = read_super_block(&file)?;
        Ok(Self {
            file: Arc::new(file),
            sb,
            queue_size,
            read_lsid: 0,
            submit_lsid: 0,
            ahead_lsid: 0,
            inflight: std::collections::VecDeque::new(),
        })
    }

    /// The device superblock.
    #[must_use]
    pub const fn super_block(&self) -> &SuperBlock {
        &self.sb
    }

    /// Discard all in-flight reads and seek to `lsid`.
    pub fn reset(&mut self, lsid: u64) {
        for handle in self.inflight.drain(..) {
            handle.abort();
        }
        self.read_lsid = lsid;
        self.submit_lsid = lsid;
        self.ahead_lsid = lsid;
    }

    /// Grow the prefetch window to `lsid` (exclusive).
    pub fn read_ahead(&mut self, lsid: u64) {
        if lsid > self.ahead_lsid {
            self.ahead_lsid = lsid;
        }
        self.fill();
    }

    fn fill(&mut self) {
        while self.inflight.len() < self.queue_size && self.submit_lsid < self.ahead_lsid {
            let lsid = self.submit_lsid;
            let file = Arc::clone(&self.file);
            let sb = self.sb.clone();
            let pbs = sb.physical_bs;
            self.inflight.push_back(tokio::task::spawn_blocking(move || {
                let mut buf = AlignedBuf::zeroed(pbs as usize, pbs as usize);
                let offset_pb = sb
                    .offset_of_lsid_pb(lsid)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
                file.read_exact_at(&mut buf, offset_pb * u64::from(pbs))?;
                Ok(buf.into_vec())
            }));
            self.submit_lsid += 1;
        }
    }

    /// Read the next physical block in lsid order.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error of the corresponding read.
    pub async fn read_block(&mut self) -> Result<Vec<u8>> {
        if self.read_lsid >= self.ahead_lsid {
            // Consumer outran its own read-ahead window; extend by one.
            self.read_ahead(self.read_lsid + 1);
        }
        // Refill below half capacity.
        if self.inflight.len() < self.queue_size / 2 {
            self.fill();
        }
        let handle = self.inflight.pop_front().expect("fill() submitted at least one read");
        let block = handle
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))??;
        self.read_lsid += 1;
        Ok(block)
    }

    /// Current consumer position.
    #[must_use]
    pub const fn position(&self) -> u64 {
        self.read_lsid
    }

    /// Read and parse the logpack header at the current position.
    ///
    /// # Errors
    ///
    /// Returns I/O errors; validation failures are in the [`Parsed`].
    pub async fn read_logpack_header(&mut self) -> Result<Parsed<LogPackHeader>> {
        let lsid = self.read_lsid;
        let block = self.read_block().await?;
        let parsed = LogPackHeader::parse(&block, self.sb.physical_bs, self.sb.log_checksum_salt);
        if let Parsed::Valid(ref h) | Parsed::Shrunken(ref h) = parsed {
            if h.logpack_lsid() != lsid {
                return Ok(Parsed::Invalid(format!(
                    "logpack lsid {} does not match position {lsid}",
                    h.logpack_lsid()
                )));
            }
        }
        Ok(parsed)
    }

    /// Read the IO data of record `idx` of a header just consumed,
    /// verifying checksums for normal records.
    ///
    /// # Errors
    ///
    /// Fails on checksum mismatch or I/O error.
    pub async fn read_logpack_io(
        &mut self,
        header: &LogPackHeader,
        idx: usize,
    ) -> Result<Option<Vec<u8>>> {
        let rec = *header.record(idx);
        if !rec.has_data() {
            return Ok(None);
        }
        let n_pb = rec.io_size_pb(header.pbs());
        let mut data = Vec::with_capacity(n_pb as usize * header.pbs() as usize);
        for _ in 0..n_pb {
            data.extend_from_slice(&self.read_block().await?);
        }
        verify_io_checksum(header, &rec, &data)?;
        Ok(Some(data))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::superblock::DEVICE_NAME_SIZE;

    const PBS: u32 = 4096;
    const SALT: u32 = 0x5a5a5a5a;
    const RING: u64 = 64;

    fn sample_super() -> SuperBlock {
        SuperBlock {
            logical_bs: 512,
            physical_bs: PBS,
            snapshot_metadata_size: 4,
            log_checksum_salt: SALT,
            uuid: *b"abcdefghijklmnop",
            name: [0u8; DEVICE_NAME_SIZE],
            ring_buffer_size: RING,
            oldest_lsid: 0,
            written_lsid: 0,
            device_size: 1 << 20,
        }
    }

    /// Build a log-device image file with one logpack at lsid 0:
    /// a single 8-lb write of `fill` bytes at device offset 0.
    fn build_image(dir: &Path, fill: u8) -> std::path::PathBuf {
        let sb = sample_super();
        let path = dir.join("wldev.img");
        let total_pb = sb.ring_buffer_offset_pb() + RING;
        let mut image = vec![0u8; (total_pb * u64::from(PBS)) as usize];

        let sb_block = sb.to_block();
        let sb_off = (sb.first_offset_pb() * u64::from(PBS)) as usize;
        image[sb_off..sb_off + PBS as usize].copy_from_slice(&sb_block);
        let sb2_off = (sb.second_offset_pb() * u64::from(PBS)) as usize;
        image[sb2_off..sb2_off + PBS as usize].copy_from_slice(&sb_block);

        let data = vec![fill; PBS as usize];
        let mut header = LogPackHeader::new(PBS, SALT, 0);
        assert!(header.add_normal_io(0, 8).unwrap());
        let csum = checksum_partial_finish(data.chunks(PBS as usize), SALT);
        header.set_record_checksum(0, csum);

        let ring_off = sb.ring_buffer_offset_pb();
        let h_off = ((ring_off) * u64::from(PBS)) as usize;
        image[h_off..h_off + PBS as usize].copy_from_slice(&header.to_block());
        let d_off = ((ring_off + 1) * u64::from(PBS)) as usize;
        image[d_off..d_off + PBS as usize].copy_from_slice(&data);

        std::fs::write(&path, &image).unwrap();
        path
    }

    #[test]
    fn test_sync_reader() {
        let dir = TempDir::new().unwrap();
        let path = build_image(dir.path(), 0x42);

        let reader = WldevReader::open(&path).unwrap();
        assert_eq!(reader.super_block().log_checksum_salt, SALT);

        let header = reader.read_logpack_header(0).unwrap().into_result().unwrap();
        assert_eq!(header.n_records(), 1);
        let data = reader.read_logpack_io(&header, 0).unwrap().unwrap();
        assert!(data.iter().all(|&b| b == 0x42));
    }

    #[test]
    fn test_sync_reader_bad_lsid() {
        let dir = TempDir::new().unwrap();
        let path = build_image(dir.path(), 0x42);
        let reader = WldevReader::open(&path).unwrap();
        // lsid 7 points at zeroed ring space: not a valid header.
        assert!(!reader.read_logpack_header(7).unwrap().is_valid());
    }

    #[tokio::test]
    async fn test_async_reader() {
        let dir = TempDir::new().unwrap();
        let path = build_image(dir.path(), 0x7e);

        let mut reader = AsyncWldevReader::with_queue_size(&path, 4).unwrap();
        reader.reset(0);
        reader.read_ahead(2);

        let header = reader.read_logpack_header().await.unwrap().into_result().unwrap();
        assert_eq!(header.logpack_lsid(), 0);
        let data = reader.read_logpack_io(&header, 0).await.unwrap().unwrap();
        assert!(data.iter().all(|&b| b == 0x7e));
        assert_eq!(reader.position(), 2);
    }

    #[tokio::test]
    async fn test_async_reader_reset() {
        let dir = TempDir::new().unwrap();
        let path = build_image(dir.path(), 0x01);

        let mut reader = AsyncWldevReader::with_queue_size(&path, 4).unwrap();
        reader.reset(0);
        reader.read_ahead(8);
        let _ = reader.read_block().await.unwrap();

        // Reset discards in-flight blocks and re-reads from the start.
        reader.reset(0);
        let header = reader.read_logpack_header().await.unwrap().into_result().unwrap();
        assert_eq!(header.logpack_lsid(), 0);
    }
}
