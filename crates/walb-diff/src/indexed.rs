//! Indexed wdiff files.
//!
//! IOs are appended in arrival order as a data stream; a sorted index
//! plus a trailer close the file. Overlapping writes are resolved
//! later-wins: the writer splits earlier index entries so the index is
//! always sorted and non-overlapping, and a split entry keeps pointing
//! into the middle of its original blob via `inner_offset_lb`.

use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom, Write};

use walb_core::checksum::{block_checksum, verify_block_checksum};
use walb_core::{checksum, Error, Result, LOGICAL_BLOCK_SIZE};

use crate::compress::{compress, uncompress, CompressionType};
use crate::record::{DiffFileHeader, DiffRecord, DiffRecordFlags, DIFF_FILE_HEADER_SIZE};

/// Serialized size of a [`DiffIndexRecord`].
pub const DIFF_INDEX_RECORD_SIZE: usize = 40;

/// Serialized size of the trailer.
pub const DIFF_INDEX_TRAILER_SIZE: usize = 40;

const TRAILER_MAGIC: u32 = 0x5844_4957; // "WIDX" little-endian.

/// One entry of the sorted index at the end of an indexed wdiff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffIndexRecord {
    /// IO address [lb].
    pub io_address: u64,
    /// IO length [lb].
    pub io_blocks: u16,
    /// ALLZERO / DISCARD / normal.
    pub flags: DiffRecordFlags,
    /// Compression of the referenced blob.
    pub compression_type: CompressionType,
    /// Offset of this range inside the uncompressed blob [lb].
    pub inner_offset_lb: u32,
    /// Blob position in the file [byte].
    pub data_offset: u64,
    /// Stored blob size [byte].
    pub data_size: u32,
    /// Uncompressed blob size [lb].
    pub orig_blocks: u32,
    /// Checksum (salt 0) over the stored blob.
    pub io_checksum: u32,
}

impl DiffIndexRecord {
    /// One past the last covered address [lb].
    #[must_use]
    pub const fn end_address(&self) -> u64 {
        self.io_address + self.io_blocks as u64
    }

    fn to_bytes(self) -> [u8; DIFF_INDEX_RECORD_SIZE] {
        let mut b = [0u8; DIFF_INDEX_RECORD_SIZE];
        b[0..8].copy_from_slice(&self.io_address.to_le_bytes());
        b[8..10].copy_from_slice(&self.io_blocks.to_le_bytes());
        b[10] = self.flags.bits();
        b[11] = self.compression_type as u8;
        b[12..16].copy_from_slice(&self.inner_offset_lb.to_le_bytes());
        b[16..24].copy_from_slice(&self.data_offset.to_le_bytes());
        b[24..28].copy_from_slice(&self.data_size.to_le_bytes());
        b[28..32].copy_from_slice(&self.orig_blocks.to_le_bytes());
        b[32..36].copy_from_slice(&self.io_checksum.to_le_bytes());
        b
    }

    fn from_bytes(b: &[u8]) -> Result<Self> {
        Ok(Self {
            io_address: u64::from_le_bytes(b[0..8].try_into().expect("8 bytes")),
            io_blocks: u16::from_le_bytes(b[8..10].try_into().expect("2 bytes")),
            flags: DiffRecordFlags::from_bits(b[10]),
            compression_type: CompressionType::from_u8(b[11])?,
            inner_offset_lb: u32::from_le_bytes(b[12..16].try_into().expect("4 bytes")),
            data_offset: u64::from_le_bytes(b[16..24].try_into().expect("8 bytes")),
            data_size: u32::from_le_bytes(b[24..28].try_into().expect("4 bytes")),
            orig_blocks: u32::from_le_bytes(b[28..32].try_into().expect("4 bytes")),
            io_checksum: u32::from_le_bytes(b[32..36].try_into().expect("4 bytes")),
        })
    }
}

fn trailer_bytes(n_index_records: u32, index_offset: u64, file_size: u64) -> [u8; DIFF_INDEX_TRAILER_SIZE] {
    let mut b = [0u8; DIFF_INDEX_TRAILER_SIZE];
    b[0..4].copy_from_slice(&TRAILER_MAGIC.to_le_bytes());
    b[4..8].copy_from_slice(&n_index_records.to_le_bytes());
    b[8..16].copy_from_slice(&index_offset.to_le_bytes());
    b[16..24].copy_from_slice(&file_size.to_le_bytes());
    let csum = block_checksum(&b, 32, 0);
    b[32..36].copy_from_slice(&csum.to_le_bytes());
    b
}

fn parse_trailer(b: &[u8]) -> Result<(u32, u64, u64)> {
    if b.len() != DIFF_INDEX_TRAILER_SIZE {
        return Err(Error::format("indexed diff trailer size mismatch"));
    }
    if u32::from_le_bytes(b[0..4].try_into().expect("4 bytes")) != TRAILER_MAGIC {
        return Err(Error::format("indexed diff trailer magic mismatch"));
    }
    if !verify_block_checksum(b, 32, 0) {
        return Err(Error::format("indexed diff trailer checksum mismatch"));
    }
    Ok((
        u32::from_le_bytes(b[4..8].try_into().expect("4 bytes")),
        u64::from_le_bytes(b[8..16].try_into().expect("8 bytes")),
        u64::from_le_bytes(b[16..24].try_into().expect("8 bytes")),
    ))
}

/// Writer of an indexed wdiff.
pub struct IndexedDiffWriter<W: Write> {
    out: W,
    compression: CompressionType,
    level: u32,
    cursor: u64,
    index: BTreeMap<u64, DiffIndexRecord>,
}

impl<W: Write> IndexedDiffWriter<W> {
    /// Create a writer and emit the file header.
    ///
    /// # Errors
    ///
    /// Returns the underlying write error.
    pub fn new(
        mut out: W,
        header: &DiffFileHeader,
        compression: CompressionType,
        level: u32,
    ) -> Result<Self> {
        let mut header = *header;
        header.flags |= crate::record::HEADER_FLAG_INDEXED;
        out.write_all(&header.to_bytes())?;
        Ok(Self {
            out,
            compression,
            level,
            cursor: DIFF_FILE_HEADER_SIZE as u64,
            index: BTreeMap::new(),
        })
    }

    /// Append one IO in arrival order. Later IOs mask earlier ones.
    ///
    /// # Errors
    ///
    /// Fails on flag/data mismatch or a write error.
    pub fn add(&mut self, rec: &DiffRecord, data: Option<&[u8]>) -> Result<()> {
        if rec.io_blocks == 0 {
            return Err(Error::format("zero-sized diff IO"));
        }
        let entry = if rec.has_data() {
            let bytes = data.ok_or_else(|| Error::format("normal IO without data"))?;
            if bytes.len() != rec.io_bytes() {
                return Err(Error::format("IO data length mismatch"));
            }
            let encoded = compress(self.compression, bytes, self.level)?;
            let (stored, ty) = if encoded.len() < bytes.len() {
                (encoded, self.compression)
            } else {
                (bytes.to_vec(), CompressionType::None)
            };
            let entry = DiffIndexRecord {
                io_address: rec.io_address,
                io_blocks: rec.io_blocks,
                flags: rec.flags,
                compression_type: ty,
                inner_offset_lb: 0,
                data_offset: self.cursor,
                data_size: stored.len() as u32,
                orig_blocks: u32::from(rec.io_blocks),
                io_checksum: checksum(&stored, 0),
            };
            self.out.write_all(&stored)?;
            self.cursor += stored.len() as u64;
            entry
        } else {
            if data.is_some() {
                return Err(Error::format("allzero/discard IO with data"));
            }
            DiffIndexRecord {
                io_address: rec.io_address,
                io_blocks: rec.io_blocks,
                flags: rec.flags,
                compression_type: CompressionType::None,
                inner_offset_lb: 0,
                data_offset: 0,
                data_size: 0,
                orig_blocks: 0,
                io_checksum: 0,
            }
        };
        self.insert_masking(entry);
        Ok(())
    }

    fn insert_masking(&mut self, entry: DiffIndexRecord) {
        let start = entry.io_address;
        let end = entry.end_address();
        let affected: Vec<u64> = self
            .index
            .range(..end)
            .filter(|(_, e)| e.end_address() > start)
            .map(|(&s, _)| s)
            .collect();
        for s in affected {
            let old = self.index.remove(&s).expect("key collected above");
            if old.io_address < start {
                let keep = (start - old.io_address) as u16;
                self.index.insert(old.io_address, DiffIndexRecord { io_blocks: keep, ..old });
            }
            if old.end_address() > end {
                let skip = (end - old.io_address) as u32;
                let keep = (old.end_address() - end) as u16;
                self.index.insert(
                    end,
                    DiffIndexRecord {
                        io_address: end,
                        io_blocks: keep,
                        inner_offset_lb: old.inner_offset_lb + skip,
                        ..old
                    },
                );
            }
        }
        self.index.insert(start, entry);
    }

    /// Write the index and trailer and flush.
    ///
    /// # Errors
    ///
    /// Returns the underlying write error.
    pub fn finish(mut self) -> Result<W> {
        let index_offset = self.cursor;
        let n = self.index.len() as u32;
        for entry in self.index.values() {
            self.out.write_all(&entry.to_bytes())?;
        }
        let file_size = index_offset
            + u64::from(n) * DIFF_INDEX_RECORD_SIZE as u64
            + DIFF_INDEX_TRAILER_SIZE as u64;
        self.out.write_all(&trailer_bytes(n, index_offset, file_size))?;
        self.out.flush()?;
        Ok(self.out)
    }
}

/// Byte-bounded LRU cache of uncompressed blobs, keyed by their file
/// offset. Owned by a single reader.
pub struct IndexedDiffCache {
    max_bytes: usize,
    cur_bytes: usize,
    tick: u64,
    by_offset: std::collections::HashMap<u64, (std::sync::Arc<Vec<u8>>, u64)>,
    by_tick: BTreeMap<u64, u64>,
}

impl IndexedDiffCache {
    /// Create a cache bounded to `max_bytes` of uncompressed data.
    #[must_use]
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            cur_bytes: 0,
            tick: 0,
            by_offset: std::collections::HashMap::new(),
            by_tick: BTreeMap::new(),
        }
    }

    fn get(&mut self, offset: u64) -> Option<std::sync::Arc<Vec<u8>>> {
        let (data, old_tick) = self.by_offset.get(&offset)?.clone();
        self.by_tick.remove(&old_tick);
        self.tick += 1;
        self.by_tick.insert(self.tick, offset);
        self.by_offset.insert(offset, (data.clone(), self.tick));
        Some(data)
    }

    fn put(&mut self, offset: u64, data: std::sync::Arc<Vec<u8>>) {
        self.cur_bytes += data.len();
        self.tick += 1;
        self.by_tick.insert(self.tick, offset);
        self.by_offset.insert(offset, (data, self.tick));
        while self.cur_bytes > self.max_bytes && self.by_tick.len() > 1 {
            let (&oldest, &victim) = self.by_tick.iter().next().expect("non-empty");
            self.by_tick.remove(&oldest);
            if let Some((evicted, _)) = self.by_offset.remove(&victim) {
                self.cur_bytes -= evicted.len();
            }
        }
    }

    /// Bytes currently held.
    #[must_use]
    pub const fn bytes(&self) -> usize {
        self.cur_bytes
    }
}

/// Reader of an indexed wdiff with point lookup by address.
pub struct IndexedDiffReader<R: Read + Seek> {
    input: R,
    header: DiffFileHeader,
    index: Vec<DiffIndexRecord>,
    cache: IndexedDiffCache,
}

impl<R: Read + Seek> IndexedDiffReader<R> {
    /// Default cache bound [byte].
    pub const DEFAULT_CACHE_BYTES: usize = 32 * 1024 * 1024;

    /// Open an indexed wdiff: parse header, trailer and index.
    ///
    /// # Errors
    ///
    /// Fails on header/trailer/index validation.
    pub fn new(input: R) -> Result<Self> {
        Self::with_cache(input, IndexedDiffCache::new(Self::DEFAULT_CACHE_BYTES))
    }

    /// Open with an explicit cache.
    ///
    /// # Errors
    ///
    /// Fails on header/trailer/index validation.
    pub fn with_cache(mut input: R, cache: IndexedDiffCache) -> Result<Self> {
        let mut hbuf = [0u8; DIFF_FILE_HEADER_SIZE];
        input.seek(SeekFrom::Start(0))?;
        input.read_exact(&mut hbuf)?;
        let header = DiffFileHeader::parse(&hbuf)?;
        if !header.is_indexed() {
            return Err(Error::format("expected an indexed wdiff, found sorted"));
        }

        let file_size = input.seek(SeekFrom::End(0))?;
        if file_size < (DIFF_FILE_HEADER_SIZE + DIFF_INDEX_TRAILER_SIZE) as u64 {
            return Err(Error::format("indexed wdiff too short"));
        }
        let mut tbuf = [0u8; DIFF_INDEX_TRAILER_SIZE];
        input.seek(SeekFrom::End(-(DIFF_INDEX_TRAILER_SIZE as i64)))?;
        input.read_exact(&mut tbuf)?;
        let (n, index_offset, recorded_size) = parse_trailer(&tbuf)?;
        if recorded_size != file_size {
            return Err(Error::format(format!(
                "indexed wdiff size {file_size} does not match trailer {recorded_size}"
            )));
        }

        input.seek(SeekFrom::Start(index_offset))?;
        let mut index = Vec::with_capacity(n as usize);
        let mut rbuf = [0u8; DIFF_INDEX_RECORD_SIZE];
        let mut last_end = 0u64;
        for i in 0..n {
            input.read_exact(&mut rbuf)?;
            let rec = DiffIndexRecord::from_bytes(&rbuf)?;
            if rec.io_address < last_end {
                return Err(Error::format(format!("index record {i} out of order")));
            }
            last_end = rec.end_address();
            index.push(rec);
        }
        Ok(Self { input, header, index, cache })
    }

    /// The file header.
    #[must_use]
    pub const fn header(&self) -> &DiffFileHeader {
        &self.header
    }

    /// The sorted index.
    #[must_use]
    pub fn index(&self) -> &[DiffIndexRecord] {
        &self.index
    }

    fn blob(&mut self, rec: &DiffIndexRecord) -> Result<std::sync::Arc<Vec<u8>>> {
        if let Some(data) = self.cache.get(rec.data_offset) {
            return Ok(data);
        }
        let mut stored = vec![0u8; rec.data_size as usize];
        self.input.seek(SeekFrom::Start(rec.data_offset))?;
        self.input.read_exact(&mut stored)?;
        if checksum(&stored, 0) != rec.io_checksum {
            return Err(Error::format(format!(
                "indexed blob checksum mismatch at offset {}",
                rec.data_offset
            )));
        }
        let orig_bytes = rec.orig_blocks as usize * LOGICAL_BLOCK_SIZE;
        let data =
            std::sync::Arc::new(uncompress(rec.compression_type, &stored, orig_bytes)?);
        self.cache.put(rec.data_offset, data.clone());
        Ok(data)
    }

    /// Read `blocks` logical blocks at `addr` through the later-wins
    /// index. `Ok(None)` when any block in the range is uncovered.
    ///
    /// # Errors
    ///
    /// Fails on checksum or decode errors of a referenced blob.
    pub fn read(&mut self, addr: u64, blocks: u16) -> Result<Option<Vec<u8>>> {
        let end = addr + u64::from(blocks);
        let mut out = vec![0u8; blocks as usize * LOGICAL_BLOCK_SIZE];
        // First entry that could cover addr.
        let mut i = self.index.partition_point(|r| r.end_address() <= addr);
        let mut covered = addr;
        while covered < end {
            let Some(rec) = self.index.get(i).copied() else {
                return Ok(None);
            };
            if rec.io_address > covered {
                return Ok(None);
            }
            let from = covered;
            let to = rec.end_address().min(end);
            if rec.flags.is_normal() {
                let data = self.blob(&rec)?;
                let src = (u64::from(rec.inner_offset_lb) + (from - rec.io_address)) as usize
                    * LOGICAL_BLOCK_SIZE;
                let dst = ((from - addr) as usize) * LOGICAL_BLOCK_SIZE;
                let len = ((to - from) as usize) * LOGICAL_BLOCK_SIZE;
                out[dst..dst + len].copy_from_slice(&data[src..src + len]);
            }
            covered = to;
            i += 1;
        }
        Ok(Some(out))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn data(blocks: u16, fill: u8) -> Vec<u8> {
        vec![fill; blocks as usize * LOGICAL_BLOCK_SIZE]
    }

    fn build(ios: &[(DiffRecord, Option<Vec<u8>>)]) -> Vec<u8> {
        let header = DiffFileHeader::indexed([3; 16], 64);
        let mut w =
            IndexedDiffWriter::new(Vec::new(), &header, CompressionType::Snappy, 0).unwrap();
        for (rec, io) in ios {
            w.add(rec, io.as_deref()).unwrap();
        }
        w.finish().unwrap()
    }

    #[test]
    fn test_point_lookup() {
        let bytes = build(&[
            (DiffRecord::normal(0, 8), Some(data(8, 1))),
            (DiffRecord::normal(16, 8), Some(data(8, 2))),
        ]);
        let mut r = IndexedDiffReader::new(Cursor::new(bytes)).unwrap();
        assert_eq!(r.read(0, 8).unwrap().unwrap(), data(8, 1));
        assert_eq!(r.read(16, 8).unwrap().unwrap(), data(8, 2));
        assert_eq!(r.read(18, 2).unwrap().unwrap(), data(2, 2));
        assert!(r.read(8, 8).unwrap().is_none());
        assert!(r.read(4, 8).unwrap().is_none());
    }

    #[test]
    fn test_later_wins() {
        let bytes = build(&[
            (DiffRecord::normal(0, 16), Some(data(16, 1))),
            (DiffRecord::normal(4, 4), Some(data(4, 2))),
        ]);
        let mut r = IndexedDiffReader::new(Cursor::new(bytes)).unwrap();
        let out = r.read(0, 16).unwrap().unwrap();
        assert!(out[..4 * 512].iter().all(|&b| b == 1));
        assert!(out[4 * 512..8 * 512].iter().all(|&b| b == 2));
        assert!(out[8 * 512..].iter().all(|&b| b == 1));
        // The masked tail still decodes through inner_offset_lb.
        assert_eq!(r.index().len(), 3);
    }

    #[test]
    fn test_allzero_discard_read_zero() {
        let bytes = build(&[
            (DiffRecord::discard(0, 8), None),
            (DiffRecord::allzero(4, 8), None),
        ]);
        let mut r = IndexedDiffReader::new(Cursor::new(bytes)).unwrap();
        assert!(r.read(6, 1).unwrap().unwrap().iter().all(|&b| b == 0));
        assert!(r.read(0, 12).unwrap().unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_trailer_corruption() {
        let mut bytes = build(&[(DiffRecord::normal(0, 8), Some(data(8, 1)))]);
        let n = bytes.len();
        bytes[n - 10] ^= 1;
        assert!(IndexedDiffReader::new(Cursor::new(bytes)).is_err());
    }

    #[test]
    fn test_cache_eviction() {
        let mut ios = Vec::new();
        for i in 0..8u16 {
            ios.push((DiffRecord::normal(u64::from(i) * 8, 8), Some(data(8, i as u8))));
        }
        let bytes = build(&ios);
        // Cache holds two 4 KiB blobs at most.
        let cache = IndexedDiffCache::new(8 * 1024);
        let mut r = IndexedDiffReader::with_cache(Cursor::new(bytes), cache).unwrap();
        for i in 0..8u16 {
            let out = r.read(u64::from(i) * 8, 8).unwrap().unwrap();
            assert_eq!(out, data(8, i as u8));
        }
        assert!(r.cache.bytes() <= 8 * 1024);
    }
}
