//! Diff pack container.
//!
//! A pack is a 4096-byte header block describing up to 128 records,
//! followed by `total_size` bytes of stored IO data. A pack with zero
//! records terminates a sorted wdiff stream.

use walb_core::checksum::{block_checksum, verify_block_checksum};
use walb_core::{Error, Result};

use crate::record::{DiffRecord, DIFF_RECORD_SIZE};

/// Byte size of a pack header block.
pub const DIFF_PACK_SIZE: usize = 4096;

/// Maximum records per pack.
pub const MAX_N_RECORDS_IN_PACK: usize = 128;

/// Maximum stored data bytes per pack.
pub const MAX_PACK_DATA_SIZE: usize = 2 * 1024 * 1024;

const PACK_FIXED_SIZE: usize = 16;

/// A pack header plus its record table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DiffPack {
    records: Vec<DiffRecord>,
    total_size: u32,
}

impl DiffPack {
    /// An empty pack.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records.
    #[must_use]
    pub fn n_records(&self) -> usize {
        self.records.len()
    }

    /// Stored data byte count.
    #[must_use]
    pub const fn total_size(&self) -> u32 {
        self.total_size
    }

    /// Record at `idx`.
    #[must_use]
    pub fn record(&self, idx: usize) -> &DiffRecord {
        &self.records[idx]
    }

    /// All records.
    #[must_use]
    pub fn records(&self) -> &[DiffRecord] {
        &self.records
    }

    /// True iff this pack terminates the stream.
    #[must_use]
    pub fn is_end(&self) -> bool {
        self.records.is_empty()
    }

    /// True when adding a record of `data_size` bytes would exceed the
    /// pack limits.
    #[must_use]
    pub fn is_full_for(&self, data_size: u32) -> bool {
        self.records.len() >= MAX_N_RECORDS_IN_PACK
            || self.total_size as usize + data_size as usize > MAX_PACK_DATA_SIZE
    }

    /// Append a record whose stored bytes have already been laid out by
    /// the caller. The record's `data_offset` is assigned here.
    ///
    /// Returns false when the pack is full; the caller must flush and
    /// start a new pack.
    pub fn add(&mut self, mut rec: DiffRecord) -> Option<DiffRecord> {
        if self.is_full_for(rec.data_size) {
            return None;
        }
        rec.data_offset = self.total_size;
        self.total_size += rec.data_size;
        self.records.push(rec);
        Some(rec)
    }

    /// Serialize the header block with a fresh checksum (salt 0).
    #[must_use]
    pub fn to_block(&self) -> Vec<u8> {
        let mut block = vec![0u8; DIFF_PACK_SIZE];
        block[4..6].copy_from_slice(&(self.records.len() as u16).to_le_bytes());
        // block[6..8]: flags, unused.
        block[8..12].copy_from_slice(&self.total_size.to_le_bytes());
        for (i, rec) in self.records.iter().enumerate() {
            let off = PACK_FIXED_SIZE + i * DIFF_RECORD_SIZE;
            block[off..off + DIFF_RECORD_SIZE].copy_from_slice(&rec.to_bytes());
        }
        let csum = block_checksum(&block, 0, 0);
        block[0..4].copy_from_slice(&csum.to_le_bytes());
        block
    }

    /// Parse and verify a header block.
    ///
    /// # Errors
    ///
    /// Fails on size, checksum or record-table violations.
    pub fn parse(block: &[u8]) -> Result<Self> {
        if block.len() != DIFF_PACK_SIZE {
            return Err(Error::format(format!("diff pack block size {}", block.len())));
        }
        if !verify_block_checksum(block, 0, 0) {
            return Err(Error::format("diff pack checksum mismatch"));
        }
        let n_records = u16::from_le_bytes(block[4..6].try_into().expect("2 bytes")) as usize;
        if n_records > MAX_N_RECORDS_IN_PACK {
            return Err(Error::format(format!("diff pack n_records {n_records} too large")));
        }
        let total_size = u32::from_le_bytes(block[8..12].try_into().expect("4 bytes"));
        let mut records = Vec::with_capacity(n_records);
        let mut expected_offset = 0u32;
        for i in 0..n_records {
            let off = PACK_FIXED_SIZE + i * DIFF_RECORD_SIZE;
            let rec = DiffRecord::from_bytes(&block[off..off + DIFF_RECORD_SIZE])?;
            if !rec.is_valid() {
                return Err(Error::format(format!("diff pack record {i} invalid")));
            }
            if rec.data_offset != expected_offset {
                return Err(Error::format(format!("diff pack record {i} data offset gap")));
            }
            expected_offset += rec.data_size;
            records.push(rec);
        }
        if expected_offset != total_size {
            return Err(Error::format("diff pack total_size mismatch"));
        }
        Ok(Self { records, total_size })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(addr: u64, blocks: u16, data_size: u32) -> DiffRecord {
        let mut r = DiffRecord::normal(addr, blocks);
        r.data_size = data_size;
        r.checksum = 0x1111;
        r
    }

    #[test]
    fn test_roundtrip() {
        let mut pack = DiffPack::new();
        assert!(pack.add(rec(0, 8, 4096)).is_some());
        assert!(pack.add(DiffRecord::discard(100, 16)).is_some());
        assert!(pack.add(rec(200, 8, 100)).is_some());
        assert_eq!(pack.total_size(), 4196);
        assert_eq!(pack.record(2).data_offset, 4096);

        let parsed = DiffPack::parse(&pack.to_block()).unwrap();
        assert_eq!(parsed, pack);
    }

    #[test]
    fn test_end_pack() {
        let pack = DiffPack::new();
        assert!(pack.is_end());
        let parsed = DiffPack::parse(&pack.to_block()).unwrap();
        assert!(parsed.is_end());
    }

    #[test]
    fn test_record_limit() {
        let mut pack = DiffPack::new();
        for i in 0..MAX_N_RECORDS_IN_PACK {
            assert!(pack.add(rec(i as u64 * 8, 8, 16)).is_some());
        }
        assert!(pack.add(rec(9999, 8, 16)).is_none());
    }

    #[test]
    fn test_data_limit() {
        let mut pack = DiffPack::new();
        assert!(pack.add(rec(0, 8, MAX_PACK_DATA_SIZE as u32)).is_some());
        assert!(pack.add(rec(8, 8, 1)).is_none());
    }

    #[test]
    fn test_corruption() {
        let mut pack = DiffPack::new();
        pack.add(rec(0, 8, 4096));
        let mut block = pack.to_block();
        block[30] ^= 0xff;
        assert!(DiffPack::parse(&block).is_err());
    }
}
