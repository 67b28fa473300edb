//! Logpack header and record codec.
//!
//! A logpack is one physical block holding a header plus `total_io_size`
//! physical blocks of IO data. The header self-checksum and every data
//! checksum are seeded with the per-device salt.
//!
//! Parsing never trusts the device: the result is a tagged
//! [`Parsed`] value so callers can distinguish a fully valid pack, one
//! truncated at the first invalid record (crash mid-write), and garbage.

use walb_core::checksum::{block_checksum, verify_block_checksum};
use walb_core::{Error, Result, INVALID_LSID};

use crate::block::{capacity_pb, n_lb_in_pb};

/// Sector type tag of a logpack header block.
pub const SECTOR_TYPE_LOGPACK: u16 = 2;

/// Byte size of the fixed header prefix.
pub const LOGPACK_HEADER_SIZE: usize = 24;

/// Byte size of one serialized log record.
pub const LOG_RECORD_SIZE: usize = 32;

/// Upper bound of `total_io_size` [pb] accepted in one logpack header.
pub const MAX_TOTAL_IO_SIZE_PB: u32 = 1024;

/// Maximum number of records a header block of `pbs` bytes can hold.
#[must_use]
pub const fn max_n_records(pbs: u32) -> usize {
    (pbs as usize - LOGPACK_HEADER_SIZE) / LOG_RECORD_SIZE
}

/// Outcome of parsing an on-disk structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed<T> {
    /// The structure verified completely.
    Valid(T),
    /// The structure was truncated at the first invalid entry and the
    /// remainder is authoritative.
    Shrunken(T),
    /// The structure is unusable.
    Invalid(String),
}

impl<T> Parsed<T> {
    /// Unwrap a valid-or-shrunken value, failing on `Invalid`.
    ///
    /// # Errors
    ///
    /// Returns a format error carrying the invalid reason.
    pub fn into_result(self) -> Result<T> {
        match self {
            Self::Valid(v) | Self::Shrunken(v) => Ok(v),
            Self::Invalid(reason) => Err(Error::format(reason)),
        }
    }

    /// True for `Valid`.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }
}

/// Log record flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordFlags(u32);

impl RecordFlags {
    const EXIST: u32 = 1 << 0;
    const PADDING: u32 = 1 << 1;
    const DISCARD: u32 = 1 << 2;
    const KNOWN: u32 = Self::EXIST | Self::PADDING | Self::DISCARD;

    /// Flags of a normal write record.
    #[must_use]
    pub const fn normal() -> Self {
        Self(Self::EXIST)
    }

    /// Flags of a padding record.
    #[must_use]
    pub const fn padding() -> Self {
        Self(Self::EXIST | Self::PADDING)
    }

    /// Flags of a discard record.
    #[must_use]
    pub const fn discard() -> Self {
        Self(Self::EXIST | Self::DISCARD)
    }

    /// Raw bit value.
    #[must_use]
    pub const fn bits(&self) -> u32 {
        self.0
    }

    /// Reconstruct from raw bits.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// EXIST bit.
    #[must_use]
    pub const fn is_exist(&self) -> bool {
        self.0 & Self::EXIST != 0
    }

    /// PADDING bit.
    #[must_use]
    pub const fn is_padding(&self) -> bool {
        self.0 & Self::PADDING != 0
    }

    /// DISCARD bit.
    #[must_use]
    pub const fn is_discard(&self) -> bool {
        self.0 & Self::DISCARD != 0
    }

    /// True iff no unknown bit is set.
    #[must_use]
    pub const fn is_known(&self) -> bool {
        self.0 & !Self::KNOWN == 0
    }
}

/// One IO record inside a logpack header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogRecord {
    /// Salted checksum over the first `io_size * 512` bytes of data.
    /// Zero for padding and discard records.
    pub checksum: u32,
    /// EXIST / PADDING / DISCARD.
    pub flags: RecordFlags,
    /// Absolute lsid: `logpack_lsid + lsid_local`.
    pub lsid: u64,
    /// Offset of this record's data inside the pack [pb], counted from
    /// the header block (first data block is 1).
    pub lsid_local: u16,
    /// IO size [lb].
    pub io_size: u16,
    /// IO offset on the data device [lb].
    pub offset: u64,
}

impl LogRecord {
    /// True iff the record carries data blocks in the pack.
    #[must_use]
    pub const fn has_data(&self) -> bool {
        self.flags.is_exist() && !self.flags.is_discard()
    }

    /// True iff the record's data has a checksum to verify.
    #[must_use]
    pub const fn has_data_for_checksum(&self) -> bool {
        self.flags.is_exist() && !self.flags.is_discard() && !self.flags.is_padding()
    }

    /// Data size in physical blocks.
    #[must_use]
    pub const fn io_size_pb(&self, pbs: u32) -> u32 {
        capacity_pb(pbs, self.io_size as u32)
    }

    fn to_bytes(self) -> [u8; LOG_RECORD_SIZE] {
        let mut b = [0u8; LOG_RECORD_SIZE];
        b[0..4].copy_from_slice(&self.checksum.to_le_bytes());
        b[4..8].copy_from_slice(&self.flags.bits().to_le_bytes());
        b[8..16].copy_from_slice(&self.lsid.to_le_bytes());
        b[16..18].copy_from_slice(&self.lsid_local.to_le_bytes());
        b[18..20].copy_from_slice(&self.io_size.to_le_bytes());
        // b[20..24] reserved.
        b[24..32].copy_from_slice(&self.offset.to_le_bytes());
        b
    }

    fn from_bytes(b: &[u8]) -> Self {
        Self {
            checksum: u32::from_le_bytes(b[0..4].try_into().expect("4 bytes")),
            flags: RecordFlags::from_bits(u32::from_le_bytes(b[4..8].try_into().expect("4 bytes"))),
            lsid: u64::from_le_bytes(b[8..16].try_into().expect("8 bytes")),
            lsid_local: u16::from_le_bytes(b[16..18].try_into().expect("2 bytes")),
            io_size: u16::from_le_bytes(b[18..20].try_into().expect("2 bytes")),
            offset: u64::from_le_bytes(b[24..32].try_into().expect("8 bytes")),
        }
    }
}

/// A logpack header: the typed form of one header block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPackHeader {
    pbs: u32,
    salt: u32,
    logpack_lsid: u64,
    total_io_size: u16,
    n_padding: u16,
    records: Vec<LogRecord>,
}

impl LogPackHeader {
    /// An empty header at `lsid`.
    #[must_use]
    pub fn new(pbs: u32, salt: u32, lsid: u64) -> Self {
        Self { pbs, salt, logpack_lsid: lsid, total_io_size: 0, n_padding: 0, records: Vec::new() }
    }

    /// The stream terminator: no records, invalid lsid.
    #[must_use]
    pub fn terminator(pbs: u32, salt: u32) -> Self {
        Self::new(pbs, salt, INVALID_LSID)
    }

    /// Physical block size.
    #[must_use]
    pub const fn pbs(&self) -> u32 {
        self.pbs
    }

    /// Checksum salt.
    #[must_use]
    pub const fn salt(&self) -> u32 {
        self.salt
    }

    /// Lsid of the header block itself.
    #[must_use]
    pub const fn logpack_lsid(&self) -> u64 {
        self.logpack_lsid
    }

    /// Total IO data size [pb].
    #[must_use]
    pub const fn total_io_size(&self) -> u16 {
        self.total_io_size
    }

    /// Number of padding records (0 or 1).
    #[must_use]
    pub const fn n_padding(&self) -> u16 {
        self.n_padding
    }

    /// Number of records.
    #[must_use]
    pub fn n_records(&self) -> usize {
        self.records.len()
    }

    /// Record at `idx`.
    #[must_use]
    pub fn record(&self, idx: usize) -> &LogRecord {
        &self.records[idx]
    }

    /// All records.
    #[must_use]
    pub fn records(&self) -> &[LogRecord] {
        &self.records
    }

    /// True iff this header is the stream terminator.
    #[must_use]
    pub fn is_end(&self) -> bool {
        self.records.is_empty() && self.logpack_lsid == INVALID_LSID
    }

    /// Lsid of the next logpack header.
    #[must_use]
    pub fn next_logpack_lsid(&self) -> u64 {
        if self.records.is_empty() {
            self.logpack_lsid
        } else {
            self.logpack_lsid + 1 + u64::from(self.total_io_size)
        }
    }

    /// Total padding size [pb].
    #[must_use]
    pub fn total_padding_pb(&self) -> u32 {
        self.records
            .iter()
            .filter(|r| r.flags.is_padding())
            .map(|r| r.io_size_pb(self.pbs))
            .sum()
    }

    /// Append a normal write IO. Returns false when the pack is full
    /// and the caller must start a new header.
    ///
    /// # Errors
    ///
    /// Fails on a zero-sized IO.
    pub fn add_normal_io(&mut self, offset: u64, io_size: u16) -> Result<bool> {
        if io_size == 0 {
            return Err(Error::format("normal IO must not be zero-sized"));
        }
        if self.records.len() >= max_n_records(self.pbs) {
            return Ok(false);
        }
        let add_pb = capacity_pb(self.pbs, u32::from(io_size));
        if u32::from(self.total_io_size) + add_pb > MAX_TOTAL_IO_SIZE_PB {
            return Ok(false);
        }
        let lsid_local = self.total_io_size + 1;
        self.records.push(LogRecord {
            checksum: 0,
            flags: RecordFlags::normal(),
            lsid: self.logpack_lsid + u64::from(lsid_local),
            lsid_local,
            io_size,
            offset,
        });
        self.total_io_size += add_pb as u16;
        Ok(true)
    }

    /// Append a discard IO. Discards carry no data blocks.
    ///
    /// # Errors
    ///
    /// Fails on a zero-sized IO.
    pub fn add_discard_io(&mut self, offset: u64, io_size: u16) -> Result<bool> {
        if io_size == 0 {
            return Err(Error::format("discard IO must not be zero-sized"));
        }
        if self.records.len() >= max_n_records(self.pbs) {
            return Ok(false);
        }
        let lsid_local = self.total_io_size + 1;
        self.records.push(LogRecord {
            checksum: 0,
            flags: RecordFlags::discard(),
            lsid: self.logpack_lsid + u64::from(lsid_local),
            lsid_local,
            io_size,
            offset,
        });
        Ok(true)
    }

    /// Append a padding record. At most one per pack; size must be
    /// pbs-aligned.
    ///
    /// # Errors
    ///
    /// Fails when the size is not pbs-aligned.
    pub fn add_padding(&mut self, io_size: u16) -> Result<bool> {
        if u32::from(io_size) % n_lb_in_pb(self.pbs) != 0 {
            return Err(Error::format("padding size must be pbs-aligned"));
        }
        if self.records.len() >= max_n_records(self.pbs) || self.n_padding > 0 {
            return Ok(false);
        }
        let add_pb = capacity_pb(self.pbs, u32::from(io_size));
        if u32::from(self.total_io_size) + add_pb > MAX_TOTAL_IO_SIZE_PB {
            return Ok(false);
        }
        let lsid_local = self.total_io_size + 1;
        self.records.push(LogRecord {
            checksum: 0,
            flags: RecordFlags::padding(),
            lsid: self.logpack_lsid + u64::from(lsid_local),
            lsid_local,
            io_size,
            offset: 0,
        });
        self.total_io_size += add_pb as u16;
        self.n_padding += 1;
        Ok(true)
    }

    /// Set the IO data checksum of record `idx`.
    pub fn set_record_checksum(&mut self, idx: usize, checksum: u32) {
        self.records[idx].checksum = checksum;
    }

    /// Rebase the pack at `new_lsid`, rewriting every record lsid.
    pub fn update_lsid(&mut self, new_lsid: u64) {
        if new_lsid == INVALID_LSID || new_lsid == self.logpack_lsid {
            return;
        }
        self.logpack_lsid = new_lsid;
        for rec in &mut self.records {
            rec.lsid = new_lsid + u64::from(rec.lsid_local);
        }
    }

    /// Truncate at the first invalid record: drop records from
    /// `invalid_idx` on and recompute totals.
    pub fn shrink(&mut self, invalid_idx: usize) {
        assert!(invalid_idx < self.records.len());
        self.records.truncate(invalid_idx);
        self.total_io_size = 0;
        self.n_padding = 0;
        for rec in &self.records {
            if !rec.flags.is_discard() {
                self.total_io_size += rec.io_size_pb(self.pbs) as u16;
            }
            if rec.flags.is_padding() {
                self.n_padding += 1;
            }
        }
    }

    /// Structural validity of the records, ignoring checksums.
    /// Returns the index of the first invalid record, if any.
    fn first_invalid_record(&self) -> Option<usize> {
        let mut sum_pb = 0u32;
        let mut n_padding = 0u16;
        for (i, rec) in self.records.iter().enumerate() {
            if !rec.flags.is_exist() || !rec.flags.is_known() {
                return Some(i);
            }
            if rec.lsid != self.logpack_lsid + u64::from(rec.lsid_local) {
                return Some(i);
            }
            if rec.flags.is_padding() {
                n_padding += 1;
                if n_padding > 1 {
                    return Some(i);
                }
            } else if rec.io_size == 0 {
                return Some(i);
            }
            if !rec.flags.is_discard() {
                if u64::from(rec.lsid_local) != u64::from(sum_pb) + 1 {
                    return Some(i);
                }
                sum_pb += rec.io_size_pb(self.pbs);
            }
        }
        None
    }

    /// Full structural validity including the total-size equation.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        if self.records.len() > max_n_records(self.pbs) {
            return false;
        }
        if self.first_invalid_record().is_some() {
            return false;
        }
        let sum: u32 = self
            .records
            .iter()
            .filter(|r| !r.flags.is_discard())
            .map(|r| r.io_size_pb(self.pbs))
            .sum();
        sum == u32::from(self.total_io_size)
    }

    /// Serialize into one header block of `pbs` bytes with a fresh
    /// salted checksum.
    #[must_use]
    pub fn to_block(&self) -> Vec<u8> {
        let mut block = vec![0u8; self.pbs as usize];
        block[4..6].copy_from_slice(&SECTOR_TYPE_LOGPACK.to_le_bytes());
        block[6..8].copy_from_slice(&self.total_io_size.to_le_bytes());
        block[8..16].copy_from_slice(&self.logpack_lsid.to_le_bytes());
        block[16..18].copy_from_slice(&(self.records.len() as u16).to_le_bytes());
        block[18..20].copy_from_slice(&self.n_padding.to_le_bytes());
        for (i, rec) in self.records.iter().enumerate() {
            let off = LOGPACK_HEADER_SIZE + i * LOG_RECORD_SIZE;
            block[off..off + LOG_RECORD_SIZE].copy_from_slice(&rec.to_bytes());
        }
        let csum = block_checksum(&block, 0, self.salt);
        block[0..4].copy_from_slice(&csum.to_le_bytes());
        block
    }

    /// Parse one header block.
    ///
    /// `Valid` when everything verifies; `Shrunken` when the checksum
    /// holds but a trailing run of records is structurally invalid
    /// (truncated at the first bad one); `Invalid` otherwise.
    #[must_use]
    pub fn parse(block: &[u8], pbs: u32, salt: u32) -> Parsed<Self> {
        if block.len() != pbs as usize {
            return Parsed::Invalid(format!(
                "header block size {} != pbs {}",
                block.len(),
                pbs
            ));
        }
        let sector_type = u16::from_le_bytes(block[4..6].try_into().expect("2 bytes"));
        if sector_type != SECTOR_TYPE_LOGPACK {
            return Parsed::Invalid(format!("bad sector type {sector_type}"));
        }
        let n_records =
            u16::from_le_bytes(block[16..18].try_into().expect("2 bytes")) as usize;
        if n_records > max_n_records(pbs) {
            return Parsed::Invalid(format!("n_records {n_records} too large"));
        }
        if !verify_block_checksum(block, 0, salt) {
            return Parsed::Invalid("header checksum mismatch".to_string());
        }
        let mut header = Self {
            pbs,
            salt,
            logpack_lsid: u64::from_le_bytes(block[8..16].try_into().expect("8 bytes")),
            total_io_size: u16::from_le_bytes(block[6..8].try_into().expect("2 bytes")),
            n_padding: u16::from_le_bytes(block[18..20].try_into().expect("2 bytes")),
            records: Vec::with_capacity(n_records),
        };
        for i in 0..n_records {
            let off = LOGPACK_HEADER_SIZE + i * LOG_RECORD_SIZE;
            header.records.push(LogRecord::from_bytes(&block[off..off + LOG_RECORD_SIZE]));
        }
        if header.is_valid() {
            return Parsed::Valid(header);
        }
        match header.first_invalid_record() {
            Some(0) | None => Parsed::Invalid("inconsistent logpack header".to_string()),
            Some(idx) => {
                header.shrink(idx);
                Parsed::Shrunken(header)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use walb_core::checksum::checksum_partial_finish;

    use super::*;

    const PBS: u32 = 4096;
    const SALT: u32 = 0xabcd1234;

    fn sample_header() -> LogPackHeader {
        let mut h = LogPackHeader::new(PBS, SALT, 1000);
        assert!(h.add_normal_io(0, 8).unwrap());
        assert!(h.add_discard_io(64, 16).unwrap());
        assert!(h.add_normal_io(128, 9).unwrap());
        h
    }

    #[test]
    fn test_roundtrip() {
        let h = sample_header();
        assert!(h.is_valid());
        let block = h.to_block();
        match LogPackHeader::parse(&block, PBS, SALT) {
            Parsed::Valid(parsed) => assert_eq!(parsed, h),
            other => panic!("expected Valid, got {other:?}"),
        }
    }

    #[test]
    fn test_lsid_local_invariant() {
        let h = sample_header();
        for rec in h.records() {
            assert_eq!(rec.lsid, h.logpack_lsid() + u64::from(rec.lsid_local));
        }
        // 8 lb -> 1 pb, discard -> 0 pb, 9 lb -> 2 pb.
        assert_eq!(h.total_io_size(), 3);
        assert_eq!(h.next_logpack_lsid(), 1000 + 1 + 3);
    }

    #[test]
    fn test_wrong_salt_rejected() {
        let block = sample_header().to_block();
        assert!(matches!(
            LogPackHeader::parse(&block, PBS, SALT + 1),
            Parsed::Invalid(_)
        ));
    }

    #[test]
    fn test_corrupt_record_shrinks() {
        let mut h = sample_header();
        // Corrupt the last record's lsid, then re-checksum the block.
        h.records[2].lsid += 7;
        let block = h.to_block();
        match LogPackHeader::parse(&block, PBS, SALT) {
            Parsed::Shrunken(shrunk) => {
                assert_eq!(shrunk.n_records(), 2);
                // total_io_size recomputed for the surviving prefix.
                assert_eq!(shrunk.total_io_size(), 1);
                assert!(shrunk.is_valid());
            }
            other => panic!("expected Shrunken, got {other:?}"),
        }
    }

    #[test]
    fn test_terminator() {
        let t = LogPackHeader::terminator(PBS, SALT);
        assert!(t.is_end());
        assert_eq!(t.next_logpack_lsid(), INVALID_LSID);
    }

    #[test]
    fn test_padding_single() {
        let mut h = LogPackHeader::new(PBS, SALT, 0);
        assert!(h.add_padding(8).unwrap());
        assert!(!h.add_padding(8).unwrap());
        assert!(h.add_padding(3).is_err());
        assert_eq!(h.n_padding(), 1);
        assert!(h.is_valid());
    }

    #[test]
    fn test_capacity_limit() {
        let mut h = LogPackHeader::new(PBS, SALT, 0);
        let mut added: u64 = 0;
        while h.add_normal_io(added * 8, 8).unwrap() {
            added += 1;
        }
        assert_eq!(added as usize, max_n_records(PBS));
    }

    #[test]
    fn test_data_checksum() {
        let mut h = LogPackHeader::new(PBS, SALT, 50);
        assert!(h.add_normal_io(0, 8).unwrap());
        let data = vec![0x5au8; 4096];
        let csum = checksum_partial_finish(data.chunks(PBS as usize), SALT);
        h.set_record_checksum(0, csum);
        assert_eq!(h.record(0).checksum, csum);
        assert!(h.record(0).has_data_for_checksum());
    }

    #[test]
    fn test_update_lsid() {
        let mut h = sample_header();
        h.update_lsid(5000);
        assert!(h.is_valid());
        assert_eq!(h.record(0).lsid, 5001);
    }
}
