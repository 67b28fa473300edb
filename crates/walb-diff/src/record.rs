//! Diff file header and record codecs.

use walb_core::checksum::{block_checksum, verify_block_checksum};
use walb_core::UUID_SIZE;

use crate::compress::CompressionType;

/// Serialized size of a [`DiffFileHeader`].
pub const DIFF_FILE_HEADER_SIZE: usize = 32;

/// Serialized size of a [`DiffRecord`].
pub const DIFF_RECORD_SIZE: usize = 24;

/// Wdiff format version.
pub const DIFF_FORMAT_VERSION: u16 = 2;

/// Header flag bit: the file is the indexed variant.
pub const HEADER_FLAG_INDEXED: u16 = 1 << 0;

/// The leading header of every wdiff file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffFileHeader {
    /// Format flags ([`HEADER_FLAG_INDEXED`]).
    pub flags: u16,
    /// Upper bound of `io_blocks` over the whole file [lb];
    /// 0 means unknown.
    pub max_io_blocks: u32,
    /// Uuid of the originating device.
    pub uuid: [u8; UUID_SIZE],
}

impl DiffFileHeader {
    /// Header of a sorted wdiff.
    #[must_use]
    pub const fn sorted(uuid: [u8; UUID_SIZE], max_io_blocks: u32) -> Self {
        Self { flags: 0, max_io_blocks, uuid }
    }

    /// Header of an indexed wdiff.
    #[must_use]
    pub const fn indexed(uuid: [u8; UUID_SIZE], max_io_blocks: u32) -> Self {
        Self { flags: HEADER_FLAG_INDEXED, max_io_blocks, uuid }
    }

    /// True iff the file is the indexed variant.
    #[must_use]
    pub const fn is_indexed(&self) -> bool {
        self.flags & HEADER_FLAG_INDEXED != 0
    }

    /// Serialize with a fresh checksum (salt 0, self-zeroed).
    #[must_use]
    pub fn to_bytes(&self) -> [u8; DIFF_FILE_HEADER_SIZE] {
        let mut b = [0u8; DIFF_FILE_HEADER_SIZE];
        // b[0..4] is the checksum field.
        b[4..6].copy_from_slice(&DIFF_FORMAT_VERSION.to_le_bytes());
        b[6..8].copy_from_slice(&self.flags.to_le_bytes());
        b[8..12].copy_from_slice(&self.max_io_blocks.to_le_bytes());
        b[12..28].copy_from_slice(&self.uuid);
        let csum = block_checksum(&b, 0, 0);
        b[0..4].copy_from_slice(&csum.to_le_bytes());
        b
    }

    /// Parse and verify a header.
    ///
    /// # Errors
    ///
    /// Fails on short input, version mismatch or checksum mismatch.
    pub fn parse(b: &[u8]) -> walb_core::Result<Self> {
        if b.len() < DIFF_FILE_HEADER_SIZE {
            return Err(walb_core::Error::format("diff file header too short"));
        }
        let b = &b[..DIFF_FILE_HEADER_SIZE];
        let version = u16::from_le_bytes(b[4..6].try_into().expect("2 bytes"));
        if version != DIFF_FORMAT_VERSION {
            return Err(walb_core::Error::format(format!(
                "unsupported wdiff version {version}"
            )));
        }
        if !verify_block_checksum(b, 0, 0) {
            return Err(walb_core::Error::format("diff file header checksum mismatch"));
        }
        Ok(Self {
            flags: u16::from_le_bytes(b[6..8].try_into().expect("2 bytes")),
            max_io_blocks: u32::from_le_bytes(b[8..12].try_into().expect("4 bytes")),
            uuid: b[12..28].try_into().expect("16 bytes"),
        })
    }
}

/// Diff record flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiffRecordFlags(u8);

impl DiffRecordFlags {
    const ALLZERO: u8 = 1 << 0;
    const DISCARD: u8 = 1 << 1;

    /// A normal data record.
    #[must_use]
    pub const fn normal() -> Self {
        Self(0)
    }

    /// An all-zero range.
    #[must_use]
    pub const fn allzero() -> Self {
        Self(Self::ALLZERO)
    }

    /// A discarded range.
    #[must_use]
    pub const fn discard() -> Self {
        Self(Self::DISCARD)
    }

    /// Raw bits.
    #[must_use]
    pub const fn bits(&self) -> u8 {
        self.0
    }

    /// Reconstruct from raw bits.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// ALLZERO bit.
    #[must_use]
    pub const fn is_allzero(&self) -> bool {
        self.0 & Self::ALLZERO != 0
    }

    /// DISCARD bit.
    #[must_use]
    pub const fn is_discard(&self) -> bool {
        self.0 & Self::DISCARD != 0
    }

    /// Neither ALLZERO nor DISCARD.
    #[must_use]
    pub const fn is_normal(&self) -> bool {
        self.0 & (Self::ALLZERO | Self::DISCARD) == 0
    }
}

/// One IO record in a wdiff pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffRecord {
    /// IO address [lb].
    pub io_address: u64,
    /// IO length [lb].
    pub io_blocks: u16,
    /// ALLZERO / DISCARD / normal.
    pub flags: DiffRecordFlags,
    /// Compression of the stored bytes.
    pub compression_type: CompressionType,
    /// Offset of the stored bytes inside the pack data area.
    pub data_offset: u32,
    /// Stored (possibly compressed) byte count; 0 for allzero/discard.
    pub data_size: u32,
    /// Checksum (salt 0) over the stored bytes; 0 when no data.
    pub checksum: u32,
}

impl DiffRecord {
    /// A normal record with no data assigned yet.
    #[must_use]
    pub fn normal(io_address: u64, io_blocks: u16) -> Self {
        Self {
            io_address,
            io_blocks,
            flags: DiffRecordFlags::normal(),
            compression_type: CompressionType::None,
            data_offset: 0,
            data_size: 0,
            checksum: 0,
        }
    }

    /// An all-zero record.
    #[must_use]
    pub fn allzero(io_address: u64, io_blocks: u16) -> Self {
        Self { flags: DiffRecordFlags::allzero(), ..Self::normal(io_address, io_blocks) }
    }

    /// A discard record.
    #[must_use]
    pub fn discard(io_address: u64, io_blocks: u16) -> Self {
        Self { flags: DiffRecordFlags::discard(), ..Self::normal(io_address, io_blocks) }
    }

    /// One past the last address this record covers [lb].
    #[must_use]
    pub const fn end_address(&self) -> u64 {
        self.io_address + self.io_blocks as u64
    }

    /// True iff the record carries stored bytes.
    #[must_use]
    pub const fn has_data(&self) -> bool {
        self.flags.is_normal()
    }

    /// Uncompressed IO byte count.
    #[must_use]
    pub const fn io_bytes(&self) -> usize {
        self.io_blocks as usize * walb_core::LOGICAL_BLOCK_SIZE
    }

    /// Structural validity: non-empty range, data presence matches the
    /// flags.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        if self.io_blocks == 0 {
            return false;
        }
        if self.has_data() {
            self.data_size > 0
        } else {
            self.data_size == 0
        }
    }

    /// Serialize.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; DIFF_RECORD_SIZE] {
        let mut b = [0u8; DIFF_RECORD_SIZE];
        b[0..8].copy_from_slice(&self.io_address.to_le_bytes());
        b[8..10].copy_from_slice(&self.io_blocks.to_le_bytes());
        b[10] = self.flags.bits();
        b[11] = self.compression_type as u8;
        b[12..16].copy_from_slice(&self.data_offset.to_le_bytes());
        b[16..20].copy_from_slice(&self.data_size.to_le_bytes());
        b[20..24].copy_from_slice(&self.checksum.to_le_bytes());
        b
    }

    /// Deserialize.
    ///
    /// # Errors
    ///
    /// Fails on an unknown compression type.
    pub fn from_bytes(b: &[u8]) -> walb_core::Result<Self> {
        Ok(Self {
            io_address: u64::from_le_bytes(b[0..8].try_into().expect("8 bytes")),
            io_blocks: u16::from_le_bytes(b[8..10].try_into().expect("2 bytes")),
            flags: DiffRecordFlags::from_bits(b[10]),
            compression_type: CompressionType::from_u8(b[11])?,
            data_offset: u32::from_le_bytes(b[12..16].try_into().expect("4 bytes")),
            data_size: u32::from_le_bytes(b[16..20].try_into().expect("4 bytes")),
            checksum: u32::from_le_bytes(b[20..24].try_into().expect("4 bytes")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let h = DiffFileHeader::sorted(*b"0123456789abcdef", 64);
        let parsed = DiffFileHeader::parse(&h.to_bytes()).unwrap();
        assert_eq!(parsed, h);
        assert!(!parsed.is_indexed());

        let hi = DiffFileHeader::indexed([7; 16], 0);
        assert!(DiffFileHeader::parse(&hi.to_bytes()).unwrap().is_indexed());
    }

    #[test]
    fn test_header_corruption() {
        let mut b = DiffFileHeader::sorted([0; 16], 8).to_bytes();
        b[20] ^= 1;
        assert!(DiffFileHeader::parse(&b).is_err());
    }

    #[test]
    fn test_record_roundtrip() {
        let mut rec = DiffRecord::normal(4096, 16);
        rec.compression_type = CompressionType::Snappy;
        rec.data_offset = 100;
        rec.data_size = 512;
        rec.checksum = 0xdead;
        let parsed = DiffRecord::from_bytes(&rec.to_bytes()).unwrap();
        assert_eq!(parsed, rec);
    }

    #[test]
    fn test_record_validity() {
        assert!(!DiffRecord::normal(0, 0).is_valid());
        // Normal without data is invalid; allzero/discard without data is valid.
        assert!(!DiffRecord::normal(0, 8).is_valid());
        assert!(DiffRecord::allzero(0, 8).is_valid());
        assert!(DiffRecord::discard(0, 8).is_valid());
        let mut rec = DiffRecord::normal(0, 8);
        rec.data_size = 4096;
        assert!(rec.is_valid());
        assert_eq!(rec.end_address(), 8);
    }
}
