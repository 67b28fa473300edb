//! Wlog stream file header.
//!
//! A wlog stream (transfer preamble, debug dump) starts with one of
//! these 4096-byte headers naming the device parameters and the lsid
//! range that follows.

use walb_core::checksum::{block_checksum, verify_block_checksum};
use walb_core::UUID_SIZE;

use crate::pack::Parsed;

/// Sector type tag of a wlog file header.
pub const SECTOR_TYPE_WLOG_HEADER: u16 = 3;

/// Wlog stream format version.
pub const WLOG_VERSION: u16 = 2;

/// Serialized header size [byte].
pub const WLOG_HEADER_SIZE: usize = 4096;

/// Header of a wlog stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WlogFileHeader {
    /// Salt of the originating log device.
    pub log_checksum_salt: u32,
    /// Logical block size [byte].
    pub logical_bs: u32,
    /// Physical block size [byte].
    pub physical_bs: u32,
    /// Device uuid.
    pub uuid: [u8; UUID_SIZE],
    /// First lsid contained in the stream.
    pub begin_lsid: u64,
    /// One past the last lsid contained in the stream.
    pub end_lsid: u64,
}

impl WlogFileHeader {
    /// Creates a header for the range `[begin_lsid, end_lsid)`.
    #[must_use]
    pub fn new(
        pbs: u32,
        salt: u32,
        uuid: [u8; UUID_SIZE],
        begin_lsid: u64,
        end_lsid: u64,
    ) -> Self {
        Self {
            log_checksum_salt: salt,
            logical_bs: walb_core::LOGICAL_BLOCK_SIZE as u32,
            physical_bs: pbs,
            uuid,
            begin_lsid,
            end_lsid,
        }
    }

    /// Serialize into the fixed-size header block (checksum salt 0).
    #[must_use]
    pub fn to_block(&self) -> Vec<u8> {
        let mut block = vec![0u8; WLOG_HEADER_SIZE];
        block[0..2].copy_from_slice(&SECTOR_TYPE_WLOG_HEADER.to_le_bytes());
        block[2..4].copy_from_slice(&WLOG_VERSION.to_le_bytes());
        block[4..6].copy_from_slice(&(WLOG_HEADER_SIZE as u16).to_le_bytes());
        // block[8..12] is the checksum field.
        block[12..16].copy_from_slice(&self.log_checksum_salt.to_le_bytes());
        block[16..20].copy_from_slice(&self.logical_bs.to_le_bytes());
        block[20..24].copy_from_slice(&self.physical_bs.to_le_bytes());
        block[24..40].copy_from_slice(&self.uuid);
        block[40..48].copy_from_slice(&self.begin_lsid.to_le_bytes());
        block[48..56].copy_from_slice(&self.end_lsid.to_le_bytes());
        let csum = block_checksum(&block, 8, 0);
        block[8..12].copy_from_slice(&csum.to_le_bytes());
        block
    }

    /// Parse a header block.
    #[must_use]
    pub fn parse(block: &[u8]) -> Parsed<Self> {
        if block.len() != WLOG_HEADER_SIZE {
            return Parsed::Invalid("wlog header size mismatch".to_string());
        }
        let sector_type = u16::from_le_bytes(block[0..2].try_into().expect("2 bytes"));
        if sector_type != SECTOR_TYPE_WLOG_HEADER {
            return Parsed::Invalid(format!("bad sector type {sector_type}"));
        }
        let version = u16::from_le_bytes(block[2..4].try_into().expect("2 bytes"));
        if version != WLOG_VERSION {
            return Parsed::Invalid(format!("unsupported wlog version {version}"));
        }
        if !verify_block_checksum(block, 8, 0) {
            return Parsed::Invalid("wlog header checksum mismatch".to_string());
        }
        let header = Self {
            log_checksum_salt: u32::from_le_bytes(block[12..16].try_into().expect("4 bytes")),
            logical_bs: u32::from_le_bytes(block[16..20].try_into().expect("4 bytes")),
            physical_bs: u32::from_le_bytes(block[20..24].try_into().expect("4 bytes")),
            uuid: block[24..40].try_into().expect("16 bytes"),
            begin_lsid: u64::from_le_bytes(block[40..48].try_into().expect("8 bytes")),
            end_lsid: u64::from_le_bytes(block[48..56].try_into().expect("8 bytes")),
        };
        if header.begin_lsid >= header.end_lsid {
            return Parsed::Invalid("empty or inverted lsid range".to_string());
        }
        Parsed::Valid(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let h = WlogFileHeader::new(4096, 99, *b"uuiduuiduuiduuid", 100, 250);
        let block = h.to_block();
        match WlogFileHeader::parse(&block) {
            Parsed::Valid(parsed) => assert_eq!(parsed, h),
            other => panic!("expected Valid, got {other:?}"),
        }
    }

    #[test]
    fn test_bad_range() {
        let h = WlogFileHeader::new(4096, 99, [0; 16], 250, 250);
        assert!(matches!(WlogFileHeader::parse(&h.to_block()), Parsed::Invalid(_)));
    }
}
