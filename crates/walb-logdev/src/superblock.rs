//! Superblock codec and the lsid → log-device offset mapping.

use walb_core::checksum::{block_checksum, verify_block_checksum};
use walb_core::{Error, Result, INVALID_LSID, UUID_SIZE};

use crate::block::is_valid_pbs;
use crate::pack::Parsed;

/// Sector type tag of a superblock.
pub const SECTOR_TYPE_SUPER: u16 = 1;

/// On-disk format version.
pub const SUPER_FORMAT_VERSION: u16 = 1;

/// Byte length of the device name field.
pub const DEVICE_NAME_SIZE: usize = 64;

/// The WalB superblock.
///
/// Two copies live on the log device: the first at a pbs-derived offset,
/// the second right after the snapshot-metadata region. Each is one
/// physical block, self-checksummed with salt 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuperBlock {
    /// Logical block size [byte]; always 512.
    pub logical_bs: u32,
    /// Physical block size [byte].
    pub physical_bs: u32,
    /// Snapshot metadata region size [pb].
    pub snapshot_metadata_size: u32,
    /// Salt mixed into every log checksum of this device.
    pub log_checksum_salt: u32,
    /// Device uuid.
    pub uuid: [u8; UUID_SIZE],
    /// Device name, NUL-padded.
    pub name: [u8; DEVICE_NAME_SIZE],
    /// Ring buffer size [pb].
    pub ring_buffer_size: u64,
    /// Ring buffer tail: every lsid before this is reclaimable.
    pub oldest_lsid: u64,
    /// Lsid the kernel has flushed to the data device.
    pub written_lsid: u64,
    /// Data device size [lb].
    pub device_size: u64,
}

/// Offset of the first superblock copy [pb].
#[must_use]
pub const fn first_super_offset_pb(pbs: u32) -> u64 {
    let off = 4096 / pbs as u64;
    if off == 0 {
        1
    } else {
        off
    }
}

impl SuperBlock {
    /// Offset of the first copy [pb].
    #[must_use]
    pub const fn first_offset_pb(&self) -> u64 {
        first_super_offset_pb(self.physical_bs)
    }

    /// Offset of the snapshot metadata region [pb].
    #[must_use]
    pub const fn metadata_offset_pb(&self) -> u64 {
        self.first_offset_pb() + 1
    }

    /// Offset of the second copy [pb].
    #[must_use]
    pub const fn second_offset_pb(&self) -> u64 {
        self.metadata_offset_pb() + self.snapshot_metadata_size as u64
    }

    /// Offset of the ring buffer [pb].
    #[must_use]
    pub const fn ring_buffer_offset_pb(&self) -> u64 {
        self.second_offset_pb() + 1
    }

    /// Map an lsid to its physical-block offset on the log device.
    ///
    /// # Errors
    ///
    /// Fails on `INVALID_LSID` or a zero ring buffer.
    pub fn offset_of_lsid_pb(&self, lsid: u64) -> Result<u64> {
        if lsid == INVALID_LSID {
            return Err(Error::format("invalid lsid"));
        }
        if self.ring_buffer_size == 0 {
            return Err(Error::format("ring buffer size must not be 0"));
        }
        Ok(lsid % self.ring_buffer_size + self.ring_buffer_offset_pb())
    }

    /// Device name as a string, trimmed at the first NUL.
    #[must_use]
    pub fn name_str(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(DEVICE_NAME_SIZE);
        std::str::from_utf8(&self.name[..end]).unwrap_or("")
    }

    /// Serialize into one physical block with a fresh checksum
    /// (salt 0).
    #[must_use]
    pub fn to_block(&self) -> Vec<u8> {
        let mut block = vec![0u8; self.physical_bs as usize];
        block[0..2].copy_from_slice(&SECTOR_TYPE_SUPER.to_le_bytes());
        block[2..4].copy_from_slice(&SUPER_FORMAT_VERSION.to_le_bytes());
        // block[4..8] is the checksum field.
        block[8..12].copy_from_slice(&self.logical_bs.to_le_bytes());
        block[12..16].copy_from_slice(&self.physical_bs.to_le_bytes());
        block[16..20].copy_from_slice(&self.snapshot_metadata_size.to_le_bytes());
        block[20..24].copy_from_slice(&self.log_checksum_salt.to_le_bytes());
        block[24..40].copy_from_slice(&self.uuid);
        block[40..104].copy_from_slice(&self.name);
        block[104..112].copy_from_slice(&self.ring_buffer_size.to_le_bytes());
        block[112..120].copy_from_slice(&self.oldest_lsid.to_le_bytes());
        block[120..128].copy_from_slice(&self.written_lsid.to_le_bytes());
        block[128..136].copy_from_slice(&self.device_size.to_le_bytes());
        let csum = block_checksum(&block, 4, 0);
        block[4..8].copy_from_slice(&csum.to_le_bytes());
        block
    }

    /// Parse one superblock copy.
    #[must_use]
    pub fn parse(block: &[u8]) -> Parsed<Self> {
        if block.len() < 136 {
            return Parsed::Invalid("superblock too short".to_string());
        }
        let sector_type = u16::from_le_bytes(block[0..2].try_into().expect("2 bytes"));
        if sector_type != SECTOR_TYPE_SUPER {
            return Parsed::Invalid(format!("bad sector type {sector_type}"));
        }
        let version = u16::from_le_bytes(block[2..4].try_into().expect("2 bytes"));
        if version != SUPER_FORMAT_VERSION {
            return Parsed::Invalid(format!("unsupported superblock version {version}"));
        }
        if !verify_block_checksum(block, 4, 0) {
            return Parsed::Invalid("superblock checksum mismatch".to_string());
        }
        let sb = Self {
            logical_bs: u32::from_le_bytes(block[8..12].try_into().expect("4 bytes")),
            physical_bs: u32::from_le_bytes(block[12..16].try_into().expect("4 bytes")),
            snapshot_metadata_size: u32::from_le_bytes(block[16..20].try_into().expect("4 bytes")),
            log_checksum_salt: u32::from_le_bytes(block[20..24].try_into().expect("4 bytes")),
            uuid: block[24..40].try_into().expect("16 bytes"),
            name: block[40..104].try_into().expect("64 bytes"),
            ring_buffer_size: u64::from_le_bytes(block[104..112].try_into().expect("8 bytes")),
            oldest_lsid: u64::from_le_bytes(block[112..120].try_into().expect("8 bytes")),
            written_lsid: u64::from_le_bytes(block[120..128].try_into().expect("8 bytes")),
            device_size: u64::from_le_bytes(block[128..136].try_into().expect("8 bytes")),
        };
        if !is_valid_pbs(sb.physical_bs) || sb.physical_bs as usize != block.len() {
            return Parsed::Invalid(format!("bad physical block size {}", sb.physical_bs));
        }
        if sb.logical_bs != walb_core::LOGICAL_BLOCK_SIZE as u32 {
            return Parsed::Invalid(format!("bad logical block size {}", sb.logical_bs));
        }
        Parsed::Valid(sb)
    }
}
