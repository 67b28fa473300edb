//! Salt-seeded checksums.
//!
//! Every log-device block checksum is seeded with the per-device
//! `log_checksum_salt` so that stale blocks from a previous device
//! generation never verify. Diff-file checksums use salt 0.

/// CRC32C over `data`, seeded with `salt`.
#[must_use]
pub fn checksum(data: &[u8], salt: u32) -> u32 {
    crc32c::crc32c_append(salt, data)
}

/// Incremental form: feed chunks through `crc32c_append`, then finish.
///
/// The log-device IO checksum covers `io_size * 512` bytes spread over
/// whole physical blocks; callers fold each block in turn.
#[must_use]
pub fn checksum_partial_finish(chunks: impl IntoIterator<Item = impl AsRef<[u8]>>, salt: u32) -> u32 {
    let mut csum = salt;
    for chunk in chunks {
        csum = crc32c::crc32c_append(csum, chunk.as_ref());
    }
    csum
}

/// Compute the self-checksum of a block whose checksum field lives at
/// `field_offset`. The field is treated as zero during computation.
#[must_use]
pub fn block_checksum(block: &[u8], field_offset: usize, salt: u32) -> u32 {
    debug_assert!(field_offset + 4 <= block.len());
    let mut csum = salt;
    csum = crc32c::crc32c_append(csum, &block[..field_offset]);
    csum = crc32c::crc32c_append(csum, &[0u8; 4]);
    crc32c::crc32c_append(csum, &block[field_offset + 4..])
}

/// Verify a self-checksummed block: the stored field must equal the
/// checksum computed with the field zeroed.
#[must_use]
pub fn verify_block_checksum(block: &[u8], field_offset: usize, salt: u32) -> bool {
    let stored = u32::from_le_bytes(
        block[field_offset..field_offset + 4].try_into().expect("4-byte field"),
    );
    block_checksum(block, field_offset, salt) == stored
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_salt_changes_checksum() {
        let data = b"logpack payload";
        assert_ne!(checksum(data, 0), checksum(data, 0xdeadbeef));
    }

    #[test]
    fn test_partial_matches_whole() {
        let data: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let whole = checksum(&data, 7);
        let parts = checksum_partial_finish(data.chunks(512), 7);
        assert_eq!(whole, parts);
    }

    #[test]
    fn test_block_checksum_roundtrip() {
        let mut block = vec![0u8; 4096];
        for (i, b) in block.iter_mut().enumerate() {
            *b = (i % 256) as u8;
        }
        let csum = block_checksum(&block, 8, 42);
        block[8..12].copy_from_slice(&csum.to_le_bytes());
        assert!(verify_block_checksum(&block, 8, 42));

        // Any corruption must break verification.
        block[100] ^= 0xff;
        assert!(!verify_block_checksum(&block, 8, 42));
    }
}
