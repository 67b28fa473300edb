//! Per-IO compression.
//!
//! Wdiff records are compressed individually. The policy is strict:
//! the compressed form is stored only when it is smaller than the
//! input, otherwise the raw bytes are stored with type `None`. Record
//! checksums always cover the stored bytes.

use std::io::{Read, Write};

use walb_core::{checksum, Error, Result};

use crate::record::DiffRecord;

/// Compression algorithm of one stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CompressionType {
    /// Stored raw.
    #[default]
    None = 0,
    /// Snappy raw block format.
    Snappy = 1,
    /// Zlib (deflate) stream.
    Gzip = 2,
    /// Xz (lzma) stream.
    Lzma = 3,
}

impl CompressionType {
    /// Decode the wire/disk byte.
    ///
    /// # Errors
    ///
    /// Fails on an unknown value.
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Self::None),
            1 => Ok(Self::Snappy),
            2 => Ok(Self::Gzip),
            3 => Ok(Self::Lzma),
            _ => Err(Error::format(format!("unknown compression type {v}"))),
        }
    }

    /// Short name for logs and status output.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Snappy => "snappy",
            Self::Gzip => "gzip",
            Self::Lzma => "lzma",
        }
    }
}

/// Compress `data` with `ty`. `None` copies.
///
/// # Errors
///
/// Returns the underlying encoder error.
pub fn compress(ty: CompressionType, data: &[u8], level: u32) -> Result<Vec<u8>> {
    match ty {
        CompressionType::None => Ok(data.to_vec()),
        CompressionType::Snappy => {
            snap::raw::Encoder::new().compress_vec(data).map_err(|e| Error::format(e.to_string()))
        }
        CompressionType::Gzip => {
            let mut enc =
                flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::new(level.min(9)));
            enc.write_all(data)?;
            Ok(enc.finish()?)
        }
        CompressionType::Lzma => {
            let mut enc = xz2::write::XzEncoder::new(Vec::new(), level.min(9));
            enc.write_all(data)?;
            Ok(enc.finish()?)
        }
    }
}

/// Uncompress `data` into exactly `orig_size` bytes.
///
/// # Errors
///
/// Fails when the stream is corrupt or the size does not match.
pub fn uncompress(ty: CompressionType, data: &[u8], orig_size: usize) -> Result<Vec<u8>> {
    let out = match ty {
        CompressionType::None => data.to_vec(),
        CompressionType::Snappy => snap::raw::Decoder::new()
            .decompress_vec(data)
            .map_err(|e| Error::format(e.to_string()))?,
        CompressionType::Gzip => {
            let mut out = Vec::with_capacity(orig_size);
            flate2::read::ZlibDecoder::new(data).read_to_end(&mut out)?;
            out
        }
        CompressionType::Lzma => {
            let mut out = Vec::with_capacity(orig_size);
            xz2::read::XzDecoder::new(data).read_to_end(&mut out)?;
            out
        }
    };
    if out.len() != orig_size {
        return Err(Error::format(format!(
            "uncompressed size {} does not match expected {orig_size}",
            out.len()
        )));
    }
    Ok(out)
}

/// Compress one record's IO bytes under the store-smaller-only policy.
///
/// Rewrites `rec.compression_type`, `rec.data_size` and `rec.checksum`
/// and returns the bytes to store.
///
/// # Errors
///
/// Returns the underlying encoder error.
pub fn compress_record(
    ty: CompressionType,
    level: u32,
    rec: &mut DiffRecord,
    data: &[u8],
) -> Result<Vec<u8>> {
    let encoded = if ty == CompressionType::None { data.to_vec() } else { compress(ty, data, level)? };
    let (stored, stored_ty) = if encoded.len() < data.len() {
        (encoded, ty)
    } else {
        (data.to_vec(), CompressionType::None)
    };
    rec.compression_type = stored_ty;
    rec.data_size = stored.len() as u32;
    rec.checksum = checksum(&stored, 0);
    Ok(stored)
}

/// Uncompress one record's stored bytes and verify its checksum.
///
/// # Errors
///
/// Fails on checksum mismatch or a corrupt stream.
pub fn uncompress_record(rec: &DiffRecord, stored: &[u8]) -> Result<Vec<u8>> {
    if checksum(stored, 0) != rec.checksum {
        return Err(Error::format(format!(
            "diff record checksum mismatch at address {}",
            rec.io_address
        )));
    }
    uncompress(rec.compression_type, stored, rec.io_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compressible_data() -> Vec<u8> {
        // Long runs compress under every codec.
        let mut v = vec![0u8; 8192];
        for (i, b) in v.iter_mut().enumerate() {
            *b = (i / 512) as u8;
        }
        v
    }

    #[test]
    fn test_roundtrip_all_types() {
        let data = compressible_data();
        for ty in [
            CompressionType::None,
            CompressionType::Snappy,
            CompressionType::Gzip,
            CompressionType::Lzma,
        ] {
            let enc = compress(ty, &data, 0).unwrap();
            let dec = uncompress(ty, &enc, data.len()).unwrap();
            assert_eq!(dec, data, "type {}", ty.as_str());
        }
    }

    #[test]
    fn test_record_policy_compressible() {
        let data = compressible_data();
        let mut rec = DiffRecord::normal(0, (data.len() / 512) as u16);
        let stored = compress_record(CompressionType::Snappy, 0, &mut rec, &data).unwrap();
        assert_eq!(rec.compression_type, CompressionType::Snappy);
        assert!(stored.len() < data.len());
        assert_eq!(uncompress_record(&rec, &stored).unwrap(), data);
    }

    #[test]
    fn test_record_policy_incompressible() {
        // High-entropy data: the encoder output is not smaller, so the
        // raw bytes must be stored with type None.
        let mut state = 0x12345678u32;
        let data: Vec<u8> = (0..4096)
            .map(|_| {
                state = state.wrapping_mul(1664525).wrapping_add(1013904223);
                (state >> 24) as u8
            })
            .collect();
        let mut rec = DiffRecord::normal(0, 8);
        let stored = compress_record(CompressionType::Snappy, 0, &mut rec, &data).unwrap();
        assert_eq!(rec.compression_type, CompressionType::None);
        assert_eq!(stored, data);
    }

    #[test]
    fn test_checksum_verified() {
        let data = compressible_data();
        let mut rec = DiffRecord::normal(0, (data.len() / 512) as u16);
        let mut stored = compress_record(CompressionType::Gzip, 6, &mut rec, &data).unwrap();
        stored[0] ^= 1;
        assert!(uncompress_record(&rec, &stored).is_err());
    }

    #[test]
    fn test_unknown_type() {
        assert!(CompressionType::from_u8(9).is_err());
    }
}
