//! Snappy frames for streaming pack blocks.
//!
//! The transfer stream wraps every serialized pack in one of these:
//! `cmp_size == 0` means the bytes travel raw.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use walb_core::{Error, Result};

use crate::packet::Packet;

/// One wire frame: a whole pack, snappy-compressed when that is
/// smaller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressedData {
    /// Compressed size; 0 when stored raw.
    pub cmp_size: u32,
    /// Original size; never 0.
    pub orig_size: u32,
    /// The stored bytes.
    pub data: Vec<u8>,
}

impl CompressedData {
    /// Build a frame from raw bytes, compressing when profitable.
    ///
    /// # Errors
    ///
    /// Fails on empty input.
    pub fn from_raw(raw: &[u8]) -> Result<Self> {
        if raw.is_empty() {
            return Err(Error::protocol("empty frame"));
        }
        let compressed = snap::raw::Encoder::new()
            .compress_vec(raw)
            .map_err(|e| Error::protocol(e.to_string()))?;
        if compressed.len() < raw.len() {
            Ok(Self {
                cmp_size: compressed.len() as u32,
                orig_size: raw.len() as u32,
                data: compressed,
            })
        } else {
            Ok(Self { cmp_size: 0, orig_size: raw.len() as u32, data: raw.to_vec() })
        }
    }

    /// Recover the raw bytes.
    ///
    /// # Errors
    ///
    /// Fails on a corrupt frame or size mismatch.
    pub fn into_raw(self) -> Result<Vec<u8>> {
        self.verify()?;
        if self.cmp_size == 0 {
            return Ok(self.data);
        }
        let raw = snap::raw::Decoder::new()
            .decompress_vec(&self.data)
            .map_err(|e| Error::protocol(e.to_string()))?;
        if raw.len() != self.orig_size as usize {
            return Err(Error::protocol(format!(
                "frame expands to {} bytes, expected {}",
                raw.len(),
                self.orig_size
            )));
        }
        Ok(raw)
    }

    fn verify(&self) -> Result<()> {
        if self.orig_size == 0 {
            return Err(Error::protocol("frame orig_size must not be 0"));
        }
        let expected = if self.cmp_size == 0 { self.orig_size } else { self.cmp_size };
        if self.data.len() != expected as usize {
            return Err(Error::protocol(format!(
                "frame data length {} does not match header {expected}",
                self.data.len()
            )));
        }
        Ok(())
    }

    /// Send this frame.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    pub async fn send<S: AsyncRead + AsyncWrite + Unpin>(&self, pkt: &mut Packet<S>) -> Result<()> {
        pkt.write(&(self.cmp_size, self.orig_size)).await?;
        pkt.write_buf(&self.data).await
    }

    /// Receive one frame.
    ///
    /// # Errors
    ///
    /// Fails on a malformed frame or I/O error.
    pub async fn recv<S: AsyncRead + AsyncWrite + Unpin>(pkt: &mut Packet<S>) -> Result<Self> {
        let (cmp_size, orig_size): (u32, u32) = pkt.read().await?;
        let data = pkt.read_buf().await?;
        let frame = Self { cmp_size, orig_size, data };
        frame.verify()?;
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;

    #[test]
    fn test_roundtrip_compressible() {
        let raw = vec![7u8; 8192];
        let frame = CompressedData::from_raw(&raw).unwrap();
        assert!(frame.cmp_size > 0);
        assert_eq!(frame.into_raw().unwrap(), raw);
    }

    #[test]
    fn test_roundtrip_incompressible() {
        let mut state = 1u32;
        let raw: Vec<u8> = (0..512)
            .map(|_| {
                state = state.wrapping_mul(48271);
                (state >> 16) as u8
            })
            .collect();
        let frame = CompressedData::from_raw(&raw).unwrap();
        assert_eq!(frame.cmp_size, 0);
        assert_eq!(frame.into_raw().unwrap(), raw);
    }

    #[tokio::test]
    async fn test_wire_roundtrip() {
        let (a, b) = duplex(1 << 20);
        let mut pa = Packet::new(a);
        let mut pb = Packet::new(b);

        let raw = vec![3u8; 4096];
        CompressedData::from_raw(&raw).unwrap().send(&mut pa).await.unwrap();
        pa.flush().await.unwrap();
        let frame = CompressedData::recv(&mut pb).await.unwrap();
        assert_eq!(frame.into_raw().unwrap(), raw);
    }
}
