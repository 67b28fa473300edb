//! Order-preserving parallel pack conversion.
//!
//! [`ConverterQueue`] runs CPU-bound pack compression on a pool of
//! engines while guaranteeing that `pop` yields results in exact `push`
//! order. Each push reserves a result slot at the tail of a bounded
//! queue; a worker failure is stored in its slot and re-raised in the
//! consumer's context without desynchronising the order.

use tokio::sync::{mpsc, oneshot, Semaphore};
use walb_core::{Error, Result};

use crate::compress::{compress_record, uncompress_record, CompressionType};
use crate::pack::{DiffPack, DIFF_PACK_SIZE};

/// What an engine does to each pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConverterMode {
    /// Compress every normal record under the store-smaller-only
    /// policy.
    Compress {
        /// Target algorithm.
        ty: CompressionType,
        /// Encoder level (codec-specific).
        level: u32,
    },
    /// Expand every record back to raw bytes.
    Uncompress,
}

/// Convert one serialized pack (header block + data area).
///
/// # Errors
///
/// Fails on a corrupt pack or codec error.
pub fn convert_pack(mode: ConverterMode, bytes: &[u8]) -> Result<Vec<u8>> {
    if bytes.len() < DIFF_PACK_SIZE {
        return Err(Error::format("pack shorter than its header block"));
    }
    let pack = DiffPack::parse(&bytes[..DIFF_PACK_SIZE])?;
    let data = &bytes[DIFF_PACK_SIZE..];
    if data.len() != pack.total_size() as usize {
        return Err(Error::format(format!(
            "pack data length {} does not match total_size {}",
            data.len(),
            pack.total_size()
        )));
    }

    let mut out_pack = DiffPack::new();
    let mut out_data = Vec::with_capacity(data.len());
    for rec in pack.records() {
        let mut rec = *rec;
        if rec.has_data() {
            let begin = rec.data_offset as usize;
            let stored = &data[begin..begin + rec.data_size as usize];
            let converted = match mode {
                ConverterMode::Compress { ty, level } => {
                    compress_record(ty, level, &mut rec, stored)?
                }
                ConverterMode::Uncompress => {
                    let raw = uncompress_record(&rec, stored)?;
                    rec.compression_type = CompressionType::None;
                    rec.data_size = raw.len() as u32;
                    rec.checksum = walb_core::checksum(&raw, 0);
                    raw
                }
            };
            out_data.extend_from_slice(&converted);
        }
        out_pack
            .add(rec)
            .ok_or_else(|| Error::format("converted pack exceeds pack limits"))?;
    }
    let mut out = out_pack.to_block();
    out.extend_from_slice(&out_data);
    Ok(out)
}

type Slot = oneshot::Receiver<Result<Vec<u8>>>;

/// Bounded, order-preserving converter pipeline.
pub struct ConverterQueue {
    mode: ConverterMode,
    engines: std::sync::Arc<Semaphore>,
    slots_tx: Option<mpsc::Sender<Slot>>,
    slots_rx: mpsc::Receiver<Slot>,
}

impl ConverterQueue {
    /// Create a queue with `max_queue` in-flight slots and `n_engines`
    /// parallel engines.
    #[must_use]
    pub fn new(max_queue: usize, n_engines: usize, mode: ConverterMode) -> Self {
        assert!(max_queue > 0 && n_engines > 0);
        let (slots_tx, slots_rx) = mpsc::channel(max_queue);
        Self {
            mode,
            engines: std::sync::Arc::new(Semaphore::new(n_engines)),
            slots_tx: Some(slots_tx),
            slots_rx,
        }
    }

    /// Submit one pack. Reserves the next result slot, then blocks
    /// until the queue has room and an engine is idle.
    ///
    /// # Errors
    ///
    /// Fails after [`quit`](Self::quit).
    pub async fn push(&self, pack: Vec<u8>) -> Result<()> {
        let tx = self
            .slots_tx
            .as_ref()
            .ok_or_else(|| Error::format("converter queue already quit"))?;
        let (result_tx, result_rx) = oneshot::channel();
        tx.send(result_rx)
            .await
            .map_err(|_| Error::format("converter queue closed"))?;
        let permit = std::sync::Arc::clone(&self.engines)
            .acquire_owned()
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;
        let mode = self.mode;
        tokio::task::spawn_blocking(move || {
            let res = convert_pack(mode, &pack);
            drop(permit);
            let _ = result_tx.send(res);
        });
        Ok(())
    }

    /// Receive the next result in push order, blocking until the head
    /// slot is produced. `Ok(None)` once the queue has quit and
    /// drained.
    ///
    /// # Errors
    ///
    /// Re-raises the error stored by the corresponding engine.
    pub async fn pop(&mut self) -> Result<Option<Vec<u8>>> {
        match self.slots_rx.recv().await {
            None => Ok(None),
            Some(slot) => {
                let res = slot.await.map_err(|e| Error::Io(std::io::Error::other(e)))?;
                res.map(Some)
            }
        }
    }

    /// Stop accepting new packs. Results already in flight remain
    /// poppable; calling twice is a no-op.
    pub fn quit(&mut self) {
        self.slots_tx = None;
    }
}

#[cfg(test)]
mod tests {
    use walb_core::LOGICAL_BLOCK_SIZE;

    use super::*;
    use crate::record::DiffRecord;

    fn raw_pack(n_records: usize, fill: u8) -> Vec<u8> {
        let mut pack = DiffPack::new();
        let mut data = Vec::new();
        for i in 0..n_records {
            let io = vec![fill.wrapping_add(i as u8); 8 * LOGICAL_BLOCK_SIZE];
            let mut rec = DiffRecord::normal(i as u64 * 8, 8);
            rec.data_size = io.len() as u32;
            rec.checksum = walb_core::checksum(&io, 0);
            pack.add(rec).unwrap();
            data.extend_from_slice(&io);
        }
        let mut out = pack.to_block();
        out.extend_from_slice(&data);
        out
    }

    #[test]
    fn test_convert_roundtrip() {
        let raw = raw_pack(3, 10);
        let compressed = convert_pack(
            ConverterMode::Compress { ty: CompressionType::Snappy, level: 0 },
            &raw,
        )
        .unwrap();
        assert!(compressed.len() < raw.len());
        let restored = convert_pack(ConverterMode::Uncompress, &compressed).unwrap();
        assert_eq!(restored, raw);
    }

    #[tokio::test]
    async fn test_queue_preserves_order() {
        let mut q = ConverterQueue::new(
            4,
            3,
            ConverterMode::Compress { ty: CompressionType::Snappy, level: 0 },
        );
        let n = 20usize;
        let packs: Vec<Vec<u8>> = (0..n).map(|i| raw_pack(2, i as u8)).collect();

        // Keep the queue at capacity: pop one before each push once
        // four jobs are in flight, then drain.
        let mut outputs = Vec::new();
        for (i, pack) in packs.into_iter().enumerate() {
            if i >= 4 {
                outputs.push(q.pop().await.unwrap().unwrap());
            }
            q.push(pack).await.unwrap();
        }
        q.quit();
        while let Some(out) = q.pop().await.unwrap() {
            outputs.push(out);
        }

        assert_eq!(outputs.len(), n);
        for (i, out) in outputs.iter().enumerate() {
            let restored = convert_pack(ConverterMode::Uncompress, out).unwrap();
            assert_eq!(restored, raw_pack(2, i as u8), "output {i} out of order");
        }
    }

    #[tokio::test]
    async fn test_queue_error_reraised_in_order() {
        let mut q = ConverterQueue::new(4, 2, ConverterMode::Uncompress);
        q.push(raw_pack(1, 1)).await.unwrap();
        // A corrupt pack: valid length, broken checksum.
        let mut bad = raw_pack(1, 2);
        bad[100] ^= 0xff;
        q.push(bad).await.unwrap();
        q.push(raw_pack(1, 3)).await.unwrap();
        q.quit();

        assert!(q.pop().await.unwrap().is_some());
        assert!(q.pop().await.is_err());
        // The queue stays usable and ordered after the failure.
        let third = q.pop().await.unwrap().unwrap();
        let restored = convert_pack(ConverterMode::Uncompress, &third).unwrap();
        assert_eq!(restored, raw_pack(1, 3));
        assert!(q.pop().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_quit_idempotent() {
        let mut q = ConverterQueue::new(2, 1, ConverterMode::Uncompress);
        q.quit();
        q.quit();
        assert!(q.push(raw_pack(1, 0)).await.is_err());
        assert!(q.pop().await.unwrap().is_none());
    }
}
