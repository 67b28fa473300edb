//! Later-wins merge of diff IOs.
//!
//! [`DiffMem`] is an in-memory, address-keyed view of a diff: adding an
//! IO masks every previously-added byte it covers. Feeding it two
//! sorted diffs A then B yields the merged diff that keeps B's record
//! at every address B covers and A's elsewhere. ALLZERO and DISCARD
//! compose by the same rule.

use std::collections::BTreeMap;

use walb_core::{Error, Result, LOGICAL_BLOCK_SIZE};

use crate::record::DiffRecord;
use crate::sorted::SortedDiffReader;

#[derive(Debug, Clone, PartialEq, Eq)]
enum IoKind {
    Normal(Vec<u8>),
    AllZero,
    Discard,
}

#[derive(Debug, Clone)]
struct MemIo {
    io_blocks: u16,
    kind: IoKind,
}

impl MemIo {
    fn slice(&self, offset_lb: u16, blocks: u16) -> Self {
        let kind = match &self.kind {
            IoKind::Normal(data) => {
                let begin = offset_lb as usize * LOGICAL_BLOCK_SIZE;
                let end = begin + blocks as usize * LOGICAL_BLOCK_SIZE;
                IoKind::Normal(data[begin..end].to_vec())
            }
            other => other.clone(),
        };
        Self { io_blocks: blocks, kind }
    }
}

/// In-memory diff with later-wins semantics.
#[derive(Debug, Default)]
pub struct DiffMem {
    ios: BTreeMap<u64, MemIo>,
}

impl DiffMem {
    /// An empty diff.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct ranges currently held.
    #[must_use]
    pub fn n_ios(&self) -> usize {
        self.ios.len()
    }

    /// Add one IO, masking everything it overlaps.
    ///
    /// # Errors
    ///
    /// Fails on a zero-length range or data/flags mismatch.
    pub fn add(&mut self, rec: &DiffRecord, data: Option<&[u8]>) -> Result<()> {
        if rec.io_blocks == 0 {
            return Err(Error::format("zero-sized diff IO"));
        }
        let kind = if rec.flags.is_discard() {
            IoKind::Discard
        } else if rec.flags.is_allzero() {
            IoKind::AllZero
        } else {
            let bytes = data.ok_or_else(|| Error::format("normal IO without data"))?;
            if bytes.len() != rec.io_bytes() {
                return Err(Error::format("IO data length mismatch"));
            }
            IoKind::Normal(bytes.to_vec())
        };
        let start = rec.io_address;
        let end = rec.end_address();

        // Collect every existing range overlapping [start, end).
        let affected: Vec<u64> = self
            .ios
            .range(..end)
            .filter(|(&s, io)| s + u64::from(io.io_blocks) > start)
            .map(|(&s, _)| s)
            .collect();

        for s in affected {
            let io = self.ios.remove(&s).expect("key collected above");
            let e = s + u64::from(io.io_blocks);
            if s < start {
                // Keep the uncovered front part.
                let keep = (start - s) as u16;
                self.ios.insert(s, io.slice(0, keep));
            }
            if e > end {
                // Keep the uncovered tail part.
                let skip = (end - s) as u16;
                let keep = (e - end) as u16;
                self.ios.insert(end, io.slice(skip, keep));
            }
        }
        self.ios.insert(start, MemIo { io_blocks: rec.io_blocks, kind });
        Ok(())
    }

    /// Drain a whole sorted diff into this view.
    ///
    /// # Errors
    ///
    /// Propagates reader and add errors.
    pub fn add_diff<R: std::io::Read>(&mut self, reader: &mut SortedDiffReader<R>) -> Result<()> {
        while let Some((rec, data)) = reader.read_record()? {
            self.add(&rec, data.as_deref())?;
        }
        Ok(())
    }

    /// Read the merged bytes at `addr` for `blocks`, or `None` when any
    /// part of the range was never written. Discarded and all-zero
    /// ranges read as zeroes.
    #[must_use]
    pub fn read(&self, addr: u64, blocks: u16) -> Option<Vec<u8>> {
        let mut out = vec![0u8; blocks as usize * LOGICAL_BLOCK_SIZE];
        let end = addr + u64::from(blocks);
        let mut covered = addr;
        for (&s, io) in self.ios.range(..end) {
            let e = s + u64::from(io.io_blocks);
            if e <= addr {
                continue;
            }
            let from = s.max(addr);
            if from > covered {
                return None;
            }
            let to = e.min(end);
            if let IoKind::Normal(data) = &io.kind {
                let src = ((from - s) as usize) * LOGICAL_BLOCK_SIZE;
                let dst = ((from - addr) as usize) * LOGICAL_BLOCK_SIZE;
                let len = ((to - from) as usize) * LOGICAL_BLOCK_SIZE;
                out[dst..dst + len].copy_from_slice(&data[src..src + len]);
            }
            covered = covered.max(to);
        }
        if covered < end {
            return None;
        }
        Some(out)
    }

    /// Emit the merged IOs in address order, ready for a sorted writer.
    #[must_use]
    pub fn emit(&self) -> Vec<(DiffRecord, Option<Vec<u8>>)> {
        self.ios
            .iter()
            .map(|(&addr, io)| match &io.kind {
                IoKind::Normal(data) => {
                    let mut rec = DiffRecord::normal(addr, io.io_blocks);
                    rec.data_size = data.len() as u32;
                    (rec, Some(data.clone()))
                }
                IoKind::AllZero => (DiffRecord::allzero(addr, io.io_blocks), None),
                IoKind::Discard => (DiffRecord::discard(addr, io.io_blocks), None),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::CompressionType;
    use crate::record::DiffFileHeader;
    use crate::sorted::SortedDiffWriter;

    fn data(blocks: u16, fill: u8) -> Vec<u8> {
        vec![fill; blocks as usize * LOGICAL_BLOCK_SIZE]
    }

    #[test]
    fn test_later_wins_full_overlap() {
        let mut mem = DiffMem::new();
        mem.add(&DiffRecord::normal(0, 8), Some(&data(8, 1))).unwrap();
        mem.add(&DiffRecord::normal(0, 8), Some(&data(8, 2))).unwrap();
        assert_eq!(mem.n_ios(), 1);
        assert_eq!(mem.read(0, 8).unwrap(), data(8, 2));
    }

    #[test]
    fn test_later_wins_partial_overlap() {
        let mut mem = DiffMem::new();
        mem.add(&DiffRecord::normal(0, 8), Some(&data(8, 1))).unwrap();
        mem.add(&DiffRecord::normal(4, 8), Some(&data(8, 2))).unwrap();
        // [0,4) keeps 1, [4,12) is 2.
        let out = mem.read(0, 12).unwrap();
        assert!(out[..4 * 512].iter().all(|&b| b == 1));
        assert!(out[4 * 512..].iter().all(|&b| b == 2));
        let emitted = mem.emit();
        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted[0].0.io_blocks, 4);
        assert_eq!(emitted[1].0.io_address, 4);
    }

    #[test]
    fn test_split_middle() {
        let mut mem = DiffMem::new();
        mem.add(&DiffRecord::normal(0, 16), Some(&data(16, 1))).unwrap();
        mem.add(&DiffRecord::allzero(4, 4), None).unwrap();
        let emitted = mem.emit();
        assert_eq!(emitted.len(), 3);
        assert_eq!(emitted[0].0.io_blocks, 4);
        assert!(emitted[1].0.flags.is_allzero());
        assert_eq!(emitted[2].0.io_address, 8);
        assert_eq!(emitted[2].0.io_blocks, 8);
        // Zero range reads as zeroes.
        assert!(mem.read(4, 4).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_discard_allzero_compose() {
        let mut mem = DiffMem::new();
        mem.add(&DiffRecord::discard(0, 8), None).unwrap();
        mem.add(&DiffRecord::allzero(4, 8), None).unwrap();
        // Address 6 reads zero through the allzero range.
        assert!(mem.read(6, 1).unwrap().iter().all(|&b| b == 0));
        let emitted = mem.emit();
        assert_eq!(emitted.len(), 2);
        assert!(emitted[0].0.flags.is_discard());
        assert_eq!(emitted[0].0.io_blocks, 4);
        assert!(emitted[1].0.flags.is_allzero());
    }

    #[test]
    fn test_unwritten_range_reads_none() {
        let mut mem = DiffMem::new();
        mem.add(&DiffRecord::normal(10, 4), Some(&data(4, 1))).unwrap();
        assert!(mem.read(0, 4).is_none());
        assert!(mem.read(8, 8).is_none());
        assert!(mem.read(10, 4).is_some());
    }

    #[test]
    fn test_merge_two_sorted_diffs() {
        // Diff A: writes 1s at [0,8) and [16,24). Diff B: 2s at [4,20).
        let header = DiffFileHeader::sorted([0; 16], 64);
        let mut wa =
            SortedDiffWriter::new(Vec::new(), &header, CompressionType::Snappy, 0).unwrap();
        wa.add(DiffRecord::normal(0, 8), Some(&data(8, 1))).unwrap();
        wa.add(DiffRecord::normal(16, 8), Some(&data(8, 1))).unwrap();
        let a = wa.finish().unwrap();

        let mut wb =
            SortedDiffWriter::new(Vec::new(), &header, CompressionType::Snappy, 0).unwrap();
        wb.add(DiffRecord::normal(4, 16), Some(&data(16, 2))).unwrap();
        let b = wb.finish().unwrap();

        let mut mem = DiffMem::new();
        mem.add_diff(&mut SortedDiffReader::new(&a[..]).unwrap()).unwrap();
        mem.add_diff(&mut SortedDiffReader::new(&b[..]).unwrap()).unwrap();

        let out = mem.read(0, 24).unwrap();
        assert!(out[..4 * 512].iter().all(|&b| b == 1));
        assert!(out[4 * 512..20 * 512].iter().all(|&b| b == 2));
        assert!(out[20 * 512..].iter().all(|&b| b == 1));

        // The merged emit is sorted and writable as a new sorted diff.
        let mut w =
            SortedDiffWriter::new(Vec::new(), &header, CompressionType::Snappy, 0).unwrap();
        for (rec, io) in mem.emit() {
            w.add(DiffRecord { data_size: 0, checksum: 0, ..rec }, io.as_deref()).unwrap();
        }
        w.finish().unwrap();
    }
}
