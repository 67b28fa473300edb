//! Sorted wdiff files.
//!
//! Records across the whole file are strictly sorted by `io_address`
//! and never overlap. The reader rejects out-of-order records unless
//! explicitly put in lenient mode.

use std::collections::VecDeque;
use std::io::{Read, Write};

use tracing::warn;
use walb_core::{Error, Result};

use crate::compress::{compress_record, uncompress_record, CompressionType};
use crate::pack::{DiffPack, DIFF_PACK_SIZE};
use crate::record::{DiffFileHeader, DiffRecord, DIFF_FILE_HEADER_SIZE};

/// Streaming writer of a sorted wdiff.
pub struct SortedDiffWriter<W: Write> {
    out: W,
    compression: CompressionType,
    level: u32,
    pack: DiffPack,
    data: Vec<u8>,
    last_end_address: u64,
}

impl<W: Write> SortedDiffWriter<W> {
    /// Create a writer and emit the file header.
    ///
    /// # Errors
    ///
    /// Returns the underlying write error.
    pub fn new(
        mut out: W,
        header: &DiffFileHeader,
        compression: CompressionType,
        level: u32,
    ) -> Result<Self> {
        out.write_all(&header.to_bytes())?;
        Ok(Self {
            out,
            compression,
            level,
            pack: DiffPack::new(),
            data: Vec::new(),
            last_end_address: 0,
        })
    }

    /// Append one record. `data` must be the uncompressed IO bytes for
    /// normal records and `None` for allzero/discard.
    ///
    /// # Errors
    ///
    /// Fails when the record breaks sort order or data presence does
    /// not match the flags.
    pub fn add(&mut self, rec: DiffRecord, data: Option<&[u8]>) -> Result<()> {
        if rec.io_blocks == 0 {
            return Err(Error::format("zero-sized diff record"));
        }
        if rec.io_address < self.last_end_address {
            return Err(Error::format(format!(
                "record at {} overlaps or precedes previous end {}",
                rec.io_address, self.last_end_address
            )));
        }
        let mut rec = rec;
        let stored = match (rec.has_data(), data) {
            (true, Some(bytes)) => {
                if bytes.len() != rec.io_bytes() {
                    return Err(Error::format(format!(
                        "data length {} does not match io_blocks {}",
                        bytes.len(),
                        rec.io_blocks
                    )));
                }
                compress_record(self.compression, self.level, &mut rec, bytes)?
            }
            (false, None) => {
                rec.data_size = 0;
                rec.checksum = 0;
                Vec::new()
            }
            _ => return Err(Error::format("data presence does not match record flags")),
        };
        if self.pack.is_full_for(rec.data_size) {
            self.flush_pack()?;
        }
        let assigned = self.pack.add(rec).expect("pack was just flushed");
        debug_assert_eq!(assigned.data_offset as usize, self.data.len());
        self.data.extend_from_slice(&stored);
        self.last_end_address = rec.end_address();
        Ok(())
    }

    fn flush_pack(&mut self) -> Result<()> {
        if self.pack.is_end() {
            return Ok(());
        }
        self.out.write_all(&self.pack.to_block())?;
        self.out.write_all(&self.data)?;
        self.pack = DiffPack::new();
        self.data.clear();
        Ok(())
    }

    /// Flush the pending pack, write the terminator and flush the
    /// underlying writer.
    ///
    /// # Errors
    ///
    /// Returns the underlying write error.
    pub fn finish(mut self) -> Result<W> {
        self.flush_pack()?;
        self.out.write_all(&DiffPack::new().to_block())?;
        self.out.flush()?;
        Ok(self.out)
    }
}

/// Streaming reader of a sorted wdiff.
pub struct SortedDiffReader<R: Read> {
    input: R,
    header: DiffFileHeader,
    lenient: bool,
    warned: bool,
    last_end_address: u64,
    queue: VecDeque<(DiffRecord, Option<Vec<u8>>)>,
    done: bool,
}

impl<R: Read> SortedDiffReader<R> {
    /// Open a sorted wdiff stream and parse its header.
    ///
    /// # Errors
    ///
    /// Fails on a bad header or an indexed file.
    pub fn new(mut input: R) -> Result<Self> {
        let mut buf = [0u8; DIFF_FILE_HEADER_SIZE];
        input.read_exact(&mut buf)?;
        let header = DiffFileHeader::parse(&buf)?;
        if header.is_indexed() {
            return Err(Error::format("expected a sorted wdiff, found indexed"));
        }
        Ok(Self {
            input,
            header,
            lenient: false,
            warned: false,
            last_end_address: 0,
            queue: VecDeque::new(),
            done: false,
        })
    }

    /// Tolerate out-of-order records (legacy files), warning once.
    #[must_use]
    pub fn lenient(mut self) -> Self {
        self.lenient = true;
        self
    }

    /// The file header.
    #[must_use]
    pub const fn header(&self) -> &DiffFileHeader {
        &self.header
    }

    /// Read the next record with its uncompressed data, or `None` after
    /// the end pack.
    ///
    /// # Errors
    ///
    /// Fails on checksum mismatch, corrupt packs, or sort-order
    /// violations (unless lenient).
    pub fn read_record(&mut self) -> Result<Option<(DiffRecord, Option<Vec<u8>>)>> {
        loop {
            if let Some((rec, data)) = self.queue.pop_front() {
                self.check_order(&rec)?;
                return Ok(Some((rec, data)));
            }
            if self.done {
                return Ok(None);
            }
            self.read_pack()?;
        }
    }

    /// Drain the whole file.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`read_record`](Self::read_record).
    pub fn read_all(&mut self) -> Result<Vec<(DiffRecord, Option<Vec<u8>>)>> {
        let mut all = Vec::new();
        while let Some(item) = self.read_record()? {
            all.push(item);
        }
        Ok(all)
    }

    fn check_order(&mut self, rec: &DiffRecord) -> Result<()> {
        if rec.io_address < self.last_end_address {
            if !self.lenient {
                return Err(Error::format(format!(
                    "out-of-order diff record at {} (previous end {})",
                    rec.io_address, self.last_end_address
                )));
            }
            if !self.warned {
                warn!(
                    io_address = rec.io_address,
                    previous_end = self.last_end_address,
                    "tolerating out-of-order diff record"
                );
                self.warned = true;
            }
        }
        self.last_end_address = self.last_end_address.max(rec.end_address());
        Ok(())
    }

    fn read_pack(&mut self) -> Result<()> {
        let mut block = vec![0u8; DIFF_PACK_SIZE];
        self.input.read_exact(&mut block)?;
        let pack = DiffPack::parse(&block)?;
        if pack.is_end() {
            self.done = true;
            return Ok(());
        }
        let mut data = vec![0u8; pack.total_size() as usize];
        self.input.read_exact(&mut data)?;
        for rec in pack.records() {
            let io = if rec.has_data() {
                let begin = rec.data_offset as usize;
                let end = begin + rec.data_size as usize;
                Some(uncompress_record(rec, &data[begin..end])?)
            } else {
                None
            };
            self.queue.push_back((*rec, io));
        }
        Ok(())
    }
}
