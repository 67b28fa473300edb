//! The walb-diff (wdiff) format.
//!
//! A wdiff file is the compact, snapshot-addressable representation of a
//! range of logpacks:
//! - sorted variant: address-ordered records grouped into 4 KiB packs
//! - indexed variant: arrival-ordered data stream plus a sorted index
//!
//! plus per-IO compression, the order-preserving parallel converter
//! queue, and later-wins merge.

#![warn(missing_docs)]

pub mod compress;
pub mod converter;
pub mod indexed;
pub mod merge;
pub mod pack;
pub mod record;
pub mod sorted;

pub use compress::CompressionType;
pub use converter::{ConverterMode, ConverterQueue};
pub use indexed::{DiffIndexRecord, IndexedDiffCache, IndexedDiffReader, IndexedDiffWriter};
pub use merge::DiffMem;
pub use pack::{DiffPack, DIFF_PACK_SIZE, MAX_N_RECORDS_IN_PACK, MAX_PACK_DATA_SIZE};
pub use record::{DiffFileHeader, DiffRecord, DiffRecordFlags};
pub use sorted::{SortedDiffReader, SortedDiffWriter};
