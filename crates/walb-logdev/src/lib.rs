//! Log-device codec for WalB.
//!
//! This crate reads and writes the on-disk structures the kernel module
//! publishes on the log device:
//! - the superblock (two copies) and the lsid → ring-buffer mapping
//! - logpack headers and their IO data, with salted checksums
//! - the wlog stream file header used by transfer and debug dumps
//!
//! plus the block-device access layer: a simple positional reader and
//! the read-ahead / write-behind async wrappers.

#![warn(missing_docs)]

pub mod block;
pub mod pack;
pub mod reader;
pub mod superblock;
pub mod wlog_header;
pub mod writer;

pub use block::{capacity_pb, n_lb_in_pb, AlignedBuf};
pub use pack::{LogPackHeader, LogRecord, Parsed, RecordFlags};
pub use reader::{AsyncWldevReader, WldevReader};
pub use superblock::SuperBlock;
pub use wlog_header::WlogFileHeader;
pub use writer::AsyncBdevWriter;
