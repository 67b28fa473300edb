//! Core types for the WalB storage host.
//!
//! This crate provides:
//! - lsid/gid constants and the snapshot metadata types
//! - salt-seeded checksums used by the log device and diff formats
//! - the error taxonomy shared by all layers
//! - TOML configuration
//! - cooperative-stop primitives and atomic file persistence

#![warn(missing_docs)]

pub mod checksum;
pub mod config;
pub mod error;
pub mod fileutil;
pub mod meta;
pub mod stop;

pub use checksum::{checksum, checksum_partial_finish};
pub use config::StorageConfig;
pub use error::{Error, ErrorKind, Result};
pub use meta::{MetaDiff, MetaLsidGid, MetaSnap};
pub use stop::{verify_not_stopping, StopFlag, StopState, Stopper};

/// Logical block size in bytes. All IO addresses and sizes counted in
/// logical blocks use this unit.
pub const LOGICAL_BLOCK_SIZE: usize = 512;

/// Size of a device uuid in bytes.
pub const UUID_SIZE: usize = 16;

/// Sentinel for "no lsid".
pub const INVALID_LSID: u64 = u64::MAX;

/// Sentinel for "no gid".
pub const INVALID_GID: u64 = u64::MAX;

/// One mebibyte.
pub const MEBI: u64 = 1 << 20;

/// Seconds since the unix epoch, as stored in meta records.
#[must_use]
pub fn unix_time_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
