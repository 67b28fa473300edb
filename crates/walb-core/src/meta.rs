//! Snapshot and diff metadata.
//!
//! A `MetaSnap` names a point in the gid space; a `MetaDiff` names the
//! transition a wdiff file carries. The storage host also keeps
//! `MetaLsidGid` progress records mapping gids to lsids.

use serde::{Deserialize, Serialize};

use crate::{INVALID_GID, INVALID_LSID};

/// A snapshot position in gid space.
///
/// The snapshot is clean iff `gid_b == gid_e`; a dirty snapshot (from a
/// full/hash backup of a writable volume) spans a gid range that later
/// wlog shipments close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaSnap {
    /// Begin gid.
    pub gid_b: u64,
    /// End gid.
    pub gid_e: u64,
}

impl MetaSnap {
    /// A clean snapshot at `gid`.
    #[must_use]
    pub const fn clean(gid: u64) -> Self {
        Self { gid_b: gid, gid_e: gid }
    }

    /// A dirty snapshot spanning `[gid_b, gid_e]`.
    #[must_use]
    pub const fn dirty(gid_b: u64, gid_e: u64) -> Self {
        Self { gid_b, gid_e }
    }

    /// True iff this snapshot is clean.
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.gid_b == self.gid_e
    }
}

impl std::fmt::Display for MetaSnap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_clean() {
            write!(f, "|{}|", self.gid_b)
        } else {
            write!(f, "|{},{}|", self.gid_b, self.gid_e)
        }
    }
}

/// The metadata of one wdiff file: the snapshot it starts from, the
/// snapshot it produces, whether the archive may merge it with its
/// neighbours, and its creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaDiff {
    /// Snapshot this diff applies on top of.
    pub snap_b: MetaSnap,
    /// Snapshot this diff produces.
    pub snap_e: MetaSnap,
    /// True for diffs produced by wlog-transfer; false for full/hash
    /// sync results, which must stay un-merged.
    pub is_mergeable: bool,
    /// Creation time [unix seconds].
    pub timestamp: u64,
}

impl MetaDiff {
    /// Creates a diff between two clean snapshots.
    #[must_use]
    pub const fn new(gid_b: u64, gid_e: u64, is_mergeable: bool, timestamp: u64) -> Self {
        Self {
            snap_b: MetaSnap::clean(gid_b),
            snap_e: MetaSnap::clean(gid_e),
            is_mergeable,
            timestamp,
        }
    }

    /// True iff `other` starts exactly where `self` ends.
    #[must_use]
    pub fn can_precede(&self, other: &MetaDiff) -> bool {
        self.snap_e == other.snap_b
    }
}

impl std::fmt::Display for MetaDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-->{}", self.snap_b, self.snap_e)
    }
}

/// A (gid, lsid) progress record.
///
/// The storage host seals each snapshot with one of these; the ordered
/// sequence in `gid_lsid_map` determines the lsid range of every diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaLsidGid {
    /// Log position of the snapshot.
    pub lsid: u64,
    /// Generation id assigned to the snapshot.
    pub gid: u64,
    /// When the snapshot was taken [unix seconds].
    pub timestamp: u64,
}

impl MetaLsidGid {
    /// An empty record.
    #[must_use]
    pub const fn invalid() -> Self {
        Self { lsid: INVALID_LSID, gid: INVALID_GID, timestamp: 0 }
    }

    /// True iff both lsid and gid are set.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.lsid != INVALID_LSID && self.gid != INVALID_GID
    }
}

impl std::fmt::Display for MetaLsidGid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "gid {} lsid {}", self.gid, self.lsid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snap_clean_dirty() {
        assert!(MetaSnap::clean(5).is_clean());
        assert!(!MetaSnap::dirty(0, 3).is_clean());
        assert_eq!(MetaSnap::clean(5).to_string(), "|5|");
        assert_eq!(MetaSnap::dirty(0, 3).to_string(), "|0,3|");
    }

    #[test]
    fn test_diff_chain() {
        let a = MetaDiff::new(0, 2, true, 100);
        let b = MetaDiff::new(2, 5, true, 200);
        let c = MetaDiff::new(3, 6, true, 300);
        assert!(a.can_precede(&b));
        assert!(!a.can_precede(&c));
        assert_eq!(a.to_string(), "|0|-->|2|");
    }

    #[test]
    fn test_lsid_gid_validity() {
        assert!(!MetaLsidGid::invalid().is_valid());
        let rec = MetaLsidGid { lsid: 10, gid: 1, timestamp: 0 };
        assert!(rec.is_valid());
    }
}
