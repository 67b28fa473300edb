//! Persisted per-volume state.
//!
//! `base_dir/<volId>/` holds one small file per fact, each written by
//! tmp + rename: `state`, `uuid`, `wdev_path`, `size_lb`, `send_lsid`
//! (the done-record) and `gid_lsid_map` (pending snapshot boundaries).
//! Recovery re-reads these files and resumes from the last durable
//! boundary.

use std::path::{Path, PathBuf};

use walb_core::fileutil::{read_string, write_file_atomic, write_string_atomic};
use walb_core::{unix_time_now, Error, MetaDiff, MetaLsidGid, Result, UUID_SIZE};

use crate::state::VolState;

const STATE_FILE: &str = "state";
const UUID_FILE: &str = "uuid";
const WDEV_PATH_FILE: &str = "wdev_path";
const SIZE_LB_FILE: &str = "size_lb";
const SEND_LSID_FILE: &str = "send_lsid";
const GID_LSID_MAP_FILE: &str = "gid_lsid_map";

/// Handle on one volume's persistent directory.
#[derive(Debug, Clone)]
pub struct StorageVolInfo {
    vol_dir: PathBuf,
    vol_id: String,
}

impl StorageVolInfo {
    /// Bind to `base_dir/<vol_id>` without touching the filesystem.
    #[must_use]
    pub fn new(base_dir: &Path, vol_id: &str) -> Self {
        Self { vol_dir: base_dir.join(vol_id), vol_id: vol_id.to_string() }
    }

    /// The volume id.
    #[must_use]
    pub fn vol_id(&self) -> &str {
        &self.vol_id
    }

    /// The volume directory.
    #[must_use]
    pub fn vol_dir(&self) -> &Path {
        &self.vol_dir
    }

    /// True iff the volume directory exists.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.vol_dir.join(STATE_FILE).is_file()
    }

    /// Create the directory and its initial files (state `SyncReady`,
    /// fresh uuid, zero progress).
    ///
    /// # Errors
    ///
    /// Fails when the volume already exists or on I/O error.
    pub fn init(&self, wdev_path: &str, size_lb: u64) -> Result<()> {
        if self.exists() {
            return Err(Error::state("init-vol", "volume already exists"));
        }
        std::fs::create_dir_all(&self.vol_dir)?;
        self.set_state(VolState::SyncReady)?;
        self.renew_uuid()?;
        write_string_atomic(&self.vol_dir.join(WDEV_PATH_FILE), wdev_path)?;
        write_string_atomic(&self.vol_dir.join(SIZE_LB_FILE), &size_lb.to_string())?;
        self.set_done(MetaLsidGid { lsid: 0, gid: 0, timestamp: unix_time_now() })?;
        self.set_queue(&[])?;
        Ok(())
    }

    /// Remove the whole volume directory.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    pub fn clear(&self) -> Result<()> {
        std::fs::remove_dir_all(&self.vol_dir)?;
        Ok(())
    }

    /// Persisted steady state.
    ///
    /// # Errors
    ///
    /// Fails on a missing or unknown state file.
    pub fn state(&self) -> Result<VolState> {
        VolState::parse_steady(&read_string(&self.vol_dir.join(STATE_FILE))?)
    }

    /// Persist a steady state.
    ///
    /// # Errors
    ///
    /// Fails when `state` is not steady or on I/O error.
    pub fn set_state(&self, state: VolState) -> Result<()> {
        if !state.is_steady() {
            return Err(Error::state("set-state", state.as_str()));
        }
        write_string_atomic(&self.vol_dir.join(STATE_FILE), state.as_str())?;
        Ok(())
    }

    /// Device uuid.
    ///
    /// # Errors
    ///
    /// Fails on a malformed uuid file.
    pub fn uuid(&self) -> Result<[u8; UUID_SIZE]> {
        let hex = read_string(&self.vol_dir.join(UUID_FILE))?;
        if hex.len() != UUID_SIZE * 2 {
            return Err(Error::format(format!("bad uuid file: {hex:?}")));
        }
        let mut out = [0u8; UUID_SIZE];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|_| Error::format(format!("bad uuid file: {hex:?}")))?;
        }
        Ok(out)
    }

    /// Generate and persist a fresh uuid (volume reset / re-base).
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    pub fn renew_uuid(&self) -> Result<()> {
        let uuid = uuid::Uuid::new_v4();
        let hex: String = uuid.into_bytes().iter().map(|b| format!("{b:02x}")).collect();
        write_string_atomic(&self.vol_dir.join(UUID_FILE), &hex)?;
        Ok(())
    }

    /// Path of the walb device this volume protects.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    pub fn wdev_path(&self) -> Result<String> {
        Ok(read_string(&self.vol_dir.join(WDEV_PATH_FILE))?)
    }

    /// Recorded volume size [lb].
    ///
    /// # Errors
    ///
    /// Fails on a malformed file.
    pub fn size_lb(&self) -> Result<u64> {
        let s = read_string(&self.vol_dir.join(SIZE_LB_FILE))?;
        s.parse().map_err(|_| Error::format(format!("bad size_lb file: {s:?}")))
    }

    /// Update the recorded volume size.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    pub fn set_size_lb(&self, size_lb: u64) -> Result<()> {
        write_string_atomic(&self.vol_dir.join(SIZE_LB_FILE), &size_lb.to_string())?;
        Ok(())
    }

    /// The done-record: everything up to `done().lsid` has been
    /// shipped and acknowledged.
    ///
    /// # Errors
    ///
    /// Fails on a corrupt record.
    pub fn done(&self) -> Result<MetaLsidGid> {
        let bytes = std::fs::read(self.vol_dir.join(SEND_LSID_FILE))?;
        bincode::deserialize(&bytes).map_err(|e| Error::format(e.to_string()))
    }

    fn set_done(&self, rec: MetaLsidGid) -> Result<()> {
        let bytes = bincode::serialize(&rec).map_err(|e| Error::format(e.to_string()))?;
        write_file_atomic(&self.vol_dir.join(SEND_LSID_FILE), &bytes)?;
        Ok(())
    }

    /// Pending snapshot boundaries, sorted by lsid.
    ///
    /// # Errors
    ///
    /// Fails on a corrupt map file.
    pub fn queue(&self) -> Result<Vec<MetaLsidGid>> {
        let bytes = std::fs::read(self.vol_dir.join(GID_LSID_MAP_FILE))?;
        bincode::deserialize(&bytes).map_err(|e| Error::format(e.to_string()))
    }

    fn set_queue(&self, queue: &[MetaLsidGid]) -> Result<()> {
        let bytes = bincode::serialize(&queue).map_err(|e| Error::format(e.to_string()))?;
        write_file_atomic(&self.vol_dir.join(GID_LSID_MAP_FILE), &bytes)?;
        Ok(())
    }

    /// Oldest and latest gid of this volume.
    ///
    /// # Errors
    ///
    /// Fails on corrupt progress files.
    pub fn gid_range(&self) -> Result<(u64, u64)> {
        let done = self.done()?;
        let queue = self.queue()?;
        let latest = queue.last().map_or(done.gid, |r| r.gid);
        Ok((done.gid, latest))
    }

    /// Seal the log up to `latest_lsid` as a new snapshot boundary and
    /// return its gid.
    ///
    /// The gid leaves room for the capped transfer rounds between the
    /// previous boundary and this one, so intermediate rounds can mint
    /// `gid + 1` steps without colliding.
    ///
    /// # Errors
    ///
    /// Fails when `latest_lsid` precedes the last recorded boundary.
    pub fn take_snapshot(&self, latest_lsid: u64, max_wlog_send_pb: u64) -> Result<u64> {
        if max_wlog_send_pb == 0 {
            return Err(Error::Config("max_wlog_send_pb must not be 0".to_string()));
        }
        let done = self.done()?;
        let mut queue = self.queue()?;
        let pre = queue.last().copied().unwrap_or(done);
        if latest_lsid < pre.lsid {
            return Err(Error::format(format!(
                "snapshot lsid {latest_lsid} precedes recorded boundary {}",
                pre.lsid
            )));
        }
        if latest_lsid == pre.lsid {
            return Ok(pre.gid);
        }
        let gid = pre.gid + 1 + (latest_lsid - pre.lsid) / max_wlog_send_pb;
        queue.push(MetaLsidGid { lsid: latest_lsid, gid, timestamp: unix_time_now() });
        self.set_queue(&queue)?;
        Ok(gid)
    }

    /// True when there are log blocks or snapshot boundaries left to
    /// ship.
    ///
    /// # Errors
    ///
    /// Fails on corrupt progress files.
    pub fn is_required_wlog_transfer(&self, permanent_lsid: u64) -> Result<bool> {
        let done = self.done()?;
        if done.lsid < permanent_lsid {
            return Ok(true);
        }
        // A pending boundary beyond the durable position cannot be
        // shipped yet; the wdev monitor re-queues once it can.
        Ok(self.queue()?.iter().any(|r| r.lsid > done.lsid && r.lsid <= permanent_lsid))
    }

    /// Plan one transfer round: the from-record, the target record and
    /// the lsid limit.
    ///
    /// # Errors
    ///
    /// Fails on corrupt progress files.
    pub fn prepare_wlog_transfer(
        &self,
        permanent_lsid: u64,
        max_wlog_send_pb: u64,
    ) -> Result<(MetaLsidGid, MetaLsidGid, u64)> {
        let rec0 = self.done()?;
        let cap = rec0.lsid + max_wlog_send_pb;
        let queue = self.queue()?;
        let next = queue.iter().find(|r| r.lsid > rec0.lsid).copied();
        let (rec1, lsid_limit) = match next {
            Some(target) => {
                let limit = target.lsid.min(cap).min(permanent_lsid);
                (target, limit)
            }
            None => {
                let limit = cap.min(permanent_lsid);
                (
                    MetaLsidGid { lsid: limit, gid: rec0.gid + 1, timestamp: unix_time_now() },
                    limit,
                )
            }
        };
        Ok((rec0, rec1, lsid_limit))
    }

    /// The `MetaDiff` a round ending at `lsid_e` ships.
    #[must_use]
    pub fn get_transfer_diff(
        &self,
        rec0: &MetaLsidGid,
        rec1: &MetaLsidGid,
        lsid_e: u64,
    ) -> MetaDiff {
        let gid_e = if lsid_e == rec1.lsid { rec1.gid } else { rec0.gid + 1 };
        // A partial round that minted a gid at or past the pending
        // boundary renumbers it in finish_wlog_transfer.
        MetaDiff::new(rec0.gid, gid_e.max(rec0.gid + 1), true, unix_time_now())
    }

    /// Commit a round: advance the done-record to `lsid_e`, prune
    /// consumed boundaries and keep the remaining gids strictly
    /// monotonic. Returns true when pending boundaries remain.
    ///
    /// # Errors
    ///
    /// Fails on corrupt progress files or I/O error.
    pub fn finish_wlog_transfer(
        &self,
        rec0: &MetaLsidGid,
        rec1: &MetaLsidGid,
        lsid_e: u64,
    ) -> Result<bool> {
        let diff = self.get_transfer_diff(rec0, rec1, lsid_e);
        let done = MetaLsidGid { lsid: lsid_e, gid: diff.snap_e.gid_b, timestamp: diff.timestamp };
        self.set_done(done)?;

        let mut queue = self.queue()?;
        queue.retain(|r| r.lsid > lsid_e);
        let mut prev_gid = done.gid;
        for rec in &mut queue {
            if rec.gid <= prev_gid {
                rec.gid = prev_gid + 1;
            }
            prev_gid = rec.gid;
        }
        self.set_queue(&queue)?;
        Ok(!queue.is_empty())
    }

    /// Reset log progress after an operator reset or a new base
    /// backup: fresh uuid, done-record at `(lsid, gid)`, empty queue.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    pub fn reset_wlog(&self, gid: u64, lsid: u64) -> Result<()> {
        self.renew_uuid()?;
        self.set_done(MetaLsidGid { lsid, gid, timestamp: unix_time_now() })?;
        self.set_queue(&[])?;
        Ok(())
    }

    /// Human-readable status lines.
    ///
    /// # Errors
    ///
    /// Fails on corrupt files.
    pub fn status_lines(&self, verbose: bool) -> Result<Vec<String>> {
        let done = self.done()?;
        let (oldest_gid, latest_gid) = self.gid_range()?;
        let mut v = vec![
            format!("wdevPath {}", self.wdev_path()?),
            format!("sizeLb {}", self.size_lb()?),
            format!("sendLsid {}", done.lsid),
            format!("oldestGid {oldest_gid}"),
            format!("latestGid {latest_gid}"),
        ];
        if verbose {
            let uuid = self.uuid()?;
            let hex: String = uuid.iter().map(|b| format!("{b:02x}")).collect();
            v.push(format!("uuid {hex}"));
            for rec in self.queue()? {
                v.push(format!("pending {rec}"));
            }
        }
        Ok(v)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn make(dir: &TempDir) -> StorageVolInfo {
        let info = StorageVolInfo::new(dir.path(), "vol0");
        info.init("/dev/walb/0", 1 << 21).unwrap();
        info
    }

    #[test]
    fn test_init_and_reload() {
        let dir = TempDir::new().unwrap();
        let info = make(&dir);
        assert!(info.exists());
        assert_eq!(info.state().unwrap(), VolState::SyncReady);
        assert_eq!(info.wdev_path().unwrap(), "/dev/walb/0");
        assert_eq!(info.done().unwrap().lsid, 0);
        assert!(info.init("/dev/walb/0", 1).is_err());

        // A second handle sees the same persisted facts.
        let again = StorageVolInfo::new(dir.path(), "vol0");
        assert_eq!(again.uuid().unwrap(), info.uuid().unwrap());
    }

    #[test]
    fn test_snapshot_gid_reservation() {
        let dir = TempDir::new().unwrap();
        let info = make(&dir);
        // 250 pb of new log with 100-pb rounds: reserve 2 intermediate
        // gids, so the snapshot gets gid 3.
        let gid = info.take_snapshot(250, 100).unwrap();
        assert_eq!(gid, 3);
        // Same lsid again: same gid, no duplicate boundary.
        assert_eq!(info.take_snapshot(250, 100).unwrap(), 3);
        assert_eq!(info.queue().unwrap().len(), 1);
        assert!(info.take_snapshot(100, 100).is_err());
    }

    #[test]
    fn test_transfer_rounds_to_snapshot() {
        let dir = TempDir::new().unwrap();
        let info = make(&dir);
        let gid = info.take_snapshot(250, 100).unwrap();

        // Round 1: capped at 100 pb.
        let (rec0, rec1, limit) = info.prepare_wlog_transfer(250, 100).unwrap();
        assert_eq!(rec0.lsid, 0);
        assert_eq!(rec1.lsid, 250);
        assert_eq!(limit, 100);
        let diff = info.get_transfer_diff(&rec0, &rec1, 100);
        assert_eq!(diff.snap_b.gid_b, 0);
        assert_eq!(diff.snap_e.gid_b, 1);
        assert!(diff.is_mergeable);
        assert!(info.finish_wlog_transfer(&rec0, &rec1, 100).unwrap());

        // Round 2.
        let (rec0, rec1, limit) = info.prepare_wlog_transfer(250, 100).unwrap();
        assert_eq!(rec0.lsid, 100);
        assert_eq!(limit, 200);
        assert!(info.finish_wlog_transfer(&rec0, &rec1, 200).unwrap());

        // Round 3 reaches the snapshot boundary exactly.
        let (rec0, rec1, limit) = info.prepare_wlog_transfer(250, 100).unwrap();
        assert_eq!(limit, 250);
        let diff = info.get_transfer_diff(&rec0, &rec1, 250);
        assert_eq!(diff.snap_e.gid_b, gid);
        assert!(!info.finish_wlog_transfer(&rec0, &rec1, 250).unwrap());
        assert!(!info.is_required_wlog_transfer(250).unwrap());
    }

    #[test]
    fn test_chained_diffs_are_contiguous() {
        let dir = TempDir::new().unwrap();
        let info = make(&dir);
        let mut prev: Option<MetaDiff> = None;
        let mut permanent = 0u64;
        for _ in 0..5 {
            permanent += 70;
            let (rec0, rec1, limit) = info.prepare_wlog_transfer(permanent, 100).unwrap();
            let diff = info.get_transfer_diff(&rec0, &rec1, limit);
            if let Some(p) = prev {
                assert!(p.can_precede(&diff), "{p} then {diff}");
            }
            info.finish_wlog_transfer(&rec0, &rec1, limit).unwrap();
            prev = Some(diff);
        }
    }

    #[test]
    fn test_partial_round_renumbers_pending_boundary() {
        let dir = TempDir::new().unwrap();
        let info = make(&dir);
        // Boundary close by: within one round's cap.
        let gid = info.take_snapshot(50, 100).unwrap();
        assert_eq!(gid, 1);
        // Only 30 pb are durable: the round stops short of the
        // boundary and mints gid 1 itself.
        let (rec0, rec1, limit) = info.prepare_wlog_transfer(30, 100).unwrap();
        assert_eq!(limit, 30);
        let diff = info.get_transfer_diff(&rec0, &rec1, 30);
        assert_eq!(diff.snap_e.gid_b, 1);
        assert!(info.finish_wlog_transfer(&rec0, &rec1, 30).unwrap());
        // The pending boundary moved past the minted gid.
        let queue = info.queue().unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].gid, 2);
        assert_eq!(queue[0].lsid, 50);
    }

    #[test]
    fn test_reset_wlog() {
        let dir = TempDir::new().unwrap();
        let info = make(&dir);
        info.take_snapshot(100, 50).unwrap();
        let old_uuid = info.uuid().unwrap();
        info.reset_wlog(7, 100).unwrap();
        assert_eq!(info.done().unwrap().gid, 7);
        assert_eq!(info.done().unwrap().lsid, 100);
        assert!(info.queue().unwrap().is_empty());
        assert_ne!(info.uuid().unwrap(), old_uuid);
    }

    #[test]
    fn test_clear() {
        let dir = TempDir::new().unwrap();
        let info = make(&dir);
        info.clear().unwrap();
        assert!(!info.exists());
    }
}
