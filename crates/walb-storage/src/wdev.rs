//! Kernel-device control boundary.
//!
//! The storage host never touches the walb kernel module directly;
//! everything goes through [`WdevControl`]. [`SysfsWdev`] talks to a
//! real device via its sysfs attributes; [`FakeWdev`] backs tests and
//! local experiments with a plain image file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use walb_core::{Error, Result};

/// The four distinguished log positions of a device.
///
/// Invariant: `oldest <= written <= permanent <= latest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LsidSet {
    /// Ring-buffer tail; everything before is reclaimed.
    pub oldest: u64,
    /// Flushed to the data device.
    pub written: u64,
    /// Durable on the log device.
    pub permanent: u64,
    /// Accepted by the kernel.
    pub latest: u64,
}

impl LsidSet {
    /// True iff the ordering invariant holds.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.oldest <= self.written && self.written <= self.permanent && self.permanent <= self.latest
    }
}

/// Control operations on one walb device.
#[async_trait]
pub trait WdevControl: Send + Sync {
    /// Kernel name of the device.
    fn wdev_name(&self) -> &str;

    /// Path of the raw log device (read side).
    fn wldev_path(&self) -> PathBuf;

    /// Path of the block device holding the volume data.
    fn data_path(&self) -> PathBuf;

    /// Read the current lsid positions.
    async fn lsid_set(&self) -> Result<LsidSet>;

    /// Volume size [lb].
    async fn size_lb(&self) -> Result<u64>;

    /// True when the ring buffer has overflowed.
    async fn is_overflow(&self) -> Result<bool>;

    /// Release log blocks with `lsid < end_lsid`. Returns the number
    /// of physical blocks still held after the release.
    async fn erase_wal(&self, end_lsid: u64) -> Result<u64>;

    /// Clear the whole log (operator reset). The lsid positions
    /// collapse onto `latest` and the overflow flag clears.
    async fn reset_wal(&self) -> Result<()>;

    /// Grow the exported device to `new_size_lb`.
    async fn resize(&self, new_size_lb: u64) -> Result<()>;
}

/// A real walb device driven through sysfs.
///
/// Attribute layout: `/sys/block/walb!<name>/walb/{lsids,log_usage,
/// log_capacity,overflow,oldest_lsid,size_lb}`.
pub struct SysfsWdev {
    name: String,
    sysfs_dir: PathBuf,
    wldev_path: PathBuf,
    data_path: PathBuf,
}

impl SysfsWdev {
    /// Bind to the device named `name`.
    #[must_use]
    pub fn new(name: &str, wldev_path: PathBuf) -> Self {
        Self {
            name: name.to_string(),
            sysfs_dir: PathBuf::from(format!("/sys/block/walb!{name}/walb")),
            wldev_path,
            data_path: PathBuf::from(format!("/dev/walb/{name}")),
        }
    }

    fn attr(&self, name: &str) -> Result<String> {
        let path = self.sysfs_dir.join(name);
        Ok(std::fs::read_to_string(&path)?.trim().to_string())
    }

    fn attr_u64(&self, name: &str) -> Result<u64> {
        let s = self.attr(name)?;
        s.parse().map_err(|_| Error::format(format!("bad sysfs attribute {name}: {s:?}")))
    }

    fn write_attr(&self, name: &str, value: &str) -> Result<()> {
        let path = self.sysfs_dir.join(name);
        std::fs::write(&path, value)?;
        Ok(())
    }
}

#[async_trait]
impl WdevControl for SysfsWdev {
    fn wdev_name(&self) -> &str {
        &self.name
    }

    fn wldev_path(&self) -> PathBuf {
        self.wldev_path.clone()
    }

    fn data_path(&self) -> PathBuf {
        self.data_path.clone()
    }

    async fn lsid_set(&self) -> Result<LsidSet> {
        // The `lsids` attribute is `name value` per line.
        let text = self.attr("lsids")?;
        let mut set = LsidSet::default();
        for line in text.lines() {
            let mut it = line.split_whitespace();
            let (Some(key), Some(value)) = (it.next(), it.next()) else { continue };
            let value: u64 = value
                .parse()
                .map_err(|_| Error::format(format!("bad lsids line {line:?}")))?;
            match key {
                "oldest" => set.oldest = value,
                "written" => set.written = value,
                "permanent" => set.permanent = value,
                "latest" => set.latest = value,
                _ => {}
            }
        }
        if !set.is_valid() {
            return Err(Error::format(format!("inconsistent lsids: {set:?}")));
        }
        Ok(set)
    }

    async fn size_lb(&self) -> Result<u64> {
        self.attr_u64("size_lb")
    }

    async fn is_overflow(&self) -> Result<bool> {
        Ok(self.attr_u64("overflow")? != 0)
    }

    async fn erase_wal(&self, end_lsid: u64) -> Result<u64> {
        self.write_attr("oldest_lsid", &end_lsid.to_string())?;
        let set = self.lsid_set().await?;
        Ok(set.permanent.saturating_sub(set.oldest))
    }

    async fn reset_wal(&self) -> Result<()> {
        self.write_attr("reset_wal", "1")
    }

    async fn resize(&self, new_size_lb: u64) -> Result<()> {
        self.write_attr("size_lb", &new_size_lb.to_string())
    }
}

#[derive(Debug, Default)]
struct FakeWdevState {
    lsids: LsidSet,
    overflow: bool,
    size_lb: u64,
}

/// An in-process device simulation over image files.
///
/// Tests (and local experiments) create the log-device image with the
/// codec crate, then drive the lsid positions explicitly.
#[derive(Clone)]
pub struct FakeWdev {
    name: String,
    wldev_path: PathBuf,
    data_path: PathBuf,
    state: Arc<Mutex<FakeWdevState>>,
}

impl FakeWdev {
    /// Create a simulated device over existing image files.
    #[must_use]
    pub fn new(name: &str, wldev_path: &Path, data_path: &Path, size_lb: u64) -> Self {
        Self {
            name: name.to_string(),
            wldev_path: wldev_path.to_path_buf(),
            data_path: data_path.to_path_buf(),
            state: Arc::new(Mutex::new(FakeWdevState {
                lsids: LsidSet::default(),
                overflow: false,
                size_lb,
            })),
        }
    }

    /// Advance the durable log position, as the kernel would after
    /// accepting and flushing writes.
    pub fn advance_permanent(&self, lsid: u64) {
        let mut st = self.state.lock();
        st.lsids.written = st.lsids.written.max(lsid);
        st.lsids.permanent = st.lsids.permanent.max(lsid);
        st.lsids.latest = st.lsids.latest.max(lsid);
    }

    /// Raise or clear the overflow flag.
    pub fn set_overflow(&self, overflow: bool) {
        self.state.lock().overflow = overflow;
    }

    /// Current positions (test inspection).
    #[must_use]
    pub fn lsids(&self) -> LsidSet {
        self.state.lock().lsids
    }
}

#[async_trait]
impl WdevControl for FakeWdev {
    fn wdev_name(&self) -> &str {
        &self.name
    }

    fn wldev_path(&self) -> PathBuf {
        self.wldev_path.clone()
    }

    fn data_path(&self) -> PathBuf {
        self.data_path.clone()
    }

    async fn lsid_set(&self) -> Result<LsidSet> {
        Ok(self.state.lock().lsids)
    }

    async fn size_lb(&self) -> Result<u64> {
        Ok(self.state.lock().size_lb)
    }

    async fn is_overflow(&self) -> Result<bool> {
        Ok(self.state.lock().overflow)
    }

    async fn erase_wal(&self, end_lsid: u64) -> Result<u64> {
        let mut st = self.state.lock();
        if end_lsid > st.lsids.permanent {
            return Err(Error::format(format!(
                "cannot erase beyond permanent lsid {} (asked {end_lsid})",
                st.lsids.permanent
            )));
        }
        st.lsids.oldest = st.lsids.oldest.max(end_lsid);
        Ok(st.lsids.permanent - st.lsids.oldest)
    }

    async fn reset_wal(&self) -> Result<()> {
        let mut st = self.state.lock();
        let latest = st.lsids.latest;
        st.lsids = LsidSet { oldest: latest, written: latest, permanent: latest, latest };
        st.overflow = false;
        Ok(())
    }

    async fn resize(&self, new_size_lb: u64) -> Result<()> {
        let mut st = self.state.lock();
        if new_size_lb < st.size_lb {
            return Err(Error::Config("shrink is not supported".to_string()));
        }
        st.size_lb = new_size_lb;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fake_wdev_lifecycle() {
        let dev = FakeWdev::new("w0", Path::new("/tmp/l"), Path::new("/tmp/d"), 1 << 20);
        dev.advance_permanent(100);
        let set = dev.lsid_set().await.unwrap();
        assert_eq!(set.permanent, 100);
        assert!(set.is_valid());

        assert_eq!(dev.erase_wal(60).await.unwrap(), 40);
        assert_eq!(dev.lsids().oldest, 60);
        assert!(dev.erase_wal(200).await.is_err());

        dev.set_overflow(true);
        assert!(dev.is_overflow().await.unwrap());
        dev.reset_wal().await.unwrap();
        assert!(!dev.is_overflow().await.unwrap());
        assert_eq!(dev.lsids().oldest, 100);
    }

    #[tokio::test]
    async fn test_fake_wdev_resize() {
        let dev = FakeWdev::new("w0", Path::new("/tmp/l"), Path::new("/tmp/d"), 100);
        assert!(dev.resize(50).await.is_err());
        dev.resize(200).await.unwrap();
        assert_eq!(dev.size_lb().await.unwrap(), 200);
    }
}
