//! Process-wide storage context.
//!
//! All shared state lives here and is threaded through handlers
//! explicitly; there are no globals. Workers address volumes by id
//! through the context maps, never by back-pointers.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;
use walb_core::{Error, Result, StopFlag, StorageConfig};

use crate::action::ActionCounters;
use crate::proxy::ProxyManager;
use crate::state::{StateMachine, VolState};
use crate::task_queue::TaskQueue;
use crate::volinfo::StorageVolInfo;
use crate::wdev::{SysfsWdev, WdevControl};

/// Process lifecycle flags.
#[derive(Debug, Default)]
pub struct ProcessStatus {
    shutdown: AtomicBool,
    force: AtomicBool,
}

impl ProcessStatus {
    /// Request shutdown; `force` aborts long-running work at the next
    /// checkpoint.
    pub fn set_shutdown(&self, force: bool) {
        self.shutdown.store(true, Ordering::Release);
        if force {
            self.force.store(true, Ordering::Release);
        }
    }

    /// True once shutdown was requested.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// True once force shutdown was requested.
    #[must_use]
    pub fn is_force_shutdown(&self) -> bool {
        self.force.load(Ordering::Acquire)
    }

    /// The raw force flag, for protocol clients that poll it.
    #[must_use]
    pub fn force_flag(&self) -> &AtomicBool {
        &self.force
    }
}

/// Live (non-persisted) state of one volume.
pub struct VolStateRuntime {
    /// Stop request flag.
    pub stop: Arc<StopFlag>,
    /// State machine cursor.
    pub sm: StateMachine,
    /// In-flight action counters.
    pub ac: Arc<ActionCounters>,
}

impl VolStateRuntime {
    fn new(initial: VolState) -> Self {
        Self {
            stop: Arc::new(StopFlag::default()),
            sm: StateMachine::new(initial),
            ac: Arc::new(ActionCounters::new()),
        }
    }
}

/// Builds a device control from a wdev path.
pub type WdevFactory = Box<dyn Fn(&str) -> Arc<dyn WdevControl> + Send + Sync>;

/// The storage host's shared state.
pub struct StorageContext {
    /// Static configuration.
    pub config: StorageConfig,
    /// Process lifecycle flags.
    pub ps: ProcessStatus,
    /// Volume task queue.
    pub task_queue: TaskQueue<String>,
    /// Proxy availability.
    pub proxies: ProxyManager,
    vols: DashMap<String, Arc<VolStateRuntime>>,
    wdevs: DashMap<String, Arc<dyn WdevControl>>,
    wdev_names: DashMap<String, String>,
    monitored: DashMap<String, ()>,
    foreground: AtomicUsize,
    wdev_factory: WdevFactory,
}

impl StorageContext {
    /// Create a context with the default (sysfs) device factory.
    #[must_use]
    pub fn new(config: StorageConfig) -> Arc<Self> {
        Self::with_wdev_factory(
            config,
            Box::new(|wdev_path: &str| {
                let name = wdev_path.rsplit('/').next().unwrap_or(wdev_path).to_string();
                let wldev = format!("/dev/walb/L{name}");
                Arc::new(SysfsWdev::new(&name, wldev.into())) as Arc<dyn WdevControl>
            }),
        )
    }

    /// Create a context with an explicit device factory (tests use
    /// this to install [`crate::wdev::FakeWdev`]).
    #[must_use]
    pub fn with_wdev_factory(config: StorageConfig, wdev_factory: WdevFactory) -> Arc<Self> {
        let proxies = ProxyManager::new(
            &config.node_id,
            &config.proxies,
            config.proxy_heartbeat_interval(),
            config.proxy_heartbeat_socket_timeout(),
        );
        Arc::new(Self {
            config,
            ps: ProcessStatus::default(),
            task_queue: TaskQueue::new(),
            proxies,
            vols: DashMap::new(),
            wdevs: DashMap::new(),
            wdev_names: DashMap::new(),
            monitored: DashMap::new(),
            foreground: AtomicUsize::new(0),
            wdev_factory,
        })
    }

    /// Persistent-state handle for a volume.
    #[must_use]
    pub fn vol_info(&self, vol_id: &str) -> StorageVolInfo {
        StorageVolInfo::new(&self.config.base_dir, vol_id)
    }

    /// Live state of a volume, created on first access from the
    /// persisted state (or `Clear` when none exists).
    #[must_use]
    pub fn vol_state(&self, vol_id: &str) -> Arc<VolStateRuntime> {
        if let Some(st) = self.vols.get(vol_id) {
            return Arc::clone(&st);
        }
        let info = self.vol_info(vol_id);
        let initial = if info.exists() {
            info.state().unwrap_or(VolState::Clear)
        } else {
            VolState::Clear
        };
        let st = Arc::new(VolStateRuntime::new(initial));
        self.vols.entry(vol_id.to_string()).or_insert(st).clone()
    }

    /// All volume ids with on-disk state.
    #[must_use]
    pub fn vol_list(&self) -> Vec<String> {
        let mut v: Vec<String> = std::fs::read_dir(&self.config.base_dir)
            .into_iter()
            .flatten()
            .flatten()
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        v.sort();
        v
    }

    /// Register an explicit device control for a volume (tests).
    pub fn register_wdev(&self, vol_id: &str, wdev: Arc<dyn WdevControl>) {
        self.wdevs.insert(vol_id.to_string(), wdev);
    }

    /// Device control for a volume, built via the factory on first
    /// access.
    ///
    /// # Errors
    ///
    /// Fails when the volume has no persisted wdev path.
    pub fn wdev(&self, vol_id: &str) -> Result<Arc<dyn WdevControl>> {
        if let Some(dev) = self.wdevs.get(vol_id) {
            return Ok(Arc::clone(&dev));
        }
        let path = self.vol_info(vol_id).wdev_path()?;
        let dev = (self.wdev_factory)(&path);
        self.wdevs.insert(vol_id.to_string(), Arc::clone(&dev));
        Ok(dev)
    }

    /// Map a kernel device name back to its volume.
    #[must_use]
    pub fn vol_id_of_wdev(&self, wdev_name: &str) -> Option<String> {
        self.wdev_names.get(wdev_name).map(|v| v.clone())
    }

    /// Begin monitoring a volume's device: register the name map and
    /// queue an initial task.
    ///
    /// # Errors
    ///
    /// Fails when the device name is already claimed by another
    /// volume.
    pub fn start_monitoring(&self, vol_id: &str) -> Result<()> {
        let dev = self.wdev(vol_id)?;
        let name = dev.wdev_name().to_string();
        if let Some(existing) = self.vol_id_of_wdev(&name) {
            if existing != vol_id {
                return Err(Error::Config(format!(
                    "wdev {name} is already used by volume {existing}"
                )));
            }
        }
        self.wdev_names.insert(name, vol_id.to_string());
        self.monitored.insert(vol_id.to_string(), ());
        self.push_task(vol_id, Duration::ZERO);
        Ok(())
    }

    /// Stop monitoring a volume and drop its queued tasks.
    pub fn stop_monitoring(&self, vol_id: &str) {
        if let Ok(dev) = self.wdev(vol_id) {
            self.wdev_names.remove(dev.wdev_name());
        }
        self.monitored.remove(vol_id);
        let vol_id = vol_id.to_string();
        self.task_queue.remove_if(|t| *t == vol_id);
    }

    /// True while the volume's device is monitored.
    #[must_use]
    pub fn is_under_monitoring(&self, vol_id: &str) -> bool {
        self.monitored.contains_key(vol_id)
    }

    /// Volumes currently monitored.
    #[must_use]
    pub fn monitored_vols(&self) -> Vec<String> {
        self.monitored.iter().map(|e| e.key().clone()).collect()
    }

    /// Queue a volume task (coalescing).
    pub fn push_task(&self, vol_id: &str, delay: Duration) {
        debug!(vol_id, delay_ms = delay.as_millis() as u64, "push task");
        self.task_queue.push(vol_id.to_string(), delay);
    }

    /// Queue a volume task, overriding any pending entry.
    pub fn push_task_force(&self, vol_id: &str, delay: Duration) {
        debug!(vol_id, delay_ms = delay.as_millis() as u64, "push task force");
        self.task_queue.push_force(vol_id.to_string(), delay);
    }

    /// Claim a foreground-task slot (backup protocols).
    ///
    /// # Errors
    ///
    /// Fails when `max_foreground_tasks` are already running.
    pub fn begin_foreground(self: &Arc<Self>) -> Result<ForegroundGuard> {
        let prev = self.foreground.fetch_add(1, Ordering::AcqRel);
        if prev >= self.config.max_foreground_tasks {
            self.foreground.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::state(
                "foreground task",
                format!("{prev} tasks already running"),
            ));
        }
        Ok(ForegroundGuard { ctx: Arc::clone(self) })
    }
}

/// Guard of one running foreground task.
pub struct ForegroundGuard {
    ctx: Arc<StorageContext>,
}

impl Drop for ForegroundGuard {
    fn drop(&mut self) {
        self.ctx.foreground.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn test_config(dir: &TempDir) -> StorageConfig {
        StorageConfig {
            base_dir: dir.path().to_path_buf(),
            max_foreground_tasks: 1,
            ..StorageConfig::default()
        }
    }

    #[test]
    fn test_vol_state_from_disk() {
        let dir = TempDir::new().unwrap();
        let ctx = StorageContext::new(test_config(&dir));

        // Unknown volume starts Clear.
        assert_eq!(ctx.vol_state("vol0").sm.get(), VolState::Clear);

        // A persisted volume resumes its stored state.
        let info = ctx.vol_info("vol1");
        info.init("/dev/walb/1", 1 << 20).unwrap();
        info.set_state(VolState::Stopped).unwrap();
        assert_eq!(ctx.vol_state("vol1").sm.get(), VolState::Stopped);
        assert_eq!(ctx.vol_list(), vec!["vol1".to_string()]);
    }

    #[test]
    fn test_foreground_limit() {
        let dir = TempDir::new().unwrap();
        let ctx = StorageContext::new(test_config(&dir));
        let g1 = ctx.begin_foreground().unwrap();
        assert!(ctx.begin_foreground().is_err());
        drop(g1);
        assert!(ctx.begin_foreground().is_ok());
    }

    #[test]
    fn test_monitoring_registry() {
        let dir = TempDir::new().unwrap();
        let ctx = StorageContext::new(test_config(&dir));
        let img = dir.path().join("wldev.img");
        std::fs::write(&img, b"").unwrap();
        let info = ctx.vol_info("vol0");
        info.init("/dev/walb/0", 1 << 20).unwrap();
        ctx.register_wdev(
            "vol0",
            Arc::new(crate::wdev::FakeWdev::new("w0", &img, &img, 1 << 20)),
        );

        ctx.start_monitoring("vol0").unwrap();
        assert!(ctx.is_under_monitoring("vol0"));
        assert_eq!(ctx.vol_id_of_wdev("w0").unwrap(), "vol0");
        assert_eq!(ctx.task_queue.len(), 1);

        ctx.stop_monitoring("vol0");
        assert!(!ctx.is_under_monitoring("vol0"));
        assert!(ctx.task_queue.is_empty());
        assert!(ctx.vol_id_of_wdev("w0").is_none());
    }
}
