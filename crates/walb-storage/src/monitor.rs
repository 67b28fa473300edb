//! Background loops: wdev monitor, proxy monitor, dispatcher workers.
//!
//! Every loop is a tokio task that exits when the shutdown channel
//! flips. Workers catch errors at the top of their loop, log with
//! volume context and continue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use metrics::gauge;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::context::StorageContext;
use crate::wdev::WdevControl;
use crate::worker::run_storage_task;

/// Poll interval of the wdev monitor.
const WDEV_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Delay applied to monitor-triggered tasks, so wlogs transfer in
/// bulk.
const WDEV_NOTIFY_DELAY: Duration = Duration::from_secs(1);

/// Tick interval of the proxy monitor.
const PROXY_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Watch every monitored device for advance of its durable log
/// position and queue the owning volume.
pub async fn run_wdev_monitor(ctx: Arc<StorageContext>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(WDEV_POLL_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_permanent: HashMap<String, u64> = HashMap::new();

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => {
                info!("wdev monitor shutting down");
                break;
            }
        }
        for vol_id in ctx.monitored_vols() {
            let dev = match ctx.wdev(&vol_id) {
                Ok(dev) => dev,
                Err(e) => {
                    error!(%vol_id, error = %e, "wdev monitor lost device handle");
                    continue;
                }
            };
            match dev.lsid_set().await {
                Ok(lsids) => {
                    let prev = last_permanent.insert(vol_id.clone(), lsids.permanent);
                    if prev.is_some_and(|p| p < lsids.permanent) || prev.is_none() {
                        debug!(%vol_id, permanent = lsids.permanent, "durable log advanced");
                        ctx.push_task(&vol_id, WDEV_NOTIFY_DELAY);
                    }
                }
                Err(e) => error!(%vol_id, error = %e, "wdev monitor poll failed"),
            }
        }
    }
}

/// Periodically re-check the stalest proxy.
pub async fn run_proxy_monitor(ctx: Arc<StorageContext>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(PROXY_CHECK_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => {
                info!("proxy monitor shutting down");
                break;
            }
        }
        ctx.proxies.try_check_availability().await;
    }
}

/// Run `n_workers` dispatcher tasks draining the task queue.
///
/// Returns the join handles; they finish when the shutdown channel
/// flips.
pub fn spawn_dispatchers(
    ctx: &Arc<StorageContext>,
    n_workers: usize,
    shutdown: &watch::Receiver<bool>,
) -> Vec<tokio::task::JoinHandle<()>> {
    (0..n_workers)
        .map(|worker_id| {
            let ctx = Arc::clone(ctx);
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let vol_id = tokio::select! {
                        vol_id = ctx.task_queue.pop() => vol_id,
                        _ = shutdown.changed() => {
                            debug!(worker_id, "dispatcher shutting down");
                            break;
                        }
                    };
                    gauge!("walb_storage_task_queue_depth").set(ctx.task_queue.len() as f64);
                    if let Err(e) = run_storage_task(&ctx, &vol_id).await {
                        error!(worker_id, %vol_id, error = %e, "storage task failed");
                    }
                }
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use walb_core::StorageConfig;

    use super::*;
    use crate::wdev::FakeWdev;

    #[tokio::test]
    async fn test_wdev_monitor_pushes_task() {
        let dir = TempDir::new().unwrap();
        let config = StorageConfig {
            base_dir: dir.path().to_path_buf(),
            ..StorageConfig::default()
        };
        let ctx = StorageContext::new(config);

        let img = dir.path().join("wldev.img");
        std::fs::write(&img, b"").unwrap();
        let info = ctx.vol_info("vol0");
        info.init("/dev/walb/0", 1 << 20).unwrap();
        let dev = FakeWdev::new("w0", &img, &img, 1 << 20);
        ctx.register_wdev("vol0", Arc::new(dev.clone()));
        ctx.start_monitoring("vol0").unwrap();
        // Drain the initial task queued by start_monitoring.
        let _ = ctx.task_queue.pop().await;

        let (tx, rx) = watch::channel(false);
        let monitor = tokio::spawn(run_wdev_monitor(Arc::clone(&ctx), rx));

        dev.advance_permanent(128);
        let vol_id =
            tokio::time::timeout(Duration::from_secs(5), ctx.task_queue.pop()).await.unwrap();
        assert_eq!(vol_id, "vol0");

        tx.send(true).unwrap();
        monitor.await.unwrap();
    }
}
