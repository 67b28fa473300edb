//! In-flight action counters.
//!
//! Long-running background actions register here; transitions that
//! require quiescence wait until every counter of interest is zero.
//! The wlog-send counter doubles as the per-volume mutual exclusion of
//! transfers.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use walb_core::{Error, Result};

/// Action name: wlog transfer to a proxy.
pub const ACTION_WLOG_SEND: &str = "WlogSend";
/// Action name: wlog removal on a standby volume.
pub const ACTION_WLOG_REMOVE: &str = "WlogRemove";

/// The full action set checked for quiescence.
pub const ALL_ACTIONS: &[&str] = &[ACTION_WLOG_SEND, ACTION_WLOG_REMOVE];

/// Named in-flight counters of one volume.
#[derive(Debug, Default)]
pub struct ActionCounters {
    counts: Mutex<HashMap<&'static str, usize>>,
    changed: Notify,
}

impl ActionCounters {
    /// Create empty counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of one counter.
    #[must_use]
    pub fn value(&self, name: &str) -> usize {
        self.counts.lock().get(name).copied().unwrap_or(0)
    }

    /// True iff every named counter is zero.
    #[must_use]
    pub fn is_all_zero(&self, names: &[&str]) -> bool {
        let counts = self.counts.lock();
        names.iter().all(|n| counts.get(n).copied().unwrap_or(0) == 0)
    }

    /// Fail when any named action is running.
    ///
    /// # Errors
    ///
    /// Returns a state-violation error naming the running action.
    pub fn verify_none_running(&self, names: &[&str], op: &str) -> Result<()> {
        let counts = self.counts.lock();
        for name in names {
            if counts.get(name).copied().unwrap_or(0) > 0 {
                return Err(Error::state(op, format!("action {name} running")));
            }
        }
        Ok(())
    }

    /// Register an action; the guard deregisters on drop.
    #[must_use]
    pub fn begin(self: &Arc<Self>, name: &'static str) -> ActionGuard {
        *self.counts.lock().entry(name).or_insert(0) += 1;
        ActionGuard { counters: Arc::clone(self), name }
    }

    /// Wait until every named counter reaches zero.
    pub async fn wait_all_zero(&self, names: &[&str]) {
        loop {
            let waiter = self.changed.notified();
            if self.is_all_zero(names) {
                return;
            }
            waiter.await;
        }
    }

    /// Status lines: `name count` per non-zero counter.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, usize)> {
        let counts = self.counts.lock();
        let mut v: Vec<(String, usize)> =
            counts.iter().filter(|(_, &c)| c > 0).map(|(n, &c)| ((*n).to_string(), c)).collect();
        v.sort();
        v
    }
}

/// Guard of one running action.
pub struct ActionGuard {
    counters: Arc<ActionCounters>,
    name: &'static str,
}

impl Drop for ActionGuard {
    fn drop(&mut self) {
        let mut counts = self.counters.counts.lock();
        if let Some(c) = counts.get_mut(self.name) {
            *c = c.saturating_sub(1);
        }
        drop(counts);
        self.counters.changed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_and_drop() {
        let ac = Arc::new(ActionCounters::new());
        assert!(ac.is_all_zero(ALL_ACTIONS));
        let g = ac.begin(ACTION_WLOG_SEND);
        assert_eq!(ac.value(ACTION_WLOG_SEND), 1);
        assert!(ac.verify_none_running(ALL_ACTIONS, "stop").is_err());
        drop(g);
        assert!(ac.is_all_zero(ALL_ACTIONS));
    }

    #[tokio::test]
    async fn test_wait_all_zero() {
        let ac = Arc::new(ActionCounters::new());
        let g = ac.begin(ACTION_WLOG_REMOVE);
        let waiter = {
            let ac = Arc::clone(&ac);
            tokio::spawn(async move {
                ac.wait_all_zero(ALL_ACTIONS).await;
            })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        drop(g);
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("waiter must wake")
            .unwrap();
    }
}
