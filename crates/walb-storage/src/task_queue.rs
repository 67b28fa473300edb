//! Delayed-retry task queue.
//!
//! One pending entry per volume, keyed by due-time on the monotonic
//! clock. `push` coalesces (the earlier due-time wins), `push_force`
//! always overrides. Dispatcher workers pop due entries and run the
//! storage worker on each.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

/// A due-time keyed queue with per-key coalescing.
#[derive(Debug)]
pub struct TaskQueue<T: Clone + Eq + Hash> {
    due: Mutex<HashMap<T, Instant>>,
    changed: Notify,
}

impl<T: Clone + Eq + Hash> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Eq + Hash> TaskQueue<T> {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self { due: Mutex::new(HashMap::new()), changed: Notify::new() }
    }

    /// Schedule `task` after `delay`. An existing entry keeps the
    /// earlier due-time.
    pub fn push(&self, task: T, delay: Duration) {
        let due_at = Instant::now() + delay;
        {
            let mut due = self.due.lock();
            let entry = due.entry(task).or_insert(due_at);
            if due_at < *entry {
                *entry = due_at;
            }
        }
        self.changed.notify_waiters();
    }

    /// Schedule `task` after `delay`, overriding any existing entry.
    pub fn push_force(&self, task: T, delay: Duration) {
        let due_at = Instant::now() + delay;
        self.due.lock().insert(task, due_at);
        self.changed.notify_waiters();
    }

    /// Remove every entry matching the predicate.
    pub fn remove_if(&self, pred: impl Fn(&T) -> bool) {
        self.due.lock().retain(|task, _| !pred(task));
        self.changed.notify_waiters();
    }

    /// Number of pending entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.due.lock().len()
    }

    /// True iff no entry is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.due.lock().is_empty()
    }

    /// Pending entries with their remaining delay in milliseconds
    /// (negative when overdue).
    #[must_use]
    pub fn snapshot(&self) -> Vec<(T, i64)> {
        let now = Instant::now();
        self.due
            .lock()
            .iter()
            .map(|(task, &due_at)| {
                let ms = if due_at >= now {
                    (due_at - now).as_millis() as i64
                } else {
                    -((now - due_at).as_millis() as i64)
                };
                (task.clone(), ms)
            })
            .collect()
    }

    fn pop_due(&self) -> std::result::Result<T, Option<Instant>> {
        let mut due = self.due.lock();
        let now = Instant::now();
        match due.iter().min_by_key(|(_, &at)| at) {
            None => Err(None),
            Some((task, &at)) if at <= now => {
                let task = task.clone();
                due.remove(&task);
                Ok(task)
            }
            Some((_, &at)) => Err(Some(at)),
        }
    }

    /// Wait for and remove the next due entry.
    pub async fn pop(&self) -> T {
        loop {
            let waiter = self.changed.notified();
            match self.pop_due() {
                Ok(task) => return task,
                Err(None) => waiter.await,
                Err(Some(at)) => {
                    tokio::select! {
                        () = waiter => {}
                        () = tokio::time::sleep_until(tokio::time::Instant::from_std(at)) => {}
                    }
                }
            }
        }
    }
}
