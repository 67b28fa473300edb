//! Cooperative-stop primitives.
//!
//! Long-running operations poll a shared [`StopState`] at every loop
//! boundary. `Stopping` drains at the next safe boundary; `ForceStopping`
//! aborts within one iteration. No thread or task is ever killed.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// The stop request level of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StopState {
    /// Normal operation.
    NotStopping = 0,
    /// Drain in-flight work at the next safe boundary.
    Stopping = 1,
    /// Abort at the next checkpoint.
    ForceStopping = 2,
}

impl StopState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Stopping,
            2 => Self::ForceStopping,
            _ => Self::NotStopping,
        }
    }

    /// Short name for status output.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NotStopping => "NotStopping",
            Self::Stopping => "Stopping",
            Self::ForceStopping => "ForceStopping",
        }
    }
}

/// Shared stop flag, one per volume.
#[derive(Debug, Default)]
pub struct StopFlag(AtomicU8);

impl StopFlag {
    /// Current state.
    #[must_use]
    pub fn get(&self) -> StopState {
        StopState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// True iff a force stop was requested.
    #[must_use]
    pub fn is_force(&self) -> bool {
        self.get() == StopState::ForceStopping
    }

    fn set(&self, st: StopState) {
        self.0.store(st as u8, Ordering::Release);
    }

    /// Transition from `NotStopping` to `target`; fails when another
    /// stop request is already in progress.
    fn try_begin(&self, target: StopState) -> bool {
        self.0
            .compare_exchange(
                StopState::NotStopping as u8,
                target as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// Guard that owns an in-progress stop request and restores
/// `NotStopping` when dropped.
pub struct Stopper {
    flag: Arc<StopFlag>,
    armed: bool,
}

impl Stopper {
    /// Begin a stop request. Returns `None` when a request is already
    /// in progress.
    #[must_use]
    pub fn begin(flag: Arc<StopFlag>, force: bool) -> Option<Self> {
        let target = if force { StopState::ForceStopping } else { StopState::Stopping };
        if flag.try_begin(target) {
            Some(Self { flag, armed: true })
        } else {
            None
        }
    }

    /// Keep the stop state set past the guard's lifetime.
    pub fn forget(mut self) {
        self.armed = false;
    }
}

impl Drop for Stopper {
    fn drop(&mut self) {
        if self.armed {
            self.flag.set(StopState::NotStopping);
        }
    }
}

/// Fails with a state-violation error when a stop is in progress.
///
/// # Errors
///
/// Returns [`crate::Error::State`] when the volume is stopping.
pub fn verify_not_stopping(flag: &StopFlag, vol_id: &str, op: &str) -> crate::Result<()> {
    let st = flag.get();
    if st == StopState::NotStopping {
        Ok(())
    } else {
        Err(crate::Error::state(op, format!("{vol_id}:{}", st.as_str())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stopper_exclusive() {
        let flag = Arc::new(StopFlag::default());
        let s1 = Stopper::begin(flag.clone(), false).unwrap();
        assert_eq!(flag.get(), StopState::Stopping);
        // A second request must be refused while one is in progress.
        assert!(Stopper::begin(flag.clone(), true).is_none());
        drop(s1);
        assert_eq!(flag.get(), StopState::NotStopping);
    }

    #[test]
    fn test_force_flag() {
        let flag = Arc::new(StopFlag::default());
        let _s = Stopper::begin(flag.clone(), true).unwrap();
        assert!(flag.is_force());
        assert!(verify_not_stopping(&flag, "vol0", "snapshot").is_err());
    }
}
