//! Per-volume state machine.
//!
//! Steady states hold between operations; every multi-step operation
//! moves through a transition pseudo-state guarded by a
//! [`StateTransaction`] that rolls back to the from-state unless
//! committed. Transitions are a total function over a fixed edge
//! table; unknown edges fail fast with a state-violation error.

use parking_lot::Mutex;
use walb_core::{Error, Result};

/// Volume lifecycle states, steady and transitional.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolState {
    /// No volume data exists.
    Clear,
    /// Initialized, waiting for a backup to establish a base.
    SyncReady,
    /// Log monitored and shipped to proxies.
    Target,
    /// Log monitored and discarded (secondary storage).
    Standby,
    /// Monitoring stopped; transfer can be restarted.
    Stopped,
    /// init-vol in progress.
    InitVol,
    /// clear-vol in progress.
    ClearVol,
    /// full backup in progress.
    FullSync,
    /// hash backup in progress.
    HashSync,
    /// start(target) in progress.
    StartTarget,
    /// stop of a target in progress.
    StopTarget,
    /// start(standby) in progress.
    StartStandby,
    /// stop of a standby in progress.
    StopStandby,
    /// reset-vol in progress.
    Reset,
}

impl VolState {
    /// Status / persistence name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Clear => "Clear",
            Self::SyncReady => "SyncReady",
            Self::Target => "Target",
            Self::Standby => "Standby",
            Self::Stopped => "Stopped",
            Self::InitVol => "InitVol",
            Self::ClearVol => "ClearVol",
            Self::FullSync => "FullSync",
            Self::HashSync => "HashSync",
            Self::StartTarget => "StartTarget",
            Self::StopTarget => "StopTarget",
            Self::StartStandby => "StartStandby",
            Self::StopStandby => "StopStandby",
            Self::Reset => "Reset",
        }
    }

    /// Parse a persisted steady state.
    ///
    /// # Errors
    ///
    /// Fails on an unknown or non-steady name.
    pub fn parse_steady(s: &str) -> Result<Self> {
        match s {
            "Clear" => Ok(Self::Clear),
            "SyncReady" => Ok(Self::SyncReady),
            "Target" => Ok(Self::Target),
            "Standby" => Ok(Self::Standby),
            "Stopped" => Ok(Self::Stopped),
            other => Err(Error::format(format!("unknown volume state {other:?}"))),
        }
    }

    /// True for the five steady states.
    #[must_use]
    pub const fn is_steady(&self) -> bool {
        matches!(
            self,
            Self::Clear | Self::SyncReady | Self::Target | Self::Standby | Self::Stopped
        )
    }
}

impl std::fmt::Display for VolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// (from, pseudo, to) edges. Every legal multi-step operation is one
/// row; everything else is a state violation.
const EDGES: &[(VolState, VolState, VolState)] = &[
    (VolState::Clear, VolState::InitVol, VolState::SyncReady),
    (VolState::SyncReady, VolState::ClearVol, VolState::Clear),
    (VolState::SyncReady, VolState::FullSync, VolState::Stopped),
    (VolState::SyncReady, VolState::HashSync, VolState::Stopped),
    (VolState::SyncReady, VolState::StartStandby, VolState::Standby),
    (VolState::SyncReady, VolState::Reset, VolState::SyncReady),
    (VolState::Standby, VolState::StopStandby, VolState::SyncReady),
    (VolState::Stopped, VolState::StartTarget, VolState::Target),
    (VolState::Stopped, VolState::Reset, VolState::SyncReady),
    (VolState::Target, VolState::StopTarget, VolState::Stopped),
];

fn edge_allowed(from: VolState, pseudo: VolState) -> Option<VolState> {
    EDGES.iter().find(|(f, p, _)| *f == from && *p == pseudo).map(|(_, _, to)| *to)
}

/// The state cursor of one volume.
#[derive(Debug)]
pub struct StateMachine {
    cur: Mutex<VolState>,
    changed: tokio::sync::Notify,
}

impl StateMachine {
    /// Create a machine at `initial`.
    #[must_use]
    pub fn new(initial: VolState) -> Self {
        Self { cur: Mutex::new(initial), changed: tokio::sync::Notify::new() }
    }

    /// Current state.
    #[must_use]
    pub fn get(&self) -> VolState {
        *self.cur.lock()
    }

    /// Wait until the state changes (used by stop to reach a steady
    /// state).
    pub async fn wait_change(&self) {
        self.changed.notified().await;
    }

    /// Begin a transition `from → pseudo`. The returned guard rolls
    /// back to `from` on drop unless committed.
    ///
    /// # Errors
    ///
    /// Fails when the current state differs from `from` or the edge is
    /// not in the table.
    pub fn transaction(&self, from: VolState, pseudo: VolState, op: &str) -> Result<StateTransaction<'_>> {
        let to = edge_allowed(from, pseudo)
            .ok_or_else(|| Error::state(op, format!("no edge {from} -> {pseudo}")))?;
        let mut cur = self.cur.lock();
        if *cur != from {
            return Err(Error::state(op, cur.as_str()));
        }
        *cur = pseudo;
        drop(cur);
        Ok(StateTransaction { sm: self, from, pseudo, to, committed: false })
    }
}

/// Scoped state transition; rolls back on drop.
pub struct StateTransaction<'a> {
    sm: &'a StateMachine,
    from: VolState,
    pseudo: VolState,
    to: VolState,
    committed: bool,
}

impl StateTransaction<'_> {
    /// The to-state this transaction commits into.
    #[must_use]
    pub const fn target(&self) -> VolState {
        self.to
    }

    /// Commit to the edge's to-state.
    pub fn commit(mut self) {
        let mut cur = self.sm.cur.lock();
        debug_assert_eq!(*cur, self.pseudo);
        *cur = self.to;
        drop(cur);
        self.committed = true;
        self.sm.changed.notify_waiters();
    }
}

impl Drop for StateTransaction<'_> {
    fn drop(&mut self) {
        if !self.committed {
            let mut cur = self.sm.cur.lock();
            if *cur == self.pseudo {
                *cur = self.from;
            }
            drop(cur);
            self.sm.changed.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_path() {
        let sm = StateMachine::new(VolState::Clear);
        let tran = sm.transaction(VolState::Clear, VolState::InitVol, "init-vol").unwrap();
        assert_eq!(sm.get(), VolState::InitVol);
        tran.commit();
        assert_eq!(sm.get(), VolState::SyncReady);
    }

    #[test]
    fn test_rollback_on_drop() {
        let sm = StateMachine::new(VolState::SyncReady);
        {
            let _tran =
                sm.transaction(VolState::SyncReady, VolState::FullSync, "full-bkp").unwrap();
            assert_eq!(sm.get(), VolState::FullSync);
            // Dropped without commit: simulated failure.
        }
        assert_eq!(sm.get(), VolState::SyncReady);
    }

    #[test]
    fn test_wrong_state_refused() {
        let sm = StateMachine::new(VolState::Target);
        let err = sm.transaction(VolState::SyncReady, VolState::FullSync, "full-bkp");
        assert!(err.is_err());
        assert_eq!(sm.get(), VolState::Target);
    }

    #[test]
    fn test_unknown_edge_refused() {
        let sm = StateMachine::new(VolState::Target);
        assert!(sm.transaction(VolState::Target, VolState::ClearVol, "clear-vol").is_err());
    }

    #[test]
    fn test_concurrent_transaction_refused() {
        let sm = StateMachine::new(VolState::SyncReady);
        let _tran =
            sm.transaction(VolState::SyncReady, VolState::FullSync, "full-bkp").unwrap();
        // The machine now sits in the pseudo-state; a second operation
        // cannot begin.
        assert!(sm
            .transaction(VolState::SyncReady, VolState::HashSync, "hash-bkp")
            .is_err());
    }

    #[test]
    fn test_reset_edges() {
        let sm = StateMachine::new(VolState::Stopped);
        let tran = sm.transaction(VolState::Stopped, VolState::Reset, "reset-vol").unwrap();
        tran.commit();
        assert_eq!(sm.get(), VolState::SyncReady);

        let tran = sm.transaction(VolState::SyncReady, VolState::Reset, "reset-vol").unwrap();
        tran.commit();
        assert_eq!(sm.get(), VolState::SyncReady);
    }
}
