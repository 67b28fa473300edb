//! The WalB storage host.
//!
//! This crate provides:
//! - the per-volume state machine and action counters
//! - the delayed-retry task queue and its dispatcher workers
//! - persisted volume state (`StorageVolInfo`)
//! - the proxy manager and monitors
//! - the wlog-transfer engine and the backup protocols
//! - the control server

#![warn(missing_docs)]

pub mod action;
pub mod backup;
pub mod context;
pub mod monitor;
pub mod proxy;
pub mod server;
pub mod state;
pub mod task_queue;
pub mod transfer;
pub mod volinfo;
pub mod wdev;
pub mod worker;

pub use context::{ProcessStatus, StorageContext, VolStateRuntime};
pub use state::{StateMachine, StateTransaction, VolState};
pub use task_queue::TaskQueue;
pub use volinfo::StorageVolInfo;
pub use wdev::{FakeWdev, LsidSet, SysfsWdev, WdevControl};
