//! Per-volume background worker.
//!
//! The dispatcher runs this for every popped task: check overflow,
//! then either remove wlogs (Standby) or run one transfer round
//! (Target), re-queueing the volume when work remains and scheduling a
//! delayed retry on failure.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};
use walb_core::{verify_not_stopping, Error, Result};

use crate::action::{ACTION_WLOG_REMOVE, ACTION_WLOG_SEND, ALL_ACTIONS};
use crate::context::StorageContext;
use crate::state::VolState;
use crate::transfer::{delete_wlogs, extract_and_send_and_delete_wlog};
use crate::wdev::WdevControl;

/// Run one task for `vol_id`.
///
/// # Errors
///
/// Errors are also responsible for their own re-scheduling; the caller
/// only logs them.
pub async fn run_storage_task(ctx: &Arc<StorageContext>, vol_id: &str) -> Result<()> {
    let vol_st = ctx.vol_state(vol_id);
    verify_not_stopping(&vol_st.stop, vol_id, "storage worker")?;

    let st = vol_st.sm.get();
    debug!(vol_id, state = %st, "storage worker start");
    if st == VolState::StartTarget || st == VolState::StartStandby {
        // The start transition is still committing; try again shortly.
        ctx.push_task(vol_id, Duration::from_secs(1));
        return Ok(());
    }
    if st != VolState::Target && st != VolState::Standby {
        return Err(Error::state("storage worker", st.as_str()));
    }
    vol_st.ac.verify_none_running(ALL_ACTIONS, "storage worker")?;

    let dev = ctx.wdev(vol_id)?;
    if dev.is_overflow().await? {
        error!(vol_id, "log device overflow");
        if st != VolState::Target {
            return Ok(());
        }
        // Auto-stop: the operator must reset-vol before any further
        // transfer.
        let info = ctx.vol_info(vol_id);
        let tran = vol_st.sm.transaction(VolState::Target, VolState::StopTarget, "overflow")?;
        ctx.stop_monitoring(vol_id);
        info.set_state(VolState::Stopped)?;
        tran.commit();
        return Ok(());
    }

    if st == VolState::Standby {
        let _guard = vol_st.ac.begin(ACTION_WLOG_REMOVE);
        delete_wlogs(ctx, vol_id, None).await?;
        return Ok(());
    }

    let _guard = vol_st.ac.begin(ACTION_WLOG_SEND);
    match extract_and_send_and_delete_wlog(ctx, vol_id).await {
        Ok(is_remaining) => {
            if is_remaining {
                ctx.push_task(vol_id, Duration::ZERO);
            }
            Ok(())
        }
        Err(e) => {
            warn!(vol_id, error = %e, "wlog-transfer failed; scheduling retry");
            ctx.push_task_force(vol_id, ctx.config.retry_delay());
            Err(e)
        }
    }
}
