//! Backup protocols, client role.
//!
//! Both protocols establish a base snapshot on the archive while the
//! volume stays writable: the archive marks the snapshot dirty and the
//! wlog shipments that follow close it. On success the volume ends up
//! in Target with monitoring running; any failure rolls the state back
//! to SyncReady.

use std::sync::Arc;

use tokio::net::TcpStream;
use tracing::{info, warn};
use walb_core::{unix_time_now, verify_not_stopping, Error, MetaSnap, Result, MEBI};
use walb_proto::full_sync::{dirty_full_sync_client, BackupParams};
use walb_proto::hash_sync::dirty_hash_sync_client;
use walb_proto::{
    negotiate_client, Packet, DIRTY_FULL_SYNC_PROTOCOL, DIRTY_HASH_SYNC_PROTOCOL, HOST_TYPE_STORAGE,
    MSG_ACCEPT,
};

use crate::context::StorageContext;
use crate::state::VolState;
use crate::wdev::WdevControl;

/// Stops monitoring on failure paths; disarmed once the backup
/// reaches Target.
struct MonitorGuard<'a> {
    ctx: &'a StorageContext,
    vol_id: &'a str,
    armed: bool,
}

impl Drop for MonitorGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.ctx.stop_monitoring(self.vol_id);
        }
    }
}

/// Default bulk size [lb] (64 KiB).
pub const DEFAULT_BULK_LB: u16 = 128;

/// Run a full or hash backup of `vol_id` against the configured
/// archive.
///
/// Returns false when a force stop aborted the copy (the volume is
/// left in SyncReady).
///
/// # Errors
///
/// Fails on state violations, archive refusal, or I/O errors.
pub async fn run_backup(
    ctx: &Arc<StorageContext>,
    vol_id: &str,
    bulk_lb: u16,
    is_full: bool,
) -> Result<bool> {
    let protocol = if is_full { DIRTY_FULL_SYNC_PROTOCOL } else { DIRTY_HASH_SYNC_PROTOCOL };
    if bulk_lb == 0 {
        return Err(Error::Config("bulk_lb must not be 0".to_string()));
    }
    let _foreground = ctx.begin_foreground()?;

    let vol_st = ctx.vol_state(vol_id);
    verify_not_stopping(&vol_st.stop, vol_id, protocol)?;
    let pseudo = if is_full { VolState::FullSync } else { VolState::HashSync };
    let tran = vol_st.sm.transaction(VolState::SyncReady, pseudo, protocol)?;

    let info = ctx.vol_info(vol_id);
    let dev = ctx.wdev(vol_id)?;
    let size_lb = dev.size_lb().await?;
    let cur_time = unix_time_now();

    let stream =
        tokio::time::timeout(ctx.config.socket_timeout(), TcpStream::connect(ctx.config.archive))
            .await
            .map_err(|_| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "archive connect timed out",
                ))
            })??;
    let mut pkt = Packet::with_timeout(stream, ctx.config.socket_timeout());
    let negotiation = negotiate_client(&mut pkt, &ctx.config.node_id, protocol).await?;

    pkt.write(&HOST_TYPE_STORAGE.to_string()).await?;
    pkt.write(&BackupParams {
        vol_id: vol_id.to_string(),
        size_lb,
        bulk_lb,
        cur_time,
    })
    .await?;
    pkt.flush().await?;
    let res: String = pkt.read().await?;
    if res != MSG_ACCEPT {
        return Err(Error::protocol(format!(
            "archive {} refused {protocol}: {res}",
            negotiation.peer_id
        )));
    }

    // Hash sync resumes on top of the archive's newest snapshot.
    let gid_b = if is_full {
        0
    } else {
        let snap: MetaSnap = pkt.read().await?;
        snap.gid_e + 1
    };

    // Re-base log progress: fresh uuid, shipments restart at the
    // current ring tail so every write during the copy reaches the
    // archive.
    let lsids = dev.lsid_set().await?;
    info.reset_wlog(gid_b, lsids.oldest)?;
    pkt.write(&info.uuid()?).await?;
    pkt.flush().await?;
    pkt.recv_ack().await?;

    ctx.start_monitoring(vol_id)?;
    let mut monitor_guard = MonitorGuard { ctx: ctx.as_ref(), vol_id, armed: true };
    info!(vol_id, protocol, archive = %negotiation.peer_id, "backup started");

    let bdev_path = dev.data_path();
    let completed = if is_full {
        dirty_full_sync_client(
            &mut pkt,
            &bdev_path,
            0,
            size_lb,
            bulk_lb,
            &vol_st.stop,
            ctx.ps.force_flag(),
        )
        .await?
    } else {
        dirty_hash_sync_client(
            &mut pkt,
            &bdev_path,
            size_lb,
            bulk_lb,
            cur_time as u32,
            &vol_st.stop,
            ctx.ps.force_flag(),
        )
        .await?
    };
    if !completed {
        warn!(vol_id, protocol, "backup force stopped");
        return Ok(false);
    }

    // Seal the copy end as the first shippable boundary. When no write
    // arrived during the copy the snapshot is already clean.
    let max_wlog_send_pb = (ctx.config.max_wlog_send_mb * MEBI / 4096).max(1);
    let lsids = dev.lsid_set().await?;
    let gid_e = info.take_snapshot(lsids.latest, max_wlog_send_pb)?;
    ctx.push_task(vol_id, std::time::Duration::ZERO);
    pkt.write(&MetaSnap::dirty(gid_b, gid_e)).await?;
    pkt.flush().await?;
    pkt.recv_ack().await?;

    tran.commit();
    let tran = vol_st.sm.transaction(VolState::Stopped, VolState::StartTarget, protocol)?;
    info.set_state(VolState::Target)?;
    tran.commit();
    monitor_guard.armed = false;
    info!(vol_id, protocol, gid_b, gid_e, "backup succeeded");
    Ok(true)
}
