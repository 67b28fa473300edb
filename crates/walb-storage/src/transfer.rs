//! The wlog-transfer engine.
//!
//! One invocation ships the logpack range
//! `[send_lsid, min(permanent_lsid, send_lsid + max_wlog_send_pb))`
//! to the first proxy that accepts the handshake, commits the new
//! `send_lsid` on acknowledgement, and asks the kernel to release the
//! consumed log prefix. A crash after the acknowledgement but before
//! the release merely leaves a few shipped blocks unreclaimed until
//! the next pass.

use std::sync::Arc;

use metrics::counter;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use walb_core::fileutil::write_file_atomic;
use walb_core::{Error, Result, MEBI};
use walb_diff::CompressionType;
use walb_logdev::pack::Parsed;
use walb_logdev::{AsyncWldevReader, WldevReader};
use walb_proto::{
    negotiate_client, Packet, WlogSender, WlogTransferParams, MSG_ACCEPT, WLOG_TRANSFER_PROTOCOL,
};

use crate::context::StorageContext;
use crate::wdev::WdevControl;

/// A single IO may not exceed one round's budget.
fn verify_max_wlog_send_pb(max_wlog_send_pb: u64, logpack_pb: u64, vol_id: &str) -> Result<()> {
    if max_wlog_send_pb < logpack_pb {
        return Err(Error::Config(format!(
            "max_wlog_send_pb {max_wlog_send_pb} is too small for logpack of {logpack_pb} pb \
             on volume {vol_id}; raise max_wlog_send_mb and restart"
        )));
    }
    Ok(())
}

/// Save a raw header block next to the volume state for offline
/// analysis. Failures are logged, never propagated.
pub fn dump_logpack_header(ctx: &StorageContext, vol_id: &str, lsid: u64, block: &[u8]) {
    let path = ctx.vol_info(vol_id).vol_dir().join(format!("logpackheader-{lsid}"));
    if let Err(e) = write_file_atomic(&path, block) {
        warn!(vol_id, lsid, error = %e, "failed to dump logpack header");
    } else {
        info!(vol_id, lsid, path = %path.display(), "dumped logpack header");
    }
}

/// Release log blocks with `lsid < end_lsid` (all shipped blocks when
/// `end_lsid` is `None`). Returns true when nothing is left.
///
/// # Errors
///
/// Returns device errors.
pub async fn delete_wlogs(
    ctx: &StorageContext,
    vol_id: &str,
    end_lsid: Option<u64>,
) -> Result<bool> {
    let dev = ctx.wdev(vol_id)?;
    let end = match end_lsid {
        Some(lsid) => lsid,
        None => dev.lsid_set().await?.permanent,
    };
    let remaining_pb = dev.erase_wal(end).await?;
    Ok(remaining_pb == 0)
}

/// Find a proxy that accepts this transfer and return the connected
/// packet stream.
async fn connect_proxy(
    ctx: &StorageContext,
    params: &WlogTransferParams,
) -> Result<Packet<TcpStream>> {
    for addr in ctx.proxies.available_list() {
        let attempt = async {
            let stream =
                tokio::time::timeout(ctx.config.socket_timeout(), TcpStream::connect(addr))
                    .await
                    .map_err(|_| {
                        Error::Io(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "proxy connect timed out",
                        ))
                    })??;
            let mut pkt = Packet::with_timeout(stream, ctx.config.socket_timeout());
            negotiate_client(&mut pkt, &ctx.config.node_id, WLOG_TRANSFER_PROTOCOL).await?;
            pkt.write(params).await?;
            pkt.flush().await?;
            let res: String = pkt.read().await?;
            if res == MSG_ACCEPT {
                Ok(pkt)
            } else {
                Err(Error::Proxy(format!("proxy {addr} refused: {res}")))
            }
        };
        match attempt.await {
            Ok(pkt) => {
                debug!(proxy = %addr, vol_id = %params.vol_id, "proxy accepted transfer");
                return Ok(pkt);
            }
            Err(e) => {
                warn!(proxy = %addr, vol_id = %params.vol_id, error = %e, "proxy attempt failed");
            }
        }
    }
    Err(Error::Proxy("no proxy accepted the transfer".to_string()))
}

/// Run one transfer round for a Target volume.
///
/// Returns true when more work remains (another round should be queued
/// immediately).
///
/// # Errors
///
/// Transient failures (socket, proxy) are returned for the caller to
/// re-schedule; format errors dump the offending header first.
pub async fn extract_and_send_and_delete_wlog(
    ctx: &Arc<StorageContext>,
    vol_id: &str,
) -> Result<bool> {
    let vol_st = ctx.vol_state(vol_id);
    let info = ctx.vol_info(vol_id);
    let dev = ctx.wdev(vol_id)?;

    let lsids = dev.lsid_set().await?;
    if !info.is_required_wlog_transfer(lsids.permanent)? {
        debug!(vol_id, "wlog-transfer not required");
        return Ok(false);
    }

    let mut reader = AsyncWldevReader::open(&dev.wldev_path())?;
    let pbs = reader.super_block().physical_bs;
    let salt = reader.super_block().log_checksum_salt;
    let max_wlog_send_pb = (ctx.config.max_wlog_send_mb * MEBI / u64::from(pbs)).max(1);

    let (rec0, rec1, lsid_limit) = info.prepare_wlog_transfer(lsids.permanent, max_wlog_send_pb)?;
    let lsid_b = rec0.lsid;
    if lsid_b >= lsid_limit {
        debug!(vol_id, lsid_b, lsid_limit, "nothing durable to ship yet");
        return Ok(false);
    }

    // Peek at the first pack before contacting any proxy: a corrupt
    // header fails the round here, and a pack extending past the limit
    // means nothing whole is shippable yet.
    reader.reset(lsid_b);
    reader.read_ahead(lsid_b + 1);
    match reader.read_logpack_header().await? {
        Parsed::Valid(h) => {
            verify_max_wlog_send_pb(
                max_wlog_send_pb,
                u64::from(h.total_io_size()) + 1,
                vol_id,
            )?;
            if h.next_logpack_lsid() > lsid_limit {
                debug!(vol_id, lsid_b, lsid_limit, "first logpack not yet fully durable");
                return Ok(false);
            }
        }
        Parsed::Shrunken(_) | Parsed::Invalid(_) => {
            if let Ok(sync_reader) = WldevReader::open(&dev.wldev_path()) {
                if let Ok(block) = sync_reader.read_raw_header_block(lsid_b) {
                    dump_logpack_header(ctx, vol_id, lsid_b, &block);
                }
            }
            return Err(Error::format(format!(
                "invalid logpack header at lsid {lsid_b} on volume {vol_id}"
            )));
        }
    }

    let params = WlogTransferParams {
        vol_id: vol_id.to_string(),
        uuid: info.uuid()?,
        pbs,
        salt,
        vol_size_lb: dev.size_lb().await?,
        max_log_size_pb: lsid_limit - lsid_b,
    };
    let pkt = connect_proxy(ctx, &params).await?;
    let mut sender = WlogSender::new(pkt, pbs, salt, CompressionType::Snappy);
    sender.send_preamble(params.uuid, lsid_b, lsid_limit).await?;

    reader.reset(lsid_b);
    reader.read_ahead(lsid_limit);

    let mut lsid = lsid_b;
    loop {
        if vol_st.stop.is_force() || ctx.ps.is_force_shutdown() {
            return Err(Error::ForceStopped(format!("wlog-transfer {vol_id}")));
        }
        if lsid == lsid_limit {
            break;
        }
        let header = match reader.read_logpack_header().await? {
            Parsed::Valid(h) => h,
            Parsed::Shrunken(_) | Parsed::Invalid(_) => {
                // Re-read the raw block for analysis before failing.
                if let Ok(sync_reader) = WldevReader::open(&dev.wldev_path()) {
                    if let Ok(block) = sync_reader.read_raw_header_block(lsid) {
                        dump_logpack_header(ctx, vol_id, lsid, &block);
                    }
                }
                return Err(Error::format(format!(
                    "invalid logpack header at lsid {lsid} on volume {vol_id}"
                )));
            }
        };
        verify_max_wlog_send_pb(
            max_wlog_send_pb,
            u64::from(header.total_io_size()) + 1,
            vol_id,
        )?;
        let next_lsid = header.next_logpack_lsid();
        if next_lsid > lsid_limit {
            // A partial pack is never shipped in this round.
            break;
        }
        sender.push_header(&header)?;
        for i in 0..header.n_records() {
            let data = reader.read_logpack_io(&header, i).await?;
            sender.push_io(&header, i, data.as_deref()).await?;
        }
        counter!("walb_storage_shipped_logpacks").increment(1);
        lsid = next_lsid;
    }
    sender.sync().await?;
    let lsid_e = lsid;

    let diff = info.get_transfer_diff(&rec0, &rec1, lsid_e);
    let mut pkt = sender.into_packet();
    pkt.write(&diff).await?;
    pkt.flush().await?;
    pkt.recv_ack().await?;
    counter!("walb_storage_shipped_pb").increment(lsid_e - lsid_b);
    info!(vol_id, lsid_b, lsid_e, %diff, "wlog-transfer round complete");

    let has_pending = info.finish_wlog_transfer(&rec0, &rec1, lsid_e)?;

    let mut is_empty = true;
    if lsid_b < lsid_e {
        is_empty = delete_wlogs(ctx, vol_id, Some(lsid_e)).await?;
    }
    Ok(!is_empty || has_pending)
}
