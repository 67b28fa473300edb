//! Control server.
//!
//! Every client connection negotiates a command name, sends its
//! parameters as a string vector and receives `(Answer, lines)`.
//! Handler errors are logged with volume and action context and their
//! message is sent to the client before the socket closes.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{error, info, warn};
use walb_core::{verify_not_stopping, Error, Result, Stopper};
use walb_proto::host_type::send_host_type;
use walb_proto::{negotiate_server, Answer, Packet, HOST_TYPE_STORAGE};

use crate::action::ALL_ACTIONS;
use crate::backup::{run_backup, DEFAULT_BULK_LB};
use crate::context::StorageContext;
use crate::state::VolState;
use crate::transfer::dump_logpack_header;
use crate::wdev::WdevControl;

/// Command names served by the storage host.
pub const COMMANDS: &[&str] = &[
    "status",
    "init-vol",
    "clear-vol",
    "reset-vol",
    "start",
    "stop",
    "full-bkp",
    "hash-bkp",
    "resize",
    "snapshot",
    "kick",
    "dbg-dump-logpack-header",
    "get",
    "exec",
    walb_proto::ECHO_PROTOCOL,
    walb_proto::GET_HOST_TYPE_PROTOCOL,
];

/// Accept loop. Exits when the shutdown channel flips.
///
/// # Errors
///
/// Returns accept errors that are not per-connection.
pub async fn run_server(
    ctx: Arc<StorageContext>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    info!(addr = %listener.local_addr()?, node_id = %ctx.config.node_id, "control server listening");
    loop {
        let (stream, peer) = tokio::select! {
            res = listener.accept() => res?,
            _ = shutdown.changed() => {
                info!("control server shutting down");
                return Ok(());
            }
        };
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(&ctx, stream).await {
                warn!(peer = %peer, error = %e, "connection handler failed");
            }
        });
    }
}

/// Serve one connection: negotiate, dispatch, reply.
///
/// # Errors
///
/// Returns negotiation and transport errors.
pub async fn handle_connection(ctx: &Arc<StorageContext>, stream: TcpStream) -> Result<()> {
    let mut pkt = Packet::with_timeout(stream, ctx.config.socket_timeout());
    let negotiation = negotiate_server(&mut pkt, &ctx.config.node_id, COMMANDS).await?;
    let command = negotiation.protocol_name.as_str();

    match command {
        walb_proto::ECHO_PROTOCOL => return walb_proto::echo::echo_server(&mut pkt).await,
        walb_proto::GET_HOST_TYPE_PROTOCOL => {
            return send_host_type(&mut pkt, HOST_TYPE_STORAGE).await;
        }
        _ => {}
    }

    let params: Vec<String> = pkt.read().await?;
    let result = dispatch(ctx, command, &params).await;
    match result {
        Ok(lines) => {
            pkt.write(&(Answer::Ok, lines)).await?;
            pkt.flush().await
        }
        Err(e) => {
            error!(client = %negotiation.peer_id, command, ?params, error = %e, "command failed");
            pkt.write(&(Answer::Ng { code: 1, msg: e.to_string() }, Vec::<String>::new()))
                .await?;
            pkt.flush().await
        }
    }
}

async fn dispatch(ctx: &Arc<StorageContext>, command: &str, params: &[String]) -> Result<Vec<String>> {
    match command {
        "status" => status(ctx, params),
        "init-vol" => init_vol(ctx, params).await,
        "clear-vol" => clear_vol(ctx, params),
        "reset-vol" => reset_vol(ctx, params).await,
        "start" => start(ctx, params).await,
        "stop" => stop(ctx, params).await,
        "full-bkp" => backup(ctx, params, true).await,
        "hash-bkp" => backup(ctx, params, false).await,
        "resize" => resize(ctx, params).await,
        "snapshot" => snapshot(ctx, params).await,
        "kick" => kick(ctx).await,
        "dbg-dump-logpack-header" => dbg_dump_logpack_header(ctx, params),
        "get" => get(ctx, params).await,
        "exec" => exec(params).await,
        other => Err(Error::protocol(format!("unknown command {other}"))),
    }
}

fn param(params: &[String], idx: usize, name: &str) -> Result<String> {
    params
        .get(idx)
        .cloned()
        .ok_or_else(|| Error::Config(format!("missing parameter {name}")))
}

fn param_u64(params: &[String], idx: usize, name: &str) -> Result<u64> {
    let s = param(params, idx, name)?;
    s.parse().map_err(|_| Error::Config(format!("bad {name}: {s:?}")))
}

fn status(ctx: &Arc<StorageContext>, params: &[String]) -> Result<Vec<String>> {
    match params.first() {
        Some(vol_id) => vol_status(ctx, vol_id),
        None => all_status(ctx),
    }
}

fn all_status(ctx: &Arc<StorageContext>) -> Result<Vec<String>> {
    let config = &ctx.config;
    let mut v = vec![
        "-----StorageGlobal-----".to_string(),
        format!("nodeId {}", config.node_id),
        format!("baseDir {}", config.base_dir.display()),
        format!("maxWlogSendMb {}", config.max_wlog_send_mb),
        format!("delaySecForRetry {}", config.delay_sec_for_retry),
        format!("maxForegroundTasks {}", config.max_foreground_tasks),
        format!("socketTimeout {}", config.socket_timeout_secs),
        "-----Archive-----".to_string(),
        format!("host {}", config.archive),
        "-----Proxy-----".to_string(),
    ];
    v.extend(ctx.proxies.status_lines());
    v.push("-----TaskQueue-----".to_string());
    for (vol_id, ms) in ctx.task_queue.snapshot() {
        v.push(format!("volume {vol_id} timeDiffMs {ms}"));
    }
    v.push("-----Volume-----".to_string());
    for vol_id in ctx.vol_list() {
        let st = ctx.vol_state(&vol_id).sm.get();
        if st == VolState::Clear {
            continue;
        }
        let info = ctx.vol_info(&vol_id);
        let (oldest_gid, latest_gid) = info.gid_range()?;
        v.push(format!(
            "volume {vol_id} state {st} oldestGid {oldest_gid} latestGid {latest_gid}"
        ));
    }
    Ok(v)
}

fn vol_status(ctx: &Arc<StorageContext>, vol_id: &str) -> Result<Vec<String>> {
    let vol_st = ctx.vol_state(vol_id);
    let st = vol_st.sm.get();
    let mut v = vec![
        "hostType storage".to_string(),
        format!("volId {vol_id}"),
        format!("state {st}"),
    ];
    if st == VolState::Clear {
        return Ok(v);
    }
    for (name, count) in vol_st.ac.snapshot() {
        v.push(format!("action {name} {count}"));
    }
    v.push(format!("stopState {}", vol_st.stop.get().as_str()));
    v.push(format!("isUnderMonitoring {}", u8::from(ctx.is_under_monitoring(vol_id))));
    v.extend(ctx.vol_info(vol_id).status_lines(true)?);
    Ok(v)
}

async fn init_vol(ctx: &Arc<StorageContext>, params: &[String]) -> Result<Vec<String>> {
    let vol_id = param(params, 0, "volId")?;
    let wdev_path = param(params, 1, "wdevPath")?;

    let vol_st = ctx.vol_state(&vol_id);
    let tran = vol_st.sm.transaction(VolState::Clear, VolState::InitVol, "init-vol")?;

    let info = ctx.vol_info(&vol_id);
    info.init(&wdev_path, 0)?;
    let dev = ctx.wdev(&vol_id)?;
    if let Some(other) = ctx.vol_id_of_wdev(dev.wdev_name()) {
        info.clear()?;
        return Err(Error::Config(format!("wdevPath {wdev_path} is already used by {other}")));
    }
    match dev.size_lb().await {
        Ok(size_lb) => info.set_size_lb(size_lb)?,
        Err(e) => {
            info.clear()?;
            return Err(e);
        }
    }
    tran.commit();
    info!(%vol_id, %wdev_path, "init-vol succeeded");
    Ok(vec![])
}

fn clear_vol(ctx: &Arc<StorageContext>, params: &[String]) -> Result<Vec<String>> {
    let vol_id = param(params, 0, "volId")?;
    let vol_st = ctx.vol_state(&vol_id);
    let tran = vol_st.sm.transaction(VolState::SyncReady, VolState::ClearVol, "clear-vol")?;
    ctx.vol_info(&vol_id).clear()?;
    tran.commit();
    info!(%vol_id, "clear-vol succeeded");
    Ok(vec![])
}

async fn reset_vol(ctx: &Arc<StorageContext>, params: &[String]) -> Result<Vec<String>> {
    let vol_id = param(params, 0, "volId")?;
    let gid = match params.get(1) {
        Some(s) => s.parse().map_err(|_| Error::Config(format!("bad gid: {s:?}")))?,
        None => 0,
    };
    let vol_st = ctx.vol_state(&vol_id);
    verify_not_stopping(&vol_st.stop, &vol_id, "reset-vol")?;
    let from = vol_st.sm.get();
    let tran = vol_st.sm.transaction(from, VolState::Reset, "reset-vol")?;

    let info = ctx.vol_info(&vol_id);
    let dev = ctx.wdev(&vol_id)?;
    dev.reset_wal().await?;
    let lsids = dev.lsid_set().await?;
    info.reset_wlog(gid, lsids.latest)?;
    info.set_state(VolState::SyncReady)?;
    tran.commit();
    info!(%vol_id, gid, "reset-vol succeeded");
    Ok(vec![])
}

async fn start(ctx: &Arc<StorageContext>, params: &[String]) -> Result<Vec<String>> {
    let vol_id = param(params, 0, "volId")?;
    let role = param(params, 1, "target|standby")?;
    let vol_st = ctx.vol_state(&vol_id);
    verify_not_stopping(&vol_st.stop, &vol_id, "start")?;
    let info = ctx.vol_info(&vol_id);
    let dev = ctx.wdev(&vol_id)?;
    let is_overflow = dev.is_overflow().await?;

    match role.as_str() {
        "target" => {
            if is_overflow {
                return Err(Error::Overflow(format!("volume {vol_id} requires reset-vol")));
            }
            let tran =
                vol_st.sm.transaction(VolState::Stopped, VolState::StartTarget, "start")?;
            ctx.start_monitoring(&vol_id)?;
            info.set_state(VolState::Target)?;
            tran.commit();
        }
        "standby" => {
            let tran =
                vol_st.sm.transaction(VolState::SyncReady, VolState::StartStandby, "start")?;
            if is_overflow {
                dev.reset_wal().await?;
                let lsids = dev.lsid_set().await?;
                info.reset_wlog(0, lsids.latest)?;
            }
            ctx.start_monitoring(&vol_id)?;
            info.set_state(VolState::Standby)?;
            tran.commit();
        }
        other => return Err(Error::Config(format!("bad role {other:?}"))),
    }
    info!(%vol_id, %role, "start succeeded");
    Ok(vec![])
}

async fn stop(ctx: &Arc<StorageContext>, params: &[String]) -> Result<Vec<String>> {
    let vol_id = param(params, 0, "volId")?;
    let force = params.get(1).is_some_and(|s| s == "force");
    let vol_st = ctx.vol_state(&vol_id);

    let stopper = Stopper::begin(Arc::clone(&vol_st.stop), force)
        .ok_or_else(|| Error::state("stop", format!("{vol_id}: already under stopping")))?;

    // Wait for a steady state with no action in flight.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(120);
    loop {
        let st = vol_st.sm.get();
        if st.is_steady() && vol_st.ac.is_all_zero(ALL_ACTIONS) {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::state("stop", format!("{vol_id}: quiesce timed out")));
        }
        tokio::select! {
            () = vol_st.sm.wait_change() => {}
            () = vol_st.ac.wait_all_zero(ALL_ACTIONS) => {}
            () = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    let info = ctx.vol_info(&vol_id);
    let st = vol_st.sm.get();
    let (from, pseudo, to) = match st {
        VolState::Target => (VolState::Target, VolState::StopTarget, VolState::Stopped),
        VolState::Standby => (VolState::Standby, VolState::StopStandby, VolState::SyncReady),
        other => return Err(Error::state("stop", other.as_str())),
    };
    let tran = vol_st.sm.transaction(from, pseudo, "stop")?;
    ctx.stop_monitoring(&vol_id);
    info.set_state(to)?;
    tran.commit();
    drop(stopper);
    info!(%vol_id, force, "stop succeeded");
    Ok(vec![])
}

async fn backup(ctx: &Arc<StorageContext>, params: &[String], is_full: bool) -> Result<Vec<String>> {
    let vol_id = param(params, 0, "volId")?;
    let bulk_lb = match params.get(1) {
        Some(s) => s.parse().map_err(|_| Error::Config(format!("bad bulkLb: {s:?}")))?,
        None => DEFAULT_BULK_LB,
    };
    let completed = run_backup(ctx, &vol_id, bulk_lb, is_full).await?;
    if !completed {
        return Err(Error::ForceStopped(format!("backup of {vol_id}")));
    }
    Ok(vec![])
}

async fn resize(ctx: &Arc<StorageContext>, params: &[String]) -> Result<Vec<String>> {
    let vol_id = param(params, 0, "volId")?;
    let new_size_lb = param_u64(params, 1, "newSizeLb")?;
    let vol_st = ctx.vol_state(&vol_id);
    verify_not_stopping(&vol_st.stop, &vol_id, "resize")?;
    let st = vol_st.sm.get();
    if st == VolState::Clear {
        return Err(Error::state("resize", st.as_str()));
    }
    let dev = ctx.wdev(&vol_id)?;
    dev.resize(new_size_lb).await?;
    ctx.vol_info(&vol_id).set_size_lb(new_size_lb)?;
    info!(%vol_id, new_size_lb, "resize succeeded");
    Ok(vec![])
}

async fn snapshot(ctx: &Arc<StorageContext>, params: &[String]) -> Result<Vec<String>> {
    let vol_id = param(params, 0, "volId")?;
    let vol_st = ctx.vol_state(&vol_id);
    verify_not_stopping(&vol_st.stop, &vol_id, "snapshot")?;
    let st = vol_st.sm.get();
    if st != VolState::Target {
        return Err(Error::state("snapshot", st.as_str()));
    }
    let info = ctx.vol_info(&vol_id);
    let dev = ctx.wdev(&vol_id)?;
    let lsids = dev.lsid_set().await?;
    let max_pb = (ctx.config.max_wlog_send_mb * MEBI_PB_DIV).max(1);
    let gid = info.take_snapshot(lsids.latest, max_pb)?;
    ctx.push_task_force(&vol_id, Duration::ZERO);
    info!(%vol_id, gid, "snapshot succeeded");
    Ok(vec![gid.to_string()])
}

/// Physical blocks per MiB at the common 4096-byte block size.
const MEBI_PB_DIV: u64 = walb_core::MEBI / 4096;

async fn kick(ctx: &Arc<StorageContext>) -> Result<Vec<String>> {
    ctx.proxies.kick().await;
    let mut kicked = Vec::new();
    for (vol_id, ms) in ctx.task_queue.snapshot() {
        if ms > 0 {
            ctx.push_task_force(&vol_id, Duration::ZERO);
            kicked.push(vol_id);
        }
    }
    info!(kicked = kicked.len(), "kick");
    Ok(kicked)
}

fn dbg_dump_logpack_header(ctx: &Arc<StorageContext>, params: &[String]) -> Result<Vec<String>> {
    let vol_id = param(params, 0, "volId")?;
    let lsid = param_u64(params, 1, "lsid")?;
    if ctx.vol_state(&vol_id).sm.get() == VolState::Clear {
        return Err(Error::state("dbg-dump-logpack-header", "Clear"));
    }
    let dev = ctx.wdev(&vol_id)?;
    let reader = walb_logdev::WldevReader::open(&dev.wldev_path())?;
    let block = reader.read_raw_header_block(lsid)?;
    dump_logpack_header(ctx, &vol_id, lsid, &block);
    Ok(vec![])
}

async fn get(ctx: &Arc<StorageContext>, params: &[String]) -> Result<Vec<String>> {
    let what = param(params, 0, "target")?;
    match what.as_str() {
        "state" => {
            let vol_id = param(params, 1, "volId")?;
            Ok(vec![ctx.vol_state(&vol_id).sm.get().as_str().to_string()])
        }
        "host-type" => Ok(vec![HOST_TYPE_STORAGE.to_string()]),
        "vol" => Ok(ctx.vol_list()),
        "pid" => Ok(vec![std::process::id().to_string()]),
        "is-overflow" => {
            let vol_id = param(params, 1, "volId")?;
            if ctx.vol_state(&vol_id).sm.get() == VolState::Clear {
                return Err(Error::state("get is-overflow", "Clear"));
            }
            let dev = ctx.wdev(&vol_id)?;
            Ok(vec![u8::from(dev.is_overflow().await?).to_string()])
        }
        "uuid" => {
            let vol_id = param(params, 1, "volId")?;
            if ctx.vol_state(&vol_id).sm.get() == VolState::Clear {
                return Err(Error::state("get uuid", "Clear"));
            }
            let uuid = ctx.vol_info(&vol_id).uuid()?;
            Ok(vec![uuid.iter().map(|b| format!("{b:02x}")).collect()])
        }
        other => Err(Error::Config(format!("unknown get target {other:?}"))),
    }
}

async fn exec(params: &[String]) -> Result<Vec<String>> {
    let argv0 = param(params, 0, "command")?;
    let output = tokio::process::Command::new(&argv0)
        .args(&params[1..])
        .output()
        .await?;
    if !output.status.success() {
        return Err(Error::Config(format!(
            "{argv0} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).lines().map(str::to_string).collect())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use walb_core::StorageConfig;

    use super::*;
    use crate::wdev::FakeWdev;

    async fn start_test_server(ctx: Arc<StorageContext>) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { break };
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    let _ = handle_connection(&ctx, stream).await;
                });
            }
        });
        addr
    }

    async fn send_command(
        addr: std::net::SocketAddr,
        command: &str,
        params: Vec<String>,
    ) -> Result<Vec<String>> {
        let stream = TcpStream::connect(addr).await?;
        let mut pkt = Packet::new(stream);
        walb_proto::negotiate_client(&mut pkt, "test-ctl", command).await?;
        pkt.write(&params).await?;
        pkt.flush().await?;
        let (answer, lines): (Answer, Vec<String>) = pkt.read().await?;
        answer.into_result()?;
        Ok(lines)
    }

    #[tokio::test]
    async fn test_command_round_trip() {
        let dir = TempDir::new().unwrap();
        let config = StorageConfig {
            base_dir: dir.path().to_path_buf(),
            ..StorageConfig::default()
        };
        let ctx = StorageContext::new(config);
        let img = dir.path().join("wldev.img");
        std::fs::write(&img, b"").unwrap();
        ctx.register_wdev("vol0", Arc::new(FakeWdev::new("w0", &img, &img, 2048)));

        let addr = start_test_server(Arc::clone(&ctx)).await;

        send_command(addr, "init-vol", vec!["vol0".into(), "/dev/walb/0".into()])
            .await
            .unwrap();
        assert_eq!(ctx.vol_state("vol0").sm.get(), VolState::SyncReady);

        let state =
            send_command(addr, "get", vec!["state".into(), "vol0".into()]).await.unwrap();
        assert_eq!(state, vec!["SyncReady".to_string()]);

        let status = send_command(addr, "status", vec!["vol0".into()]).await.unwrap();
        assert!(status.iter().any(|l| l == "state SyncReady"), "{status:?}");

        // Snapshot is refused outside Target.
        let err = send_command(addr, "snapshot", vec!["vol0".into()]).await;
        assert!(err.is_err());

        send_command(addr, "clear-vol", vec!["vol0".into()]).await.unwrap();
        assert_eq!(ctx.vol_state("vol0").sm.get(), VolState::Clear);

        // Unknown command is refused at negotiation.
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut pkt = Packet::new(stream);
        assert!(walb_proto::negotiate_client(&mut pkt, "test-ctl", "no-such-command")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_get_host_type() {
        let dir = TempDir::new().unwrap();
        let config = StorageConfig {
            base_dir: dir.path().to_path_buf(),
            ..StorageConfig::default()
        };
        let ctx = StorageContext::new(config);
        let addr = start_test_server(ctx).await;

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut pkt = Packet::new(stream);
        let ty = walb_proto::host_type::get_host_type_client(&mut pkt, "test-ctl")
            .await
            .unwrap();
        assert_eq!(ty, HOST_TYPE_STORAGE);
    }
}
