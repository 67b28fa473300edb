//! WalB storage host daemon and control client.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use walb_core::config::{LogFormat, StorageConfig};
use walb_storage::monitor::{run_proxy_monitor, run_wdev_monitor, spawn_dispatchers};
use walb_storage::server::run_server;
use walb_storage::StorageContext;

mod cli;
mod client;

use cli::{Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let addr = cli.addr;
    let id = cli.id.clone();
    match cli.command {
        Commands::Serve(args) => return serve(args).await,
        Commands::Status { vol_id } => {
            let params = vol_id.into_iter().collect();
            print_lines(client::run_command(addr, &id, "status", params).await?);
        }
        Commands::InitVol { vol_id, wdev_path } => {
            client::run_command(addr, &id, "init-vol", vec![vol_id, wdev_path]).await?;
        }
        Commands::ClearVol { vol_id } => {
            client::run_command(addr, &id, "clear-vol", vec![vol_id]).await?;
        }
        Commands::Start { vol_id, role } => {
            client::run_command(addr, &id, "start", vec![vol_id, role]).await?;
        }
        Commands::Stop { vol_id, force } => {
            let mut params = vec![vol_id];
            if force {
                params.push("force".to_string());
            }
            client::run_command(addr, &id, "stop", params).await?;
        }
        Commands::FullBkp { vol_id, bulk_lb } => {
            let mut params = vec![vol_id];
            params.extend(bulk_lb.map(|b| b.to_string()));
            client::run_command(addr, &id, "full-bkp", params).await?;
        }
        Commands::HashBkp { vol_id, bulk_lb } => {
            let mut params = vec![vol_id];
            params.extend(bulk_lb.map(|b| b.to_string()));
            client::run_command(addr, &id, "hash-bkp", params).await?;
        }
        Commands::Snapshot { vol_id } => {
            print_lines(client::run_command(addr, &id, "snapshot", vec![vol_id]).await?);
        }
        Commands::ResetVol { vol_id, gid } => {
            let mut params = vec![vol_id];
            params.extend(gid.map(|g| g.to_string()));
            client::run_command(addr, &id, "reset-vol", params).await?;
        }
        Commands::Resize { vol_id, new_size_lb } => {
            client::run_command(addr, &id, "resize", vec![vol_id, new_size_lb.to_string()])
                .await?;
        }
        Commands::Kick => {
            client::run_command(addr, &id, "kick", vec![]).await?;
        }
        Commands::Get { target, vol_id } => {
            let mut params = vec![target];
            params.extend(vol_id);
            print_lines(client::run_command(addr, &id, "get", params).await?);
        }
        Commands::DbgDumpLogpackHeader { vol_id, lsid } => {
            client::run_command(
                addr,
                &id,
                "dbg-dump-logpack-header",
                vec![vol_id, lsid.to_string()],
            )
            .await?;
        }
        Commands::Exec { argv } => {
            print_lines(client::run_command(addr, &id, "exec", argv).await?);
        }
    }
    Ok(())
}

fn print_lines(lines: Vec<String>) {
    for line in lines {
        println!("{line}");
    }
}

async fn serve(args: cli::ServeArgs) -> Result<()> {
    let mut config = load_config(&args.config)?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(base_dir) = args.base_dir {
        config.base_dir = base_dir;
    }

    init_logging(&config)?;
    std::fs::create_dir_all(&config.base_dir)
        .with_context(|| format!("failed to create {}", config.base_dir.display()))?;

    let listener =
        TcpListener::bind(config.listen).await.context("failed to bind control address")?;
    let ctx = StorageContext::new(config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = vec![
        tokio::spawn(run_wdev_monitor(Arc::clone(&ctx), shutdown_rx.clone())),
        tokio::spawn(run_proxy_monitor(Arc::clone(&ctx), shutdown_rx.clone())),
    ];
    tasks.extend(spawn_dispatchers(&ctx, ctx.config.dispatch_workers, &shutdown_rx));

    // Resume monitoring of volumes that were Target or Standby at the
    // previous shutdown.
    for vol_id in ctx.vol_list() {
        let st = ctx.vol_state(&vol_id).sm.get();
        if matches!(st, walb_storage::VolState::Target | walb_storage::VolState::Standby) {
            if let Err(e) = ctx.start_monitoring(&vol_id) {
                tracing::error!(%vol_id, error = %e, "failed to resume monitoring");
            }
        }
    }

    let server = tokio::spawn(run_server(Arc::clone(&ctx), listener, shutdown_rx));

    shutdown_signal().await;
    info!("shutting down");
    ctx.ps.set_shutdown(false);
    shutdown_tx.send(true).ok();

    server.await?.ok();
    for task in tasks.drain(..) {
        task.await.ok();
    }
    info!("shutdown complete");
    Ok(())
}

fn load_config(path: &Option<PathBuf>) -> Result<StorageConfig> {
    match path {
        Some(p) => StorageConfig::from_file(p)
            .with_context(|| format!("failed to load config {}", p.display())),
        None => {
            let default_paths =
                [PathBuf::from("walb-storage.toml"), PathBuf::from("/etc/walb/storage.toml")];
            for p in &default_paths {
                if p.exists() {
                    return StorageConfig::from_file(p)
                        .with_context(|| format!("failed to load config {}", p.display()));
                }
            }
            Ok(StorageConfig::default())
        }
    }
}

fn init_logging(config: &StorageConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let fmt_layer = tracing_subscriber::fmt::layer();

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry().with(filter).with(fmt_layer.json()).init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry().with(filter).with(fmt_layer).init();
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            info!("received SIGTERM, initiating shutdown");
        }
    }
}
