// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Tally Node
//!
//! Entry point for the `tally-node` binary. Parses CLI arguments,
//! initializes logging and metrics, and runs one of the two roles:
//!
//! - `device`    - local HTTP API, TCP peer listener and background sync
//! - `authority` - canonical ledger and the sync endpoint devices call
//! - `init`      - create a device data directory with a fresh device id
//! - `version`   - print build version information

mod api;
mod cli;
mod logging;
mod metrics;
mod peer;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;

use tally_ledger::config::{LedgerLimits, SyncConfig, PROTOCOL_VERSION};
use tally_ledger::sync::spawn_sync_loop;
use tally_ledger::{
    Authority, DeviceId, HttpAuthority, LedgerDB, LedgerEngine, PaymentService, Perspective,
    SessionRegistry, SyncReconciler, SyncTrigger,
};

use cli::{Commands, TallyNodeCli};
use logging::{LogFormat, NodeRole};
use metrics::NodeMetrics;
use peer::PeerNetwork;

/// File inside the data directory holding the device id.
const DEVICE_ID_FILE: &str = "device-id";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = TallyNodeCli::parse();

    match cli.command {
        Commands::Device(args) => run_device(args).await,
        Commands::Authority(args) => run_authority(args).await,
        Commands::Init(args) => init_device(args),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

fn version_string() -> String {
    format!("{} (protocol {})", env!("CARGO_PKG_VERSION"), PROTOCOL_VERSION)
}

/// Starts a device: HTTP API, peer listener and background sync.
async fn run_device(args: cli::DeviceArgs) -> Result<()> {
    logging::init_logging(NodeRole::Device, args.log_format);

    std::fs::create_dir_all(&args.data_dir).with_context(|| {
        format!("failed to create data directory: {}", args.data_dir.display())
    })?;

    let owner = match args.device_id {
        Some(id) => DeviceId::new(id),
        None => load_or_create_device_id(&args.data_dir)?,
    };

    tracing::info!(
        device = %owner,
        http_port = args.http_port,
        peer_port = args.peer_port,
        authority = %args.authority_url,
        data_dir = %args.data_dir.display(),
        "starting tally device"
    );

    // --- Persistent storage ---
    let db_path = args.data_dir.join("ledger");
    let db = LedgerDB::open(&db_path)
        .with_context(|| format!("failed to open ledger at {}", db_path.display()))?;
    tracing::info!(path = %db_path.display(), "ledger opened");

    let engine = Arc::new(LedgerEngine::new(
        db,
        Perspective::Device(owner.clone()),
        LedgerLimits::default(),
    ));
    let account = engine
        .ensure_account(&owner)
        .context("failed to open owner account")?;
    tracing::info!(balance = %account.balance, "owner account ready");

    // --- Metrics ---
    let node_metrics = Arc::new(NodeMetrics::new().context("failed to register metrics")?);

    // --- Shutdown fan-out ---
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // --- Payments & peers ---
    let registry = Arc::new(SessionRegistry::new());
    let trigger = SyncTrigger::new();
    let service = Arc::new(PaymentService::new(
        owner.clone(),
        Arc::clone(&engine),
        registry.clone(),
        trigger.clone(),
    ));
    let peers = PeerNetwork::new(
        registry,
        Arc::clone(&service),
        Arc::clone(&node_metrics),
        shutdown_rx.clone(),
    );

    // --- Sync ---
    let sync_config = SyncConfig {
        auto_sync_interval: Duration::from_secs(args.sync_interval_secs.max(1)),
        ..SyncConfig::default()
    };
    let authority = HttpAuthority::new(&args.authority_url, sync_config.request_timeout)
        .context("failed to build authority client")?;
    tracing::info!(endpoint = authority.endpoint(), "authority configured");
    let reconciler = Arc::new(SyncReconciler::new(
        Arc::clone(&engine),
        Arc::new(authority),
        owner,
        &sync_config,
    ));

    let sync_metrics = Arc::clone(&node_metrics);
    let sync_loop = spawn_sync_loop(
        Arc::clone(&reconciler),
        trigger.clone(),
        sync_config.auto_sync_interval,
        shutdown_rx.clone(),
        move |outcome| sync_metrics.record_sync(outcome),
    );

    // --- Peer listener ---
    let peer_addr = format!("0.0.0.0:{}", args.peer_port);
    let peer_listener = tokio::net::TcpListener::bind(&peer_addr)
        .await
        .with_context(|| format!("failed to bind peer listener on {}", peer_addr))?;
    tracing::info!("peer listener on {}", peer_addr);
    let peer_task = tokio::spawn(Arc::clone(&peers).listen(peer_listener));

    // --- API server ---
    let router = api::create_device_router(api::DeviceState {
        version: version_string(),
        service,
        reconciler,
        peers,
        trigger,
        metrics: node_metrics,
    });
    let api_addr = format!("0.0.0.0:{}", args.http_port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {}", api_addr))?;
    tracing::info!("device API listening on {}", api_addr);

    // --- Serve ---
    let mut api_shutdown = shutdown_rx;
    let server = axum::serve(api_listener, router).with_graceful_shutdown(async move {
        let _ = api_shutdown.wait_for(|stop| *stop).await;
    });

    tokio::select! {
        res = server => {
            if let Err(e) = res {
                tracing::error!("API server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received, draining connections");
        }
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = sync_loop.await {
        tracing::warn!(error = %e, "sync loop ended abnormally");
    }
    if let Err(e) = peer_task.await {
        tracing::warn!(error = %e, "peer listener ended abnormally");
    }
    engine.db().flush().context("failed to flush ledger")?;

    tracing::info!("tally device stopped");
    Ok(())
}

/// Starts the authority HTTP server.
async fn run_authority(args: cli::AuthorityArgs) -> Result<()> {
    logging::init_logging(NodeRole::Authority, args.log_format);

    tracing::info!(
        port = args.port,
        data_dir = %args.data_dir.display(),
        "starting tally authority"
    );

    let db_path = args.data_dir.join("ledger");
    std::fs::create_dir_all(&args.data_dir).with_context(|| {
        format!("failed to create data directory: {}", args.data_dir.display())
    })?;
    let db = LedgerDB::open(&db_path)
        .with_context(|| format!("failed to open ledger at {}", db_path.display()))?;
    tracing::info!(
        path = %db_path.display(),
        accounts = db.account_count(),
        transactions = db.transaction_count(),
        "canonical ledger opened"
    );

    let authority = Arc::new(Authority::new(db, LedgerLimits::default()));
    let node_metrics = Arc::new(NodeMetrics::new().context("failed to register metrics")?);

    let router = api::create_authority_router(api::AuthorityState {
        version: version_string(),
        authority: Arc::clone(&authority),
        metrics: node_metrics,
    });
    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {}", addr))?;
    tracing::info!("authority API listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("authority server error")?;

    authority
        .engine()
        .db()
        .flush()
        .context("failed to flush ledger")?;
    tracing::info!("tally authority stopped");
    Ok(())
}

/// Creates a device data directory and writes a fresh device id.
fn init_device(args: cli::InitArgs) -> Result<()> {
    logging::init_logging(NodeRole::Setup, LogFormat::Pretty);

    let data_dir = &args.data_dir;
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

    let id_path = data_dir.join(DEVICE_ID_FILE);
    if id_path.exists() && !args.force {
        anyhow::bail!(
            "{} already exists; pass --force to replace the device id",
            id_path.display()
        );
    }

    let id = DeviceId::generate();
    std::fs::write(&id_path, id.as_str())
        .with_context(|| format!("failed to write device id to {}", id_path.display()))?;
    tracing::info!(device = %id, path = %id_path.display(), "device id generated");

    println!("Device initialized successfully.");
    println!("  Data directory : {}", data_dir.display());
    println!("  Device id      : {}", id);

    Ok(())
}

/// Reads the device id stored in `data_dir`, generating one on first run.
fn load_or_create_device_id(data_dir: &Path) -> Result<DeviceId> {
    let id_path = data_dir.join(DEVICE_ID_FILE);
    match std::fs::read_to_string(&id_path) {
        Ok(contents) => {
            let id = contents.trim();
            anyhow::ensure!(!id.is_empty(), "{} is empty", id_path.display());
            Ok(DeviceId::new(id))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let id = DeviceId::generate();
            std::fs::write(&id_path, id.as_str())
                .with_context(|| format!("failed to write device id to {}", id_path.display()))?;
            tracing::info!(device = %id, "generated new device id");
            Ok(id)
        }
        Err(e) => {
            Err(e).with_context(|| format!("failed to read device id from {}", id_path.display()))
        }
    }
}

/// Prints version information to stdout.
fn print_version() {
    println!("tally-node {}", env!("CARGO_PKG_VERSION"));
    println!("protocol   {}", PROTOCOL_VERSION);
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported. If a handler cannot be
/// installed, that signal is ignored and the other still works.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
