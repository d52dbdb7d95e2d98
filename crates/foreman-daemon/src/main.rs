//! Foreman Daemon
//!
//! Schedules feature pipelines across agent CLI subprocesses and serves the
//! HTTP API with live SSE streams.

use std::future::IntoFuture;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use foreman_core::config::{default_database_path, load_config};
use foreman_daemon::orchestration::{FeatureWatcher, Orchestrator};
use foreman_daemon::server::{AppState, build_router};
use foreman_daemon::storage::Database;

const HTTP_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "foreman-daemon")]
#[command(version, about = "Foreman daemon - agent pipeline scheduler")]
struct Args {
    /// Project directory holding `.foreman/settings.json`
    #[arg(long, env = "FOREMAN_PROJECT_DIR")]
    project_dir: Option<PathBuf>,

    /// HTTP bind address (overrides settings)
    #[arg(long, env = "FOREMAN_LISTEN_ADDR")]
    addr: Option<String>,

    /// Database file path (overrides settings)
    #[arg(long, env = "FOREMAN_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Agent CLI program (overrides settings)
    #[arg(long, env = "FOREMAN_AGENT_PROGRAM")]
    agent_program: Option<String>,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    #[arg(long, env = "FOREMAN_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "FOREMAN_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.project_dir.as_deref())?;
    if let Some(addr) = args.addr {
        config.daemon.listen_addr = addr;
    }
    if let Some(path) = args.db_path {
        config.daemon.database_path = Some(path);
    }
    if let Some(program) = args.agent_program {
        config.sessions.agent_program = program;
    }
    if let Some(level) = args.log_level {
        config.daemon.log_level = level;
    }
    config.daemon.log_json |= args.log_json;

    let log_filter = format!("foreman_daemon={}", config.daemon.log_level);
    foreman_core::tracing_init::init_tracing(&log_filter, config.daemon.log_json)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.daemon.listen_addr,
        agent = %config.sessions.agent_program,
        success_status = ?config.pipeline.success_status,
        "Starting foreman-daemon"
    );

    let db_path = config
        .daemon
        .database_path
        .clone()
        .or_else(default_database_path)
        .ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?;
    info!(path = %db_path.display(), "Opening database");
    let db = Database::open(&db_path).await?;

    let listen_addr = config.daemon.listen_addr.clone();
    let orchestrator = Orchestrator::new(db, config);
    orchestrator.recover().await?;

    let watcher = FeatureWatcher::new(Arc::clone(&orchestrator));
    let watcher_handle = tokio::spawn(watcher.run(orchestrator.shutdown_token()));

    let app = build_router(AppState {
        orchestrator: Arc::clone(&orchestrator),
    });
    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // `true` unsets $NOTIFY_SOCKET so agent subprocesses can't notify systemd.
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    info!(addr = %listen_addr, "HTTP server ready");

    let shutdown = orchestrator.shutdown_token();
    let server = tokio::spawn(
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .into_future(),
    );

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C shutdown signal"),
        _ = sigterm_future => info!("Received SIGTERM shutdown signal"),
    }

    orchestrator.shutdown().await;
    if let Err(e) = watcher_handle.await {
        warn!(error = %e, "Watcher task ended abnormally");
    }
    // Live SSE streams never end on their own.
    match tokio::time::timeout(HTTP_DRAIN_TIMEOUT, server).await {
        Ok(Ok(result)) => result?,
        Ok(Err(e)) => warn!(error = %e, "HTTP server task ended abnormally"),
        Err(_) => warn!("HTTP connections still open after drain timeout"),
    }

    info!("Daemon stopped");
    Ok(())
}
