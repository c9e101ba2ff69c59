pub mod config;

use anyhow::{Context, Result};
use chilli_core::{ChallengeStore, Config, SessionSnapshot};
use chilli_http::{run_server, Redir};
use chilli_ipc::{msg_queue, SessionTable};
use chilli_net::RadiusClient;
use clap::Parser;
use std::fs;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{load_config_from_path, Args};

const REAPER_INTERVAL: Duration = Duration::from_secs(60);
const QUEUE_DRAIN: Duration = Duration::from_secs(5);

fn init_tracing(config: &Config, debug: bool) {
    let level = if debug { "debug" } else { config.loglevel.as_filter() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Builds a listener instance for `config` around the long-lived state.
fn build_redir(
    config: Arc<Config>,
    challenges: Arc<ChallengeStore>,
    table: Arc<SessionTable>,
) -> Arc<Redir> {
    let radius = Arc::new(RadiusClient::new(&config));
    Arc::new(Redir::new(config, challenges, table, radius))
}

async fn load_status(status_file: &Option<PathBuf>, table: &SessionTable) -> Result<()> {
    if let Some(path) = status_file {
        if path.exists() {
            info!("Loading status from {}", path.display());
            let data = fs::read(path)?;
            let sessions: Vec<(Ipv4Addr, SessionSnapshot)> = serde_json::from_slice(&data)?;
            table.load(sessions).await;
        }
    }
    Ok(())
}

async fn save_status(status_file: &Option<PathBuf>, table: &SessionTable) -> Result<()> {
    if let Some(path) = status_file {
        info!("Saving status to {}", path.display());
        let sessions = table.all().await;
        let data = serde_json::to_vec_pretty(&sessions)?;
        fs::write(path, data)?;
    }
    Ok(())
}

async fn sighup_handler(
    config_file: PathBuf,
    redir_tx: watch::Sender<Arc<Redir>>,
    challenges: Arc<ChallengeStore>,
    table: Arc<SessionTable>,
) {
    let mut stream = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(e) => {
            error!("Failed to create SIGHUP listener, reloads disabled: {}", e);
            return std::future::pending().await;
        }
    };

    while stream.recv().await.is_some() {
        info!("SIGHUP received, reloading configuration...");
        match load_config_from_path(&config_file) {
            Ok(new_config) => {
                let current = redir_tx.borrow().config().clone();
                if new_config.uam_addr() != current.uam_addr() {
                    warn!(
                        "UAM listen address change to {} needs a restart, keeping {}",
                        new_config.uam_addr(),
                        current.uam_addr()
                    );
                }
                let redir = build_redir(Arc::new(new_config), challenges.clone(), table.clone());
                if redir_tx.send(redir).is_err() {
                    error!("UAM listener is gone, cannot reload config.");
                    break;
                }
                info!("Configuration reloaded successfully.");
            }
            Err(e) => {
                error!("Failed to reload configuration: {:#}", e);
            }
        }
    }
}

async fn session_reaper_loop(table: Arc<SessionTable>) {
    let mut interval = tokio::time::interval(REAPER_INTERVAL);
    loop {
        interval.tick().await;
        let reaped = table.reap_expired().await;
        if reaped > 0 {
            info!(reaped, "removed expired sessions");
        }
    }
}

/// Tells the session table consumer to stop and waits a bounded time for
/// it to apply what is still queued.
async fn stop_session_consumer(stop: watch::Sender<bool>, mut consumer: JoinHandle<()>) {
    let _ = stop.send(true);
    match tokio::time::timeout(QUEUE_DRAIN, &mut consumer).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Session table consumer failed: {}", e),
        Err(_) => {
            warn!("Session queue not drained after {:?}, dropping the rest", QUEUE_DRAIN);
            consumer.abort();
        }
    }
}

pub async fn run() -> Result<()> {
    let args = Args::parse();
    let config = Arc::new(load_config_from_path(&args.config_file)?);
    init_tracing(&config, args.debug);

    info!("Starting chilli-redir {}", env!("CARGO_PKG_VERSION"));
    serve(args.config_file, config).await
}

async fn serve(config_file: PathBuf, config: Arc<Config>) -> Result<()> {
    let (queue_tx, queue_rx) = msg_queue(config.msg_queue_depth);
    let table = Arc::new(SessionTable::new(queue_tx));
    if let Err(e) = load_status(&config.statusfile, &table).await {
        warn!("Failed to load status file: {:#}", e);
    }
    let (consumer_stop, consumer_stop_rx) = watch::channel(false);
    let consumer_handle = tokio::spawn(table.clone().run(queue_rx, consumer_stop_rx));
    let reaper_handle = tokio::spawn(session_reaper_loop(table.clone()));

    let challenges = Arc::new(ChallengeStore::new());
    let listener = TcpListener::bind(config.uam_addr())
        .await
        .with_context(|| format!("binding UAM listener on {}", config.uam_addr()))?;
    info!("UAM listener on {}", config.uam_addr());
    let redir = build_redir(config.clone(), challenges.clone(), table.clone());
    let (redir_tx, redir_rx) = watch::channel(redir);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server_handle = tokio::spawn(run_server(listener, redir_rx, shutdown_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl-C, shutting down.");
        }
        _ = sighup_handler(config_file, redir_tx, challenges, table.clone()) => {
            info!("SIGHUP handler finished.");
        }
    }

    let _ = shutdown_tx.send(true);
    match server_handle.await {
        Ok(Ok(())) => info!("UAM listener stopped."),
        Ok(Err(e)) => error!("UAM listener failed: {}", e),
        Err(e) => error!("UAM listener task failed: {}", e),
    }
    reaper_handle.abort();
    stop_session_consumer(consumer_stop, consumer_handle).await;

    if let Err(e) = save_status(&config.statusfile, &table).await {
        warn!("Failed to save status file: {:#}", e);
    }
    info!("Shutdown complete.");
    Ok(())
}
