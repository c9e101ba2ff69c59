use crate::redir::Redir;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Accepts UAM connections until `shutdown` fires.
///
/// Each connection is served by the listener instance current at accept
/// time, so a reload swaps `redir_rx` without touching connections in
/// flight. At most `max_clients` connections are served at once: a slot is
/// taken before `accept`, so excess clients wait in the kernel backlog.
pub async fn run_server(
    listener: TcpListener,
    redir_rx: watch::Receiver<Arc<Redir>>,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    let max_clients = redir_rx.borrow().config().max_clients.max(1);
    let slots = Arc::new(Semaphore::new(max_clients));
    let mut tasks = JoinSet::new();
    let mut purge = tokio::time::interval(PURGE_INTERVAL);
    let mut slot: Option<OwnedSemaphorePermit> = None;

    info!(addr = %listener.local_addr()?, max_clients, "UAM listener started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("UAM listener shutting down");
                break;
            }
            _ = purge.tick() => {
                let redir = redir_rx.borrow().clone();
                let purged = redir.challenges().purge_expired(redir.config().challenge_window());
                if purged > 0 {
                    debug!(purged, "dropped expired challenges");
                }
            }
            permit = slots.clone().acquire_owned(), if slot.is_none() => {
                match permit {
                    Ok(permit) => slot = Some(permit),
                    Err(_) => break,
                }
            }
            accepted = listener.accept(), if slot.is_some() => {
                let (mut stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("Failed to accept UAM connection: {}", e);
                        continue;
                    }
                };
                let IpAddr::V4(client) = peer.ip() else {
                    debug!(%peer, "ignoring non-IPv4 client");
                    continue;
                };
                let permit = slot.take();
                let redir = redir_rx.borrow().clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    redir.handle(&mut stream, client).await
                });
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    error!("UAM connection task failed: {}", e);
                }
            }
        }
    }

    drop(listener);
    let drain = redir_rx.borrow().config().timeouts.total();
    let drained = tokio::time::timeout(drain, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(remaining = tasks.len(), "abandoning UAM connections still in flight");
        tasks.abort_all();
    }
    Ok(())
}
