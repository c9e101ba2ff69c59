use crate::queue::{MsgReceiver, MsgSender};
use async_trait::async_trait;
use chilli_core::{MsgKind, PostError, RedirMsg, SessionAuthority, SessionSnapshot};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// In-process session authority.
///
/// Holds the durable table of clients keyed by address. Reads are answered
/// directly; changes arrive only as [`RedirMsg`]s through the queue and are
/// applied by [`SessionTable::run`].
pub struct SessionTable {
    sessions: Mutex<HashMap<Ipv4Addr, SessionSnapshot>>,
    queue: MsgSender,
}

impl SessionTable {
    pub fn new(queue: MsgSender) -> Self {
        SessionTable {
            sessions: Mutex::new(HashMap::new()),
            queue,
        }
    }

    /// Records a client the lease manager handed an address to.
    pub async fn register(&self, addr: Ipv4Addr, hismac: [u8; 6], nasport: u32) {
        let mut sessions = self.sessions.lock().await;
        let entry = sessions.entry(addr).or_default();
        entry.hismac = hismac;
        entry.nasport = nasport;
    }

    pub async fn apply(&self, msg: RedirMsg) {
        self.apply_at(msg, unix_now()).await
    }

    async fn apply_at(&self, msg: RedirMsg, now: u64) {
        let mut sessions = self.sessions.lock().await;
        match msg.kind {
            MsgKind::Login => {
                let entry = sessions.entry(msg.addr).or_default();
                entry.authenticated = true;
                entry.sessionid = Some(msg.sessionid);
                entry.username = Some(msg.username);
                entry.userurl = Some(msg.userurl);
                entry.params = msg.params;
                entry.state = msg.state;
                entry.class = msg.class;
                entry.start_time = now;
                info!(
                    client = %msg.addr,
                    username = %entry.username.as_deref().unwrap_or_default(),
                    sessiontimeout = entry.params.sessiontimeout,
                    "session authenticated"
                );
            }
            kind @ (MsgKind::Logout | MsgKind::Abort) => {
                if let Some(entry) = sessions.get_mut(&msg.addr) {
                    // Keep what the lease manager told us, drop the session.
                    let (hismac, nasport) = (entry.hismac, entry.nasport);
                    *entry = SessionSnapshot {
                        hismac,
                        nasport,
                        ..Default::default()
                    };
                    info!(client = %msg.addr, ?kind, "session terminated");
                }
            }
        }
    }

    /// Applies queued messages until `stop` changes or every sender is gone.
    ///
    /// On stop the queue is closed to new posts and whatever was already
    /// accepted is still applied before returning.
    pub async fn run(self: Arc<Self>, mut rx: MsgReceiver, mut stop: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(msg) => self.apply_queued(msg).await,
                    None => {
                        info!("Redir message queue closed, session table consumer finished.");
                        return;
                    }
                },
                _ = stop.changed() => break,
            }
        }

        rx.close();
        let mut drained = 0usize;
        while let Some(msg) = rx.recv().await {
            self.apply_queued(msg).await;
            drained += 1;
        }
        info!(drained, "Session table consumer stopped.");
    }

    async fn apply_queued(&self, msg: RedirMsg) {
        debug!(client = %msg.addr, kind = ?msg.kind, "applying redir message");
        self.apply(msg).await;
    }

    async fn get_state_at(&self, addr: Ipv4Addr, now: u64) -> Option<SessionSnapshot> {
        let sessions = self.sessions.lock().await;
        let entry = sessions.get(&addr)?;
        if entry.authenticated && entry.params.is_expired(entry.start_time, now) {
            debug!(client = %addr, "session expired");
            return None;
        }
        Some(entry.clone())
    }

    /// Drops authenticated sessions whose time is up. Returns how many.
    pub async fn reap_expired(&self) -> usize {
        let now = unix_now();
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|_, s| !(s.authenticated && s.params.is_expired(s.start_time, now)));
        before - sessions.len()
    }

    pub async fn all(&self) -> Vec<(Ipv4Addr, SessionSnapshot)> {
        let sessions = self.sessions.lock().await;
        sessions.iter().map(|(ip, s)| (*ip, s.clone())).collect()
    }

    pub async fn load(&self, entries: Vec<(Ipv4Addr, SessionSnapshot)>) {
        let mut sessions = self.sessions.lock().await;
        sessions.extend(entries);
    }
}

#[async_trait]
impl SessionAuthority for SessionTable {
    async fn get_state(&self, addr: Ipv4Addr) -> Option<SessionSnapshot> {
        self.get_state_at(addr, unix_now()).await
    }

    fn publish(&self, msg: RedirMsg) -> Result<(), PostError> {
        self.queue.post(msg)
    }
}
