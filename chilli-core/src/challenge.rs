//! Per-address anti-replay challenges.
//!
//! A challenge is handed to the client (via `/challenge` or the portal
//! redirect) and must come back hashed with the password inside the validity
//! window. Each challenge backs at most one credential check: taking it for a
//! login removes it.

use crate::error::ChallengeError;
use crate::REDIR_CHALLEN;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Challenge {
    pub bytes: [u8; REDIR_CHALLEN],
    pub issued: Instant,
}

impl Challenge {
    pub fn age(&self) -> Duration {
        self.issued.elapsed()
    }

    pub fn is_fresh(&self, window: Duration) -> bool {
        self.age() <= window
    }
}

/// Challenges keyed by client address, shared by every connection handler.
#[derive(Debug, Default)]
pub struct ChallengeStore {
    entries: Mutex<HashMap<Ipv4Addr, Challenge>>,
}

impl ChallengeStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<Ipv4Addr, Challenge>> {
        // Entries are replaced whole under the lock, so a poisoned map is
        // still consistent.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Issues a fresh random challenge for `addr`, replacing any previous one.
    pub fn issue(&self, addr: Ipv4Addr) -> Result<[u8; REDIR_CHALLEN], getrandom::Error> {
        let mut bytes = [0u8; REDIR_CHALLEN];
        getrandom::getrandom(&mut bytes)?;

        let mut entries = self.entries();
        while entries.get(&addr).is_some_and(|prev| prev.bytes == bytes) {
            getrandom::getrandom(&mut bytes)?;
        }
        entries.insert(
            addr,
            Challenge {
                bytes,
                issued: Instant::now(),
            },
        );
        debug!(client = %addr, "issued challenge");
        Ok(bytes)
    }

    /// Installs an externally chosen challenge for `addr`.
    pub fn set(&self, addr: Ipv4Addr, bytes: [u8; REDIR_CHALLEN]) {
        self.entries().insert(
            addr,
            Challenge {
                bytes,
                issued: Instant::now(),
            },
        );
    }

    pub fn get(&self, addr: Ipv4Addr) -> Option<Challenge> {
        self.entries().get(&addr).copied()
    }

    /// Removes the challenge for `addr` and returns it if it is still inside
    /// `window` and, when the client echoed one, equal to `presented`.
    pub fn take_fresh(
        &self,
        addr: Ipv4Addr,
        presented: Option<&[u8; REDIR_CHALLEN]>,
        window: Duration,
    ) -> Result<Challenge, ChallengeError> {
        let challenge = self.entries().remove(&addr).ok_or(ChallengeError::Missing)?;
        if !challenge.is_fresh(window) {
            return Err(ChallengeError::Expired {
                age_secs: challenge.age().as_secs(),
            });
        }
        match presented {
            Some(p) if *p != challenge.bytes => Err(ChallengeError::Mismatch),
            _ => Ok(challenge),
        }
    }

    /// Drops every challenge older than `window`; returns how many went.
    pub fn purge_expired(&self, window: Duration) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, c| c.is_fresh(window));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}
