use crate::conn::SessionId;
use crate::{AttrBuf, UserUrl, Username};
use serde::{Deserialize, Serialize};

/// Limits attached to an authenticated session, from RADIUS or the authority.
/// Zero means "no limit".
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionParams {
    pub bandwidthmaxup: u64,
    pub bandwidthmaxdown: u64,
    pub maxinputoctets: u64,
    pub maxoutputoctets: u64,
    pub maxtotaloctets: u64,
    pub sessiontimeout: u64,
    pub idletimeout: u64,
    pub interim_interval: u64,
    /// Absolute end of the session, seconds since the Unix epoch.
    pub sessionterminatetime: u64,
}

impl SessionParams {
    /// Seconds left before the session must end, if it is limited at all.
    pub fn time_left(&self, start_time: u64, now: u64) -> Option<u64> {
        let by_timeout = (self.sessiontimeout > 0)
            .then(|| (start_time + self.sessiontimeout).saturating_sub(now));
        let by_terminate = (self.sessionterminatetime > 0)
            .then(|| self.sessionterminatetime.saturating_sub(now));
        match (by_timeout, by_terminate) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn is_expired(&self, start_time: u64, now: u64) -> bool {
        self.time_left(start_time, now) == Some(0)
    }
}

/// What the session authority currently knows about a client address.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    pub authenticated: bool,
    pub hismac: [u8; 6],
    pub nasport: u32,
    pub sessionid: Option<SessionId>,
    pub username: Option<Username>,
    pub userurl: Option<UserUrl>,
    pub params: SessionParams,
    pub state: Option<AttrBuf>,
    pub class: Option<AttrBuf>,
    /// When the session was authenticated, seconds since the Unix epoch.
    pub start_time: u64,
}
