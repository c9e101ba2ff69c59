//! Per-request working state.

use crate::challenge::Challenge;
use crate::error::FieldError;
use crate::msg::{MsgKind, RedirMsg};
use crate::radius::RadiusAccept;
use crate::session::{SessionParams, SessionSnapshot};
use crate::{
    AttrBuf, AttrString, BoundedString, Password, RequestKind, UserUrl, Username,
    REDIR_CHALLEN, REDIR_ETH_ALEN, REDIR_MD5LEN, REDIR_SESSIONID_LEN,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

static SESSION_COUNTER: AtomicU32 = AtomicU32::new(0);

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Accounting session identifier: up to 16 printable ASCII characters.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(BoundedString<{ REDIR_SESSIONID_LEN - 1 }>);

impl SessionId {
    /// A new identifier built from the current time and a process-wide counter.
    pub fn generate() -> Self {
        let counter = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
        // Sixteen hex digits always fit.
        Self(BoundedString::new("sessionid", format!("{:08x}{:08x}", unix_now() as u32, counter))
            .unwrap_or_default())
    }

    pub fn parse(value: &str) -> Result<Self, FieldError> {
        if value.is_empty() || !value.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(FieldError::BadLength {
                field: "sessionid",
                expected: REDIR_SESSIONID_LEN - 1,
                len: value.len(),
            });
        }
        Ok(Self(BoundedString::new("sessionid", value)?))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl TryFrom<String> for SessionId {
    type Error = FieldError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SessionId> for String {
    fn from(value: SessionId) -> Self {
        value.0.into()
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parses `00-11-22-33-44-55` or `00:11:22:33:44:55`.
pub fn parse_mac(value: &str) -> Option<[u8; REDIR_ETH_ALEN]> {
    let mut mac = [0u8; REDIR_ETH_ALEN];
    let mut parts = value.split(|c| c == '-' || c == ':');
    for byte in mac.iter_mut() {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    parts.next().is_none().then_some(mac)
}

/// Formats a MAC the way RADIUS station ids and portal URLs carry it.
pub fn format_mac(mac: &[u8; REDIR_ETH_ALEN]) -> String {
    mac.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join("-")
}

/// Credential supplied with a login.
#[derive(Clone, PartialEq, Eq, Default)]
pub enum Credential {
    #[default]
    None,
    /// Hex-decoded `password` parameter, still masked with the challenge.
    Password(Password),
    /// CHAP response over the challenge.
    Chap([u8; REDIR_MD5LEN]),
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::None => f.write_str("None"),
            Credential::Password(_) => f.write_str("Password(..)"),
            Credential::Chap(_) => f.write_str("Chap(..)"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RadiusResponse {
    #[default]
    Pending,
    Reject,
    Accept,
    Timeout,
}

/// Everything known about one UAM request while it is being handled.
#[derive(Debug, Clone)]
pub struct RedirConn {
    pub kind: RequestKind,
    pub username: Username,
    pub userurl: UserUrl,
    pub credential: Credential,
    /// Challenge echoed back by the client, if any.
    pub presented_challenge: Option<[u8; REDIR_CHALLEN]>,

    pub uamchal: [u8; REDIR_CHALLEN],
    pub uamtime: Option<Instant>,

    pub authenticated: bool,
    pub nasport: u32,
    pub hismac: [u8; REDIR_ETH_ALEN],
    pub ourmac: [u8; REDIR_ETH_ALEN],
    pub hisip: Ipv4Addr,
    pub ourip: Ipv4Addr,
    pub sessionid: SessionId,

    pub response: RadiusResponse,
    pub params: SessionParams,
    /// Seconds left in the session when the reply is built.
    pub timeleft: Option<u64>,
    pub state: Option<AttrBuf>,
    pub class: Option<AttrBuf>,
    pub redirurl: Option<AttrString>,
    pub reply: Option<AttrString>,
}

impl RedirConn {
    pub fn new(hisip: Ipv4Addr, ourip: Ipv4Addr) -> Self {
        Self {
            kind: RequestKind::Prelogin,
            username: Username::default(),
            userurl: UserUrl::default(),
            credential: Credential::None,
            presented_challenge: None,
            uamchal: [0; REDIR_CHALLEN],
            uamtime: None,
            authenticated: false,
            nasport: 0,
            hismac: [0; REDIR_ETH_ALEN],
            ourmac: [0; REDIR_ETH_ALEN],
            hisip,
            ourip,
            sessionid: SessionId::generate(),
            response: RadiusResponse::Pending,
            params: SessionParams::default(),
            timeleft: None,
            state: None,
            class: None,
            redirurl: None,
            reply: None,
        }
    }

    /// Takes over what the session authority reports for this client.
    /// Request fields the client supplied win over stored ones.
    pub fn apply_snapshot(&mut self, snapshot: SessionSnapshot) {
        self.apply_snapshot_at(snapshot, unix_now());
    }

    pub fn apply_snapshot_at(&mut self, snapshot: SessionSnapshot, now: u64) {
        self.authenticated = snapshot.authenticated;
        self.hismac = snapshot.hismac;
        self.nasport = snapshot.nasport;
        if let Some(id) = snapshot.sessionid {
            self.sessionid = id;
        }
        if self.username.is_empty() {
            if let Some(username) = snapshot.username {
                self.username = username;
            }
        }
        if self.userurl.is_empty() {
            if let Some(userurl) = snapshot.userurl {
                self.userurl = userurl;
            }
        }
        self.params = snapshot.params;
        self.state = snapshot.state;
        self.class = snapshot.class;
        if snapshot.authenticated {
            self.timeleft = snapshot.params.time_left(snapshot.start_time, now);
        }
    }

    pub fn set_challenge(&mut self, challenge: &Challenge) {
        self.uamchal = challenge.bytes;
        self.uamtime = Some(challenge.issued);
    }

    /// Copies what an Access-Accept carried into the context.
    pub fn apply_accept(&mut self, accept: RadiusAccept) {
        self.response = RadiusResponse::Accept;
        self.authenticated = true;
        self.params = accept.params;
        let now = unix_now();
        self.timeleft = accept.params.time_left(now, now);
        if accept.state.is_some() {
            self.state = accept.state;
        }
        if accept.class.is_some() {
            self.class = accept.class;
        }
        self.redirurl = accept.redirurl;
        self.reply = accept.reply;
    }

    pub fn to_msg(&self, kind: MsgKind) -> RedirMsg {
        RedirMsg {
            kind,
            addr: self.hisip,
            sessionid: self.sessionid.clone(),
            username: self.username.clone(),
            userurl: self.userurl.clone(),
            uamchal: self.uamchal,
            state: self.state.clone(),
            class: self.class.clone(),
            params: self.params,
        }
    }
}
