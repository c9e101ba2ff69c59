//! The RADIUS collaborator as seen by the redirect handler.

use crate::conn::SessionId;
use crate::session::SessionParams;
use crate::{AttrBuf, AttrString, Username, REDIR_CHALLEN, REDIR_ETH_ALEN, REDIR_MD5LEN};
use async_trait::async_trait;
use std::fmt;
use std::net::Ipv4Addr;

#[derive(Clone, PartialEq, Eq)]
pub enum RadiusCredential {
    /// Cleartext password, hidden on the wire by the client implementation.
    Pap(Vec<u8>),
    Chap {
        challenge: [u8; REDIR_CHALLEN],
        response: [u8; REDIR_MD5LEN],
    },
}

impl fmt::Debug for RadiusCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RadiusCredential::Pap(_) => f.write_str("Pap(..)"),
            RadiusCredential::Chap { challenge, .. } => f
                .debug_struct("Chap")
                .field("challenge", &hex::encode(challenge))
                .finish_non_exhaustive(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RadiusRequest {
    pub username: Username,
    pub credential: RadiusCredential,
    pub hisip: Ipv4Addr,
    pub hismac: [u8; REDIR_ETH_ALEN],
    pub nasport: u32,
    pub sessionid: SessionId,
    /// State from a previous round, echoed back.
    pub state: Option<AttrBuf>,
}

/// What an Access-Accept carried that the gateway cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RadiusAccept {
    pub params: SessionParams,
    pub state: Option<AttrBuf>,
    pub class: Option<AttrBuf>,
    pub redirurl: Option<AttrString>,
    pub reply: Option<AttrString>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadiusOutcome {
    Accept(RadiusAccept),
    Reject { reply: Option<AttrString> },
    /// No server answered within the collaborator's retry policy.
    Timeout,
}

#[async_trait]
pub trait RadiusAuthenticator: Send + Sync {
    async fn authenticate(&self, request: RadiusRequest) -> RadiusOutcome;
}
