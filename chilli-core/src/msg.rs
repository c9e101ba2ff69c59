use crate::conn::SessionId;
use crate::session::SessionParams;
use crate::{AttrBuf, UserUrl, Username, REDIR_CHALLEN};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    /// RADIUS accepted the client; open a session.
    Login,
    /// Client logged off.
    Logout,
    /// Client aborted; end the session.
    Abort,
}

impl MsgKind {
    pub fn terminates(self) -> bool {
        matches!(self, MsgKind::Logout | MsgKind::Abort)
    }
}

/// Authentication event posted to the session authority.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RedirMsg {
    pub kind: MsgKind,
    pub addr: Ipv4Addr,
    pub sessionid: SessionId,
    pub username: Username,
    pub userurl: UserUrl,
    pub uamchal: [u8; REDIR_CHALLEN],
    pub state: Option<AttrBuf>,
    pub class: Option<AttrBuf>,
    /// Timers, bandwidth and octet caps, termination time.
    pub params: SessionParams,
}
