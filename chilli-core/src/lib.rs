pub mod authority;
pub mod bounded;
pub mod challenge;
pub mod config;
pub mod conn;
pub mod error;
pub mod msg;
pub mod radius;
pub mod session;

use serde::{Deserialize, Serialize};

pub use authority::SessionAuthority;
pub use bounded::{BoundedBytes, BoundedString};
pub use challenge::{Challenge, ChallengeStore};
pub use config::{Config, LogLevel, StageTimeouts};
pub use conn::{Credential, RadiusResponse, RedirConn, SessionId};
pub use error::{ChallengeError, FieldError, PostError, RedirError};
pub use msg::{MsgKind, RedirMsg};
pub use radius::{RadiusAccept, RadiusAuthenticator, RadiusCredential, RadiusOutcome, RadiusRequest};
pub use session::{SessionParams, SessionSnapshot};

pub const REDIR_CHALLEN: usize = 16;
pub const REDIR_MD5LEN: usize = 16;
pub const REDIR_MAXCHAR: usize = 64;
/// Upper bound on the request head read from a client.
pub const REDIR_MAXBUFFER: usize = 5125;
pub const REDIR_USERNAMESIZE: usize = 256;
pub const REDIR_USERURLSIZE: usize = 256;
pub const REDIR_MAXCONN: usize = 16;
pub const REDIR_SESSIONID_LEN: usize = 17;
pub const REDIR_URL_LEN: usize = 2048;
pub const REDIR_ETH_ALEN: usize = 6;
pub const RADIUS_ATTR_VLEN: usize = 253;

/// Username as received from the client, without the C terminator slot.
pub type Username = BoundedString<{ REDIR_USERNAMESIZE - 1 }>;
/// URL the client originally asked for.
pub type UserUrl = BoundedString<{ REDIR_USERURLSIZE - 1 }>;
/// Opaque RADIUS attribute value (State, Class).
pub type AttrBuf = BoundedBytes<RADIUS_ATTR_VLEN>;
/// Printable RADIUS attribute value (Reply-Message, redirection URL).
pub type AttrString = BoundedString<RADIUS_ATTR_VLEN>;
/// Decoded plaintext password bytes.
pub type Password = BoundedBytes<REDIR_MAXCHAR>;

/// The captive-portal action a request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    Login,
    Prelogin,
    Logout,
    Challenge,
    Abort,
    About,
    Static,
    MsDownload,
    Admin,
}

/// Outcome rendered back to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyCode {
    /// Login while already logged on.
    Already,
    FailedReject,
    /// Login failed for any reason other than an explicit reject.
    FailedOther,
    Success,
    Logoff,
    /// Reply to prelogin or any unrecognised GET.
    NotYet,
    AbortAck,
    AbortNak,
}

impl ReplyCode {
    /// Value of the `res` query parameter sent to the portal.
    pub fn res(self) -> &'static str {
        match self {
            ReplyCode::Already | ReplyCode::AbortNak => "already",
            ReplyCode::FailedReject | ReplyCode::FailedOther => "failed",
            ReplyCode::Success => "success",
            ReplyCode::Logoff | ReplyCode::AbortAck => "logoff",
            ReplyCode::NotYet => "notyet",
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(self, ReplyCode::FailedReject | ReplyCode::FailedOther)
    }
}

/// Where a connection is in its lifetime. Carried through the handler so a
/// timeout or error can be attributed to the stage it happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Init,
    GetRequest,
    GetState,
    Process,
    Radius,
    Reply,
    Terminal,
}
