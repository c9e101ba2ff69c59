//! Bounded reading and classification of UAM requests.

use chilli_core::{
    Credential, FieldError, Password, RedirError, RequestKind, UserUrl, Username, REDIR_CHALLEN,
    REDIR_MAXBUFFER,
};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

const MAX_HEADERS: usize = 32;

/// A parsed UAM request, before any session state is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UamRequest {
    pub kind: RequestKind,
    /// File name under `wwwdir` for [`RequestKind::Static`].
    pub file: Option<String>,
    pub username: Option<Username>,
    pub userurl: Option<UserUrl>,
    pub credential: Credential,
    pub challenge: Option<[u8; REDIR_CHALLEN]>,
}

impl UamRequest {
    fn new(kind: RequestKind) -> Self {
        UamRequest {
            kind,
            file: None,
            username: None,
            userurl: None,
            credential: Credential::None,
            challenge: None,
        }
    }
}

/// Maps a request path onto the action it asks for.
pub fn classify(path: &str) -> RequestKind {
    match path {
        "/login" | "/logon" => RequestKind::Login,
        "/prelogin" => RequestKind::Prelogin,
        "/logout" | "/logoff" => RequestKind::Logout,
        "/challenge" => RequestKind::Challenge,
        "/abort" | "/abortlogin" => RequestKind::Abort,
        "/about" => RequestKind::About,
        "/msdownload" => RequestKind::MsDownload,
        "/admin" => RequestKind::Admin,
        p if p.starts_with("/www/") => RequestKind::Static,
        _ => RequestKind::Prelogin,
    }
}

/// Accepts a plain file name: no separators, no leading dot.
fn static_file(name: &str) -> Result<String, RedirError> {
    let ok = !name.is_empty()
        && !name.starts_with('.')
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_'));
    if ok {
        Ok(name.to_string())
    } else {
        Err(RedirError::Malformed(format!("bad static file name '{}'", name)))
    }
}

fn decode_hex(field: &'static str, value: &str) -> Result<Vec<u8>, FieldError> {
    hex::decode(value).map_err(|_| FieldError::BadHex { field })
}

fn decode_md5(field: &'static str, value: &str) -> Result<[u8; REDIR_CHALLEN], FieldError> {
    let bytes = decode_hex(field, value)?;
    let len = bytes.len();
    bytes.try_into().map_err(|_| FieldError::BadLength {
        field,
        expected: REDIR_CHALLEN,
        len,
    })
}

/// Values that may end up in a response header must not carry CR, LF or
/// any other control character.
fn printable(field: &'static str, value: String) -> Result<String, FieldError> {
    if value.chars().any(char::is_control) {
        return Err(FieldError::Control { field });
    }
    Ok(value)
}

fn apply_query(req: &mut UamRequest, query: &str) -> Result<(), RedirError> {
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "username" => req.username = Some(Username::new("username", value.into_owned())?),
            "userurl" => {
                let userurl = printable("userurl", value.into_owned())?;
                req.userurl = Some(UserUrl::new("userurl", userurl)?);
            }
            "password" => {
                let bytes = decode_hex("password", &value)?;
                req.credential = Credential::Password(Password::new("password", bytes)?);
            }
            "response" => req.credential = Credential::Chap(decode_md5("response", &value)?),
            "challenge" => req.challenge = Some(decode_md5("challenge", &value)?),
            _ => {}
        }
    }
    Ok(())
}

/// Parses a complete request head.
pub fn parse_request(head: &[u8]) -> Result<UamRequest, RedirError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => return Err(RedirError::Incomplete),
        Err(e) => return Err(RedirError::Malformed(e.to_string())),
    }

    let method = req.method.unwrap_or_default();
    if method != "GET" {
        return Err(RedirError::Method(method.to_string()));
    }
    let target = req.path.unwrap_or("/");
    let (path, query) = target.split_once('?').unwrap_or((target, ""));

    let mut uam = UamRequest::new(classify(path));
    if uam.kind == RequestKind::Static {
        uam.file = Some(static_file(&path["/www/".len()..])?);
    }
    apply_query(&mut uam, query)?;
    debug!(path, kind = ?uam.kind, "parsed UAM request");
    Ok(uam)
}

/// Reads one request head of at most `REDIR_MAXBUFFER` bytes.
pub async fn read_request<R: AsyncRead + Unpin>(r: &mut R) -> Result<UamRequest, RedirError> {
    let mut buf = Vec::with_capacity(1024);
    let mut tmp = [0u8; 512];

    loop {
        let n = r.read(&mut tmp).await?;
        if n == 0 {
            return Err(RedirError::Incomplete);
        }
        buf.extend_from_slice(&tmp[..n]);
        if buf.len() > REDIR_MAXBUFFER {
            return Err(RedirError::RequestTooLarge {
                max: REDIR_MAXBUFFER,
            });
        }
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            return parse_request(&buf);
        }
    }
}
