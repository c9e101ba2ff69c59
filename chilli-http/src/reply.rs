//! Mapping of outcomes onto HTTP replies.

use chilli_core::conn::format_mac;
use chilli_core::{Config, RedirConn, ReplyCode};
use std::fmt::Write as _;
use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// A fully rendered reply, ready to be written to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub location: Option<String>,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl HttpReply {
    fn html(status: u16, location: Option<String>, body: String) -> Self {
        HttpReply {
            status,
            location,
            content_type: "text/html",
            body: body.into_bytes(),
        }
    }

    pub fn reason(&self) -> &'static str {
        match self.status {
            200 => "OK",
            302 => "Moved Temporarily",
            400 => "Bad Request",
            404 => "Not Found",
            _ => "Error",
        }
    }

    /// Serializes the reply. A `Location` that could break out of its
    /// header line is left out.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut head = format!("HTTP/1.0 {} {}\r\n", self.status, self.reason());
        head.push_str("Connection: close\r\n");
        head.push_str("Pragma: no-cache\r\n");
        head.push_str("Cache-Control: no-cache, must-revalidate\r\n");
        if let Some(location) = self.location.as_deref().filter(|l| header_safe(l)) {
            let _ = write!(head, "Location: {}\r\n", location);
        }
        let _ = write!(head, "Content-Type: {}\r\n", self.content_type);
        let _ = write!(head, "Content-Length: {}\r\n\r\n", self.body.len());

        let mut out = head.into_bytes();
        out.extend_from_slice(&self.body);
        out
    }
}

pub async fn write_reply<W: AsyncWrite + Unpin>(w: &mut W, reply: &HttpReply) -> io::Result<()> {
    w.write_all(&reply.to_bytes()).await?;
    w.flush().await?;
    w.shutdown().await
}

fn header_safe(value: &str) -> bool {
    !value.chars().any(char::is_control)
}

fn encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

fn xml_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

fn gateway_url(config: &Config, path: &str) -> String {
    format!("http://{}:{}/{}", config.uamlisten, config.uamport, path)
}

/// Builds the portal URL for `code`, signed with `md` when a UAM secret is set.
pub fn portal_url(base: &str, code: ReplyCode, conn: &RedirConn, config: &Config) -> String {
    let mut url = format!(
        "{}?res={}&uamip={}&uamport={}",
        base,
        code.res(),
        config.uamlisten,
        config.uamport
    );
    if conn.uamtime.is_some() {
        let _ = write!(url, "&challenge={}", hex::encode(conn.uamchal));
    }
    if let Some(reply) = &conn.reply {
        let _ = write!(url, "&reply={}", encode(reply));
    }
    if !conn.username.is_empty() {
        let _ = write!(url, "&uid={}", encode(&conn.username));
    }
    if conn.authenticated {
        if let Some(timeleft) = conn.timeleft {
            let _ = write!(url, "&timeleft={}", timeleft);
        }
    }
    let _ = write!(url, "&mac={}&ip={}", format_mac(&conn.hismac), conn.hisip);
    if let Some(nasmac) = &config.nasmac {
        let _ = write!(url, "&called={}", encode(nasmac));
    }
    if let Some(nasid) = &config.radiusnasid {
        let _ = write!(url, "&nasid={}", encode(nasid));
    }
    let _ = write!(url, "&sessionid={}", conn.sessionid);
    if !conn.userurl.is_empty() {
        let _ = write!(url, "&userurl={}", encode(&conn.userurl));
    }
    if let Some(redirurl) = &conn.redirurl {
        let _ = write!(url, "&redirurl={}", encode(redirurl));
    }
    if let Some(secret) = config.uam_secret() {
        let mut ctx = md5::Context::new();
        ctx.consume(url.as_bytes());
        ctx.consume(secret.as_bytes());
        let _ = write!(url, "&md={}", hex::encode_upper(ctx.compute().0));
    }
    url
}

/// Where the client is sent for `code`.
pub fn redirect_target(code: ReplyCode, conn: &RedirConn, config: &Config) -> String {
    match code {
        ReplyCode::Success if !config.uamsuccess => conn
            .redirurl
            .as_deref()
            .filter(|url| header_safe(url))
            .or_else(|| Some(conn.userurl.as_str()).filter(|url| !url.is_empty() && header_safe(url)))
            .map(str::to_string)
            .unwrap_or_else(|| portal_url(&config.uamurl, code, conn, config)),
        ReplyCode::NotYet => {
            let base = config.uamhomepage.as_deref().unwrap_or(&config.uamurl);
            portal_url(base, code, conn, config)
        }
        _ => portal_url(&config.uamurl, code, conn, config),
    }
}

/// The WISPr `(message type, response code)` pair for `code`.
pub fn wispr_codes(code: ReplyCode) -> (u16, u16) {
    match code {
        ReplyCode::NotYet => (100, 0),
        ReplyCode::Success | ReplyCode::Already => (120, 50),
        ReplyCode::FailedReject => (120, 100),
        ReplyCode::FailedOther => (120, 102),
        ReplyCode::Logoff => (130, 150),
        ReplyCode::AbortAck => (150, 151),
        ReplyCode::AbortNak => (150, 50),
    }
}

fn wispr_block(code: ReplyCode, target: &str, config: &Config) -> String {
    let (message_type, response_code) = wispr_codes(code);
    let mut xml = String::from(
        "<!--\r\n<?xml version=\"1.0\" encoding=\"UTF-8\"?>\r\n\
         <WISPAccessGatewayParam xmlns:xsi=\"http://www.w3.org/2001/XMLSchema-instance\" \
         xsi:noNamespaceSchemaLocation=\"http://www.acmewisp.com/WISPAccessGatewayParam.xsd\">\r\n",
    );
    let element = match message_type {
        100 => "Redirect",
        120 => "AuthenticationReply",
        130 => "LogoffReply",
        _ => "AbortLoginReply",
    };
    let _ = write!(xml, "<{}>\r\n", element);
    if message_type == 100 {
        xml.push_str("<AccessProcedure>1.0</AccessProcedure>\r\n");
        if let Some(id) = &config.radiuslocationid {
            let _ = write!(xml, "<AccessLocation>{}</AccessLocation>\r\n", xml_escape(id));
        }
        if let Some(name) = &config.radiuslocationname {
            let _ = write!(xml, "<LocationName>{}</LocationName>\r\n", xml_escape(name));
        }
        let _ = write!(xml, "<LoginURL>{}</LoginURL>\r\n", xml_escape(target));
        let _ = write!(
            xml,
            "<AbortLoginURL>{}</AbortLoginURL>\r\n",
            xml_escape(&gateway_url(config, "abort"))
        );
    }
    let _ = write!(xml, "<MessageType>{}</MessageType>\r\n", message_type);
    let _ = write!(xml, "<ResponseCode>{}</ResponseCode>\r\n", response_code);
    if message_type == 120 && response_code == 50 {
        let _ = write!(
            xml,
            "<LogoffURL>{}</LogoffURL>\r\n",
            xml_escape(&gateway_url(config, "logoff"))
        );
    }
    let _ = write!(xml, "</{}>\r\n</WISPAccessGatewayParam>\r\n-->\r\n", element);
    xml
}

/// Renders the redirect for an authentication outcome.
pub fn render(code: ReplyCode, conn: &RedirConn, config: &Config) -> HttpReply {
    let target = redirect_target(code, conn, config);
    let mut body = String::from("<html>\r\n<head><title>Redirecting</title></head>\r\n<body>\r\n");
    if config.uamwispr {
        body.push_str(&wispr_block(code, &target, config));
    }
    let _ = write!(
        body,
        "<p>Please <a href=\"{}\">click here</a> to continue.</p>\r\n</body>\r\n</html>\r\n",
        xml_escape(&target)
    );
    HttpReply::html(302, Some(target), body)
}

pub fn about(config: &Config) -> HttpReply {
    let mut body = format!(
        "<html>\r\n<head><title>CoovaChilli UAM</title></head>\r\n<body>\r\n\
         <h1>CoovaChilli UAM gateway</h1>\r\n<p>chilli-redir {}</p>\r\n",
        env!("CARGO_PKG_VERSION")
    );
    if let Some(ssid) = &config.ssid {
        let _ = write!(body, "<p>SSID: {}</p>\r\n", xml_escape(ssid));
    }
    body.push_str("</body>\r\n</html>\r\n");
    HttpReply::html(200, None, body)
}

/// Page that forwards download-probe clients to the login portal.
pub fn msdownload(conn: &RedirConn, config: &Config) -> HttpReply {
    let target = xml_escape(&redirect_target(ReplyCode::NotYet, conn, config));
    HttpReply::html(
        200,
        None,
        format!(
            "<html>\r\n<head><meta http-equiv=\"refresh\" content=\"0;url={0}\"></head>\r\n\
             <body><a href=\"{0}\">Login</a></body>\r\n</html>\r\n",
            target
        ),
    )
}

fn content_type(name: &str) -> &'static str {
    match name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase()).as_deref() {
        Some("html") | Some("htm") => "text/html",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("ico") => "image/x-icon",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    }
}

pub fn static_content(name: &str, body: Vec<u8>) -> HttpReply {
    HttpReply {
        status: 200,
        location: None,
        content_type: content_type(name),
        body,
    }
}

pub fn not_found() -> HttpReply {
    HttpReply::html(404, None, "<html><body>Not found</body></html>\r\n".to_string())
}
