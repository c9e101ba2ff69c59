use async_trait::async_trait;
use chilli_core::conn::{format_mac, parse_mac};
use chilli_core::{
    AttrBuf, AttrString, Config, RadiusAccept, RadiusAuthenticator, RadiusCredential,
    RadiusOutcome, RadiusRequest, SessionParams,
};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

// RADIUS Packet Codes
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum RadiusCode {
    AccessRequest = 1,
    AccessAccept = 2,
    AccessReject = 3,
    AccessChallenge = 11,
}

impl RadiusCode {
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            1 => Some(RadiusCode::AccessRequest),
            2 => Some(RadiusCode::AccessAccept),
            3 => Some(RadiusCode::AccessReject),
            11 => Some(RadiusCode::AccessChallenge),
            _ => None,
        }
    }
}

// RADIUS Attributes
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
#[repr(u8)]
pub enum RadiusAttributeType {
    UserName = 1,
    UserPassword = 2,
    ChapPassword = 3,
    NasIpAddress = 4,
    NasPort = 5,
    ServiceType = 6,
    FramedIpAddress = 8,
    ReplyMessage = 18,
    State = 24,
    Class = 25,
    VendorSpecific = 26,
    SessionTimeout = 27,
    IdleTimeout = 28,
    CalledStationId = 30,
    CallingStationId = 31,
    NasIdentifier = 32,
    AcctSessionId = 44,
    ChapChallenge = 60,
    NasPortType = 61,
    AcctInterimInterval = 85,
}

pub const RADIUS_HDR_LEN: usize = 20;
pub const RADIUS_MAX_LEN: usize = 4096;
pub const RADIUS_AUTH_LEN: usize = 16;
pub const RADIUS_ATTR_MAX: usize = 253;
pub const RADIUS_PASSWORD_MAX: usize = 128;

pub const RADIUS_SERVICE_TYPE_LOGIN: u32 = 1;

pub const VENDOR_WISPR: u32 = 14122;
pub const WISPR_LOCATION_ID: u8 = 1;
pub const WISPR_LOCATION_NAME: u8 = 2;
pub const WISPR_REDIRECTION_URL: u8 = 4;
pub const WISPR_BANDWIDTH_MAX_UP: u8 = 7;
pub const WISPR_BANDWIDTH_MAX_DOWN: u8 = 8;
pub const WISPR_SESSION_TERMINATE_TIME: u8 = 9;

pub const VENDOR_CHILLISPOT: u32 = 14559;
pub const CHILLISPOT_MAX_INPUT_OCTETS: u8 = 1;
pub const CHILLISPOT_MAX_OUTPUT_OCTETS: u8 = 2;
pub const CHILLISPOT_MAX_TOTAL_OCTETS: u8 = 3;
pub const CHILLISPOT_BANDWIDTH_MAX_UP: u8 = 4;
pub const CHILLISPOT_BANDWIDTH_MAX_DOWN: u8 = 5;

#[derive(Debug, Error)]
pub enum RadiusError {
    #[error("attribute {0:?} value exceeds {RADIUS_ATTR_MAX} bytes")]
    AttributeTooLong(RadiusAttributeType),
    #[error("password exceeds {RADIUS_PASSWORD_MAX} bytes")]
    PasswordTooLong,
    #[error("no random source: {0}")]
    Random(getrandom::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Accumulates attributes into a packet payload.
#[derive(Debug, Default)]
pub struct AttributeWriter {
    buf: Vec<u8>,
}

impl AttributeWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&mut self, attr: RadiusAttributeType, value: &[u8]) -> Result<(), RadiusError> {
        if value.len() > RADIUS_ATTR_MAX {
            return Err(RadiusError::AttributeTooLong(attr));
        }
        self.buf.push(attr as u8);
        self.buf.push((value.len() + 2) as u8);
        self.buf.extend_from_slice(value);
        Ok(())
    }

    pub fn u32(&mut self, attr: RadiusAttributeType, value: u32) -> Result<(), RadiusError> {
        self.bytes(attr, &value.to_be_bytes())
    }

    pub fn vendor(&mut self, vendor: u32, vendor_type: u8, value: &[u8]) -> Result<(), RadiusError> {
        let attr = RadiusAttributeType::VendorSpecific;
        if value.len() + 6 > RADIUS_ATTR_MAX {
            return Err(RadiusError::AttributeTooLong(attr));
        }
        let mut vsa = Vec::with_capacity(value.len() + 6);
        vsa.extend_from_slice(&vendor.to_be_bytes());
        vsa.push(vendor_type);
        vsa.push((value.len() + 2) as u8);
        vsa.extend_from_slice(value);
        self.bytes(attr, &vsa)
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Iterates `(type, value)` pairs of a payload, stopping at the first
/// malformed attribute.
pub fn attributes(mut payload: &[u8]) -> impl Iterator<Item = (u8, &[u8])> {
    std::iter::from_fn(move || {
        if payload.len() < 2 {
            return None;
        }
        let len = payload[1] as usize;
        if len < 2 || len > payload.len() {
            return None;
        }
        let item = (payload[0], &payload[2..len]);
        payload = &payload[len..];
        Some(item)
    })
}

/// RFC 2865 §5.2 User-Password hiding.
pub fn hide_password(
    password: &[u8],
    secret: &[u8],
    authenticator: &[u8; RADIUS_AUTH_LEN],
) -> Result<Vec<u8>, RadiusError> {
    if password.len() > RADIUS_PASSWORD_MAX {
        return Err(RadiusError::PasswordTooLong);
    }
    let padded_len = password.len().div_ceil(16).max(1) * 16;
    let mut out = password.to_vec();
    out.resize(padded_len, 0);

    let mut prev: Vec<u8> = authenticator.to_vec();
    for chunk in out.chunks_mut(16) {
        let mut ctx = md5::Context::new();
        ctx.consume(secret);
        ctx.consume(&prev);
        let key = ctx.compute();
        for (b, k) in chunk.iter_mut().zip(key.iter()) {
            *b ^= k;
        }
        prev = chunk.to_vec();
    }
    Ok(out)
}

/// MD5(Code + Identifier + Length + RequestAuth + Attributes + Secret).
pub fn response_authenticator(
    response: &[u8],
    request_authenticator: &[u8; RADIUS_AUTH_LEN],
    secret: &[u8],
) -> [u8; RADIUS_AUTH_LEN] {
    let mut ctx = md5::Context::new();
    ctx.consume(&response[..4]);
    ctx.consume(request_authenticator);
    ctx.consume(&response[RADIUS_HDR_LEN..]);
    ctx.consume(secret);
    ctx.compute().0
}

fn be_u32(value: &[u8]) -> Option<u32> {
    Some(u32::from_be_bytes(value.try_into().ok()?))
}

/// WISPr-Session-Terminate-Time: ISO 8601, with or without an offset
/// (UTC assumed when absent).
pub fn parse_terminate_time(value: &str) -> Option<u64> {
    let value = value.trim();
    let secs = match chrono::DateTime::parse_from_rfc3339(value) {
        Ok(dt) => dt.timestamp(),
        Err(_) => chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S")
            .ok()?
            .and_utc()
            .timestamp(),
    };
    u64::try_from(secs).ok()
}

fn attr_string(value: &[u8]) -> Option<AttrString> {
    AttrString::new("attribute", String::from_utf8_lossy(value).into_owned()).ok()
}

/// A URL headed for a `Location:` header; control characters disqualify it.
fn attr_url(value: &[u8]) -> Option<AttrString> {
    let url = std::str::from_utf8(value).ok()?;
    if url.chars().any(char::is_control) {
        warn!("Ignoring WISPr-Redirection-URL with control characters");
        return None;
    }
    AttrString::new("redirurl", url).ok()
}

/// Pulls session limits and echo attributes out of an Access-Accept.
pub fn parse_accept(payload: &[u8]) -> RadiusAccept {
    let mut accept = RadiusAccept::default();
    let params: &mut SessionParams = &mut accept.params;
    for (attr, value) in attributes(payload) {
        match attr {
            a if a == RadiusAttributeType::SessionTimeout as u8 => {
                params.sessiontimeout = be_u32(value).unwrap_or_default().into();
            }
            a if a == RadiusAttributeType::IdleTimeout as u8 => {
                params.idletimeout = be_u32(value).unwrap_or_default().into();
            }
            a if a == RadiusAttributeType::AcctInterimInterval as u8 => {
                params.interim_interval = be_u32(value).unwrap_or_default().into();
            }
            a if a == RadiusAttributeType::State as u8 => {
                accept.state = AttrBuf::new("state", value).ok();
            }
            a if a == RadiusAttributeType::Class as u8 => {
                accept.class = AttrBuf::new("class", value).ok();
            }
            a if a == RadiusAttributeType::ReplyMessage as u8 => {
                if accept.reply.is_none() {
                    accept.reply = attr_string(value);
                }
            }
            a if a == RadiusAttributeType::VendorSpecific as u8 && value.len() >= 6 => {
                let vendor = u32::from_be_bytes([value[0], value[1], value[2], value[3]]);
                let vendor_type = value[4];
                let vlen = value[5] as usize;
                if vlen < 2 || vlen + 4 > value.len() {
                    continue;
                }
                let data = &value[6..4 + vlen];
                match (vendor, vendor_type) {
                    (VENDOR_WISPR, WISPR_REDIRECTION_URL) => accept.redirurl = attr_url(data),
                    (VENDOR_WISPR, WISPR_BANDWIDTH_MAX_UP) => {
                        params.bandwidthmaxup = be_u32(data).unwrap_or_default().into();
                    }
                    (VENDOR_WISPR, WISPR_BANDWIDTH_MAX_DOWN) => {
                        params.bandwidthmaxdown = be_u32(data).unwrap_or_default().into();
                    }
                    (VENDOR_WISPR, WISPR_SESSION_TERMINATE_TIME) => {
                        match parse_terminate_time(&String::from_utf8_lossy(data)) {
                            Some(t) => params.sessionterminatetime = t,
                            None => warn!("Ignoring unparseable WISPr-Session-Terminate-Time"),
                        }
                    }
                    (VENDOR_CHILLISPOT, CHILLISPOT_MAX_INPUT_OCTETS) => {
                        params.maxinputoctets = be_u32(data).unwrap_or_default().into();
                    }
                    (VENDOR_CHILLISPOT, CHILLISPOT_MAX_OUTPUT_OCTETS) => {
                        params.maxoutputoctets = be_u32(data).unwrap_or_default().into();
                    }
                    (VENDOR_CHILLISPOT, CHILLISPOT_MAX_TOTAL_OCTETS) => {
                        params.maxtotaloctets = be_u32(data).unwrap_or_default().into();
                    }
                    // ChilliSpot bandwidth is in kbit/s.
                    (VENDOR_CHILLISPOT, CHILLISPOT_BANDWIDTH_MAX_UP) => {
                        params.bandwidthmaxup = u64::from(be_u32(data).unwrap_or_default()) * 1000;
                    }
                    (VENDOR_CHILLISPOT, CHILLISPOT_BANDWIDTH_MAX_DOWN) => {
                        params.bandwidthmaxdown = u64::from(be_u32(data).unwrap_or_default()) * 1000;
                    }
                    _ => debug!(vendor, vendor_type, "ignoring vendor attribute"),
                }
            }
            _ => {}
        }
    }
    accept
}

fn reply_message(payload: &[u8]) -> Option<AttrString> {
    attributes(payload)
        .find(|(attr, _)| *attr == RadiusAttributeType::ReplyMessage as u8)
        .and_then(|(_, value)| attr_string(value))
}

/// UDP RADIUS client that authenticates UAM logins.
pub struct RadiusClient {
    listen: Ipv4Addr,
    servers: Vec<SocketAddr>,
    secret: String,
    timeout: Duration,
    retries: u32,
    nas_ip: Ipv4Addr,
    nas_id: Option<String>,
    nas_port_type: u32,
    called_station: Option<String>,
    location_id: Option<String>,
    location_name: Option<String>,
    next_id: AtomicU8,
}

impl RadiusClient {
    pub fn new(config: &Config) -> Self {
        let mut servers = vec![SocketAddr::new(config.radiusserver1.into(), config.radiusauthport)];
        if let Some(second) = config.radiusserver2 {
            servers.push(SocketAddr::new(second.into(), config.radiusauthport));
        }
        RadiusClient {
            listen: config.radiuslisten,
            servers,
            secret: config.radiussecret.clone(),
            timeout: Duration::from_secs(config.radiustimeout.max(1).into()),
            retries: config.radiusretry.max(1),
            nas_ip: config.nas_ip(),
            nas_id: config.radiusnasid.clone(),
            nas_port_type: config.radiusnasporttype,
            called_station: config
                .nasmac
                .as_deref()
                .and_then(parse_mac)
                .map(|mac| format_mac(&mac)),
            location_id: config.radiuslocationid.clone(),
            location_name: config.radiuslocationname.clone(),
            next_id: AtomicU8::new(0),
        }
    }

    pub fn servers(&self) -> &[SocketAddr] {
        &self.servers
    }

    /// Encodes an Access-Request for `req`.
    pub fn build_access_request(
        &self,
        id: u8,
        authenticator: &[u8; RADIUS_AUTH_LEN],
        req: &RadiusRequest,
    ) -> Result<Vec<u8>, RadiusError> {
        use RadiusAttributeType::*;

        let mut attrs = AttributeWriter::new();
        attrs.bytes(UserName, req.username.as_bytes())?;
        match &req.credential {
            RadiusCredential::Pap(password) => {
                let hidden = hide_password(password, self.secret.as_bytes(), authenticator)?;
                attrs.bytes(UserPassword, &hidden)?;
            }
            RadiusCredential::Chap { challenge, response } => {
                attrs.bytes(ChapChallenge, challenge)?;
                let mut chap = Vec::with_capacity(1 + response.len());
                chap.push(0);
                chap.extend_from_slice(response);
                attrs.bytes(ChapPassword, &chap)?;
            }
        }
        attrs.bytes(NasIpAddress, &self.nas_ip.octets())?;
        attrs.u32(ServiceType, RADIUS_SERVICE_TYPE_LOGIN)?;
        attrs.bytes(FramedIpAddress, &req.hisip.octets())?;
        attrs.u32(NasPortType, self.nas_port_type)?;
        attrs.u32(NasPort, req.nasport)?;
        attrs.bytes(CallingStationId, format_mac(&req.hismac).as_bytes())?;
        if let Some(called) = &self.called_station {
            attrs.bytes(CalledStationId, called.as_bytes())?;
        }
        if let Some(nas_id) = &self.nas_id {
            attrs.bytes(NasIdentifier, nas_id.as_bytes())?;
        }
        attrs.bytes(AcctSessionId, req.sessionid.as_str().as_bytes())?;
        if let Some(state) = &req.state {
            attrs.bytes(State, state)?;
        }
        if let Some(location) = &self.location_id {
            attrs.vendor(VENDOR_WISPR, WISPR_LOCATION_ID, location.as_bytes())?;
        }
        if let Some(location) = &self.location_name {
            attrs.vendor(VENDOR_WISPR, WISPR_LOCATION_NAME, location.as_bytes())?;
        }
        let payload = attrs.finish();

        let length = (RADIUS_HDR_LEN + payload.len()) as u16;
        let mut packet_bytes = Vec::with_capacity(length as usize);
        packet_bytes.push(RadiusCode::AccessRequest as u8);
        packet_bytes.push(id);
        packet_bytes.extend_from_slice(&length.to_be_bytes());
        packet_bytes.extend_from_slice(authenticator);
        packet_bytes.extend_from_slice(&payload);
        Ok(packet_bytes)
    }

    /// Checks that `data` answers request `id` and returns code and attributes.
    fn validate_response<'a>(
        &self,
        data: &'a [u8],
        id: u8,
        authenticator: &[u8; RADIUS_AUTH_LEN],
    ) -> Option<(RadiusCode, &'a [u8])> {
        if data.len() < RADIUS_HDR_LEN || data[1] != id {
            return None;
        }
        let len = u16::from_be_bytes([data[2], data[3]]) as usize;
        if len < RADIUS_HDR_LEN || len > data.len() {
            return None;
        }
        let data = &data[..len];
        let expected = response_authenticator(data, authenticator, self.secret.as_bytes());
        if data[4..RADIUS_HDR_LEN] != expected {
            warn!("Dropping RADIUS response with bad authenticator");
            return None;
        }
        Some((RadiusCode::from_u8(data[0])?, &data[RADIUS_HDR_LEN..]))
    }

    async fn try_server(
        &self,
        socket: &UdpSocket,
        server: SocketAddr,
        req: &RadiusRequest,
    ) -> Result<Option<RadiusOutcome>, RadiusError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut authenticator = [0u8; RADIUS_AUTH_LEN];
        getrandom::getrandom(&mut authenticator).map_err(RadiusError::Random)?;
        let packet = self.build_access_request(id, &authenticator, req)?;

        let mut buf = [0u8; RADIUS_MAX_LEN];
        for attempt in 1..=self.retries {
            socket.send_to(&packet, server).await?;
            debug!(%server, id, attempt, "sent Access-Request");

            let wait = tokio::time::timeout(self.timeout, async {
                loop {
                    let (len, src) = match socket.recv_from(&mut buf).await {
                        Ok(received) => received,
                        Err(e) => return Err(RadiusError::Io(e)),
                    };
                    if src != server {
                        warn!(%src, "Ignoring RADIUS packet from unexpected source");
                        continue;
                    }
                    if let Some((code, payload)) = self.validate_response(&buf[..len], id, &authenticator) {
                        return Ok::<_, RadiusError>(Some((code, payload.to_vec())));
                    }
                }
            })
            .await;

            match wait {
                Ok(Ok(Some((code, payload)))) => {
                    return Ok(Some(match code {
                        RadiusCode::AccessAccept => RadiusOutcome::Accept(parse_accept(&payload)),
                        RadiusCode::AccessReject => RadiusOutcome::Reject {
                            reply: reply_message(&payload),
                        },
                        RadiusCode::AccessChallenge => {
                            warn!("Access-Challenge is not supported for UAM logins, treating as reject");
                            RadiusOutcome::Reject {
                                reply: reply_message(&payload),
                            }
                        }
                        RadiusCode::AccessRequest => continue,
                    }));
                }
                Ok(Ok(None)) => continue,
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    debug!(%server, id, attempt, "RADIUS attempt timed out");
                }
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl RadiusAuthenticator for RadiusClient {
    async fn authenticate(&self, request: RadiusRequest) -> RadiusOutcome {
        let socket = match UdpSocket::bind((self.listen, 0)).await {
            Ok(socket) => socket,
            Err(e) => {
                error!("Failed to bind RADIUS socket on {}: {}", self.listen, e);
                return RadiusOutcome::Timeout;
            }
        };

        for server in &self.servers {
            match self.try_server(&socket, *server, &request).await {
                Ok(Some(outcome)) => {
                    info!(
                        %server,
                        username = %request.username,
                        accepted = matches!(outcome, RadiusOutcome::Accept(_)),
                        "RADIUS answered"
                    );
                    return outcome;
                }
                Ok(None) => warn!("RADIUS server {} did not answer, trying next", server),
                Err(e @ (RadiusError::AttributeTooLong(_) | RadiusError::PasswordTooLong)) => {
                    error!(
                        "Cannot encode Access-Request for user '{}', not sent: {}",
                        request.username, e
                    );
                    return RadiusOutcome::Timeout;
                }
                Err(e) => {
                    error!("RADIUS request for user '{}' failed: {}", request.username, e);
                    return RadiusOutcome::Timeout;
                }
            }
        }
        RadiusOutcome::Timeout
    }
}
