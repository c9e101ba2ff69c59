use crate::{REDIR_MAXCONN, Stage};
use serde::Deserialize;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// The log level for the application, corresponding to syslog levels.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Emerg,
    Alert,
    Crit,
    Err,
    Warning,
    Notice,
    Info,
    Debug,
}

impl LogLevel {
    /// The `tracing` filter directive closest to this syslog level.
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Emerg | LogLevel::Alert | LogLevel::Crit | LogLevel::Err => "error",
            LogLevel::Warning => "warn",
            LogLevel::Notice | LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

// Helper functions for default values
fn default_loglevel() -> LogLevel { LogLevel::Info }
fn default_uamlisten() -> Ipv4Addr { Ipv4Addr::new(192, 168, 182, 1) }
fn default_uamport() -> u16 { 3990 }
fn default_uamurl() -> String { "http://192.168.182.1/uam/".to_string() }
fn default_radiuslisten() -> Ipv4Addr { Ipv4Addr::UNSPECIFIED }
fn default_radiusserver1() -> Ipv4Addr { Ipv4Addr::LOCALHOST }
fn default_radiussecret() -> String { "testing123".to_string() }
fn default_radiusauthport() -> u16 { 1812 }
fn default_radiusacctport() -> u16 { 1813 }
fn default_radiusnasporttype() -> u32 { 19 }
fn default_radiustimeout() -> u32 { 10 }
fn default_radiusretry() -> u32 { 3 }
fn default_max_clients() -> usize { REDIR_MAXCONN }
fn default_msg_queue_depth() -> usize { 64 }
fn default_challenge_timeout() -> u64 { 300 }

/// Per-stage budgets, in seconds, for a single UAM connection.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct StageTimeouts {
    pub getreq: u64,
    pub getstate: u64,
    /// Only bounds work that can block while processing, which today is
    /// reading a static file from `wwwdir`.
    pub process: u64,
    pub radius: u64,
    pub reply: u64,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            getreq: 5,
            getstate: 2,
            process: 5,
            radius: 60,
            reply: 5,
        }
    }
}

impl StageTimeouts {
    pub fn budget(&self, stage: Stage) -> Duration {
        let secs = match stage {
            Stage::GetRequest => self.getreq,
            Stage::GetState => self.getstate,
            Stage::Process => self.process,
            Stage::Radius => self.radius,
            Stage::Reply => self.reply,
            Stage::Init | Stage::Terminal => 0,
        };
        Duration::from_secs(secs)
    }

    /// Worst-case time a single connection can be held open.
    pub fn total(&self) -> Duration {
        Duration::from_secs(self.getreq + self.getstate + self.process + self.radius + self.reply)
    }
}

/// Static configuration of one UAM listener instance.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    #[serde(default = "default_loglevel")]
    pub loglevel: LogLevel,

    #[serde(default = "default_uamlisten")]
    pub uamlisten: Ipv4Addr,
    #[serde(default = "default_uamport")]
    pub uamport: u16,
    #[serde(default = "default_uamurl")]
    pub uamurl: String,
    pub uamhomepage: Option<String>,
    pub uamsecret: Option<String>,
    #[serde(default)]
    pub uamsuccess: bool,
    #[serde(default)]
    pub uamwispr: bool,

    pub ssid: Option<String>,
    pub nasmac: Option<String>,
    pub nasip: Option<Ipv4Addr>,

    #[serde(default = "default_radiuslisten")]
    pub radiuslisten: Ipv4Addr,
    #[serde(default = "default_radiusserver1")]
    pub radiusserver1: Ipv4Addr,
    pub radiusserver2: Option<Ipv4Addr>,
    #[serde(default = "default_radiussecret")]
    pub radiussecret: String,
    #[serde(default = "default_radiusauthport")]
    pub radiusauthport: u16,
    #[serde(default = "default_radiusacctport")]
    pub radiusacctport: u16,
    #[serde(default = "default_radiustimeout")]
    pub radiustimeout: u32,
    #[serde(default = "default_radiusretry")]
    pub radiusretry: u32,
    pub radiusnasid: Option<String>,
    pub radiuslocationid: Option<String>,
    pub radiuslocationname: Option<String>,
    #[serde(default = "default_radiusnasporttype")]
    pub radiusnasporttype: u32,

    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    #[serde(default = "default_msg_queue_depth")]
    pub msg_queue_depth: usize,
    /// Seconds an issued challenge stays usable.
    #[serde(default = "default_challenge_timeout")]
    pub challenge_timeout: u64,
    #[serde(default)]
    pub timeouts: StageTimeouts,

    pub wwwdir: Option<PathBuf>,
    /// Where the session table is saved on shutdown and restored at start.
    pub statusfile: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            loglevel: default_loglevel(),
            uamlisten: default_uamlisten(),
            uamport: default_uamport(),
            uamurl: default_uamurl(),
            uamhomepage: None,
            uamsecret: None,
            uamsuccess: false,
            uamwispr: false,
            ssid: None,
            nasmac: None,
            nasip: None,
            radiuslisten: default_radiuslisten(),
            radiusserver1: default_radiusserver1(),
            radiusserver2: None,
            radiussecret: default_radiussecret(),
            radiusauthport: default_radiusauthport(),
            radiusacctport: default_radiusacctport(),
            radiustimeout: default_radiustimeout(),
            radiusretry: default_radiusretry(),
            radiusnasid: None,
            radiuslocationid: None,
            radiuslocationname: None,
            radiusnasporttype: default_radiusnasporttype(),
            max_clients: default_max_clients(),
            msg_queue_depth: default_msg_queue_depth(),
            challenge_timeout: default_challenge_timeout(),
            timeouts: StageTimeouts::default(),
            wwwdir: None,
            statusfile: None,
        }
    }
}

impl Config {
    pub fn uam_addr(&self) -> SocketAddr {
        SocketAddr::new(self.uamlisten.into(), self.uamport)
    }

    pub fn challenge_window(&self) -> Duration {
        Duration::from_secs(self.challenge_timeout)
    }

    /// The NAS address presented to RADIUS: explicit `nasip`, else the
    /// RADIUS listen address, else the UAM address.
    pub fn nas_ip(&self) -> Ipv4Addr {
        self.nasip
            .or(Some(self.radiuslisten).filter(|ip| !ip.is_unspecified()))
            .unwrap_or(self.uamlisten)
    }

    /// The UAM shared secret, treating an empty string as unset.
    pub fn uam_secret(&self) -> Option<&str> {
        self.uamsecret.as_deref().filter(|s| !s.is_empty())
    }
}
