use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;

use crate::auth::Mechanism;
use crate::chaos::ChaosEngine;
use crate::error::SmtpdError;
use crate::handler::{AuthHandler, LineLogger, MessageHandler, RecipientHandler};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_MAX_RECIPIENTS: usize = 100;
pub const DEFAULT_APP_NAME: &str = "smtpd";

static UNIX_SOCKET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^unix:(.*):(\d\d\d\d?)$").unwrap());

/// Where the server listens: `host:port`, or `unix:<path>:<octal mode>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    Tcp(String),
    Unix { path: PathBuf, mode: u32 },
}

impl FromStr for ListenAddr {
    type Err = SmtpdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(caps) = UNIX_SOCKET_RE.captures(s) {
            let mode = u32::from_str_radix(&caps[2], 8)
                .map_err(|_| SmtpdError::InvalidListenAddr(s.to_string()))?;
            let path = PathBuf::from(&caps[1]);
            if path.as_os_str().is_empty() {
                return Err(SmtpdError::InvalidListenAddr(s.to_string()));
            }
            return Ok(ListenAddr::Unix { path, mode });
        }

        if s.starts_with("unix:") || !s.contains(':') {
            return Err(SmtpdError::InvalidListenAddr(s.to_string()));
        }
        Ok(ListenAddr::Tcp(s.to_string()))
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddr::Tcp(addr) => write!(f, "{}", addr),
            ListenAddr::Unix { path, mode } => write!(f, "unix:{}:{:04o}", path.display(), mode),
        }
    }
}

/// Server settings. Frozen once handed to [`crate::Server::new`].
#[derive(Clone)]
pub struct ServerConfig {
    pub addr: ListenAddr,
    pub app_name: String,
    /// Announced in banners; the system hostname when empty.
    pub hostname: String,

    pub tls: Option<Arc<rustls::ServerConfig>>,
    /// Require STARTTLS before mail transactions. Ignored without `tls`.
    pub tls_required: bool,
    /// Accept implicit TLS connections only. Ignored without `tls`.
    pub tls_listener: bool,

    /// Require AUTH before mail transactions. Ignored without `auth_handler`.
    pub auth_required: bool,
    /// Per-mechanism overrides of the default TLS-based policy.
    pub auth_mechs: HashMap<Mechanism, bool>,

    /// Maximum message size in bytes, 0 for unlimited.
    pub max_size: u64,
    pub max_recipients: usize,
    pub timeout: Duration,
    pub disable_reverse_dns: bool,
    /// Peer IPs allowed to use XCLIENT.
    pub xclient_allowed: Vec<String>,

    pub chaos: Arc<ChaosEngine>,
    pub message_handler: Option<Arc<dyn MessageHandler>>,
    pub recipient_handler: Option<Arc<dyn RecipientHandler>>,
    pub auth_handler: Option<Arc<dyn AuthHandler>>,
    pub log_read: Option<Arc<dyn LineLogger>>,
    pub log_write: Option<Arc<dyn LineLogger>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: ListenAddr::Tcp("0.0.0.0:25".to_string()),
            app_name: DEFAULT_APP_NAME.to_string(),
            hostname: String::new(),
            tls: None,
            tls_required: false,
            tls_listener: false,
            auth_required: false,
            auth_mechs: HashMap::new(),
            max_size: 0,
            max_recipients: DEFAULT_MAX_RECIPIENTS,
            timeout: DEFAULT_TIMEOUT,
            disable_reverse_dns: false,
            xclient_allowed: Vec::new(),
            chaos: Arc::new(ChaosEngine::new()),
            message_handler: None,
            recipient_handler: None,
            auth_handler: None,
            log_read: None,
            log_write: None,
        }
    }
}

impl ServerConfig {
    /// Fill in whatever was left empty or zero.
    pub(crate) fn with_defaults(mut self) -> Self {
        if self.app_name.is_empty() {
            self.app_name = DEFAULT_APP_NAME.to_string();
        }
        if self.hostname.is_empty() {
            self.hostname = gethostname::gethostname().to_string_lossy().into_owned();
        }
        if self.timeout.is_zero() {
            self.timeout = DEFAULT_TIMEOUT;
        }
        if self.max_recipients == 0 {
            self.max_recipients = DEFAULT_MAX_RECIPIENTS;
        }
        self
    }

    pub(crate) fn tls_enforced(&self) -> bool {
        self.tls.is_some() && self.tls_required
    }

    pub(crate) fn auth_enforced(&self) -> bool {
        self.auth_handler.is_some() && self.auth_required
    }
}
