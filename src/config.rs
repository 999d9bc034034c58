//! Per-engine configuration. Built once at engine creation and treated as immutable afterwards,
//! matching the `ClientConfig`/`WebSocketConfig` split the teacher crate uses for its own
//! connection options.

use std::path::PathBuf;
use std::time::Duration;

/// How the TLS transport validates the server's certificate when the URL scheme is `wss`.
#[derive(Debug, Clone, Default)]
pub enum SslVerify {
    /// Validate against the platform's default trust anchors (`webpki-roots`).
    #[default]
    Peer,
    /// Validate against a single additional CA certificate file, on top of the default roots.
    Custom(PathBuf),
    /// Accept any certificate. Only for local development against self-signed servers.
    None,
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub url: String,
    pub extra_headers: Vec<(String, String)>,
    pub ssl_verify: SslVerify,
    /// `None` disables the keepalive timer entirely.
    pub keepalive_ms: Option<u64>,
    pub keepalive_max_attempts: u32,
    pub connect_timeout_ms: u64,
}

const DEFAULT_KEEPALIVE_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 6_000;

impl ConnectionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            extra_headers: Vec::new(),
            ssl_verify: SslVerify::default(),
            keepalive_ms: None,
            keepalive_max_attempts: DEFAULT_KEEPALIVE_MAX_ATTEMPTS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }

    pub fn with_extra_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.push((name.into(), value.into()));
        self
    }

    pub fn with_keepalive(mut self, interval: Duration, max_attempts: u32) -> Self {
        self.keepalive_ms = Some(interval.as_millis() as u64);
        self.keepalive_max_attempts = max_attempts;
        self
    }

    pub fn with_ssl_verify(mut self, ssl_verify: SslVerify) -> Self {
        self.ssl_verify = ssl_verify;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        self.keepalive_ms.map(Duration::from_millis)
    }
}
