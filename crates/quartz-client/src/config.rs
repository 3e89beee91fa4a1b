//! Client configuration: endpoints, retry and backpressure strategies,
//! TLS settings, and the top-level [`Options`] bundle.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ConfigError;
use crate::handshake::Handshake;
use crate::subscriber::MessageListener;

/// A single backend address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses `host:port`. The split is on the last colon, so bracketless
    /// IPv6 hosts keep their inner colons.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::InvalidEndpoint(s.to_string()))?;
        if host.is_empty() {
            return Err(ConfigError::InvalidEndpoint(s.to_string()));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| ConfigError::InvalidEndpoint(s.to_string()))?;
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// The ordered cluster member list the connection manager cycles through.
#[derive(Debug, Clone)]
pub struct Members {
    endpoints: Vec<Endpoint>,
}

impl Members {
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self { endpoints }
    }

    /// Single-member convenience constructor.
    pub fn single(host: impl Into<String>, port: u16) -> Self {
        Self {
            endpoints: vec![Endpoint::new(host, port)],
        }
    }

    /// Parses a comma-separated list: `host1:port1,host2:port2`.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let endpoints = s
            .split(',')
            .map(|part| Endpoint::parse(part.trim()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { endpoints })
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

/// How long the connection manager keeps requests pending while the
/// backend is unreachable.
///
/// The timeout is per-connection, not per-request: it bounds continuous
/// unavailability, measured on a steady clock since the last healthy
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Fail all pending requests with nil on the first broken read or
    /// write.
    NoRetries,

    /// Keep reconnecting and retrying, failing pending requests once the
    /// backend has been continuously unavailable for the given duration.
    WithTimeout(Duration),

    /// Keep reconnecting forever. Pending requests outlive any outage.
    InfiniteRetries,
}

impl RetryStrategy {
    pub fn no_retries() -> Self {
        RetryStrategy::NoRetries
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        RetryStrategy::WithTimeout(timeout)
    }

    pub fn infinite() -> Self {
        RetryStrategy::InfiniteRetries
    }

    /// Whether pending requests survive a reconnect at all.
    pub fn active(&self) -> bool {
        !matches!(self, RetryStrategy::NoRetries)
    }
}

impl Default for RetryStrategy {
    fn default() -> Self {
        RetryStrategy::NoRetries
    }
}

/// Bound on staged-but-unanswered requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureStrategy {
    /// No bound; staging never waits.
    None,

    /// Staging waits once `max_in_flight` requests are awaiting replies.
    /// A cap of zero blocks every non-bypass stage.
    Blocking { max_in_flight: usize },
}

impl BackpressureStrategy {
    pub fn none() -> Self {
        BackpressureStrategy::None
    }

    pub fn blocking(max_in_flight: usize) -> Self {
        BackpressureStrategy::Blocking { max_in_flight }
    }
}

impl Default for BackpressureStrategy {
    /// Bounded by default. The cap is far above any sane pipeline depth;
    /// it exists to turn a runaway producer into a stall instead of
    /// unbounded memory growth.
    fn default() -> Self {
        BackpressureStrategy::Blocking {
            max_in_flight: 262_144,
        }
    }
}

/// TLS settings for the connection to the backend.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub enabled: bool,

    /// CA certificate (PEM) for verifying the backend. When `None`, the
    /// platform trust store is used.
    pub ca_path: Option<String>,

    /// Client certificate chain (PEM) for mutual TLS.
    pub cert_path: Option<String>,

    /// Client private key (PEM) for mutual TLS.
    pub key_path: Option<String>,
}

impl TlsConfig {
    pub fn disabled() -> Self {
        Self::default()
    }
}

/// Everything a client needs to connect and behave.
pub struct Options {
    pub members: Members,

    /// Follow `MOVED` redirects transparently instead of delivering them
    /// as error replies.
    pub transparent_redirects: bool,

    pub retry_strategy: RetryStrategy,
    pub backpressure: BackpressureStrategy,
    pub tls: TlsConfig,

    /// Optional first-contact exchange, run before any user payload is
    /// written on each new connection.
    pub handshake: Option<Box<dyn Handshake + Send>>,

    /// Puts the client in subscription mode: every incoming reply is
    /// decoded as a pub/sub message and routed to this listener, and the
    /// staged-request queue is used for outgoing control commands only.
    /// Futures returned by `execute` on such a client never resolve
    /// before shutdown.
    pub message_listener: Option<Arc<dyn MessageListener>>,
}

impl Options {
    pub fn new(members: Members) -> Self {
        Self {
            members,
            transparent_redirects: false,
            retry_strategy: RetryStrategy::default(),
            backpressure: BackpressureStrategy::default(),
            tls: TlsConfig::default(),
            handshake: None,
            message_listener: None,
        }
    }

    pub fn transparent_redirects(mut self, enabled: bool) -> Self {
        self.transparent_redirects = enabled;
        self
    }

    pub fn retry_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.retry_strategy = strategy;
        self
    }

    pub fn backpressure(mut self, strategy: BackpressureStrategy) -> Self {
        self.backpressure = strategy;
        self
    }

    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    pub fn handshake(mut self, handshake: Box<dyn Handshake + Send>) -> Self {
        self.handshake = Some(handshake);
        self
    }

    pub fn message_listener(mut self, listener: Arc<dyn MessageListener>) -> Self {
        self.message_listener = Some(listener);
        self
    }
}
