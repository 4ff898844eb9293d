//! Client configuration.
//!
//! `Config` is a plain value with builder-style setters; loading it from a
//! file or the command line is left to the caller.

use std::str::FromStr;
use std::time::Duration;

use crate::error::MqError;

/// Protocol identifier for AMQP 0-9-1.
pub const PROTOCOL_AMQP091: &str = "amqp091";
/// Protocol identifier for STOMP 1.2.
pub const PROTOCOL_STOMP: &str = "stomp";

/// Broker protocols with an adapter in this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Amqp091,
    Stomp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Amqp091 => PROTOCOL_AMQP091,
            Protocol::Stomp => PROTOCOL_STOMP,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = MqError;

    /// Parse an identifier, ignoring case and surrounding whitespace. An empty
    /// identifier selects AMQP 0-9-1.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | PROTOCOL_AMQP091 => Ok(Protocol::Amqp091),
            PROTOCOL_STOMP => Ok(Protocol::Stomp),
            _ => Err(MqError::UnsupportedProtocol(s.to_string())),
        }
    }
}

/// One broker endpoint as configured by the caller. Unset fields are
/// defaulted by the resolver.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerConfig {
    /// Connect over TLS
    pub ssl: bool,
    /// Host name or address; empty means `127.0.0.1`
    pub host: String,
    /// Port; `0` means the protocol default for the TLS setting
    pub port: u16,
    /// Per-server username overriding the global one
    pub user: Option<String>,
    /// Per-server password overriding the global one
    pub pass: Option<String>,
    /// Per-server virtual host (AMQP only)
    pub vhost: Option<String>,
}

impl ServerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Enable TLS for this server.
    pub fn ssl(mut self) -> Self {
        self.ssl = true;
        self
    }

    pub fn credentials(mut self, user: impl Into<String>, pass: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.pass = Some(pass.into());
        self
    }

    pub fn vhost(mut self, vhost: impl Into<String>) -> Self {
        self.vhost = Some(vhost.into());
        self
    }
}

/// Backoff policy of the reconnect supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delay before the first attempt
    pub initial_backoff: Duration,
    /// Upper bound for the doubling delay
    pub max_backoff: Duration,
    /// Maximum number of attempts (`None` = unlimited)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            max_attempts: Some(10),
        }
    }
}

impl ReconnectConfig {
    /// Delay to wait before attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }

    /// Whether attempt number `attempt` is still allowed.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt <= max)
    }
}

/// Top-level client configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Protocol identifier (`amqp091` or `stomp`); empty selects `amqp091`
    pub protocol: String,
    /// Servers tried in order on every connect
    pub servers: Vec<ServerConfig>,
    /// Global username; empty uses the protocol default
    pub user: String,
    /// Global password; empty uses the protocol default
    pub pass: String,
    /// Global virtual host (AMQP only); empty uses `/`
    pub vhost: String,
    /// Connect while constructing the client
    pub auto_connect: bool,
    /// Re-establish the link after a broker-initiated closure
    pub auto_reconnect: bool,
    /// Backoff used when `auto_reconnect` is set
    pub reconnect: ReconnectConfig,
    /// Desired heartbeat interval; zero disables heartbeats
    pub heartbeat: Duration,
    /// Limit for TCP connect, TLS and protocol handshake of one server
    pub connect_timeout: Option<Duration>,
    /// Name reported to the broker (AMQP `connection_name` client property)
    pub connection_name: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            protocol: String::new(),
            servers: Vec::new(),
            user: String::new(),
            pass: String::new(),
            vhost: String::new(),
            auto_connect: false,
            auto_reconnect: false,
            reconnect: ReconnectConfig::default(),
            heartbeat: Duration::from_secs(10),
            connect_timeout: None,
            connection_name: None,
        }
    }
}

impl Config {
    pub fn new(protocol: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            ..Self::default()
        }
    }

    /// Append a server to the failover list.
    pub fn server(mut self, server: ServerConfig) -> Self {
        self.servers.push(server);
        self
    }

    pub fn credentials(mut self, user: impl Into<String>, pass: impl Into<String>) -> Self {
        self.user = user.into();
        self.pass = pass.into();
        self
    }

    pub fn vhost(mut self, vhost: impl Into<String>) -> Self {
        self.vhost = vhost.into();
        self
    }

    pub fn auto_connect(mut self, enabled: bool) -> Self {
        self.auto_connect = enabled;
        self
    }

    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat = interval;
        self
    }

    pub fn connect_timeout(mut self, limit: Duration) -> Self {
        self.connect_timeout = Some(limit);
        self
    }

    pub fn connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }

    /// Parsed protocol identifier.
    pub fn protocol(&self) -> Result<Protocol, MqError> {
        self.protocol.parse()
    }

    /// Reconnect policy when auto-reconnect is enabled.
    pub(crate) fn reconnect_policy(&self) -> Option<ReconnectConfig> {
        self.auto_reconnect.then(|| self.reconnect.clone())
    }
}
