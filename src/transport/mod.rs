//! Transport capability traits shared by the protocol implementations.
//!
//! The lifecycle core only ever talks to a broker through these three traits:
//! a [`Dialer`] opens a [`TransportConnection`] to one [`ServerTarget`], the
//! connection opens a [`TransportChannel`] (AMQP channel or STOMP session),
//! and both report closure through a `watch` channel of [`LinkStatus`].

use std::fmt;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

use crate::config::Config;
use crate::resolver::ServerTarget;

#[cfg(test)]
pub(crate) mod mock;
pub(crate) mod stream;

pub use stream::MaybeTlsStream;

/// Reason attached to a link closed by the broker or the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// Protocol reply code (AMQP reply-code, `0` when the protocol has none)
    pub code: u16,
    /// Human readable reason
    pub text: String,
}

impl CloseReason {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }

    /// Reason used when the socket itself failed or reached EOF.
    pub fn network(text: impl Into<String>) -> Self {
        Self::new(0, text)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.code == 0 {
            write!(f, "{}", self.text)
        } else {
            write!(f, "{} {}", self.code, self.text)
        }
    }
}

/// Current state of a connection or channel as seen by its close listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStatus {
    Open,
    /// `None` for a graceful, client-initiated close.
    Closed(Option<CloseReason>),
}

impl LinkStatus {
    pub fn is_closed(&self) -> bool {
        matches!(self, LinkStatus::Closed(_))
    }
}

/// Receiving side of a close notification registration.
pub type CloseNotify = watch::Receiver<LinkStatus>;

/// Wait until the watched link leaves `Open`.
///
/// Returns the broker-supplied reason, or `None` for a graceful close. A
/// dropped sender counts as graceful: the handle was discarded by its owner.
pub async fn closed(mut notify: CloseNotify) -> Option<CloseReason> {
    match notify.wait_for(LinkStatus::is_closed).await {
        Ok(status) => match &*status {
            LinkStatus::Closed(reason) => reason.clone(),
            LinkStatus::Open => None,
        },
        Err(_) => None,
    }
}

/// Transport-level settings shared by the dialers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DialOptions {
    /// Desired heartbeat interval; zero disables heartbeats
    pub heartbeat: Duration,
    /// Limit for connect, TLS and protocol handshake
    pub connect_timeout: Option<Duration>,
    /// Name reported to brokers that support one
    pub connection_name: Option<String>,
}

impl From<&Config> for DialOptions {
    fn from(config: &Config) -> Self {
        Self {
            heartbeat: config.heartbeat,
            connect_timeout: config.connect_timeout,
            connection_name: config.connection_name.clone(),
        }
    }
}

/// Error for an operation attempted on a link that is already closed.
pub(crate) fn closed_error(status: &watch::Sender<LinkStatus>) -> TransportError {
    match &*status.borrow() {
        LinkStatus::Closed(Some(reason)) => TransportError::Closed(reason.clone()),
        _ => TransportError::Closed(CloseReason::network("link closed")),
    }
}

/// Error frame details sent by a broker rejecting a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    /// Short message (STOMP `message` header)
    pub message: String,
    /// Optional detailed description
    pub body: Option<String>,
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(body) = &self.body {
            write!(f, ": {}", body)?;
        }
        Ok(())
    }
}

/// Errors raised by the transports. These surface unchanged through
/// [`crate::MqError::Transport`].
#[derive(Error, Debug)]
pub enum TransportError {
    /// I/O-level error
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// Protocol-level error
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The broker refused the session during the handshake
    #[error("server rejected connection: {0}")]
    ServerRejected(ServerError),
    /// The link was closed by the broker or the network
    #[error("link closed: {0}")]
    Closed(CloseReason),
    /// Connect or handshake exceeded the configured limit
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// TLS configuration or server name error
    #[error("tls error: {0}")]
    Tls(String),
    /// Receipt timeout error
    #[error("receipt timeout: no RECEIPT received for '{0}' within timeout")]
    ReceiptTimeout(String),
}

/// Opens transport connections to resolved targets.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Connection: TransportConnection;

    /// Dial a single target. Failover across targets is the caller's job.
    async fn dial(&self, target: &ServerTarget) -> Result<Self::Connection, TransportError>;
}

/// An open link to one broker process.
#[async_trait]
pub trait TransportConnection: Send + Sync + 'static {
    type Channel: TransportChannel;

    fn is_closed(&self) -> bool;

    /// Open a logical channel (AMQP) or session (STOMP) on this connection.
    async fn channel(&self) -> Result<Self::Channel, TransportError>;

    /// Register for the closure of this connection.
    fn notify_close(&self) -> CloseNotify;

    /// Gracefully close the connection.
    async fn close(&self) -> Result<(), TransportError>;
}

/// A logical sub-connection able to send messages.
#[async_trait]
pub trait TransportChannel: Send + Sync + 'static {
    /// Protocol-specific outbound message.
    type Outgoing: Send + 'static;

    fn is_closed(&self) -> bool;

    fn notify_close(&self) -> CloseNotify;

    async fn send(&self, message: Self::Outgoing) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}
