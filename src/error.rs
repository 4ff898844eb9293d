use thiserror::Error;

use crate::transport::TransportError;

/// Errors returned by [`crate::Client`] and the adapters.
#[derive(Error, Debug)]
pub enum MqError {
    /// Every configured server failed to dial
    #[error("no available server")]
    NoAvailableServer,
    /// The protocol identifier matches no adapter
    #[error("unsupported protocol: {0:?}")]
    UnsupportedProtocol(String),
    /// A publish named neither a queue nor a topic
    #[error("unknown destination")]
    UnknownDestination,
    /// A publish named both a queue and a topic
    #[error("ambiguous destination: both queue and topic are set")]
    AmbiguousDestination,
    /// Publish found no open channel
    #[error("not connected")]
    NotConnected,
    /// Dial, channel-open, send or close failure from the transport
    #[error(transparent)]
    Transport(#[from] TransportError),
}
