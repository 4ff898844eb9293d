//! Async publisher client with one lifecycle over AMQP 0-9-1 and STOMP 1.2.
//!
//! A [`Client`] is built from a [`Config`]; the protocol identifier picks the
//! adapter, the server list gives the failover order, and `connect`,
//! `publish` and `close` behave the same whichever broker is underneath.

pub mod adapter;
pub mod amqp;
pub mod client;
pub mod config;
pub mod error;
pub mod publish;
pub mod resolver;
pub mod stomp;
pub mod transport;

pub use adapter::{Adapter, Amqp091Adapter, StompAdapter, new_adapter};
pub use client::Client;
pub use config::{Config, PROTOCOL_AMQP091, PROTOCOL_STOMP, Protocol, ReconnectConfig, ServerConfig};
pub use error::MqError;
pub use publish::{Destination, PublishInput};
pub use resolver::{ProtocolDefaults, ServerTarget, resolve};
pub use transport::{CloseReason, LinkStatus, TransportError};
