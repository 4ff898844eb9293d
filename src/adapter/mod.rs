//! Protocol adapters and the factory selecting one from a [`Config`].

mod amqp091;
pub(crate) mod lifecycle;
mod stomp;

use async_trait::async_trait;

pub use amqp091::{
    AMQP_DEFAULT_PASS, AMQP_DEFAULT_PORT, AMQP_DEFAULT_TLS_PORT, AMQP_DEFAULT_USER,
    AMQP_DEFAULT_VHOST, Amqp091Adapter, TOPIC_EXCHANGE,
};
pub use stomp::{
    STOMP_DEFAULT_PASS, STOMP_DEFAULT_PORT, STOMP_DEFAULT_TLS_PORT, STOMP_DEFAULT_USER,
    StompAdapter,
};

use crate::config::{Config, Protocol};
use crate::error::MqError;
use crate::publish::PublishInput;
use crate::resolver::ServerTarget;

/// Protocol-specific connect/close/publish behind one interface.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Resolved targets, in failover order.
    fn servers(&self) -> &[ServerTarget];

    async fn connect(&self) -> Result<(), MqError>;

    async fn close(&self) -> Result<(), MqError>;

    /// `true` only while fully connected (connection and channel both open).
    async fn is_connecting(&self) -> bool;

    async fn publish(&self, input: PublishInput) -> Result<(), MqError>;
}

/// Build the adapter for `config.protocol`.
pub fn new_adapter(config: &Config) -> Result<Box<dyn Adapter>, MqError> {
    let adapter: Box<dyn Adapter> = match config.protocol()? {
        Protocol::Amqp091 => Box::new(Amqp091Adapter::new(config)),
        Protocol::Stomp => Box::new(StompAdapter::new(config)),
    };
    Ok(adapter)
}
