use async_trait::async_trait;

use super::Adapter;
use super::lifecycle::{ChannelOf, Lifecycle};
use crate::amqp::{AmqpDialer, BasicProperties, Publish};
use crate::config::{Config, Protocol};
use crate::error::MqError;
use crate::publish::{Destination, PublishInput};
use crate::resolver::{ProtocolDefaults, ServerTarget, resolve};
use crate::transport::{Dialer, TransportChannel};

pub const AMQP_DEFAULT_PORT: u16 = 5672;
pub const AMQP_DEFAULT_TLS_PORT: u16 = 5671;
pub const AMQP_DEFAULT_USER: &str = "guest";
pub const AMQP_DEFAULT_PASS: &str = "guest";
pub const AMQP_DEFAULT_VHOST: &str = "/";

/// Exchange used for topic destinations.
pub const TOPIC_EXCHANGE: &str = "amq.topic";

fn defaults(config: &Config) -> ProtocolDefaults {
    ProtocolDefaults {
        user: AMQP_DEFAULT_USER.into(),
        pass: AMQP_DEFAULT_PASS.into(),
        vhost: Some(AMQP_DEFAULT_VHOST.into()),
        port: AMQP_DEFAULT_PORT,
        tls_port: AMQP_DEFAULT_TLS_PORT,
    }
    .with_overrides(&config.user, &config.pass, &config.vhost)
}

fn non_empty(s: String) -> Option<String> {
    (!s.is_empty()).then_some(s)
}

/// Map a publish request onto `basic.publish`.
///
/// Queues go through the default exchange with the queue name as routing
/// key; topics go to `amq.topic`.
fn to_publish(input: PublishInput) -> Result<Publish, MqError> {
    let (exchange, routing_key) = match input.destination()? {
        Destination::Queue(queue) => ("", queue.to_string()),
        Destination::Topic(topic) => (TOPIC_EXCHANGE, topic.to_string()),
    };
    let properties = BasicProperties {
        content_type: non_empty(input.content_type),
        expiration: (input.expires > 0).then(|| input.expires.to_string()),
        message_id: non_empty(input.message_id),
        delivery_mode: input.persistent.then_some(2),
        priority: (input.priority > 0).then_some(input.priority),
        ..Default::default()
    };
    Ok(Publish {
        exchange: exchange.to_string(),
        routing_key,
        mandatory: false,
        properties,
        body: input.body,
    })
}

/// AMQP 0-9-1 adapter.
pub struct Amqp091Adapter<D: Dialer = AmqpDialer> {
    lifecycle: Lifecycle<D>,
}

impl Amqp091Adapter {
    pub fn new(config: &Config) -> Self {
        Self::with_dialer(config, AmqpDialer::new(config.into()))
    }
}

impl<D> Amqp091Adapter<D>
where
    D: Dialer,
    ChannelOf<D>: TransportChannel<Outgoing = Publish>,
{
    /// Build the adapter over a custom dialer.
    pub fn with_dialer(config: &Config, dialer: D) -> Self {
        let targets = resolve(&config.servers, &defaults(config));
        Self {
            lifecycle: Lifecycle::new(Protocol::Amqp091, dialer, targets, config.reconnect_policy()),
        }
    }
}

#[async_trait]
impl<D> Adapter for Amqp091Adapter<D>
where
    D: Dialer,
    ChannelOf<D>: TransportChannel<Outgoing = Publish>,
{
    fn protocol(&self) -> Protocol {
        Protocol::Amqp091
    }

    fn servers(&self) -> &[ServerTarget] {
        self.lifecycle.targets()
    }

    async fn connect(&self) -> Result<(), MqError> {
        self.lifecycle.connect().await
    }

    async fn close(&self) -> Result<(), MqError> {
        self.lifecycle.close().await
    }

    async fn is_connecting(&self) -> bool {
        self.lifecycle.is_connecting().await
    }

    async fn publish(&self, input: PublishInput) -> Result<(), MqError> {
        let publish = to_publish(input)?;
        self.lifecycle.publish(publish).await
    }
}
