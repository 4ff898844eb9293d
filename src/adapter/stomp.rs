use async_trait::async_trait;

use super::Adapter;
use super::lifecycle::{ChannelOf, Lifecycle};
use crate::config::{Config, Protocol};
use crate::error::MqError;
use crate::publish::{Destination, PublishInput};
use crate::resolver::{ProtocolDefaults, ServerTarget, resolve};
use crate::stomp::{Frame, StompDialer};
use crate::transport::{Dialer, TransportChannel};

pub const STOMP_DEFAULT_PORT: u16 = 61613;
pub const STOMP_DEFAULT_TLS_PORT: u16 = 61614;
pub const STOMP_DEFAULT_USER: &str = "guest";
pub const STOMP_DEFAULT_PASS: &str = "guest";

fn defaults(config: &Config) -> ProtocolDefaults {
    ProtocolDefaults {
        user: STOMP_DEFAULT_USER.into(),
        pass: STOMP_DEFAULT_PASS.into(),
        vhost: None,
        port: STOMP_DEFAULT_PORT,
        tls_port: STOMP_DEFAULT_TLS_PORT,
    }
    .with_overrides(&config.user, &config.pass, &config.vhost)
}

/// Build the `SEND` frame for a publish request.
fn to_frame(input: PublishInput) -> Result<Frame, MqError> {
    let destination = match input.destination()? {
        Destination::Queue(queue) => format!("/queue/{}", queue),
        Destination::Topic(topic) => format!("/topic/{}", topic),
    };
    let mut frame = Frame::send(destination, input.body.to_vec());
    if !input.content_type.is_empty() {
        frame = frame.header("content-type", input.content_type);
    }
    if input.expires > 0 {
        frame = frame.header("expires", input.expires.to_string());
    }
    if !input.message_id.is_empty() {
        frame = frame.header("message-id", input.message_id);
    }
    if input.persistent {
        frame = frame.header("persistent", "true");
    }
    if input.priority > 0 {
        frame = frame.header("priority", input.priority.to_string());
    }
    Ok(frame)
}

/// STOMP 1.2 adapter.
pub struct StompAdapter<D: Dialer = StompDialer> {
    lifecycle: Lifecycle<D>,
}

impl StompAdapter {
    pub fn new(config: &Config) -> Self {
        Self::with_dialer(config, StompDialer::new(config.into()))
    }
}

impl<D> StompAdapter<D>
where
    D: Dialer,
    ChannelOf<D>: TransportChannel<Outgoing = Frame>,
{
    pub fn with_dialer(config: &Config, dialer: D) -> Self {
        let targets = resolve(&config.servers, &defaults(config));
        Self {
            lifecycle: Lifecycle::new(Protocol::Stomp, dialer, targets, config.reconnect_policy()),
        }
    }
}

#[async_trait]
impl<D> Adapter for StompAdapter<D>
where
    D: Dialer,
    ChannelOf<D>: TransportChannel<Outgoing = Frame>,
{
    fn protocol(&self) -> Protocol {
        Protocol::Stomp
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
        let frame = to_frame(input)?;
        self.lifecycle.publish(frame).await
    }
}
