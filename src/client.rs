use tracing::debug;

use crate::adapter::{Adapter, new_adapter};
use crate::config::{Config, Protocol};
use crate::error::MqError;
use crate::publish::PublishInput;
use crate::resolver::ServerTarget;

/// Unified publisher over any supported broker protocol.
///
/// ```no_run
/// use iridium_mq::{Client, Config, PublishInput, ServerConfig};
///
/// # async fn run() -> Result<(), iridium_mq::MqError> {
/// let config = Config::new("stomp").server(ServerConfig::new("127.0.0.1", 61613));
/// let client = Client::new(config).await?;
/// client.publish(PublishInput::to_queue("orders", "hello")).await?;
/// client.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct Client {
    adapter: Box<dyn Adapter>,
}

impl Client {
    /// Build a client for `config.protocol`, connecting right away when
    /// `auto_connect` is set.
    pub async fn new(config: Config) -> Result<Self, MqError> {
        let adapter = new_adapter(&config)?;
        Self::with_adapter(adapter, config.auto_connect).await
    }

    /// Build a client over an existing adapter.
    pub async fn with_adapter(adapter: Box<dyn Adapter>, auto_connect: bool) -> Result<Self, MqError> {
        let client = Self { adapter };
        if auto_connect {
            client.connect().await?;
        }
        Ok(client)
    }

    pub fn protocol(&self) -> Protocol {
        self.adapter.protocol()
    }

    /// Resolved broker targets, in failover order.
    pub fn servers(&self) -> &[ServerTarget] {
        self.adapter.servers()
    }

    pub async fn is_connected(&self) -> bool {
        self.adapter.is_connecting().await
    }

    /// Connect unless already fully connected.
    pub async fn connect(&self) -> Result<(), MqError> {
        if self.adapter.is_connecting().await {
            debug!(protocol = %self.protocol(), "already connected");
            return Ok(());
        }
        self.adapter.connect().await
    }

    pub async fn close(&self) -> Result<(), MqError> {
        self.adapter.close().await
    }

    /// Publish one message, connecting first if needed.
    pub async fn publish(&self, input: PublishInput) -> Result<(), MqError> {
        self.connect().await?;
        self.adapter.publish(input).await
    }
}
