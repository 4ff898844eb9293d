use iridium_mq::{Client, Config, PublishInput, ReconnectConfig, ServerConfig};
use std::env;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Expects RabbitMQ with the STOMP plugin on localhost (ports 5672 and 61613).
    // Pick the protocol with the first argument: `amqp091` (default) or `stomp`.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let protocol = env::args().nth(1).unwrap_or_default();

    // The first server is unreachable on purpose; connect fails over to the
    // second. Port 0 picks the protocol default.
    let config = Config::new(protocol)
        .server(ServerConfig::new("127.0.0.1", 1))
        .server(ServerConfig::new("127.0.0.1", 0))
        .credentials("guest", "guest")
        .connection_name("iridium-mq demo")
        .connect_timeout(Duration::from_secs(5))
        .auto_connect(true)
        .auto_reconnect(true)
        .reconnect(ReconnectConfig {
            max_attempts: None,
            ..ReconnectConfig::default()
        });

    let client = Client::new(config).await?;
    println!("connected via {} to {:?}", client.protocol(), client.servers());

    for i in 0..5 {
        let body = format!("hello #{} from iridium-mq", i);
        client
            .publish(
                PublishInput::to_queue("demo", body)
                    .content_type("text/plain")
                    .persistent(),
            )
            .await?;
        client
            .publish(PublishInput::to_topic("demo.ticks", i.to_string()))
            .await?;
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    client.close().await?;
    Ok(())
}
