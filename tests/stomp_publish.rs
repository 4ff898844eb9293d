//! End-to-end tests of the STOMP adapter against an in-process broker.
//!
//! The broker runs on a std `TcpListener` in its own thread, decodes with the
//! crate's `StompCodec` and answers CONNECT, SEND and DISCONNECT according to
//! a small script. It returns every frame it received so tests can assert on
//! exactly what went over the wire.

use bytes::BytesMut;
use iridium_mq::stomp::{Frame, StompCodec, StompItem};
use iridium_mq::{Client, Config, MqError, PublishInput, ServerConfig, TransportError};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;
use tokio_util::codec::Decoder;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Script {
    /// Accept the session and confirm DISCONNECT
    Accept,
    /// Answer CONNECT with an ERROR frame
    RejectConnect,
    /// Accept, then answer the first SEND with an ERROR frame and hang up
    ErrorAfterSend,
    /// Accept, then push a frame whose content-length cannot be buffered
    OversizedAfterConnect,
}

fn write_frame(stream: &mut TcpStream, raw: &str) {
    stream.write_all(raw.as_bytes()).unwrap();
    stream.flush().unwrap();
}

/// Serve a single connection and return the frames received.
fn spawn_broker(script: Script) -> (u16, thread::JoinHandle<Vec<Frame>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut codec = StompCodec::new();
        let mut buf = BytesMut::new();
        let mut chunk = [0u8; 4096];
        let mut received = Vec::new();

        loop {
            while let Some(item) = codec.decode(&mut buf).unwrap() {
                let StompItem::Frame(frame) = item else {
                    continue;
                };
                received.push(frame.clone());
                match (frame.command.as_str(), script) {
                    ("CONNECT", Script::RejectConnect) => {
                        write_frame(
                            &mut stream,
                            "ERROR\nmessage:Authentication failed\n\nInvalid credentials\0",
                        );
                        thread::sleep(Duration::from_millis(100));
                        return received;
                    }
                    ("CONNECT", Script::OversizedAfterConnect) => {
                        write_frame(&mut stream, "CONNECTED\nversion:1.2\nheart-beat:0,0\n\n\0");
                        thread::sleep(Duration::from_millis(50));
                        write_frame(
                            &mut stream,
                            "MESSAGE\ncontent-length:18446744073709551615\n\n\0",
                        );
                        thread::sleep(Duration::from_millis(200));
                        return received;
                    }
                    ("CONNECT", _) => {
                        write_frame(&mut stream, "CONNECTED\nversion:1.2\nheart-beat:0,0\n\n\0");
                    }
                    ("SEND", Script::ErrorAfterSend) => {
                        write_frame(&mut stream, "ERROR\nmessage:queue is full\n\n\0");
                        thread::sleep(Duration::from_millis(100));
                        return received;
                    }
                    ("DISCONNECT", _) => {
                        let receipt = frame.get_header("receipt").unwrap_or_default();
                        write_frame(&mut stream, &format!("RECEIPT\nreceipt-id:{}\n\n\0", receipt));
                        return received;
                    }
                    _ => {}
                }
            }
            match stream.read(&mut chunk) {
                Ok(0) | Err(_) => return received,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        }
    });

    (port, handle)
}

fn config(port: u16) -> Config {
    Config::new("stomp")
        .server(ServerConfig::new("127.0.0.1", port))
        .auto_connect(true)
}

fn commands(frames: &[Frame]) -> Vec<&str> {
    frames.iter().map(|f| f.command.as_str()).collect()
}

// ============================================================================
// Publish
// ============================================================================

#[tokio::test]
async fn queue_publish_arrives_once() {
    let (port, broker) = spawn_broker(Script::Accept);

    let client = Client::new(config(port).credentials("app", "secret"))
        .await
        .expect("connect failed");
    assert!(client.is_connected().await);
    client
        .publish(
            PublishInput::to_queue("orders", "hello")
                .content_type("text/plain")
                .persistent(),
        )
        .await
        .expect("publish failed");
    client.close().await.expect("close failed");
    assert!(!client.is_connected().await);

    let frames = broker.join().unwrap();
    assert_eq!(commands(&frames), vec!["CONNECT", "SEND", "DISCONNECT"]);

    let connect = &frames[0];
    assert_eq!(connect.get_header("accept-version"), Some("1.2"));
    assert_eq!(connect.get_header("host"), Some("/"));
    assert_eq!(connect.get_header("login"), Some("app"));
    assert_eq!(connect.get_header("passcode"), Some("secret"));
    assert_eq!(connect.get_header("heart-beat"), Some("10000,10000"));

    let send = &frames[1];
    assert_eq!(send.get_header("destination"), Some("/queue/orders"));
    assert_eq!(send.get_header("content-type"), Some("text/plain"));
    assert_eq!(send.get_header("persistent"), Some("true"));
    assert_eq!(send.get_header("priority"), None);
    assert_eq!(send.body, b"hello");
}

#[tokio::test]
async fn topic_publish_carries_optional_headers() {
    let (port, broker) = spawn_broker(Script::Accept);

    let client = Client::new(config(port)).await.unwrap();
    client
        .publish(
            PublishInput::to_topic("prices", vec![0u8, 1, 2])
                .expires(30000)
                .message_id("m-42")
                .priority(7),
        )
        .await
        .unwrap();
    client.close().await.unwrap();

    let frames = broker.join().unwrap();
    let send = frames.iter().find(|f| f.command == "SEND").unwrap();
    assert_eq!(send.get_header("destination"), Some("/topic/prices"));
    assert_eq!(send.get_header("expires"), Some("30000"));
    assert_eq!(send.get_header("message-id"), Some("m-42"));
    assert_eq!(send.get_header("priority"), Some("7"));
    // binary body travels with content-length
    assert_eq!(send.get_header("content-length"), Some("3"));
    assert_eq!(send.body, vec![0u8, 1, 2]);
}

#[tokio::test]
async fn publish_without_auto_connect_connects_lazily() {
    let (port, broker) = spawn_broker(Script::Accept);

    let client = Client::new(config(port).auto_connect(false)).await.unwrap();
    assert!(!client.is_connected().await);
    client
        .publish(PublishInput::to_queue("orders", "lazy"))
        .await
        .unwrap();
    client.close().await.unwrap();

    let frames = broker.join().unwrap();
    assert_eq!(commands(&frames), vec!["CONNECT", "SEND", "DISCONNECT"]);
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn connect_error_frame_is_server_rejected() {
    let (port, broker) = spawn_broker(Script::RejectConnect);

    match Client::new(config(port)).await {
        Err(MqError::Transport(TransportError::ServerRejected(err))) => {
            assert_eq!(err.message, "Authentication failed");
            assert_eq!(err.body.as_deref(), Some("Invalid credentials"));
        }
        Err(other) => panic!("expected ServerRejected, got {:?}", other),
        Ok(_) => panic!("expected ServerRejected, got a connected client"),
    }
    broker.join().unwrap();
}

#[tokio::test]
async fn broker_error_frame_drops_the_link() {
    let (port, broker) = spawn_broker(Script::ErrorAfterSend);

    let client = Client::new(config(port)).await.unwrap();
    client
        .publish(PublishInput::to_queue("orders", "x"))
        .await
        .unwrap();

    let mut connected = true;
    for _ in 0..200 {
        connected = client.is_connected().await;
        if !connected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!connected, "client still connected after broker ERROR");
    broker.join().unwrap();
}

#[tokio::test]
async fn oversized_inbound_frame_drops_the_link() {
    let (port, broker) = spawn_broker(Script::OversizedAfterConnect);

    let client = Client::new(config(port)).await.unwrap();

    let mut connected = true;
    for _ in 0..200 {
        connected = client.is_connected().await;
        if !connected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!connected, "client still connected after unparseable frame");
    broker.join().unwrap();

    // the broker is gone, so publishing must fail instead of hanging
    let res = tokio::time::timeout(
        Duration::from_secs(5),
        client.publish(PublishInput::to_queue("orders", "x")),
    )
    .await
    .expect("publish hung on a dead session");
    assert!(res.is_err());
}

#[tokio::test]
async fn failover_skips_dead_server() {
    let dead_port = TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let (port, broker) = spawn_broker(Script::Accept);

    let config = Config::new("stomp")
        .server(ServerConfig::new("127.0.0.1", dead_port))
        .server(ServerConfig::new("127.0.0.1", port))
        .auto_connect(true);
    let client = Client::new(config).await.expect("failover failed");
    client.publish(PublishInput::to_queue("orders", "x")).await.unwrap();
    client.close().await.unwrap();

    let frames = broker.join().unwrap();
    assert_eq!(frames.iter().filter(|f| f.command == "SEND").count(), 1);
}
