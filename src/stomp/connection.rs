use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use super::codec::{StompCodec, StompItem};
use super::frame::Frame;
use crate::resolver::ServerTarget;
use crate::transport::{
    CloseNotify, CloseReason, DialOptions, Dialer, LinkStatus, MaybeTlsStream, ServerError,
    TransportChannel, TransportConnection, TransportError, closed_error, stream,
};

type StompFramed = Framed<MaybeTlsStream, StompCodec>;

/// How long a graceful close waits for the broker's DISCONNECT receipt.
const DISCONNECT_RECEIPT_TIMEOUT: Duration = Duration::from_secs(5);

static RECEIPT_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Parse the STOMP `heart-beat` header value (format: "cx,cy").
///
/// Returns a tuple `(cx, cy)` where each value is the heartbeat interval in
/// milliseconds. Missing or invalid fields default to `0`.
pub fn parse_heartbeat_header(header: &str) -> (u64, u64) {
    let mut parts = header.split(',');
    let mut next = || {
        parts
            .next()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(0)
    };
    let cx = next();
    let cy = next();
    (cx, cy)
}

/// Negotiate heartbeat intervals between client and server.
///
/// Parameters
/// - `client_out`: how often the client can send heartbeats (ms).
/// - `client_in`: how often the client wants to receive heartbeats (ms).
/// - `server_out`: server's advertised outgoing interval (ms).
/// - `server_in`: server's advertised incoming interval (ms).
///
/// Returns `(outgoing, incoming)`. A direction is enabled only when both
/// sides asked for it, and then uses the larger of the two values.
pub fn negotiate_heartbeats(
    client_out: u64,
    client_in: u64,
    server_out: u64,
    server_in: u64,
) -> (Option<Duration>, Option<Duration>) {
    let pick = |ours: u64, theirs: u64| {
        (ours != 0 && theirs != 0).then(|| Duration::from_millis(ours.max(theirs)))
    };
    (pick(client_out, server_in), pick(client_in, server_out))
}

/// Client `heart-beat` header for the desired interval.
fn heartbeat_header(interval: Duration) -> String {
    let ms = interval.as_millis();
    format!("{},{}", ms, ms)
}

fn server_error(frame: &Frame) -> ServerError {
    ServerError {
        message: frame
            .get_header("message")
            .unwrap_or("unknown error")
            .to_string(),
        body: (!frame.body.is_empty()).then(|| String::from_utf8_lossy(&frame.body).into_owned()),
    }
}

/// Dials STOMP brokers over TCP or TLS.
#[derive(Debug, Clone, Default)]
pub struct StompDialer {
    options: DialOptions,
}

impl StompDialer {
    pub fn new(options: DialOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl Dialer for StompDialer {
    type Connection = StompConnection;

    async fn dial(&self, target: &ServerTarget) -> Result<StompConnection, TransportError> {
        let socket = stream::with_deadline(self.options.connect_timeout, stream::open(target)).await?;
        Ok(StompConnection {
            target: target.clone(),
            options: self.options.clone(),
            framed: Mutex::new(Some(Framed::new(socket, StompCodec::new()))),
            status: Arc::new(watch::channel(LinkStatus::Open).0),
            commands: OnceLock::new(),
        })
    }
}

enum Command {
    Send(Frame, oneshot::Sender<io::Result<()>>),
    Disconnect(oneshot::Sender<Result<(), TransportError>>),
}

/// An open socket to a STOMP broker.
///
/// The STOMP session owns the socket once opened, so a connection carries at
/// most one session and both close together.
pub struct StompConnection {
    target: ServerTarget,
    options: DialOptions,
    /// Socket waiting for the session handshake
    framed: Mutex<Option<StompFramed>>,
    status: Arc<watch::Sender<LinkStatus>>,
    /// Command queue of the session task, once started
    commands: OnceLock<mpsc::Sender<Command>>,
}

#[async_trait]
impl TransportConnection for StompConnection {
    type Channel = StompSession;

    fn is_closed(&self) -> bool {
        self.status.borrow().is_closed()
    }

    async fn channel(&self) -> Result<StompSession, TransportError> {
        if self.is_closed() {
            return Err(closed_error(&self.status));
        }
        let framed = self.framed.lock().await.take().ok_or_else(|| {
            TransportError::Protocol("a session is already open on this connection".into())
        })?;

        let handshake = handshake(framed, &self.target, self.options.heartbeat);
        let (framed, server_hb) = match stream::with_deadline(self.options.connect_timeout, handshake).await {
            Ok(done) => done,
            Err(err) => {
                // never reached Open, so there is no dropped link to recover
                self.status.send_replace(LinkStatus::Closed(None));
                return Err(err);
            }
        };

        let client_ms = self.options.heartbeat.as_millis() as u64;
        let (sx, sy) = parse_heartbeat_header(&server_hb);
        let (send_interval, recv_interval) = negotiate_heartbeats(client_ms, client_ms, sx, sy);
        debug!(server = %self.target, ?send_interval, ?recv_interval, "stomp session established");

        let (tx, rx) = mpsc::channel(32);
        let first = self.commands.set(tx.clone()).is_ok();
        debug_assert!(first, "framed is taken once, so commands is set once");
        tokio::spawn(run_session(
            framed,
            rx,
            self.status.clone(),
            send_interval,
            recv_interval,
        ));

        Ok(StompSession {
            commands: tx,
            status: self.status.clone(),
        })
    }

    fn notify_close(&self) -> CloseNotify {
        self.status.subscribe()
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            return Ok(());
        }
        if let Some(commands) = self.commands.get() {
            return disconnect_via(commands, &self.status).await;
        }
        if let Some(framed) = self.framed.lock().await.take() {
            framed.into_inner().shutdown().await?;
        }
        self.status.send_replace(LinkStatus::Closed(None));
        Ok(())
    }
}

/// An established STOMP session, used to send frames.
#[derive(Debug)]
pub struct StompSession {
    commands: mpsc::Sender<Command>,
    status: Arc<watch::Sender<LinkStatus>>,
}

#[async_trait]
impl TransportChannel for StompSession {
    type Outgoing = Frame;

    fn is_closed(&self) -> bool {
        self.status.borrow().is_closed()
    }

    fn notify_close(&self) -> CloseNotify {
        self.status.subscribe()
    }

    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(closed_error(&self.status));
        }
        let (done_tx, done_rx) = oneshot::channel();
        self.commands
            .send(Command::Send(frame, done_tx))
            .await
            .map_err(|_| closed_error(&self.status))?;
        done_rx.await.map_err(|_| closed_error(&self.status))??;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            return Ok(());
        }
        disconnect_via(&self.commands, &self.status).await
    }
}

async fn disconnect_via(
    commands: &mpsc::Sender<Command>,
    status: &watch::Sender<LinkStatus>,
) -> Result<(), TransportError> {
    let (done_tx, done_rx) = oneshot::channel();
    if commands.send(Command::Disconnect(done_tx)).await.is_err() {
        // session task already gone
        return if status.borrow().is_closed() {
            Ok(())
        } else {
            Err(closed_error(status))
        };
    }
    done_rx.await.map_err(|_| closed_error(status))?
}

/// Send CONNECT and wait for CONNECTED. Returns the socket and the server's
/// `heart-beat` header.
async fn handshake(
    mut framed: StompFramed,
    target: &ServerTarget,
    heartbeat: Duration,
) -> Result<(StompFramed, String), TransportError> {
    let connect = Frame::new("CONNECT")
        .header("accept-version", "1.2")
        .header("host", "/")
        .header("login", &target.user)
        .header("passcode", &target.pass)
        .header("heart-beat", heartbeat_header(heartbeat));
    framed.send(StompItem::Frame(connect)).await?;

    loop {
        match framed.next().await {
            Some(Ok(StompItem::Heartbeat)) => {}
            Some(Ok(StompItem::Frame(f))) if f.command == "CONNECTED" => {
                let server_hb = f.get_header("heart-beat").unwrap_or("0,0").to_string();
                return Ok((framed, server_hb));
            }
            Some(Ok(StompItem::Frame(f))) if f.command == "ERROR" => {
                return Err(TransportError::ServerRejected(server_error(&f)));
            }
            Some(Ok(StompItem::Frame(f))) => {
                debug!(command = %f.command, "ignoring frame before CONNECTED");
            }
            Some(Err(e)) => return Err(e.into()),
            None => {
                return Err(TransportError::Protocol(
                    "connection closed before CONNECTED".into(),
                ));
            }
        }
    }
}

/// Marks the link closed if the session task ends without reporting a status,
/// including when it unwinds from a panic.
struct SessionGuard(Arc<watch::Sender<LinkStatus>>);

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.0.send_if_modified(|status| {
            if status.is_closed() {
                return false;
            }
            *status = LinkStatus::Closed(Some(CloseReason::network("stomp session task ended")));
            true
        });
    }
}

/// Session task: owns the socket, writes queued frames, keeps heart-beats
/// flowing and publishes the final [`LinkStatus`].
async fn run_session(
    framed: StompFramed,
    mut commands: mpsc::Receiver<Command>,
    status: Arc<watch::Sender<LinkStatus>>,
    send_interval: Option<Duration>,
    recv_interval: Option<Duration>,
) {
    let _guard = SessionGuard(status.clone());
    let (mut sink, mut stream) = framed.split();

    let tick_every = send_interval.unwrap_or(Duration::from_secs(86400));
    let mut hb_tick = tokio::time::interval_at(Instant::now() + tick_every, tick_every);
    let watchdog_every = recv_interval.map_or(Duration::from_secs(86400), |d| d / 2);
    let mut watchdog = tokio::time::interval_at(Instant::now() + watchdog_every, watchdog_every);
    let mut last_sent = Instant::now();
    let mut last_received = Instant::now();

    let reason = loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(Command::Send(frame, done)) => {
                    let res = sink.send(StompItem::Frame(frame)).await;
                    let failed = res.as_ref().err().map(|e| CloseReason::network(e.to_string()));
                    let _ = done.send(res);
                    if let Some(reason) = failed {
                        break Some(reason);
                    }
                    last_sent = Instant::now();
                }
                Some(Command::Disconnect(done)) => {
                    let res = disconnect(&mut sink, &mut stream).await;
                    status.send_replace(LinkStatus::Closed(None));
                    let _ = done.send(res);
                    return;
                }
                None => {
                    // every handle dropped
                    let _ = sink.close().await;
                    break None;
                }
            },
            item = stream.next() => match item {
                Some(Ok(StompItem::Heartbeat)) => last_received = Instant::now(),
                Some(Ok(StompItem::Frame(f))) => {
                    last_received = Instant::now();
                    if f.command == "ERROR" {
                        break Some(CloseReason::network(server_error(&f).to_string()));
                    }
                    debug!(command = %f.command, "ignoring inbound frame");
                }
                Some(Err(e)) => break Some(CloseReason::network(e.to_string())),
                None => break Some(CloseReason::network("connection closed by broker")),
            },
            _ = hb_tick.tick(), if send_interval.is_some() => {
                if last_sent.elapsed() >= tick_every {
                    if let Err(e) = sink.send(StompItem::Heartbeat).await {
                        break Some(CloseReason::network(e.to_string()));
                    }
                    last_sent = Instant::now();
                }
            }
            _ = watchdog.tick(), if recv_interval.is_some() => {
                if let Some(limit) = recv_interval.map(|d| d * 2) {
                    if last_received.elapsed() > limit {
                        let _ = sink.close().await;
                        break Some(CloseReason::network("heart-beat timeout"));
                    }
                }
            }
        }
    };

    if let Some(reason) = &reason {
        warn!(%reason, "stomp session closed");
    }
    status.send_replace(LinkStatus::Closed(reason));
}

async fn disconnect(
    sink: &mut SplitSink<StompFramed, StompItem>,
    stream: &mut SplitStream<StompFramed>,
) -> Result<(), TransportError> {
    let receipt_id = format!("disconnect-{}", RECEIPT_COUNTER.fetch_add(1, Ordering::SeqCst));
    sink.send(StompItem::Frame(Frame::new("DISCONNECT").receipt(&receipt_id)))
        .await?;

    let confirmed = tokio::time::timeout(DISCONNECT_RECEIPT_TIMEOUT, async {
        while let Some(item) = stream.next().await {
            if let StompItem::Frame(f) = item? {
                if f.command == "RECEIPT" && f.get_header("receipt-id") == Some(receipt_id.as_str()) {
                    return Ok(());
                }
            }
        }
        // EOF after DISCONNECT is an acceptable end too
        Ok::<(), io::Error>(())
    })
    .await;

    sink.close().await?;
    match confirmed {
        Ok(res) => res.map_err(TransportError::from),
        Err(_) => Err(TransportError::ReceiptTimeout(receipt_id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiation_requires_both_sides() {
        assert_eq!(negotiate_heartbeats(0, 0, 0, 0), (None, None));
        assert_eq!(negotiate_heartbeats(10000, 10000, 0, 0), (None, None));
        assert_eq!(
            negotiate_heartbeats(10000, 10000, 5000, 20000),
            (
                Some(Duration::from_millis(20000)),
                Some(Duration::from_millis(10000))
            )
        );
    }

    #[test]
    fn heartbeat_header_uses_millis() {
        assert_eq!(heartbeat_header(Duration::from_secs(10)), "10000,10000");
        assert_eq!(heartbeat_header(Duration::ZERO), "0,0");
    }

    #[test]
    fn server_error_takes_message_and_body() {
        let f = Frame::new("ERROR")
            .header("message", "Authentication failed")
            .set_body(b"Invalid credentials".to_vec());
        let err = server_error(&f);
        assert_eq!(err.message, "Authentication failed");
        assert_eq!(err.body.as_deref(), Some("Invalid credentials"));
        assert_eq!(server_error(&Frame::new("ERROR")).message, "unknown error");
    }

    #[test]
    fn dropped_session_marks_link_closed() {
        let status = Arc::new(watch::channel(LinkStatus::Open).0);
        drop(SessionGuard(status.clone()));
        assert!(matches!(&*status.borrow(), LinkStatus::Closed(Some(_))));
    }

    #[test]
    fn session_guard_keeps_reported_status() {
        let status = Arc::new(watch::channel(LinkStatus::Closed(None)).0);
        drop(SessionGuard(status.clone()));
        assert!(matches!(&*status.borrow(), LinkStatus::Closed(None)));
    }

    async fn rejecting_broker() -> (ServerTarget, tokio::task::JoinHandle<()>) {
        use tokio::io::AsyncReadExt;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let broker = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 512];
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(b"ERROR\nmessage:denied\n\n\0")
                .await
                .unwrap();
            let _ = socket.read(&mut buf).await;
        });
        let target = ServerTarget {
            host: "127.0.0.1".into(),
            port,
            tls: false,
            user: "guest".into(),
            pass: "guest".into(),
            vhost: None,
        };
        (target, broker)
    }

    #[tokio::test]
    async fn rejected_handshake_is_not_a_dropped_link() {
        let (target, broker) = rejecting_broker().await;
        let conn = StompDialer::new(DialOptions::default())
            .dial(&target)
            .await
            .unwrap();
        let notify = conn.notify_close();

        let err = conn.channel().await.unwrap_err();
        assert!(matches!(err, TransportError::ServerRejected(_)));
        assert!(conn.is_closed());
        assert_eq!(crate::transport::closed(notify).await, None);

        drop(conn);
        broker.abort();
    }

    #[tokio::test]
    async fn second_session_on_connection_is_refused() {
        let (target, broker) = rejecting_broker().await;
        let conn = StompDialer::new(DialOptions::default())
            .dial(&target)
            .await
            .unwrap();
        *conn.framed.lock().await = None;
        let err = conn.channel().await.unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
        broker.abort();
    }
}
