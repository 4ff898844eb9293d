use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use super::codec::{AmqpCodec, MAX_FRAME_SIZE};
use super::frame::{
    AmqpFrame, BasicProperties, CLASS_BASIC, ContentHeader, FieldTable, FieldValue, Method,
    PROTOCOL_HEADER, REPLY_SUCCESS,
};
use crate::resolver::ServerTarget;
use crate::transport::{
    CloseNotify, CloseReason, DialOptions, Dialer, LinkStatus, MaybeTlsStream, TransportChannel,
    TransportConnection, TransportError, closed_error, stream,
};

type AmqpFramed = Framed<MaybeTlsStream, AmqpCodec>;

/// Channel limit offered when the broker imposes none.
pub const DEFAULT_CHANNEL_MAX: u16 = 2047;

/// Negotiated connection parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tuning {
    pub channel_max: u16,
    pub frame_max: u32,
    /// Heartbeat interval in seconds, `0` when disabled
    pub heartbeat: u16,
}

/// Combine the broker's `connection.tune` values with ours.
///
/// Zero means "no limit" for the broker's channel and frame maxima, so ours
/// apply. Heartbeats use the smaller interval when both sides want them and
/// whichever side is non-zero otherwise.
pub fn negotiate_tuning(server: Tuning, client_heartbeat: u16) -> Tuning {
    let limit = |ours: u32, theirs: u32| if theirs == 0 { ours } else { ours.min(theirs) };
    let heartbeat = if server.heartbeat != 0 && client_heartbeat != 0 {
        server.heartbeat.min(client_heartbeat)
    } else {
        server.heartbeat.max(client_heartbeat)
    };
    Tuning {
        channel_max: limit(DEFAULT_CHANNEL_MAX as u32, server.channel_max as u32) as u16,
        frame_max: limit(MAX_FRAME_SIZE, server.frame_max),
        heartbeat,
    }
}

/// A message ready for `basic.publish`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Publish {
    pub exchange: String,
    pub routing_key: String,
    pub mandatory: bool,
    pub properties: BasicProperties,
    pub body: Bytes,
}

/// Split `publish` into its method, content header and body frames.
fn publish_frames(channel: u16, publish: Publish, frame_max: u32) -> Vec<AmqpFrame> {
    let chunk = (frame_max as usize).saturating_sub(8).max(1);
    let mut frames = Vec::with_capacity(2 + publish.body.len().div_ceil(chunk));
    frames.push(AmqpFrame::Method(
        channel,
        Method::BasicPublish {
            exchange: publish.exchange,
            routing_key: publish.routing_key,
            mandatory: publish.mandatory,
            immediate: false,
        },
    ));
    frames.push(AmqpFrame::Header(
        channel,
        ContentHeader {
            class_id: CLASS_BASIC,
            body_size: publish.body.len() as u64,
            properties: publish.properties,
        },
    ));
    let mut body = publish.body;
    while !body.is_empty() {
        let part = body.split_to(chunk.min(body.len()));
        frames.push(AmqpFrame::Body(channel, part));
    }
    frames
}

fn client_properties(connection_name: Option<&str>) -> FieldTable {
    let mut caps = FieldTable::new();
    caps.insert("authentication_failure_close", true);
    caps.insert("connection.blocked", true);

    let mut props = FieldTable::new();
    props.insert("product", env!("CARGO_PKG_NAME"));
    props.insert("version", env!("CARGO_PKG_VERSION"));
    props.insert("platform", "Rust");
    props.insert("capabilities", FieldValue::Table(caps));
    if let Some(name) = connection_name {
        props.insert("connection_name", name);
    }
    props
}

/// Dials AMQP 0-9-1 brokers over TCP or TLS.
#[derive(Debug, Clone, Default)]
pub struct AmqpDialer {
    options: DialOptions,
}

impl AmqpDialer {
    pub fn new(options: DialOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl Dialer for AmqpDialer {
    type Connection = AmqpConnection;

    async fn dial(&self, target: &ServerTarget) -> Result<AmqpConnection, TransportError> {
        let opening = async {
            let mut socket = stream::open(target).await?;
            socket.write_all(PROTOCOL_HEADER).await?;
            let framed = Framed::new(socket, AmqpCodec::new());
            handshake(framed, target, &self.options).await
        };
        let (framed, tuning) = stream::with_deadline(self.options.connect_timeout, opening).await?;
        info!(
            server = %target,
            frame_max = tuning.frame_max,
            heartbeat = tuning.heartbeat,
            "amqp connection open"
        );
        Ok(AmqpConnection::start(framed, tuning, target))
    }
}

/// Next method on channel 0 during the handshake. Heartbeats are skipped and
/// a `connection.close` from the broker ends the handshake with its reason.
async fn next_method(framed: &mut AmqpFramed) -> Result<Method, TransportError> {
    loop {
        match framed.next().await {
            Some(Ok(AmqpFrame::Heartbeat)) => {}
            Some(Ok(AmqpFrame::Method(
                0,
                Method::ConnectionClose {
                    reply_code,
                    reply_text,
                    ..
                },
            ))) => {
                let _ = framed.send(AmqpFrame::Method(0, Method::ConnectionCloseOk)).await;
                return Err(TransportError::Closed(CloseReason::new(reply_code, reply_text)));
            }
            Some(Ok(AmqpFrame::Method(0, method))) => return Ok(method),
            Some(Ok(other)) => {
                return Err(TransportError::Protocol(format!(
                    "unexpected frame during handshake: {:?}",
                    other
                )));
            }
            Some(Err(e)) => return Err(e.into()),
            None => {
                return Err(TransportError::Protocol(
                    "connection closed during handshake".into(),
                ));
            }
        }
    }
}

fn unexpected(expected: &str, got: &Method) -> TransportError {
    TransportError::Protocol(format!("expected {}, got {:?}", expected, got))
}

async fn handshake(
    mut framed: AmqpFramed,
    target: &ServerTarget,
    options: &DialOptions,
) -> Result<(AmqpFramed, Tuning), TransportError> {
    match next_method(&mut framed).await? {
        Method::ConnectionStart { mechanisms, .. } => {
            if !mechanisms.split_whitespace().any(|m| m == "PLAIN") {
                return Err(TransportError::Protocol(format!(
                    "broker does not offer PLAIN authentication (offers: {})",
                    mechanisms
                )));
            }
        }
        other => return Err(unexpected("connection.start", &other)),
    }

    let mut response = Vec::with_capacity(target.user.len() + target.pass.len() + 2);
    response.push(0);
    response.extend_from_slice(target.user.as_bytes());
    response.push(0);
    response.extend_from_slice(target.pass.as_bytes());
    framed
        .send(AmqpFrame::Method(
            0,
            Method::ConnectionStartOk {
                client_properties: client_properties(options.connection_name.as_deref()),
                mechanism: "PLAIN".into(),
                response,
                locale: "en_US".into(),
            },
        ))
        .await?;

    let server = match next_method(&mut framed).await? {
        Method::ConnectionTune {
            channel_max,
            frame_max,
            heartbeat,
        } => Tuning {
            channel_max,
            frame_max,
            heartbeat,
        },
        other => return Err(unexpected("connection.tune", &other)),
    };
    let client_heartbeat = u16::try_from(options.heartbeat.as_secs()).unwrap_or(u16::MAX);
    let tuning = negotiate_tuning(server, client_heartbeat);
    framed
        .send(AmqpFrame::Method(
            0,
            Method::ConnectionTuneOk {
                channel_max: tuning.channel_max,
                frame_max: tuning.frame_max,
                heartbeat: tuning.heartbeat,
            },
        ))
        .await?;

    framed
        .send(AmqpFrame::Method(
            0,
            Method::ConnectionOpen {
                virtual_host: target.vhost.clone().unwrap_or_else(|| "/".into()),
            },
        ))
        .await?;
    match next_method(&mut framed).await? {
        Method::ConnectionOpenOk => Ok((framed, tuning)),
        other => Err(unexpected("connection.open-ok", &other)),
    }
}

struct ChannelSlot {
    status: Arc<watch::Sender<LinkStatus>>,
    /// Waiter for the next synchronous reply on this channel
    pending: Option<oneshot::Sender<Method>>,
}

#[derive(Default)]
struct ChannelTable {
    slots: HashMap<u16, ChannelSlot>,
    next_id: u16,
    /// Waiter for `connection.close-ok`
    closing: Option<oneshot::Sender<()>>,
}

impl ChannelTable {
    fn allocate(&mut self, channel_max: u16) -> Option<u16> {
        let max = channel_max.max(1);
        for _ in 0..max {
            self.next_id = if self.next_id >= max { 1 } else { self.next_id + 1 };
            if !self.slots.contains_key(&self.next_id) {
                return Some(self.next_id);
            }
        }
        None
    }
}

struct Inner {
    server: String,
    tuning: Tuning,
    writer: Mutex<SplitSink<AmqpFramed, AmqpFrame>>,
    channels: StdMutex<ChannelTable>,
    status: watch::Sender<LinkStatus>,
}

impl Inner {
    fn table(&self) -> MutexGuard<'_, ChannelTable> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write frames back to back so no other frame lands between them.
    async fn send_frames(&self, frames: Vec<AmqpFrame>) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        for frame in frames {
            writer.feed(frame).await?;
        }
        writer.flush().await?;
        Ok(())
    }

    async fn send_frame(&self, frame: AmqpFrame) -> Result<(), TransportError> {
        self.send_frames(vec![frame]).await
    }

    /// Register for the end of the connection, or `None` when it already
    /// ended. The status is checked under the table lock because the read
    /// loop marks the status before taking the waiter.
    fn close_waiter(&self) -> Option<oneshot::Receiver<()>> {
        let mut table = self.table();
        if self.status.borrow().is_closed() {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        table.closing = Some(tx);
        Some(rx)
    }

    /// Mark the connection and every channel closed. The first reason wins.
    fn fail_all(&self, reason: Option<CloseReason>) {
        let mark = |status: &watch::Sender<LinkStatus>, reason: &Option<CloseReason>| {
            status.send_if_modified(|s| {
                if s.is_closed() {
                    return false;
                }
                *s = LinkStatus::Closed(reason.clone());
                true
            });
        };
        mark(&self.status, &reason);
        let slots: Vec<ChannelSlot> = {
            self.table().slots.drain().map(|(_, slot)| slot).collect()
        };
        for slot in slots {
            mark(&slot.status, &reason);
        }
    }

    /// Handle one inbound frame. `Some` ends the connection with the given
    /// reason (`None` inside for a graceful close).
    async fn dispatch(&self, frame: AmqpFrame) -> Option<Option<CloseReason>> {
        let (channel, method) = match frame {
            AmqpFrame::Method(channel, method) => (channel, method),
            AmqpFrame::Heartbeat => return None,
            other => {
                debug!(server = %self.server, ?other, "ignoring content frame");
                return None;
            }
        };

        match method {
            Method::ConnectionClose {
                reply_code,
                reply_text,
                ..
            } => {
                let _ = self.send_frame(AmqpFrame::Method(0, Method::ConnectionCloseOk)).await;
                Some(Some(CloseReason::new(reply_code, reply_text)))
            }
            Method::ConnectionCloseOk => {
                self.fail_all(None);
                Some(None)
            }
            Method::ConnectionBlocked { reason } => {
                warn!(server = %self.server, %reason, "broker blocked publishing");
                None
            }
            Method::ConnectionUnblocked => {
                info!(server = %self.server, "broker unblocked publishing");
                None
            }
            Method::ChannelClose {
                reply_code,
                reply_text,
                ..
            } => {
                let _ = self
                    .send_frame(AmqpFrame::Method(channel, Method::ChannelCloseOk))
                    .await;
                let slot = self.table().slots.remove(&channel);
                if let Some(slot) = slot {
                    warn!(server = %self.server, channel, reply_code, %reply_text, "channel closed by broker");
                    slot.status
                        .send_replace(LinkStatus::Closed(Some(CloseReason::new(reply_code, reply_text))));
                }
                None
            }
            Method::ChannelCloseOk => {
                let slot = self.table().slots.remove(&channel);
                if let Some(mut slot) = slot {
                    slot.status.send_replace(LinkStatus::Closed(None));
                    if let Some(waiter) = slot.pending.take() {
                        let _ = waiter.send(Method::ChannelCloseOk);
                    }
                }
                None
            }
            Method::ChannelFlow { active } => {
                debug!(server = %self.server, channel, active, "channel flow");
                let _ = self
                    .send_frame(AmqpFrame::Method(channel, Method::ChannelFlowOk { active }))
                    .await;
                None
            }
            reply => {
                let waiter = self
                    .table()
                    .slots
                    .get_mut(&channel)
                    .and_then(|slot| slot.pending.take());
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(reply);
                    }
                    None => debug!(server = %self.server, channel, ?reply, "ignoring method"),
                }
                None
            }
        }
    }
}

async fn read_loop(mut stream: SplitStream<AmqpFramed>, inner: Arc<Inner>) {
    // two missed heartbeats and the broker is gone
    let limit = (inner.tuning.heartbeat != 0).then(|| Duration::from_secs(inner.tuning.heartbeat as u64 * 2));
    let reason = loop {
        let next = match limit {
            Some(limit) => match tokio::time::timeout(limit, stream.next()).await {
                Ok(next) => next,
                Err(_) => break Some(CloseReason::network("missed heartbeats from broker")),
            },
            None => stream.next().await,
        };
        match next {
            Some(Ok(frame)) => {
                if let Some(reason) = inner.dispatch(frame).await {
                    break reason;
                }
            }
            Some(Err(e)) => break Some(CloseReason::network(e.to_string())),
            None => break Some(CloseReason::network("connection closed by broker")),
        }
    };

    if let Some(reason) = &reason {
        warn!(server = %inner.server, %reason, "amqp connection closed");
    }
    inner.fail_all(reason);
    let waiter = inner.table().closing.take();
    if let Some(waiter) = waiter {
        let _ = waiter.send(());
    }
    let _ = inner.writer.lock().await.close().await;
}

async fn heartbeat_loop(inner: Arc<Inner>, every: Duration) {
    let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    loop {
        tick.tick().await;
        if inner.status.borrow().is_closed() {
            break;
        }
        if let Err(e) = inner.send_frame(AmqpFrame::Heartbeat).await {
            debug!(server = %inner.server, error = %e, "heartbeat write failed");
            break;
        }
    }
}

/// Aborts the connection's I/O tasks when the last handle goes away.
struct IoTasks(Vec<JoinHandle<()>>);

impl Drop for IoTasks {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}

/// An open AMQP 0-9-1 connection.
pub struct AmqpConnection {
    inner: Arc<Inner>,
    tasks: Arc<IoTasks>,
}

impl AmqpConnection {
    fn start(framed: AmqpFramed, tuning: Tuning, target: &ServerTarget) -> Self {
        let (sink, stream) = framed.split();
        let inner = Arc::new(Inner {
            server: target.to_string(),
            tuning,
            writer: Mutex::new(sink),
            channels: StdMutex::new(ChannelTable::default()),
            status: watch::channel(LinkStatus::Open).0,
        });

        let mut tasks = vec![tokio::spawn(read_loop(stream, inner.clone()))];
        if tuning.heartbeat != 0 {
            // send at half the negotiated timeout
            let every = Duration::from_millis(tuning.heartbeat as u64 * 500);
            tasks.push(tokio::spawn(heartbeat_loop(inner.clone(), every)));
        }
        Self {
            inner,
            tasks: Arc::new(IoTasks(tasks)),
        }
    }

    pub fn tuning(&self) -> Tuning {
        self.inner.tuning
    }
}

#[async_trait]
impl TransportConnection for AmqpConnection {
    type Channel = AmqpChannel;

    fn is_closed(&self) -> bool {
        self.inner.status.borrow().is_closed()
    }

    async fn channel(&self) -> Result<AmqpChannel, TransportError> {
        if self.is_closed() {
            return Err(closed_error(&self.inner.status));
        }
        let (id, status, reply) = {
            let mut table = self.inner.table();
            let id = table
                .allocate(self.inner.tuning.channel_max)
                .ok_or_else(|| TransportError::Protocol("no free channel ids".into()))?;
            let status = Arc::new(watch::channel(LinkStatus::Open).0);
            let (tx, rx) = oneshot::channel();
            table.slots.insert(
                id,
                ChannelSlot {
                    status: status.clone(),
                    pending: Some(tx),
                },
            );
            (id, status, rx)
        };

        if let Err(e) = self.inner.send_frame(AmqpFrame::Method(id, Method::ChannelOpen)).await {
            self.inner.table().slots.remove(&id);
            return Err(e);
        }
        match reply.await {
            Ok(Method::ChannelOpenOk) => {
                debug!(server = %self.inner.server, channel = id, "amqp channel open");
                Ok(AmqpChannel {
                    id,
                    inner: self.inner.clone(),
                    status,
                    _tasks: self.tasks.clone(),
                })
            }
            Ok(other) => Err(unexpected("channel.open-ok", &other)),
            Err(_) => match &*status.borrow() {
                LinkStatus::Closed(Some(reason)) => Err(TransportError::Closed(reason.clone())),
                _ => Err(closed_error(&self.inner.status)),
            },
        }
    }

    fn notify_close(&self) -> CloseNotify {
        self.inner.status.subscribe()
    }

    async fn close(&self) -> Result<(), TransportError> {
        let Some(rx) = self.inner.close_waiter() else {
            return Ok(());
        };
        self.inner
            .send_frame(AmqpFrame::Method(
                0,
                Method::ConnectionClose {
                    reply_code: REPLY_SUCCESS,
                    reply_text: "Normal shutdown".into(),
                    class_id: 0,
                    method_id: 0,
                },
            ))
            .await?;
        let _ = rx.await;
        match &*self.inner.status.borrow() {
            LinkStatus::Closed(Some(reason)) => Err(TransportError::Closed(reason.clone())),
            _ => Ok(()),
        }
    }
}

/// A channel on an [`AmqpConnection`].
pub struct AmqpChannel {
    id: u16,
    inner: Arc<Inner>,
    status: Arc<watch::Sender<LinkStatus>>,
    _tasks: Arc<IoTasks>,
}

impl AmqpChannel {
    pub fn id(&self) -> u16 {
        self.id
    }
}

#[async_trait]
impl TransportChannel for AmqpChannel {
    type Outgoing = Publish;

    fn is_closed(&self) -> bool {
        self.status.borrow().is_closed()
    }

    fn notify_close(&self) -> CloseNotify {
        self.status.subscribe()
    }

    async fn send(&self, publish: Publish) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(closed_error(&self.status));
        }
        let frames = publish_frames(self.id, publish, self.inner.tuning.frame_max);
        self.inner.send_frames(frames).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            return Ok(());
        }
        let reply = {
            let mut table = self.inner.table();
            let Some(slot) = table.slots.get_mut(&self.id) else {
                return Ok(());
            };
            let (tx, rx) = oneshot::channel();
            slot.pending = Some(tx);
            rx
        };
        self.inner
            .send_frame(AmqpFrame::Method(
                self.id,
                Method::ChannelClose {
                    reply_code: REPLY_SUCCESS,
                    reply_text: "Normal shutdown".into(),
                    class_id: 0,
                    method_id: 0,
                },
            ))
            .await?;
        match reply.await {
            Ok(Method::ChannelCloseOk) => Ok(()),
            Ok(other) => Err(unexpected("channel.close-ok", &other)),
            Err(_) => match &*self.status.borrow() {
                LinkStatus::Closed(None) => Ok(()),
                LinkStatus::Closed(Some(reason)) => Err(TransportError::Closed(reason.clone())),
                LinkStatus::Open => Err(closed_error(&self.inner.status)),
            },
        }
    }
}
