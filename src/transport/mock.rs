//! In-memory transport for lifecycle and client tests.
//!
//! A [`MockBroker`] hands out a [`MockDialer`] and lets tests refuse dials,
//! fail channel opens and close links from the broker side.

use std::collections::HashSet;
use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;

use super::{
    CloseNotify, CloseReason, Dialer, LinkStatus, TransportChannel, TransportConnection,
    TransportError, closed_error,
};
use crate::resolver::ServerTarget;

type Status = Arc<watch::Sender<LinkStatus>>;

struct BrokerState<M> {
    unreachable: HashSet<String>,
    dials: Vec<String>,
    refuse_channels: bool,
    fail_close: bool,
    connections: Vec<Status>,
    /// (connection index, status)
    channels: Vec<(usize, Status)>,
    notify_registrations: usize,
    sent: Vec<M>,
}

pub(crate) struct MockBroker<M> {
    state: Arc<Mutex<BrokerState<M>>>,
}

impl<M> Clone for MockBroker<M> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<M: Clone + Send + 'static> MockBroker<M> {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                unreachable: HashSet::new(),
                dials: Vec::new(),
                refuse_channels: false,
                fail_close: false,
                connections: Vec::new(),
                channels: Vec::new(),
                notify_registrations: 0,
                sent: Vec::new(),
            })),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut BrokerState<M>) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub(crate) fn dialer(&self) -> MockDialer<M> {
        MockDialer {
            broker: self.clone(),
        }
    }

    /// Refuse dials to `address` (`host:port`).
    pub(crate) fn set_unreachable(&self, address: &str, unreachable: bool) {
        self.with(|s| {
            if unreachable {
                s.unreachable.insert(address.to_string());
            } else {
                s.unreachable.remove(address);
            }
        })
    }

    pub(crate) fn refuse_channels(&self, refuse: bool) {
        self.with(|s| s.refuse_channels = refuse)
    }

    pub(crate) fn fail_close(&self, fail: bool) {
        self.with(|s| s.fail_close = fail)
    }

    /// Every dial attempt in order, failed ones included.
    pub(crate) fn dials(&self) -> Vec<String> {
        self.with(|s| s.dials.clone())
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.with(|s| s.connections.len())
    }

    pub(crate) fn channel_count(&self) -> usize {
        self.with(|s| s.channels.len())
    }

    pub(crate) fn notify_registrations(&self) -> usize {
        self.with(|s| s.notify_registrations)
    }

    pub(crate) fn sent(&self) -> Vec<M> {
        self.with(|s| s.sent.clone())
    }

    /// Close connection `index` and its channels from the broker side.
    pub(crate) fn kill_connection(&self, index: usize, reason: CloseReason) {
        self.with(|s| {
            let closed = LinkStatus::Closed(Some(reason));
            s.connections[index].send_replace(closed.clone());
            for (_, status) in s.channels.iter().filter(|(conn, _)| *conn == index) {
                status.send_replace(closed.clone());
            }
        })
    }

    /// Close channel `index` only.
    pub(crate) fn kill_channel(&self, index: usize, reason: CloseReason) {
        self.with(|s| {
            s.channels[index].1.send_replace(LinkStatus::Closed(Some(reason)));
        })
    }
}

pub(crate) struct MockDialer<M> {
    broker: MockBroker<M>,
}

#[async_trait]
impl<M: Clone + Send + 'static> Dialer for MockDialer<M> {
    type Connection = MockConnection<M>;

    async fn dial(&self, target: &ServerTarget) -> Result<MockConnection<M>, TransportError> {
        let address = target.address();
        self.broker.with(|s| {
            s.dials.push(address.clone());
            if s.unreachable.contains(&address) {
                return Err(TransportError::Io(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    format!("{} refused", address),
                )));
            }
            let status = Arc::new(watch::channel(LinkStatus::Open).0);
            s.connections.push(status.clone());
            Ok(MockConnection {
                index: s.connections.len() - 1,
                broker: self.broker.clone(),
                status,
            })
        })
    }
}

pub(crate) struct MockConnection<M> {
    index: usize,
    broker: MockBroker<M>,
    status: Status,
}

impl<M: Clone + Send + 'static> MockConnection<M> {
    /// Mark closed without telling listeners anything unusual.
    pub(crate) fn set_closed(&self) {
        self.status.send_replace(LinkStatus::Closed(None));
    }
}

#[async_trait]
impl<M: Clone + Send + 'static> TransportConnection for MockConnection<M> {
    type Channel = MockChannel<M>;

    fn is_closed(&self) -> bool {
        self.status.borrow().is_closed()
    }

    async fn channel(&self) -> Result<MockChannel<M>, TransportError> {
        if self.is_closed() {
            return Err(closed_error(&self.status));
        }
        self.broker.with(|s| {
            if s.refuse_channels {
                return Err(TransportError::Closed(CloseReason::new(
                    403,
                    "ACCESS_REFUSED",
                )));
            }
            let status = Arc::new(watch::channel(LinkStatus::Open).0);
            s.channels.push((self.index, status.clone()));
            Ok(MockChannel {
                broker: self.broker.clone(),
                status,
            })
        })
    }

    fn notify_close(&self) -> CloseNotify {
        self.broker.with(|s| s.notify_registrations += 1);
        self.status.subscribe()
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.broker.with(|s| s.fail_close) {
            return Err(TransportError::Protocol("close refused".into()));
        }
        self.status.send_replace(LinkStatus::Closed(None));
        Ok(())
    }
}

pub(crate) struct MockChannel<M> {
    broker: MockBroker<M>,
    status: Status,
}

impl<M: Clone + Send + 'static> MockChannel<M> {
    pub(crate) fn set_closed(&self) {
        self.status.send_replace(LinkStatus::Closed(None));
    }
}

#[async_trait]
impl<M: Clone + Send + 'static> TransportChannel for MockChannel<M> {
    type Outgoing = M;

    fn is_closed(&self) -> bool {
        self.status.borrow().is_closed()
    }

    fn notify_close(&self) -> CloseNotify {
        self.broker.with(|s| s.notify_registrations += 1);
        self.status.subscribe()
    }

    async fn send(&self, message: M) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(closed_error(&self.status));
        }
        self.broker.with(|s| s.sent.push(message));
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.broker.with(|s| s.fail_close) {
            return Err(TransportError::Protocol("close refused".into()));
        }
        self.status.send_replace(LinkStatus::Closed(None));
        Ok(())
    }
}
