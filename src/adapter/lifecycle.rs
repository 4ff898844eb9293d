//! Connection lifecycle shared by every protocol adapter.
//!
//! [`Lifecycle`] owns the current connection and channel of one adapter and
//! keeps them consistent across client calls and broker-initiated closures:
//!
//! - `connect` dials the targets in order (first success wins) and opens a
//!   channel, registering a close listener for each new handle.
//! - A listener that sees an unsolicited close either clears the affected
//!   handles or, with auto-reconnect enabled, starts the single reconnect
//!   supervisor.
//! - Each handle carries an epoch so a late notification for a replaced
//!   handle never clears its successor.
//!
//! Listeners and the supervisor hold only a `Weak` reference: dropping the
//! adapter ends them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{Protocol, ReconnectConfig};
use crate::error::MqError;
use crate::resolver::ServerTarget;
use crate::transport::{
    CloseNotify, CloseReason, Dialer, TransportChannel, TransportConnection, closed,
};

pub(crate) type ConnectionOf<D> = <D as Dialer>::Connection;
pub(crate) type ChannelOf<D> = <ConnectionOf<D> as TransportConnection>::Channel;
pub(crate) type OutgoingOf<D> = <ChannelOf<D> as TransportChannel>::Outgoing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Connection,
    Channel,
}

pub(crate) struct LinkState<D: Dialer> {
    connection: Option<Arc<ConnectionOf<D>>>,
    channel: Option<Arc<ChannelOf<D>>>,
    connected: bool,
    connection_epoch: u64,
    channel_epoch: u64,
    /// Set by a successful `connect`, cleared by `close`
    wanted: bool,
}

impl<D: Dialer> Default for LinkState<D> {
    fn default() -> Self {
        Self {
            connection: None,
            channel: None,
            connected: false,
            connection_epoch: 0,
            channel_epoch: 0,
            wanted: false,
        }
    }
}

impl<D: Dialer> LinkState<D> {
    fn live_connection(&self) -> Option<Arc<ConnectionOf<D>>> {
        self.connection.clone().filter(|c| !c.is_closed())
    }

    fn live_channel(&self) -> Option<Arc<ChannelOf<D>>> {
        self.channel.clone().filter(|c| !c.is_closed())
    }

    fn clear(&mut self) {
        self.channel = None;
        self.connection = None;
        self.connected = false;
    }
}

struct Shared<D: Dialer> {
    protocol: Protocol,
    dialer: D,
    targets: Vec<ServerTarget>,
    reconnect: Option<ReconnectConfig>,
    state: Mutex<LinkState<D>>,
    /// A reconnect supervisor is running
    reconnecting: AtomicBool,
}

/// Connection state machine over a [`Dialer`].
pub(crate) struct Lifecycle<D: Dialer> {
    shared: Arc<Shared<D>>,
}

impl<D: Dialer> Lifecycle<D> {
    pub(crate) fn new(
        protocol: Protocol,
        dialer: D,
        targets: Vec<ServerTarget>,
        reconnect: Option<ReconnectConfig>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                protocol,
                dialer,
                targets,
                reconnect,
                state: Mutex::new(LinkState::default()),
                reconnecting: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn targets(&self) -> &[ServerTarget] {
        &self.shared.targets
    }

    /// Establish whatever part of the link is missing.
    pub(crate) async fn connect(&self) -> Result<(), MqError> {
        let mut state = self.shared.state.lock().await;
        establish(&self.shared, &mut state).await?;
        state.wanted = true;
        Ok(())
    }

    /// Close the channel, then the connection. A failed step leaves its
    /// handle in place, and auto-reconnect armed, so the call can be retried.
    pub(crate) async fn close(&self) -> Result<(), MqError> {
        let mut state = self.shared.state.lock().await;
        if let Some(channel) = state.channel.clone() {
            if !channel.is_closed() {
                channel.close().await?;
            }
            state.channel = None;
        }
        if let Some(connection) = state.connection.clone() {
            if !connection.is_closed() {
                connection.close().await?;
            }
            state.connection = None;
        }
        state.connected = false;
        state.wanted = false;
        debug!(protocol = %self.shared.protocol, "link closed");
        Ok(())
    }

    /// Fully connected: flag set and both handles present and open.
    pub(crate) async fn is_connecting(&self) -> bool {
        let state = self.shared.state.lock().await;
        state.connected && state.live_connection().is_some() && state.live_channel().is_some()
    }

    /// Send on the current channel. Never reconnects.
    pub(crate) async fn publish(&self, message: OutgoingOf<D>) -> Result<(), MqError> {
        let channel = self
            .shared
            .state
            .lock()
            .await
            .channel
            .clone()
            .ok_or(MqError::NotConnected)?;
        channel.send(message).await?;
        Ok(())
    }
}

async fn dial_any<D: Dialer>(shared: &Shared<D>) -> Result<ConnectionOf<D>, MqError> {
    for target in &shared.targets {
        match shared.dialer.dial(target).await {
            Ok(connection) => {
                info!(protocol = %shared.protocol, server = %target, "connected");
                return Ok(connection);
            }
            Err(e) => {
                warn!(protocol = %shared.protocol, server = %target, error = %e, "failed to connect");
            }
        }
    }
    Err(MqError::NoAvailableServer)
}

async fn establish<D: Dialer>(shared: &Arc<Shared<D>>, state: &mut LinkState<D>) -> Result<(), MqError> {
    let connection = match state.live_connection() {
        Some(connection) => connection,
        None => {
            state.channel = None;
            state.connection = None;
            let connection = Arc::new(dial_any(shared).await?);
            state.connection_epoch += 1;
            watch_close(
                Arc::downgrade(shared),
                Scope::Connection,
                state.connection_epoch,
                connection.notify_close(),
            );
            state.connection = Some(connection.clone());
            connection
        }
    };

    if state.live_channel().is_none() {
        state.channel = None;
        let channel = Arc::new(connection.channel().await?);
        state.channel_epoch += 1;
        watch_close(
            Arc::downgrade(shared),
            Scope::Channel,
            state.channel_epoch,
            channel.notify_close(),
        );
        state.channel = Some(channel);
    }

    state.connected = true;
    Ok(())
}

/// One listener per registration; it handles a single event and exits.
fn watch_close<D: Dialer>(shared: Weak<Shared<D>>, scope: Scope, epoch: u64, notify: CloseNotify) {
    tokio::spawn(async move {
        let Some(reason) = closed(notify).await else {
            return;
        };
        if let Some(shared) = shared.upgrade() {
            on_unsolicited_close(&shared, scope, epoch, reason).await;
        }
    });
}

async fn on_unsolicited_close<D: Dialer>(
    shared: &Arc<Shared<D>>,
    scope: Scope,
    epoch: u64,
    reason: CloseReason,
) {
    let mut state = shared.state.lock().await;
    let current = match scope {
        Scope::Connection => state.connection_epoch,
        Scope::Channel => state.channel_epoch,
    };
    if epoch != current {
        debug!(protocol = %shared.protocol, ?scope, epoch, "ignoring close of a replaced handle");
        return;
    }
    if scope == Scope::Channel && state.live_connection().is_none() {
        // the connection listener owns this event
        return;
    }
    warn!(protocol = %shared.protocol, ?scope, %reason, "closed by broker");

    if shared.reconnect.is_some() && state.wanted {
        drop(state);
        spawn_reconnect(shared);
        return;
    }
    match scope {
        Scope::Connection => state.clear(),
        Scope::Channel => state.channel = None,
    }
}

fn spawn_reconnect<D: Dialer>(shared: &Arc<Shared<D>>) {
    if shared.reconnecting.swap(true, Ordering::SeqCst) {
        return;
    }
    tokio::spawn(reconnect(Arc::downgrade(shared)));
}

/// Reconnect supervisor. Clears `reconnecting` under the state lock so a
/// close event arriving right after it finishes starts a fresh supervisor.
async fn reconnect<D: Dialer>(shared: Weak<Shared<D>>) {
    let mut attempt = 1;
    loop {
        let Some(policy) = shared.upgrade().and_then(|s| s.reconnect.clone()) else {
            return;
        };
        if !policy.allows(attempt) {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let mut state = shared.state.lock().await;
            warn!(protocol = %shared.protocol, attempts = attempt - 1, "giving up reconnecting");
            state.clear();
            shared.reconnecting.store(false, Ordering::SeqCst);
            return;
        }

        tokio::time::sleep(policy.delay_for(attempt)).await;

        let Some(shared) = shared.upgrade() else {
            return;
        };
        let mut state = shared.state.lock().await;
        if !state.wanted {
            shared.reconnecting.store(false, Ordering::SeqCst);
            return;
        }
        match establish(&shared, &mut state).await {
            Ok(()) => {
                info!(protocol = %shared.protocol, attempt, "reconnected");
                shared.reconnecting.store(false, Ordering::SeqCst);
                return;
            }
            Err(e) => {
                warn!(protocol = %shared.protocol, attempt, error = %e, "reconnect attempt failed");
            }
        }
        attempt += 1;
    }
}
