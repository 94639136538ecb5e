//! Resilient queue client.
//!
//! A [`Client`] owns one background task that keeps a connection and a
//! confirm-mode channel alive for a single queue, and exposes `publish`,
//! `consume` and `close` to callers.
//!
//! ## State machine
//!
//! ```text
//! Disconnected → Connecting → ChannelInitializing → Ready
//!                    ▲               ▲                │
//!                    │               └─ channel close ┤
//!                    └──────────── connection close ──┘
//!
//! any state ── close() ──▶ Closed
//! ```
//!
//! Only `Ready` lets `publish` and `consume` proceed; every other state
//! rejects them immediately.

mod consumer;
mod publisher;
mod supervisor;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use crate::broker::{AmqpDialer, BrokerChannel, BrokerConnection, Dialer};
use crate::error::ClientError;
use crate::util::redact_url;

pub use consumer::Deliveries;

/// Lifecycle of a [`Client`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
    Disconnected,
    Connecting,
    ChannelInitializing,
    Ready,
    Closed,
}

/// Timing and declaration settings for a [`Client`].
#[derive(Debug, Clone)]
pub struct Settings {
    /// Wait after a failed dial.
    pub reconnect_delay: Duration,
    /// Wait after a failed channel initialization.
    pub reinit_delay: Duration,
    /// Wait between publish attempts.
    pub resend_delay: Duration,
    /// Limit for one publish attempt, confirmation included.
    pub confirm_timeout: Duration,
    /// Wait between consumer re-subscription attempts.
    pub resubscribe_delay: Duration,
    /// Declare the queue as durable.
    pub durable: bool,
    /// Prefix for consumer tags; a counter keeps them unique per channel.
    pub consumer_tag: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
            reinit_delay: Duration::from_secs(2),
            resend_delay: Duration::from_secs(5),
            confirm_timeout: Duration::from_secs(30),
            resubscribe_delay: Duration::from_secs(5),
            durable: false,
            consumer_tag: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

/// Handle to a self-healing connection for one queue.
///
/// Cloning is cheap; all clones share the same connection, channel and
/// background task.
pub struct Client<D: Dialer = AmqpDialer> {
    inner: Arc<Inner<D>>,
}

impl<D: Dialer> Clone for Client<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

type ChannelOf<D> = <<D as Dialer>::Connection as BrokerConnection>::Channel;

/// Connection and channel slots. Written only by the maintenance task (and
/// emptied by `close`); everyone else reads clones.
struct Shared<C: BrokerConnection> {
    connection: Option<Arc<C>>,
    channel: Option<C::Channel>,
    state: ClientState,
}

struct Inner<D: Dialer> {
    queue: String,
    address: String,
    settings: Settings,
    dialer: D,
    shared: Mutex<Shared<D::Connection>>,
    state: watch::Sender<ClientState>,
    shutdown: watch::Sender<bool>,
    /// Serializes publishes so at most one confirmation is pending.
    publish_turn: Mutex<()>,
    consumer_seq: AtomicU64,
}

impl Client<AmqpDialer> {
    /// Starts a client for `queue` against an AMQP broker at `address`.
    ///
    /// Returns immediately; the connection is established in the background.
    /// Must be called from within a tokio runtime.
    pub fn new(queue: impl Into<String>, address: impl Into<String>) -> Self {
        Self::with_dialer(AmqpDialer::default(), queue, address, Settings::default())
    }
}

impl<D: Dialer> Client<D> {
    pub fn with_dialer(
        dialer: D,
        queue: impl Into<String>,
        address: impl Into<String>,
        settings: Settings,
    ) -> Self {
        let (state, _) = watch::channel(ClientState::Disconnected);
        let (shutdown, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            queue: queue.into(),
            address: address.into(),
            settings,
            dialer,
            shared: Mutex::new(Shared {
                connection: None,
                channel: None,
                state: ClientState::Disconnected,
            }),
            state,
            shutdown,
            publish_turn: Mutex::new(()),
            consumer_seq: AtomicU64::new(0),
        });

        info!(
            queue = %inner.queue,
            broker = %redact_url(&inner.address),
            "queue_client_starting"
        );
        tokio::spawn(supervisor::maintain(Arc::clone(&inner)));

        Self { inner }
    }

    pub fn queue(&self) -> &str {
        &self.inner.queue
    }

    pub fn state(&self) -> ClientState {
        *self.inner.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ClientState::Ready
    }

    /// Waits until the client is ready. Fails once the client is closed.
    pub async fn wait_ready(&self) -> Result<(), ClientError> {
        let mut states = self.inner.state.subscribe();
        let state = match states
            .wait_for(|s| matches!(s, ClientState::Ready | ClientState::Closed))
            .await
        {
            Ok(state) => *state,
            Err(_) => ClientState::Closed,
        };

        match state {
            ClientState::Ready => Ok(()),
            _ => Err(ClientError::AlreadyClosed),
        }
    }

    /// Stops the client: signals shutdown to every loop, then closes the
    /// channel and the connection, in that order.
    ///
    /// Returns the first close error, if any. Calling it again returns
    /// [`ClientError::AlreadyClosed`].
    pub async fn close(&self) -> Result<(), ClientError> {
        let (channel, connection) = {
            let mut shared = self.inner.shared.lock().await;
            if shared.state == ClientState::Closed {
                return Err(ClientError::AlreadyClosed);
            }
            self.inner.shutdown.send_replace(true);
            self.inner.set_state(&mut shared, ClientState::Closed);
            (shared.channel.take(), shared.connection.take())
        };

        info!(queue = %self.inner.queue, "queue_client_closing");

        let mut first_error = None;
        if let Some(channel) = channel {
            if let Err(e) = channel.close().await {
                warn!(error = %e, "broker_channel_close_error");
                first_error.get_or_insert(e);
            }
        }
        if let Some(connection) = connection {
            if let Err(e) = connection.close().await {
                warn!(error = %e, "broker_connection_close_error");
                first_error.get_or_insert(e);
            }
        }

        info!(queue = %self.inner.queue, "queue_client_closed");

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

impl<D: Dialer> Inner<D> {
    /// Moves to `next` unless the client is already closed.
    fn set_state(&self, shared: &mut Shared<D::Connection>, next: ClientState) {
        if shared.state == ClientState::Closed || shared.state == next {
            return;
        }
        shared.state = next;
        self.state.send_replace(next);
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Returns a clone of the live channel, or why there is none.
    async fn ready_channel(&self) -> Result<ChannelOf<D>, ClientError> {
        let shared = self.shared.lock().await;
        match (shared.state, &shared.channel) {
            (ClientState::Ready, Some(channel)) => Ok(channel.clone()),
            (ClientState::Closed, _) => Err(ClientError::AlreadyClosed),
            _ => Err(ClientError::NotConnected),
        }
    }

    fn next_consumer_tag(&self) -> String {
        let seq = self.consumer_seq.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.settings.consumer_tag, seq)
    }
}

/// Resolves once shutdown has been signaled.
async fn shutdown_signaled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|done| *done).await;
}
