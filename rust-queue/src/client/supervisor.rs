//! Connection supervision and channel initialization.
//!
//! One task per client runs [`maintain`]. The outer loop dials and redials the
//! broker; the inner loop ([`initialize`]) opens a confirm-mode channel on the
//! live connection, declares the queue, and reopens the channel whenever it
//! alone is lost. Every wait selects over shutdown as well, so `close` is
//! observed within one retry delay.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::{shutdown_signaled, ChannelOf, ClientState, Inner};
use crate::broker::{BrokerChannel, BrokerConnection, Dialer, QueueOptions};
use crate::error::BrokerError;
use crate::util::redact_url;

/// What the supervisor does after the initializer lets go of a connection.
enum Next {
    Shutdown,
    Redial,
}

pub(super) async fn maintain<D: Dialer>(inner: Arc<Inner<D>>) {
    let mut shutdown = inner.shutdown.subscribe();

    loop {
        if inner.is_shutdown() {
            break;
        }
        inner.enter(ClientState::Connecting).await;

        info!(broker = %redact_url(&inner.address), "broker_connecting");

        let dialed = tokio::select! {
            biased;
            _ = shutdown_signaled(&mut shutdown) => break,
            dialed = inner.dialer.dial(&inner.address) => dialed,
        };

        let connection = match dialed {
            Ok(connection) => Arc::new(connection),
            Err(e) => {
                warn!(
                    error = %e,
                    retry_in_ms = inner.settings.reconnect_delay.as_millis() as u64,
                    "broker_connect_failed"
                );
                tokio::select! {
                    biased;
                    _ = shutdown_signaled(&mut shutdown) => break,
                    _ = sleep(inner.settings.reconnect_delay) => continue,
                }
            }
        };

        if !inner.install_connection(Arc::clone(&connection)).await {
            // close() ran while we were dialing.
            let _ = connection.close().await;
            break;
        }

        info!("broker_connected");

        match initialize(&inner, &connection, &mut shutdown).await {
            Next::Shutdown => break,
            Next::Redial => continue,
        }
    }

    debug!(queue = %inner.queue, "queue_client_maintenance_stopped");
}

/// Keeps a ready channel on `connection` until the connection is lost or
/// shutdown is signaled.
async fn initialize<D: Dialer>(
    inner: &Inner<D>,
    connection: &D::Connection,
    shutdown: &mut watch::Receiver<bool>,
) -> Next {
    let mut connection_closed = connection.close_signal();

    loop {
        inner.enter(ClientState::ChannelInitializing).await;

        let opened = tokio::select! {
            biased;
            _ = shutdown_signaled(shutdown) => return Next::Shutdown,
            reason = connection_closed.closed() => {
                warn!(reason = %reason, "broker_connection_closed");
                return Next::Redial;
            }
            opened = open_channel(inner, connection) => opened,
        };

        let channel = match opened {
            Ok(channel) => channel,
            Err(e) => {
                warn!(
                    error = %e,
                    retry_in_ms = inner.settings.reinit_delay.as_millis() as u64,
                    "broker_channel_init_failed"
                );
                tokio::select! {
                    biased;
                    _ = shutdown_signaled(shutdown) => return Next::Shutdown,
                    reason = connection_closed.closed() => {
                        warn!(reason = %reason, "broker_connection_closed");
                        return Next::Redial;
                    }
                    _ = sleep(inner.settings.reinit_delay) => continue,
                }
            }
        };

        let mut channel_closed = channel.close_signal();
        if !inner.install_channel(channel.clone()).await {
            let _ = channel.close().await;
            return Next::Shutdown;
        }

        info!(
            queue = %inner.queue,
            durable = inner.settings.durable,
            "broker_channel_ready"
        );

        tokio::select! {
            biased;
            _ = shutdown_signaled(shutdown) => return Next::Shutdown,
            reason = connection_closed.closed() => {
                warn!(reason = %reason, "broker_connection_closed");
                return Next::Redial;
            }
            reason = channel_closed.closed() => {
                warn!(reason = %reason, "broker_channel_closed");
            }
        }
    }
}

/// Opens a channel, enables confirms and declares the queue.
async fn open_channel<D: Dialer>(
    inner: &Inner<D>,
    connection: &D::Connection,
) -> Result<ChannelOf<D>, BrokerError> {
    let channel = connection.create_channel().await?;

    let prepared = async {
        channel.confirm_select().await?;
        channel
            .queue_declare(
                &inner.queue,
                QueueOptions {
                    durable: inner.settings.durable,
                    exclusive: false,
                    auto_delete: false,
                },
            )
            .await
    }
    .await;

    if let Err(e) = prepared {
        let _ = channel.close().await;
        return Err(e);
    }
    Ok(channel)
}

impl<D: Dialer> Inner<D> {
    /// Drops the handles that are no longer valid in `state` and moves to it.
    async fn enter(&self, state: ClientState) {
        let mut shared = self.shared.lock().await;
        shared.channel = None;
        if state == ClientState::Connecting {
            shared.connection = None;
        }
        self.set_state(&mut shared, state);
    }

    /// Returns false if the client closed in the meantime.
    async fn install_connection(&self, connection: Arc<D::Connection>) -> bool {
        let mut shared = self.shared.lock().await;
        if shared.state == ClientState::Closed {
            return false;
        }
        shared.connection = Some(connection);
        true
    }

    /// Publishes the channel and marks the client ready. Returns false if the
    /// client closed in the meantime.
    async fn install_channel(&self, channel: ChannelOf<D>) -> bool {
        let mut shared = self.shared.lock().await;
        if shared.state == ClientState::Closed || shared.connection.is_none() {
            return false;
        }
        shared.channel = Some(channel);
        self.set_state(&mut shared, ClientState::Ready);
        true
    }
}
