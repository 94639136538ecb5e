//! Broker transport abstraction.
//!
//! The client only needs a small slice of AMQP 0-9-1: dial a connection, open
//! a channel on it, enable publisher confirms, declare a queue, publish with a
//! confirmation, and consume with manual acknowledgment. These traits describe
//! exactly that slice so the reconnect logic can run against a real broker
//! ([`amqp`]) or the in-process test double ([`memory`]).
//!
//! ```text
//! Dialer ──dial──▶ BrokerConnection ──create_channel──▶ BrokerChannel
//!                        │                                   │
//!                  CloseSignal                         CloseSignal
//! ```

pub mod amqp;
pub mod delivery;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use tokio::sync::watch;

use crate::error::BrokerError;

pub use amqp::AmqpDialer;
pub use delivery::{Acknowledger, Delivery};
pub use memory::MemoryBroker;

/// Broker verdict for a single publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Ack,
    Nack,
}

/// Resolves once the broker confirms (or rejects) a publish.
pub type ConfirmFuture = BoxFuture<'static, Result<Confirmation, BrokerError>>;

/// Deliveries of one subscription. Ends when the subscription is cancelled or
/// its channel goes away.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// Queue declaration flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

/// Opens connections to a broker address.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Connection: BrokerConnection;

    async fn dial(&self, address: &str) -> Result<Self::Connection, BrokerError>;
}

/// A live transport session.
#[async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    type Channel: BrokerChannel;

    async fn create_channel(&self) -> Result<Self::Channel, BrokerError>;

    /// Fires when the broker or the network drops this connection.
    fn close_signal(&self) -> CloseSignal;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// A logical session multiplexed over a connection.
#[async_trait]
pub trait BrokerChannel: Clone + Send + Sync + 'static {
    async fn confirm_select(&self) -> Result<(), BrokerError>;

    async fn queue_declare(&self, queue: &str, options: QueueOptions) -> Result<(), BrokerError>;

    /// Publishes `payload` on the default exchange with `queue` as routing key.
    ///
    /// Returns once the broker accepted the frame; the returned future resolves
    /// with the confirmation.
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<ConfirmFuture, BrokerError>;

    async fn qos(&self, prefetch_count: u16) -> Result<(), BrokerError>;

    async fn consume(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream, BrokerError>;

    /// Stops the broker from sending further deliveries to `consumer_tag`.
    /// Unacknowledged deliveries stay pending until settled or the channel
    /// closes.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError>;

    /// Fires when this channel closes, whether or not the connection survives.
    fn close_signal(&self) -> CloseSignal;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Creates a linked notifier/signal pair.
pub fn close_signal() -> (CloseNotifier, CloseSignal) {
    let (tx, rx) = watch::channel(None);
    (CloseNotifier { tx: Arc::new(tx) }, CloseSignal { rx })
}

/// Sending half of a close notification. Dropping every notifier also counts
/// as a close.
#[derive(Clone, Debug)]
pub struct CloseNotifier {
    tx: Arc<watch::Sender<Option<String>>>,
}

impl CloseNotifier {
    /// Records the close reason. Only the first reason is kept.
    pub fn notify(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }
}

/// Receiving half of a close notification.
///
/// Notifications are latched: a signal that fired before anyone waited on it
/// is still observed.
#[derive(Clone, Debug)]
pub struct CloseSignal {
    rx: watch::Receiver<Option<String>>,
}

impl CloseSignal {
    /// Waits for the close and returns its reason.
    pub async fn closed(&mut self) -> String {
        match self.rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => "close notifier dropped".to_string(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.rx.borrow().is_some() || self.rx.has_changed().is_err()
    }
}
