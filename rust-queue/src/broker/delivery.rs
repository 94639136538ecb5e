//! Inbound messages and their acknowledgment handles.

use std::fmt;

use async_trait::async_trait;

use crate::error::BrokerError;

/// Settles one delivery on the channel it arrived on.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError>;
}

/// One message handed from the broker to a consumer, pending acknowledgment.
///
/// `ack` and `nack` take `self`, so a delivery is settled at most once. A
/// delivery dropped without being settled stays unacknowledged until its
/// channel closes, at which point the broker redelivers it.
pub struct Delivery {
    payload: Vec<u8>,
    delivery_tag: u64,
    redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        payload: Vec<u8>,
        delivery_tag: u64,
        redelivered: bool,
        acker: impl Acknowledger + 'static,
    ) -> Self {
        Self {
            payload,
            delivery_tag,
            redelivered,
            acker: Box::new(acker),
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Whether the broker delivered this message before, e.g. prior to a
    /// reconnect.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// Commits the delivery; the broker removes the message.
    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    /// Declines the delivery. With `requeue` the broker redelivers it,
    /// otherwise it is dropped or dead-lettered per the queue's arguments.
    pub async fn nack(self, requeue: bool) -> Result<(), BrokerError> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("payload_length", &self.payload.len())
            .finish()
    }
}
