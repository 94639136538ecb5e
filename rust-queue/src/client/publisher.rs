//! Confirmed publishing.

use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use super::{shutdown_signaled, Client, Inner};
use crate::broker::{BrokerChannel, Confirmation, Dialer};
use crate::error::ClientError;

impl<D: Dialer> Client<D> {
    /// Publishes `payload` to the client's queue and waits for the broker to
    /// confirm it.
    ///
    /// Fails immediately with [`ClientError::NotConnected`] when the client
    /// is not ready, so callers can decide to retry later. Once an attempt has
    /// started, nacks, timeouts and channel losses are retried every
    /// `resend_delay` until the broker confirms or the client shuts down.
    ///
    /// Delivery is at least once: a confirmation lost after the broker stored
    /// the message leads to a duplicate.
    pub async fn publish(&self, payload: &[u8]) -> Result<(), ClientError> {
        // Fail fast before queueing behind other publishes.
        self.inner.ready_channel().await?;

        let _turn = self.inner.publish_turn.lock().await;
        let mut shutdown = self.inner.shutdown.subscribe();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            match self.inner.publish_once(payload).await {
                Ok(Confirmation::Ack) => {
                    info!(
                        queue = %self.inner.queue,
                        body_length = payload.len(),
                        attempt = attempt,
                        "publish_confirmed"
                    );
                    return Ok(());
                }
                Ok(Confirmation::Nack) => {
                    warn!(queue = %self.inner.queue, attempt = attempt, "publish_nacked");
                }
                Err(ClientError::ShuttingDown) | Err(ClientError::AlreadyClosed) => {
                    return Err(ClientError::ShuttingDown);
                }
                Err(e) => {
                    warn!(
                        queue = %self.inner.queue,
                        attempt = attempt,
                        error = %e,
                        "publish_failed"
                    );
                }
            }

            tokio::select! {
                biased;
                _ = shutdown_signaled(&mut shutdown) => return Err(ClientError::ShuttingDown),
                _ = sleep(self.inner.settings.resend_delay) => {}
            }
        }
    }

    /// Like [`Client::publish`], but gives up with [`ClientError::Timeout`]
    /// once `deadline` has passed, whatever attempt is in progress.
    ///
    /// The message may still have reached the broker when the deadline hits.
    pub async fn publish_within(
        &self,
        payload: &[u8],
        deadline: Duration,
    ) -> Result<(), ClientError> {
        match timeout(deadline, self.publish(payload)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    queue = %self.inner.queue,
                    deadline_ms = deadline.as_millis() as u64,
                    "publish_deadline_exceeded"
                );
                Err(ClientError::Timeout(deadline))
            }
        }
    }
}

impl<D: Dialer> Inner<D> {
    /// One submission plus its confirmation, bounded by `confirm_timeout`.
    async fn publish_once(&self, payload: &[u8]) -> Result<Confirmation, ClientError> {
        let channel = self.ready_channel().await?;
        let mut shutdown = self.shutdown.subscribe();
        let limit = self.settings.confirm_timeout;

        let attempt = async {
            let confirm = channel.publish(&self.queue, payload).await?;
            Ok::<_, ClientError>(confirm.await?)
        };

        tokio::select! {
            biased;
            _ = shutdown_signaled(&mut shutdown) => Err(ClientError::ShuttingDown),
            outcome = timeout(limit, attempt) => match outcome {
                Ok(result) => result,
                Err(_) => Err(ClientError::Timeout(limit)),
            },
        }
    }
}
