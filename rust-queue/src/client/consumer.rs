//! Prefetch-bounded consumption with automatic re-subscription.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{FutureExt, Stream, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::sleep;
use tracing::{info, warn};

use super::{shutdown_signaled, ChannelOf, Client, ClientState, Inner};
use crate::broker::{BrokerChannel, CloseSignal, Delivery, DeliveryStream, Dialer};
use crate::error::ClientError;

/// At most one unacknowledged delivery per consumer.
pub const PREFETCH_COUNT: u16 = 1;

/// Deliveries from [`Client::consume`].
///
/// The stream is lazy and unbounded: it survives channel and connection loss
/// by re-subscribing in the background, and ends only when the client shuts
/// down. It cannot be restarted afterwards.
///
/// Dropping it cancels the subscription and requeues deliveries that were
/// received from the broker but not yet yielded.
pub struct Deliveries {
    receiver: mpsc::Receiver<Delivery>,
    released: Option<oneshot::Sender<Vec<Delivery>>>,
}

impl Stream for Deliveries {
    type Item = Delivery;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Delivery>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for Deliveries {
    fn drop(&mut self) {
        self.receiver.close();
        let mut unread = Vec::new();
        while let Ok(delivery) = self.receiver.try_recv() {
            unread.push(delivery);
        }
        if let Some(released) = self.released.take() {
            // The intake task settles these after cancelling the consumer.
            let _ = released.send(unread);
        }
    }
}

struct Subscription<C> {
    channel: C,
    deliveries: DeliveryStream,
    closed: CloseSignal,
    consumer_tag: String,
}

impl<D: Dialer> Client<D> {
    /// Subscribes to the queue with manual acknowledgment and a prefetch of
    /// one.
    ///
    /// Fails immediately when the client is not ready. Each delivery must be
    /// settled with [`Delivery::ack`] or [`Delivery::nack`]; the next one is
    /// not sent by the broker until then.
    pub async fn consume(&self) -> Result<Deliveries, ClientError> {
        let subscription = self.inner.subscribe().await?;
        let (sender, receiver) = mpsc::channel(usize::from(PREFETCH_COUNT));
        let (released, on_release) = oneshot::channel();

        tokio::spawn(intake(
            Arc::clone(&self.inner),
            subscription,
            sender,
            on_release,
        ));

        Ok(Deliveries {
            receiver,
            released: Some(released),
        })
    }
}

impl<D: Dialer> Inner<D> {
    async fn subscribe(&self) -> Result<Subscription<ChannelOf<D>>, ClientError> {
        let channel = self.ready_channel().await?;
        channel.qos(PREFETCH_COUNT).await?;

        let consumer_tag = self.next_consumer_tag();
        let deliveries = channel.consume(&self.queue, &consumer_tag).await?;

        info!(
            queue = %self.queue,
            consumer_tag = %consumer_tag,
            prefetch_count = PREFETCH_COUNT,
            "consumer_subscribed"
        );

        Ok(Subscription {
            closed: channel.close_signal(),
            channel,
            deliveries,
            consumer_tag,
        })
    }
}

/// Forwards deliveries to the caller and re-subscribes after channel loss.
async fn intake<D: Dialer>(
    inner: Arc<Inner<D>>,
    mut subscription: Subscription<ChannelOf<D>>,
    sender: mpsc::Sender<Delivery>,
    mut on_release: oneshot::Receiver<Vec<Delivery>>,
) {
    let mut shutdown = inner.shutdown.subscribe();

    'subscribed: loop {
        loop {
            tokio::select! {
                biased;
                _ = shutdown_signaled(&mut shutdown) => break 'subscribed,
                unread = &mut on_release => {
                    release(&mut subscription, unread.unwrap_or_default()).await;
                    break 'subscribed;
                }
                reason = subscription.closed.closed() => {
                    warn!(
                        consumer_tag = %subscription.consumer_tag,
                        reason = %reason,
                        "consumer_channel_closed"
                    );
                    break;
                }
                next = subscription.deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        tokio::select! {
                            biased;
                            _ = shutdown_signaled(&mut shutdown) => break 'subscribed,
                            sent = sender.send(delivery) => {
                                if let Err(mpsc::error::SendError(delivery)) = sent {
                                    let mut unread = (&mut on_release).await.unwrap_or_default();
                                    unread.push(delivery);
                                    release(&mut subscription, unread).await;
                                    break 'subscribed;
                                }
                            }
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "consumer_delivery_error");
                        break;
                    }
                    None => {
                        warn!(consumer_tag = %subscription.consumer_tag, "consumer_cancelled");
                        break;
                    }
                },
            }
        }

        // Deliveries from the lost channel were requeued by the broker.
        match resubscribe(&inner, &mut shutdown, &sender).await {
            Some(next) => subscription = next,
            None => break,
        }
    }

    info!(queue = %inner.queue, "consumer_stopped");
}

/// Cancels a subscription whose stream was dropped and requeues everything
/// it still holds, so another consumer can take it.
async fn release<C: BrokerChannel>(subscription: &mut Subscription<C>, mut unread: Vec<Delivery>) {
    let consumer_tag = subscription.consumer_tag.as_str();

    if let Err(e) = subscription.channel.cancel(consumer_tag).await {
        warn!(consumer_tag = %consumer_tag, error = %e, "consumer_cancel_failed");
    }

    // Sent by the broker before the cancel took effect.
    while let Some(Some(Ok(delivery))) = subscription.deliveries.next().now_or_never() {
        unread.push(delivery);
    }

    let requeued = unread.len();
    // Requeue back to front so the broker keeps their original order.
    for delivery in unread.into_iter().rev() {
        if let Err(e) = delivery.nack(true).await {
            warn!(consumer_tag = %consumer_tag, error = %e, "consumer_requeue_failed");
        }
    }

    info!(consumer_tag = %consumer_tag, requeued = requeued, "consumer_dropped");
}

/// Retries the subscription every `resubscribe_delay`, or sooner when the
/// client changes state. Returns `None` on shutdown or once the caller has
/// dropped the stream.
async fn resubscribe<D: Dialer>(
    inner: &Inner<D>,
    shutdown: &mut watch::Receiver<bool>,
    sender: &mpsc::Sender<Delivery>,
) -> Option<Subscription<ChannelOf<D>>> {
    let mut states = inner.state.subscribe();

    loop {
        if sender.is_closed() {
            return None;
        }

        match inner.subscribe().await {
            Ok(subscription) => {
                info!(consumer_tag = %subscription.consumer_tag, "consumer_resubscribed");
                return Some(subscription);
            }
            Err(ClientError::AlreadyClosed) | Err(ClientError::ShuttingDown) => return None,
            Err(e) => {
                warn!(
                    error = %e,
                    retry_in_ms = inner.settings.resubscribe_delay.as_millis() as u64,
                    "consumer_resubscribe_failed"
                );
            }
        }

        tokio::select! {
            biased;
            _ = shutdown_signaled(shutdown) => return None,
            _ = sender.closed() => return None,
            _ = state_changed(&mut states) => {}
            _ = sleep(inner.settings.resubscribe_delay) => {}
        }
    }
}

async fn state_changed(states: &mut watch::Receiver<ClientState>) {
    if states.changed().await.is_err() {
        futures::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::super::tests::{fast_settings, ready_client, QUEUE};
    use super::*;
    use crate::broker::MemoryBroker;

    #[tokio::test(start_paused = true)]
    async fn test_consume_requires_ready_client() {
        let broker = MemoryBroker::new();
        broker.set_reachable(false);
        let client = Client::with_dialer(broker.clone(), QUEUE, "memory://", fast_settings());

        assert!(matches!(
            client.consume().await,
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_published_messages_are_consumed_and_acked() {
        let broker = MemoryBroker::new();
        let client = ready_client(&broker).await;
        let mut deliveries = client.consume().await.unwrap();

        client.publish(b"hotel booked").await.unwrap();
        let delivery = deliveries.next().await.unwrap();
        assert_eq!(delivery.payload(), b"hotel booked");
        assert!(!delivery.redelivered());
        delivery.ack().await.unwrap();

        assert_eq!(broker.acked(QUEUE), vec![b"hotel booked".to_vec()]);
        assert_eq!(broker.ready_count(QUEUE), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_more_than_one_unacked_delivery() {
        let broker = MemoryBroker::new();
        let client = ready_client(&broker).await;
        for n in 0..5u8 {
            broker.enqueue(QUEUE, &[n]);
        }

        let mut deliveries = client.consume().await.unwrap();
        let mut seen = Vec::new();
        for _ in 0..5 {
            let delivery = deliveries.next().await.unwrap();
            sleep(Duration::from_millis(50)).await;
            assert_eq!(broker.unacked_count(), 1);
            seen.push(delivery.payload()[0]);
            delivery.ack().await.unwrap();
        }

        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert_eq!(broker.max_unacked(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribes_after_channel_close() {
        let settings = fast_settings();
        let broker = MemoryBroker::new();
        let client = ready_client(&broker).await;
        let mut deliveries = client.consume().await.unwrap();

        broker.enqueue(QUEUE, b"before");
        deliveries.next().await.unwrap().ack().await.unwrap();

        broker.close_channels();
        broker.enqueue(QUEUE, b"after");

        let delivery = timeout(settings.resubscribe_delay, deliveries.next())
            .await
            .expect("consumer should resubscribe within one retry interval")
            .unwrap();
        assert_eq!(delivery.payload(), b"after");
        delivery.ack().await.unwrap();
        assert_eq!(broker.dials(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_delivery_is_redelivered_after_reconnect() {
        let broker = MemoryBroker::new();
        let client = ready_client(&broker).await;
        broker.enqueue(QUEUE, b"flight delayed");
        let mut deliveries = client.consume().await.unwrap();

        let stale = deliveries.next().await.unwrap();
        broker.drop_connections();
        assert!(stale.ack().await.is_err());

        let again = deliveries.next().await.unwrap();
        assert_eq!(again.payload(), b"flight delayed");
        assert!(again.redelivered());
        again.ack().await.unwrap();
        assert_eq!(broker.dials(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_waits_for_broker_to_return() {
        let broker = MemoryBroker::new();
        let client = ready_client(&broker).await;
        let mut deliveries = client.consume().await.unwrap();

        broker.set_reachable(false);
        broker.drop_connections();
        broker.enqueue(QUEUE, b"queued while down");
        sleep(Duration::from_secs(3)).await;
        assert!(!client.is_ready());

        broker.set_reachable(true);
        let delivery = deliveries.next().await.unwrap();
        assert_eq!(delivery.payload(), b"queued while down");
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_ends_delivery_stream() {
        let broker = MemoryBroker::new();
        let client = ready_client(&broker).await;
        let mut deliveries = client.consume().await.unwrap();

        client.close().await.unwrap();

        assert!(deliveries.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_during_resubscribe_ends_stream() {
        let settings = fast_settings();
        let broker = MemoryBroker::new();
        let client = ready_client(&broker).await;
        let mut deliveries = client.consume().await.unwrap();

        broker.set_reachable(false);
        broker.drop_connections();
        sleep(settings.resubscribe_delay + Duration::from_millis(50)).await;
        assert!(!client.is_ready());

        client.close().await.unwrap();

        let ended = timeout(settings.resubscribe_delay, deliveries.next())
            .await
            .expect("consumer should stop within one retry interval");
        assert!(ended.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_stream_requeues_to_next_consumer() {
        let settings = fast_settings();
        let broker = MemoryBroker::new();
        let client = ready_client(&broker).await;
        let deliveries = client.consume().await.unwrap();

        broker.enqueue(QUEUE, b"room upgrade");
        sleep(Duration::from_millis(10)).await;
        assert_eq!(broker.unacked_count(), 1);
        drop(deliveries);

        let mut second = client.consume().await.unwrap();
        let delivery = timeout(settings.resubscribe_delay, second.next())
            .await
            .expect("requeued delivery should reach the next consumer")
            .unwrap();

        assert_eq!(delivery.payload(), b"room upgrade");
        assert!(delivery.redelivered());
        delivery.ack().await.unwrap();
        assert_eq!(broker.unacked_count(), 0);
        assert_eq!(broker.acked(QUEUE), vec![b"room upgrade".to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_stream_cancels_subscription() {
        let broker = MemoryBroker::new();
        let client = ready_client(&broker).await;
        drop(client.consume().await.unwrap());
        sleep(Duration::from_millis(10)).await;

        broker.enqueue(QUEUE, b"car rental");

        assert_eq!(broker.unacked_count(), 0);
        assert_eq!(broker.ready_count(QUEUE), 1);
        assert!(client.is_ready());
    }
}
