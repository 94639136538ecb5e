//! In-process broker, a test double for the AMQP transport.
//!
//! Neither binary dials it; it exists so client behaviour can be exercised
//! without RabbitMQ. It speaks the same traits as the AMQP transport and lets
//! a test drive failures on demand:
//! - refuse dials (`set_reachable(false)`)
//! - drop every connection, or only the channels
//! - nack or withhold publisher confirmations
//! - reject queue declarations
//!
//! It keeps per-channel unacknowledged deliveries and honours the prefetch
//! count, so consumer back-pressure can be observed with `max_unacked`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::{future, stream, StreamExt};
use tokio::sync::mpsc;

use super::{
    close_signal, Acknowledger, BrokerChannel, BrokerConnection, CloseNotifier, CloseSignal,
    ConfirmFuture, Confirmation, Delivery, DeliveryStream, Dialer, QueueOptions,
};
use crate::error::BrokerError;

// ============================================================================
// Internal State
// ============================================================================

#[derive(Default)]
struct BrokerState {
    unreachable: bool,
    dials: usize,
    next_id: u64,
    connections: HashMap<u64, ConnectionEntry>,
    channels: HashMap<u64, ChannelEntry>,
    queues: HashMap<String, QueueEntry>,
    nack_publishes: usize,
    withhold_confirms: bool,
    reject_declares: usize,
    max_unacked: usize,
}

struct ConnectionEntry {
    notifier: CloseNotifier,
}

struct ChannelEntry {
    connection: u64,
    notifier: CloseNotifier,
    confirming: bool,
    prefetch: u16,
    next_tag: u64,
    consumers: Vec<ConsumerEntry>,
    unacked: HashMap<u64, Unacked>,
}

struct ConsumerEntry {
    tag: String,
    queue: String,
    sender: mpsc::UnboundedSender<Result<Delivery, BrokerError>>,
}

struct Unacked {
    queue: String,
    payload: Vec<u8>,
}

#[derive(Default)]
struct QueueEntry {
    options: QueueOptions,
    /// Messages waiting for a consumer, with their redelivered flag.
    ready: VecDeque<(Vec<u8>, bool)>,
    /// Every payload the broker accepted, in arrival order.
    published: Vec<Vec<u8>>,
    acked: Vec<Vec<u8>>,
    dead_lettered: Vec<Vec<u8>>,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn channel_mut(&mut self, id: u64) -> Result<&mut ChannelEntry, BrokerError> {
        self.channels
            .get_mut(&id)
            .ok_or_else(|| BrokerError::Closed(format!("channel {id} is closed")))
    }

    /// Removes a channel and returns its unacked messages to their queues.
    /// Callers dispatch afterwards.
    fn remove_channel(&mut self, id: u64, reason: &str) {
        let Some(channel) = self.channels.remove(&id) else {
            return;
        };
        channel.notifier.notify(reason);

        let mut unacked: Vec<(u64, Unacked)> = channel.unacked.into_iter().collect();
        unacked.sort_by_key(|(tag, _)| *tag);
        for (_, message) in unacked.into_iter().rev() {
            if let Some(queue) = self.queues.get_mut(&message.queue) {
                queue.ready.push_front((message.payload, true));
            }
        }
        // Dropping the consumer senders ends their delivery streams.
    }

    fn remove_connection(&mut self, id: u64, reason: &str) {
        let Some(connection) = self.connections.remove(&id) else {
            return;
        };
        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, channel)| channel.connection == id)
            .map(|(channel_id, _)| *channel_id)
            .collect();
        for channel in channels {
            self.remove_channel(channel, reason);
        }
        connection.notifier.notify(reason);
    }

    /// Hands ready messages of `queue` to consumers with prefetch room.
    fn dispatch(&mut self, queue: &str, broker: &MemoryBroker) {
        let mut channel_ids: Vec<u64> = self.channels.keys().copied().collect();
        channel_ids.sort_unstable();

        for channel_id in channel_ids {
            loop {
                let Some(entry) = self.queues.get_mut(queue) else {
                    return;
                };
                if entry.ready.is_empty() {
                    return;
                }
                let Some(channel) = self.channels.get_mut(&channel_id) else {
                    break;
                };

                let Some(consumer) = channel.consumers.iter().find(|c| c.queue == queue) else {
                    break;
                };
                if channel.prefetch > 0 && channel.unacked.len() >= usize::from(channel.prefetch)
                {
                    break;
                }
                let Some((payload, redelivered)) = entry.ready.pop_front() else {
                    return;
                };

                channel.next_tag += 1;
                let tag = channel.next_tag;
                let delivery = Delivery::new(
                    payload.clone(),
                    tag,
                    redelivered,
                    MemoryAcker {
                        broker: broker.clone(),
                        channel: channel_id,
                        tag,
                    },
                );

                // A consumer whose stream was dropped without a cancel still
                // receives, and its deliveries stay unacked like on RabbitMQ.
                let _ = consumer.sender.send(Ok(delivery));

                channel.unacked.insert(
                    tag,
                    Unacked {
                        queue: queue.to_string(),
                        payload,
                    },
                );
                self.max_unacked = self.max_unacked.max(channel.unacked.len());
            }
        }
    }

    fn dispatch_all(&mut self, broker: &MemoryBroker) {
        let queues: Vec<String> = self.queues.keys().cloned().collect();
        for queue in queues {
            self.dispatch(&queue, broker);
        }
    }
}

// ============================================================================
// Broker Handle
// ============================================================================

/// Shared handle to an in-process broker. Clones see the same state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// When unreachable, every dial fails.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().unreachable = !reachable;
    }

    /// Drops every live connection as if the network failed.
    pub fn drop_connections(&self) {
        let mut state = self.lock();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            state.remove_connection(id, "connection reset by peer");
        }
        state.dispatch_all(self);
    }

    /// Closes every channel with a channel-level error, leaving connections up.
    pub fn close_channels(&self) {
        let mut state = self.lock();
        let ids: Vec<u64> = state.channels.keys().copied().collect();
        for id in ids {
            state.remove_channel(id, "PRECONDITION_FAILED - channel closed by broker");
        }
        state.dispatch_all(self);
    }

    /// The next `count` publishes are negatively confirmed and not stored.
    pub fn nack_next_publishes(&self, count: usize) {
        self.lock().nack_publishes = count;
    }

    /// While set, publishes are neither stored nor confirmed.
    pub fn withhold_confirms(&self, withhold: bool) {
        self.lock().withhold_confirms = withhold;
    }

    /// The next `count` queue declarations fail with a channel error.
    pub fn reject_next_declares(&self, count: usize) {
        self.lock().reject_declares = count;
    }

    /// Puts a message on `queue` directly, declaring it if needed.
    pub fn enqueue(&self, queue: &str, payload: &[u8]) {
        let mut state = self.lock();
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_back((payload.to_vec(), false));
        state.dispatch(queue, self);
    }

    pub fn dials(&self) -> usize {
        self.lock().dials
    }

    pub fn live_connections(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn live_channels(&self) -> usize {
        self.lock().channels.len()
    }

    /// Whether some live connection carries a channel in confirm mode.
    pub fn has_confirming_channel(&self) -> bool {
        let state = self.lock();
        state
            .channels
            .values()
            .any(|c| c.confirming && state.connections.contains_key(&c.connection))
    }

    pub fn queue_options(&self, queue: &str) -> Option<QueueOptions> {
        self.lock().queues.get(queue).map(|q| q.options)
    }

    /// Payloads accepted for `queue`, in arrival order.
    pub fn published(&self, queue: &str) -> Vec<Vec<u8>> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.published.clone())
            .unwrap_or_default()
    }

    pub fn acked(&self, queue: &str) -> Vec<Vec<u8>> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.acked.clone())
            .unwrap_or_default()
    }

    pub fn dead_lettered(&self, queue: &str) -> Vec<Vec<u8>> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.dead_lettered.clone())
            .unwrap_or_default()
    }

    /// Messages waiting on `queue` for a consumer.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    pub fn unacked_count(&self) -> usize {
        self.lock().channels.values().map(|c| c.unacked.len()).sum()
    }

    /// Highest number of unacked deliveries any single channel ever held.
    pub fn max_unacked(&self) -> usize {
        self.lock().max_unacked
    }

    fn settle(&self, channel: u64, tag: u64, outcome: Settle) -> Result<(), BrokerError> {
        let mut state = self.lock();
        let message = state
            .channel_mut(channel)?
            .unacked
            .remove(&tag)
            .ok_or_else(|| BrokerError::Ack(format!("unknown delivery tag {tag}")))?;

        let queue = message.queue.clone();
        if let Some(entry) = state.queues.get_mut(&queue) {
            match outcome {
                Settle::Ack => entry.acked.push(message.payload),
                Settle::Requeue => entry.ready.push_front((message.payload, true)),
                Settle::Discard => entry.dead_lettered.push(message.payload),
            }
        }
        state.dispatch(&queue, self);
        Ok(())
    }
}

enum Settle {
    Ack,
    Requeue,
    Discard,
}

// ============================================================================
// Transport Implementation
// ============================================================================

#[async_trait]
impl Dialer for MemoryBroker {
    type Connection = MemoryConnection;

    async fn dial(&self, _address: &str) -> Result<MemoryConnection, BrokerError> {
        let mut state = self.lock();
        state.dials += 1;
        if state.unreachable {
            return Err(BrokerError::Connect("connection refused".to_string()));
        }

        let id = state.next_id();
        let (notifier, closed) = close_signal();
        state.connections.insert(id, ConnectionEntry { notifier });

        Ok(MemoryConnection {
            broker: self.clone(),
            id,
            closed,
        })
    }
}

pub struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
    closed: CloseSignal,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    type Channel = MemoryChannel;

    async fn create_channel(&self) -> Result<MemoryChannel, BrokerError> {
        let mut state = self.broker.lock();
        if !state.connections.contains_key(&self.id) {
            return Err(BrokerError::Channel("connection is closed".to_string()));
        }

        let id = state.next_id();
        let (notifier, closed) = close_signal();
        state.channels.insert(
            id,
            ChannelEntry {
                connection: self.id,
                notifier,
                confirming: false,
                prefetch: 0,
                next_tag: 0,
                consumers: Vec::new(),
                unacked: HashMap::new(),
            },
        );

        Ok(MemoryChannel {
            broker: self.broker.clone(),
            id,
            closed,
        })
    }

    fn close_signal(&self) -> CloseSignal {
        self.closed.clone()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        if !state.connections.contains_key(&self.id) {
            return Err(BrokerError::Close("connection already closed".to_string()));
        }
        state.remove_connection(self.id, "closed by client");
        state.dispatch_all(&self.broker);
        Ok(())
    }
}

#[derive(Clone)]
pub struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
    closed: CloseSignal,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn confirm_select(&self) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        state
            .channel_mut(self.id)
            .map_err(|e| BrokerError::ConfirmSelect(e.to_string()))?
            .confirming = true;
        Ok(())
    }

    async fn queue_declare(&self, queue: &str, options: QueueOptions) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        state.channel_mut(self.id).map_err(|e| BrokerError::Declare {
            queue: queue.to_string(),
            reason: e.to_string(),
        })?;

        if state.reject_declares > 0 {
            state.reject_declares -= 1;
            // A failed declare closes the channel, as RabbitMQ does.
            state.remove_channel(self.id, "PRECONDITION_FAILED - inequivalent arg 'durable'");
            state.dispatch_all(&self.broker);
            return Err(BrokerError::Declare {
                queue: queue.to_string(),
                reason: "PRECONDITION_FAILED - inequivalent arg 'durable'".to_string(),
            });
        }

        state.queues.entry(queue.to_string()).or_default().options = options;
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<ConfirmFuture, BrokerError> {
        let mut state = self.broker.lock();
        let confirming = state
            .channel_mut(self.id)
            .map_err(|e| BrokerError::Publish(e.to_string()))?
            .confirming;
        if !confirming {
            return Err(BrokerError::Publish(
                "publisher confirms are not enabled on this channel".to_string(),
            ));
        }

        if state.withhold_confirms {
            return Ok(Box::pin(future::pending()));
        }
        if state.nack_publishes > 0 {
            state.nack_publishes -= 1;
            return Ok(Box::pin(future::ready(Ok(Confirmation::Nack))));
        }

        // Unroutable messages on the default exchange are confirmed and dropped.
        if let Some(entry) = state.queues.get_mut(queue) {
            entry.published.push(payload.to_vec());
            entry.ready.push_back((payload.to_vec(), false));
            state.dispatch(queue, &self.broker);
        }
        Ok(Box::pin(future::ready(Ok(Confirmation::Ack))))
    }

    async fn qos(&self, prefetch_count: u16) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        state
            .channel_mut(self.id)
            .map_err(|e| BrokerError::Qos(e.to_string()))?
            .prefetch = prefetch_count;
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        let mut state = self.broker.lock();
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::Consume(format!("NOT_FOUND - no queue '{queue}'")));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        state
            .channel_mut(self.id)
            .map_err(|e| BrokerError::Consume(e.to_string()))?
            .consumers
            .push(ConsumerEntry {
                tag: consumer_tag.to_string(),
                queue: queue.to_string(),
                sender,
            });
        state.dispatch(queue, &self.broker);

        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        })
        .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        let channel = state
            .channel_mut(self.id)
            .map_err(|e| BrokerError::Cancel(e.to_string()))?;
        // Dropping the sender ends the consumer's stream.
        channel.consumers.retain(|c| c.tag != consumer_tag);
        Ok(())
    }

    fn close_signal(&self) -> CloseSignal {
        self.closed.clone()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        if !state.channels.contains_key(&self.id) {
            return Err(BrokerError::Close("channel already closed".to_string()));
        }
        state.remove_channel(self.id, "closed by client");
        state.dispatch_all(&self.broker);
        Ok(())
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    channel: u64,
    tag: u64,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.broker.settle(self.channel, self.tag, Settle::Ack)
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        let outcome = if requeue {
            Settle::Requeue
        } else {
            Settle::Discard
        };
        self.broker.settle(self.channel, self.tag, outcome)
    }
}
