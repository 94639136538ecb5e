//! Delivery processing - hands payloads to a [`Processor`] and settles them.
//!
//! Successful processing always acks. A failed delivery is nacked according to
//! the consumer's [`FailurePolicy`]: `Requeue` puts it back on the queue for
//! another attempt, `Reject` drops it (or dead-letters it when the queue has a
//! dead-letter exchange).

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::broker::Delivery;

/// Application logic run for each delivery.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, payload: &[u8]) -> Result<()>;
}

/// What happens to a delivery whose processing failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Nack with requeue; the broker redelivers the message.
    Requeue,
    /// Nack without requeue.
    #[default]
    Reject,
}

impl FailurePolicy {
    pub fn requeue(self) -> bool {
        matches!(self, FailurePolicy::Requeue)
    }
}

impl FromStr for FailurePolicy {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "requeue" => Ok(FailurePolicy::Requeue),
            "reject" => Ok(FailurePolicy::Reject),
            other => bail!("unknown failure policy {other:?}, expected \"requeue\" or \"reject\""),
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::Requeue => f.write_str("requeue"),
            FailurePolicy::Reject => f.write_str("reject"),
        }
    }
}

/// Outcome counts for one [`run`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProcessStats {
    pub acked: usize,
    pub requeued: usize,
    pub rejected: usize,
    /// Acks or nacks the broker did not accept, usually because the channel
    /// closed. Those deliveries come back redelivered.
    pub settle_failures: usize,
}

/// Processes deliveries one at a time until the stream ends.
pub async fn run<S, P>(mut deliveries: S, processor: &P, policy: FailurePolicy) -> ProcessStats
where
    S: Stream<Item = Delivery> + Unpin,
    P: Processor + ?Sized,
{
    let mut stats = ProcessStats::default();

    while let Some(delivery) = deliveries.next().await {
        handle(delivery, processor, policy, &mut stats).await;
    }

    info!(
        acked = stats.acked,
        requeued = stats.requeued,
        rejected = stats.rejected,
        settle_failures = stats.settle_failures,
        "processor_stopped"
    );
    stats
}

async fn handle<P>(
    delivery: Delivery,
    processor: &P,
    policy: FailurePolicy,
    stats: &mut ProcessStats,
) where
    P: Processor + ?Sized,
{
    let delivery_tag = delivery.delivery_tag();

    info!(
        delivery_tag = delivery_tag,
        redelivered = delivery.redelivered(),
        body_length = delivery.payload().len(),
        "delivery_received"
    );

    match processor.process(delivery.payload()).await {
        Ok(()) => match delivery.ack().await {
            Ok(()) => {
                stats.acked += 1;
                info!(delivery_tag = delivery_tag, "delivery_acked");
            }
            Err(e) => {
                stats.settle_failures += 1;
                error!(delivery_tag = delivery_tag, error = %e, "delivery_ack_failed");
            }
        },
        Err(e) => {
            warn!(
                delivery_tag = delivery_tag,
                error = %format!("{e:#}"),
                policy = %policy,
                "delivery_processing_failed"
            );
            match delivery.nack(policy.requeue()).await {
                Ok(()) if policy.requeue() => stats.requeued += 1,
                Ok(()) => stats.rejected += 1,
                Err(e) => {
                    stats.settle_failures += 1;
                    error!(delivery_tag = delivery_tag, error = %e, "delivery_nack_failed");
                }
            }
        }
    }
}

/// Logs each notification and refuses empty ones.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProcessor;

#[async_trait]
impl Processor for LogProcessor {
    async fn process(&self, payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            bail!("empty notification payload");
        }

        let body = String::from_utf8_lossy(payload);
        info!(body_length = payload.len(), body = %body, "notification_processed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use futures::stream;

    use super::*;
    use crate::broker::{Acknowledger, MemoryBroker};
    use crate::client::tests::{ready_client, QUEUE};
    use crate::error::BrokerError;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Settled {
        Ack(u64),
        Nack(u64, bool),
    }

    #[derive(Clone)]
    struct Recorder {
        tag: u64,
        log: Arc<Mutex<Vec<Settled>>>,
        fail: bool,
    }

    #[async_trait]
    impl Acknowledger for Recorder {
        async fn ack(&self) -> Result<(), BrokerError> {
            if self.fail {
                return Err(BrokerError::Closed("channel closed".to_string()));
            }
            self.log.lock().unwrap().push(Settled::Ack(self.tag));
            Ok(())
        }

        async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
            if self.fail {
                return Err(BrokerError::Closed("channel closed".to_string()));
            }
            self.log.lock().unwrap().push(Settled::Nack(self.tag, requeue));
            Ok(())
        }
    }

    fn deliveries(
        payloads: &[&[u8]],
        log: &Arc<Mutex<Vec<Settled>>>,
        fail: bool,
    ) -> Vec<Delivery> {
        payloads
            .iter()
            .enumerate()
            .map(|(i, payload)| {
                let tag = i as u64 + 1;
                Delivery::new(
                    payload.to_vec(),
                    tag,
                    false,
                    Recorder {
                        tag,
                        log: Arc::clone(log),
                        fail,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn test_failure_policy_parse() {
        assert_eq!("requeue".parse::<FailurePolicy>().unwrap(), FailurePolicy::Requeue);
        assert_eq!(" Reject ".parse::<FailurePolicy>().unwrap(), FailurePolicy::Reject);
        assert!("drop".parse::<FailurePolicy>().is_err());
        assert_eq!(FailurePolicy::default(), FailurePolicy::Reject);
        assert_eq!(FailurePolicy::Requeue.to_string(), "requeue");
    }

    #[tokio::test]
    async fn test_success_acks_and_failure_rejects() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let input = deliveries(&[b"trip booked", b"", b"trip cancelled"], &log, false);

        let stats = run(stream::iter(input), &LogProcessor, FailurePolicy::Reject).await;

        assert_eq!(
            *log.lock().unwrap(),
            vec![Settled::Ack(1), Settled::Nack(2, false), Settled::Ack(3)]
        );
        assert_eq!(stats.acked, 2);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.requeued, 0);
    }

    #[tokio::test]
    async fn test_requeue_policy_nacks_with_requeue() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let input = deliveries(&[b""], &log, false);

        let stats = run(stream::iter(input), &LogProcessor, FailurePolicy::Requeue).await;

        assert_eq!(*log.lock().unwrap(), vec![Settled::Nack(1, true)]);
        assert_eq!(stats.requeued, 1);
    }

    #[tokio::test]
    async fn test_settle_failures_are_counted() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let input = deliveries(&[b"ok", b""], &log, true);

        let stats = run(stream::iter(input), &LogProcessor, FailurePolicy::Reject).await;

        assert_eq!(stats.settle_failures, 2);
        assert_eq!(stats.acked + stats.rejected, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_delivery_is_dead_lettered_by_broker() {
        let broker = MemoryBroker::new();
        let client = ready_client(&broker).await;
        broker.enqueue(QUEUE, b"gate change");
        broker.enqueue(QUEUE, b"");

        let deliveries = client.consume().await.unwrap();
        let worker = tokio::spawn(async move {
            run(deliveries, &LogProcessor, FailurePolicy::Reject).await
        });

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        client.close().await.unwrap();
        let stats = worker.await.unwrap();

        assert_eq!(stats.acked, 1);
        assert_eq!(stats.rejected, 1);
        assert_eq!(broker.acked(QUEUE), vec![b"gate change".to_vec()]);
        assert_eq!(broker.dead_lettered(QUEUE), vec![Vec::<u8>::new()]);
    }
}
