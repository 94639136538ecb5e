//! travel-queue worker - consumes email notifications from RabbitMQ.
//!
//! The worker subscribes with prefetch 1 and manual acknowledgment, hands each
//! payload to the processor, and settles it according to `FAILURE_POLICY`.
//! Reconnects and re-subscriptions happen inside the client; the worker only
//! stops on SIGINT/SIGTERM.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::{signal, time::sleep};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use travelq::processor::{self, LogProcessor};
use travelq::util::redact_url;
use travelq::{AmqpDialer, Client, ClientError, Config, Deliveries};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("worker_starting");

    // Load configuration from environment
    let config = Config::from_env();
    info!(
        broker = %redact_url(&config.rabbitmq_url),
        queue = %config.queue_name,
        durable = config.queue_durable,
        failure_policy = %config.failure_policy,
        "config_loaded"
    );

    let client = Client::with_dialer(
        AmqpDialer::new(concat!(env!("CARGO_PKG_NAME"), "-worker")),
        config.queue_name.clone(),
        config.rabbitmq_url.clone(),
        config.client_settings(),
    );

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let deliveries = tokio::select! {
        _ = &mut shutdown => {
            close(&client).await;
            return Ok(());
        }
        subscribed = subscribe(&client, &config) => subscribed?,
    };

    info!("worker_ready");

    let policy = config.failure_policy;
    let worker =
        tokio::spawn(async move { processor::run(deliveries, &LogProcessor, policy).await });

    shutdown.await;
    info!("worker_stopping");
    close(&client).await;

    let stats = worker.await.context("processor task panicked")?;
    info!(
        acked = stats.acked,
        requeued = stats.requeued,
        rejected = stats.rejected,
        "worker_shutdown_complete"
    );

    Ok(())
}

/// Waits for the client and starts consuming, retrying transient failures.
async fn subscribe(client: &Client, config: &Config) -> Result<Deliveries> {
    let retry = Duration::from_millis(config.resubscribe_delay_ms);

    loop {
        client
            .wait_ready()
            .await
            .context("queue client closed before it became ready")?;

        match client.consume().await {
            Ok(deliveries) => return Ok(deliveries),
            Err(e) if e.is_transient() => {
                warn!(error = %e, retry_in_ms = config.resubscribe_delay_ms, "worker_subscribe_failed");
                sleep(retry).await;
            }
            Err(e) => return Err(e).context("failed to start consuming"),
        }
    }
}

async fn close(client: &Client) {
    match client.close().await {
        Ok(()) | Err(ClientError::AlreadyClosed) => {}
        Err(e) => warn!(error = %e, "queue_client_close_failed"),
    }
}

/// Create a future that completes when a shutdown signal is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "sigint_handler_failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "sigterm_handler_failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
