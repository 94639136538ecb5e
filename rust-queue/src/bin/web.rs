//! travel-queue web server - notification intake.
//!
//! This binary provides a thin HTTP front that:
//! - Publishes each `POST /notifications` body to RabbitMQ with confirms
//! - Answers 202 once the broker confirmed, 503 while disconnected
//! - Reports the queue client's state on `GET /health`
//!
//! Processing happens in the worker.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::{net::TcpListener, signal};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use travelq::util::redact_url;
use travelq::web::{self, AppState};
use travelq::{AmqpDialer, Client, ClientError, Config};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("web_server_starting");

    // Load configuration
    let config = Config::from_env();
    info!(
        port = config.port,
        broker = %redact_url(&config.rabbitmq_url),
        queue = %config.queue_name,
        durable = config.queue_durable,
        publish_deadline_ms = config.publish_deadline_ms,
        "config_loaded"
    );

    // Start the queue client; it connects in the background
    let client = Client::with_dialer(
        AmqpDialer::new(concat!(env!("CARGO_PKG_NAME"), "-web")),
        config.queue_name.clone(),
        config.rabbitmq_url.clone(),
        config.client_settings(),
    );

    let port = config.port;
    let app = web::router(AppState::new(config, client.clone()));

    // Bind to address
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(address = %addr, "web_server_listening");

    // In-flight publishes fail with 503 once the client is closed.
    let closer = client.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            match closer.close().await {
                Ok(()) | Err(ClientError::AlreadyClosed) => {}
                Err(e) => warn!(error = %e, "queue_client_close_failed"),
            }
        })
        .await
        .context("Server error")?;

    info!("web_server_shutdown_complete");

    Ok(())
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

    info!("web_server_shutting_down");
}
