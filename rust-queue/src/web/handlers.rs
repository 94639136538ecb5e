//! Intake endpoint handlers.
//!
//! `POST /notifications` publishes the raw request body and answers only after
//! the broker confirmed it. When the client is not connected the request fails
//! fast with 503 so the caller can retry; it never waits for a reconnect.
//! A publish still unconfirmed after `PUBLISH_DEADLINE_MS` also answers 503.

use std::sync::Arc;

use axum::{body::Bytes, extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::broker::{AmqpDialer, Dialer};
use crate::client::{Client, ClientState};
use crate::error::ClientError;
use crate::Config;

/// Shared application state.
pub struct AppState<D: Dialer = AmqpDialer> {
    pub config: Arc<Config>,
    pub client: Client<D>,
}

impl<D: Dialer> AppState<D> {
    pub fn new(config: Config, client: Client<D>) -> Self {
        Self {
            config: Arc::new(config),
            client,
        }
    }
}

impl<D: Dialer> Clone for AppState<D> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            client: self.client.clone(),
        }
    }
}

// =============================================================================
// Health Check
// =============================================================================

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub queue: String,
    pub state: ClientState,
}

/// Health check endpoint. `degraded` while the client is reconnecting.
pub async fn health<D: Dialer>(State(state): State<AppState<D>>) -> Json<HealthResponse> {
    let client_state = state.client.state();
    let status = match client_state {
        ClientState::Ready => "ok",
        _ => "degraded",
    };

    Json(HealthResponse {
        status,
        queue: state.client.queue().to_string(),
        state: client_state,
    })
}

// =============================================================================
// Notifications
// =============================================================================

/// Notification intake response.
#[derive(Debug, Serialize)]
pub struct PublishResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PublishResponse {
    fn failed(status: &'static str, error: &ClientError) -> Json<Self> {
        Json(Self {
            status,
            error: Some(error.to_string()),
        })
    }
}

/// Notification endpoint.
///
/// This endpoint:
/// 1. Rejects empty bodies
/// 2. Publishes the body and waits for the broker confirmation, up to the
///    configured publish deadline
/// 3. Returns 202 Accepted
pub async fn publish_notification<D: Dialer>(
    State(state): State<AppState<D>>,
    body: Bytes,
) -> impl IntoResponse {
    info!(body_length = body.len(), "notification_received");

    if body.is_empty() {
        warn!("notification_empty");
        return (
            StatusCode::BAD_REQUEST,
            Json(PublishResponse {
                status: "empty_body",
                error: None,
            }),
        );
    }

    let deadline = state.config.publish_deadline();
    match state.client.publish_within(&body, deadline).await {
        Ok(()) => {
            info!(queue = %state.client.queue(), "notification_enqueued");
            (
                StatusCode::ACCEPTED,
                Json(PublishResponse {
                    status: "enqueued",
                    error: None,
                }),
            )
        }
        Err(
            e @ (ClientError::NotConnected
            | ClientError::ShuttingDown
            | ClientError::AlreadyClosed
            | ClientError::Timeout(_)),
        ) => {
            warn!(error = %e, "notification_publish_unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                PublishResponse::failed("unavailable", &e),
            )
        }
        Err(e) => {
            error!(error = %e, "notification_publish_failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                PublishResponse::failed("error", &e),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::response::Response;

    use super::*;
    use crate::broker::MemoryBroker;
    use crate::client::tests::{fast_settings, ready_client, QUEUE};
    use crate::processor::FailurePolicy;

    fn test_config() -> Config {
        Config {
            rabbitmq_url: "memory://".to_string(),
            queue_name: QUEUE.to_string(),
            queue_durable: false,
            reconnect_delay_ms: 500,
            reinit_delay_ms: 200,
            resend_delay_ms: 300,
            confirm_timeout_ms: 2000,
            resubscribe_delay_ms: 400,
            publish_deadline_ms: 3000,
            consumer_tag: "test".to_string(),
            failure_policy: FailurePolicy::Reject,
            port: 0,
        }
    }

    async fn post(state: &AppState<MemoryBroker>, body: &'static [u8]) -> Response {
        publish_notification(State(state.clone()), Bytes::from_static(body))
            .await
            .into_response()
    }

    #[tokio::test(start_paused = true)]
    async fn test_notification_is_published() {
        let broker = MemoryBroker::new();
        let state = AppState::new(test_config(), ready_client(&broker).await);

        let response = post(&state, b"{\"to\":\"traveler@example.com\"}").await;

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(
            broker.published(QUEUE),
            vec![b"{\"to\":\"traveler@example.com\"}".to_vec()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_body_is_rejected() {
        let broker = MemoryBroker::new();
        let state = AppState::new(test_config(), ready_client(&broker).await);

        let response = post(&state, b"").await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(broker.published(QUEUE).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_broker_returns_unavailable() {
        let broker = MemoryBroker::new();
        broker.set_reachable(false);
        let client = Client::with_dialer(broker.clone(), QUEUE, "memory://", fast_settings());
        let state = AppState::new(test_config(), client);

        let response = post(&state, b"welcome").await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(broker.published(QUEUE).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_client_returns_unavailable() {
        let broker = MemoryBroker::new();
        let state = AppState::new(test_config(), ready_client(&broker).await);
        state.client.close().await.unwrap();

        let response = post(&state, b"welcome").await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_publish_returns_unavailable_at_deadline() {
        let broker = MemoryBroker::new();
        let state = AppState::new(test_config(), ready_client(&broker).await);
        broker.withhold_confirms(true);

        let started = tokio::time::Instant::now();
        let response = post(&state, b"welcome").await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(started.elapsed() >= state.config.publish_deadline());
        assert!(started.elapsed() < state.config.publish_deadline() + Duration::from_millis(100));
        assert!(broker.published(QUEUE).is_empty());

        // The client keeps working for the next request.
        broker.withhold_confirms(false);
        let response = post(&state, b"welcome").await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_reports_client_state() {
        let broker = MemoryBroker::new();
        let state = AppState::new(test_config(), ready_client(&broker).await);

        let Json(ready) = health(State(state.clone())).await;
        assert_eq!(ready.status, "ok");
        assert_eq!(ready.state, ClientState::Ready);
        assert_eq!(ready.queue, QUEUE);
        assert_eq!(
            serde_json::to_value(&ready).unwrap(),
            serde_json::json!({"status": "ok", "queue": QUEUE, "state": "ready"})
        );

        state.client.close().await.unwrap();
        let Json(closed) = health(State(state)).await;
        assert_eq!(closed.status, "degraded");
        assert_eq!(closed.state, ClientState::Closed);
    }
}
