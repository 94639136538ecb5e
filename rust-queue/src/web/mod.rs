//! Web server module for the notification intake.
//!
//! This module provides a thin HTTP front for the queue client:
//! - Reports the client's connection state
//! - Publishes raw notification bodies and answers once the broker confirmed
//!
//! Consumption happens in the worker binary.

pub mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::broker::Dialer;

pub use handlers::{health, publish_notification, AppState, HealthResponse, PublishResponse};

/// Builds the intake router over `state`.
pub fn router<D: Dialer>(state: AppState<D>) -> Router {
    Router::new()
        .route("/health", get(health::<D>))
        .route("/notifications", post(publish_notification::<D>))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
