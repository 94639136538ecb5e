//! travel-queue - resilient RabbitMQ client for the notification path.
//!
//! This library provides the queue client shared by the two binaries:
//! - `travel-queue-web`: HTTP intake that publishes notifications with confirms
//! - `travel-queue-worker`: consumer that processes and acknowledges them
//!
//! ## Architecture
//!
//! ```text
//! POST /notifications → Web → email_queue → Worker → Processor
//! ```
//!
//! Both sides hold a [`Client`], which keeps one connection and one
//! confirm-mode channel alive in the background and heals them after broker
//! restarts or network loss.

pub mod broker;
pub mod client;
pub mod config;
pub mod error;
pub mod processor;
pub mod util;
pub mod web;

// Re-export commonly used types
pub use broker::{AmqpDialer, Delivery};
// Test double for exercising a `Client` without RabbitMQ.
pub use broker::MemoryBroker;
pub use client::{Client, ClientState, Deliveries, Settings};
pub use config::Config;
pub use error::{BrokerError, ClientError};
pub use processor::{FailurePolicy, Processor};
pub use web::AppState;
