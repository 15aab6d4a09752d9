//! # Broker transport
//!
//! The controller never talks to rumqttc directly. It goes through the [`Transport`] and
//! [`Connection`] traits so the lifecycle can run against a real broker or an in-process one.
//!
//! ```text
//! mqtt/
//! ├── config.rs        - Client settings derived from the controller configuration
//! ├── mqtt_handler.rs  - rumqttc-backed transport with acknowledged requests
//! └── loopback.rs      - In-process broker for tests and local simulation
//! ```
//!
//! ## Contract
//!
//! - `connect` resolves once the broker accepted the session (CONNACK).
//! - `subscribe`, `unsubscribe` and `publish` resolve once the broker acknowledged the request
//!   (SUBACK, UNSUBACK, PUBACK).
//! - Handlers are invoked on the transport's own task and must not block; the controller spawns
//!   a task per message.
//! - `fault` resolves only if the connection dies for a reason other than `disconnect`.

pub mod config;
pub mod loopback;
pub mod mqtt_handler;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::TransportError;

pub use config::MqttSettings;
pub use loopback::{CallCounts, LoopbackBroker};
pub use mqtt_handler::MqttTransport;

/// Callback receiving the raw payload of each message delivered on a subscription
pub type MessageHandler = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, address: &str) -> Result<Arc<dyn Connection>, TransportError>;
}

/// Live broker session. Implementations are internally synchronized.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<(), TransportError>;

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    async fn disconnect(&self, timeout: Duration) -> Result<(), TransportError>;

    /// Resolves with the cause once the transport declares the session dead
    async fn fault(&self) -> TransportError;
}

/// MQTT topic filter matching with `+` (one level) and `#` (remaining levels)
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(expected), Some(actual)) if expected == actual => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
