//! # Network-server broker client
//!
//! Connects to the network server's MQTT broker, subscribes to the uplink
//! topic pattern and publishes downlinks.
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Connection settings derived from the bridge config
//! ├── message_manager.rs  - Inbound uplink representation
//! └── mqtt_handler.rs     - Session state machine and event loop
//! ```

pub mod config;
pub mod message_manager;
pub mod mqtt_handler;

use async_trait::async_trait;
use rumqttc::{AsyncClient, QoS};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::debug;

pub use config::BrokerSettings;
pub use mqtt_handler::{BrokerSession, Created, SessionState, Subscribed};

#[derive(Debug, Error)]
pub enum BrokerError {
    /// Request could not be handed to the event loop.
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    /// The broker connection closed and the bridge is configured to exit.
    #[error("MQTT connection closed: {0}")]
    ConnectionClosed(String),
}

/// Correlation id of one downlink publish.
///
/// A bridge-local sequence number starting at 1. It is not the MQTT packet id:
/// the packet id is assigned by the event loop after the request is queued and
/// only shows up in the delivery confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishReceipt {
    pub id: u64,
}

#[async_trait]
pub trait BrokerPublisher: Send + Sync {
    /// Publish at exactly-once QoS without retain.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<PublishReceipt, BrokerError>;
}

/// Publishes through the session's client.
pub struct MqttPublisher {
    client: AsyncClient,
    next_id: AtomicU64,
}

impl MqttPublisher {
    pub fn new(client: AsyncClient) -> Self {
        Self {
            client,
            next_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl BrokerPublisher for MqttPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<PublishReceipt, BrokerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.client
            .publish(topic, QoS::ExactlyOnce, false, payload)
            .await?;

        debug!("Downlink {} queued on {} (packet id assigned on send)", id, topic);
        Ok(PublishReceipt { id })
    }
}
