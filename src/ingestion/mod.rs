//! Per-device connections to the cloud ingestion service.

pub mod connection_string;
pub mod hub_client;
pub mod sas;

use async_trait::async_trait;
use connection_string::ConnectionString;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use hub_client::{HubConnection, HubConnector, HubSettings};

#[derive(Debug, Error)]
pub enum IngestionError {
    /// Connection string is malformed or lacks a required key.
    #[error("Invalid connection string: {0}")]
    InvalidConnectionString(String),

    /// Shared access key is not valid base64.
    #[error("Invalid shared access key: {0}")]
    InvalidKey(String),

    /// MQTT request could not be queued.
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    /// The hub refused the session or could not be reached.
    #[error("Connecting {device_id} failed: {reason}")]
    Connect { device_id: String, reason: String },

    #[error("No hub session for {0} within the connect timeout")]
    ConnectTimeout(String),

    /// The session dropped and has not been re-established yet.
    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error("Send not accepted within {0:?}")]
    SendTimeout(Duration),

    /// The connection has been closed.
    #[error("Connection closed")]
    Closed,

    /// The message was never received or was already completed.
    #[error("Unknown delivery tag {0}")]
    UnknownDelivery(u64),
}

/// A cloud-to-device message waiting to be completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudMessage {
    pub body: Vec<u8>,
    pub delivery_tag: u64,
}

/// An open per-device connection.
#[async_trait]
pub trait DeviceConnection: Send + Sync {
    fn device_id(&self) -> &str;

    /// Send one device-to-cloud message.
    async fn send(&self, payload: Vec<u8>) -> Result<(), IngestionError>;

    /// Wait for a cloud-to-device message. `None` means the wait window
    /// elapsed without one.
    async fn receive(&self) -> Result<Option<CloudMessage>, IngestionError>;

    /// Acknowledge a received message so it is not redelivered.
    async fn complete(&self, message: &CloudMessage) -> Result<(), IngestionError>;

    /// Close the connection. Calling it again is a no-op.
    async fn close(&self) -> Result<(), IngestionError>;
}

/// Opens device connections from a per-device connection string.
#[async_trait]
pub trait DeviceConnector: Send + Sync {
    async fn open(
        &self,
        connection_string: &ConnectionString,
    ) -> Result<Arc<dyn DeviceConnection>, IngestionError>;
}
