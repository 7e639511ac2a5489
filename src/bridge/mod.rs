//! Uplink and downlink pipelines between the broker and the ingestion service.
//!
//! ```text
//! broker ──► handle_uplink ──► whitelist ──► directory ──► pool.get ──► send
//!
//! receive loop ──► downlink channel ──► handle_downlink ──► broker.publish
//! ```
//!
//! Every uplink is handled independently; a failure drops that one message,
//! is counted, and is reported through the notifier.

pub mod downlink;
pub mod stats;
pub mod uplink;

use crate::config::{BridgeConfig, DeviceKeyKind};
use crate::directory::{ensure_device, DeviceDirectory, DirectoryError};
use crate::ingestion::IngestionError;
use crate::mqtt::{BrokerError, BrokerPublisher, PublishReceipt};
use crate::notify::Notifier;
use crate::pool::{DeviceConnectionPool, PoolError};
use crate::whitelist::WhiteList;
use chrono::Local;
use downlink::DownlinkEnvelope;
use stats::{BridgeStats, DropReason};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uplink::UplinkEnvelope;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Topic {0} does not name a device")]
    InvalidTopic(String),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("Ingestion send failed: {0}")]
    Ingestion(#[from] IngestionError),

    #[error("Payload error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// What happened to one uplink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UplinkOutcome {
    Forwarded,
    Dropped(DropReason),
}

#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub application_id: String,
    pub min_payload_bytes: usize,
    pub add_gateway_info: bool,
    pub device_key_kind: DeviceKeyKind,
}

impl From<&BridgeConfig> for BridgeSettings {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            application_id: config.bridge.application_id.clone(),
            min_payload_bytes: config.bridge.min_payload_bytes,
            add_gateway_info: config.bridge.add_gateway_info,
            device_key_kind: config.bridge.device_key_kind,
        }
    }
}

pub struct MessageBridge {
    settings: BridgeSettings,
    whitelist: Arc<WhiteList>,
    directory: Arc<dyn DeviceDirectory>,
    pool: DeviceConnectionPool,
    broker: Arc<dyn BrokerPublisher>,
    notifier: Arc<dyn Notifier>,
    stats: Arc<BridgeStats>,
}

impl MessageBridge {
    pub fn new(
        settings: BridgeSettings,
        whitelist: Arc<WhiteList>,
        directory: Arc<dyn DeviceDirectory>,
        pool: DeviceConnectionPool,
        broker: Arc<dyn BrokerPublisher>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            settings,
            whitelist,
            directory,
            pool,
            broker,
            notifier,
            stats: Arc::new(BridgeStats::new()),
        }
    }

    pub fn stats(&self) -> Arc<BridgeStats> {
        self.stats.clone()
    }

    pub fn pool(&self) -> &DeviceConnectionPool {
        &self.pool
    }

    /// Relay one broker delivery to the ingestion service.
    pub async fn handle_uplink(
        &self,
        topic: &str,
        payload: &[u8],
    ) -> Result<UplinkOutcome, BridgeError> {
        self.stats.record_received();

        match self.relay_uplink(topic, payload).await {
            Ok(UplinkOutcome::Dropped(reason)) => {
                self.stats.record_dropped(reason);
                Ok(UplinkOutcome::Dropped(reason))
            }
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.stats.record_uplink_error();
                warn!("Uplink on {} dropped: {}", topic, e);
                self.notifier
                    .line(&format!("Uplink on {} dropped: {}", topic, e));
                Err(e)
            }
        }
    }

    async fn relay_uplink(
        &self,
        topic: &str,
        payload: &[u8],
    ) -> Result<UplinkOutcome, BridgeError> {
        let device_id = uplink::device_id_from_topic(topic)
            .ok_or_else(|| BridgeError::InvalidTopic(topic.to_string()))?;

        if payload.len() < self.settings.min_payload_bytes {
            debug!(device_id = %device_id, "Uplink of {} bytes ignored", payload.len());
            self.notifier.trace(&format!(
                "Short uplink ({} bytes) from {} ignored",
                payload.len(),
                device_id
            ));
            return Ok(UplinkOutcome::Dropped(DropReason::TooShort));
        }

        let outcome = ensure_device(self.directory.as_ref(), device_id).await?;
        if outcome.is_created() {
            self.notifier.line(&format!("Device {} added", device_id));
        }
        let device = outcome.into_record();

        if !self.whitelist.accept(device_id) {
            self.notifier
                .line(&format!("Device {} is not whitelisted", device_id));
            return Ok(UplinkOutcome::Dropped(DropReason::NotWhitelisted));
        }

        if !device.is_enabled() {
            self.notifier
                .line(&format!("Device {} is disabled", device_id));
            return Ok(UplinkOutcome::Dropped(DropReason::Disabled));
        }

        let envelope = UplinkEnvelope::parse(payload)?;
        let Some(forwarded) = envelope.forwarded_payload(self.settings.add_gateway_info) else {
            self.notifier
                .line(&format!("Device {} seen, no data", device_id));
            return Ok(UplinkOutcome::Dropped(DropReason::NoData));
        };
        let body = serde_json::to_vec(&forwarded)?;

        self.notifier
            .trace(&envelope.summary(device_id, &String::from_utf8_lossy(&body)));

        let connection = self
            .pool
            .get(device_id, device.key(self.settings.device_key_kind))
            .await?;
        let size = body.len();
        connection.send(body).await?;

        self.stats.record_forwarded(size);
        self.notifier.line("-Ingestion message sent");
        Ok(UplinkOutcome::Forwarded)
    }

    /// Publish one cloud-to-device message on the device's downlink topic.
    pub async fn handle_downlink(
        &self,
        envelope: DownlinkEnvelope,
    ) -> Result<PublishReceipt, BridgeError> {
        match self.publish_downlink(&envelope).await {
            Ok(receipt) => {
                self.stats.record_downlink();
                Ok(receipt)
            }
            Err(e) => {
                self.stats.record_downlink_error();
                warn!(device_id = %envelope.device_id, "Downlink failed: {}", e);
                self.notifier.line(&format!(
                    "Downlink for {} failed: {}",
                    envelope.device_id, e
                ));
                Err(e)
            }
        }
    }

    async fn publish_downlink(
        &self,
        envelope: &DownlinkEnvelope,
    ) -> Result<PublishReceipt, BridgeError> {
        let topic = envelope.topic(&self.settings.application_id);
        let body = envelope.to_broker_payload()?;

        self.notifier.trace(&format!(
            "{} Ingestion downlink for {}; Uploaded: {}",
            Local::now().format("%H:%M:%S"),
            envelope.device_id,
            String::from_utf8_lossy(&body)
        ));

        let receipt = self.broker.publish(&topic, body).await?;

        self.notifier
            .line(&format!(" - Id {} on {}", receipt.id, topic));
        Ok(receipt)
    }

    /// Consume downlink envelopes until every sender is gone.
    pub fn spawn_downlink_worker(
        self: &Arc<Self>,
        mut downlinks: mpsc::Receiver<DownlinkEnvelope>,
    ) -> JoinHandle<()> {
        let bridge = self.clone();
        tokio::spawn(async move {
            while let Some(envelope) = downlinks.recv().await {
                // failures are reported by handle_downlink
                let _ = bridge.handle_downlink(envelope).await;
            }
            info!("Downlink worker stopped");
        })
    }
}
