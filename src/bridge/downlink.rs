//! Downlink envelopes: ingestion-side messages on their way to a device.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Serialize;

/// LoRaWAN port used for every downlink.
pub const DOWNLINK_PORT: u8 = 1;

/// Raw cloud-to-device payload produced by a device's receive loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownlinkEnvelope {
    pub device_id: String,
    pub payload: Vec<u8>,
}

/// Network-server downlink message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TtnDownlink {
    pub payload_raw: String,
    pub port: u8,
}

impl DownlinkEnvelope {
    /// `<app>/devices/<device id>/down`
    pub fn topic(&self, application_id: &str) -> String {
        format!("{}/devices/{}/down", application_id, self.device_id)
    }

    pub fn to_ttn(&self) -> TtnDownlink {
        TtnDownlink {
            payload_raw: STANDARD.encode(&self.payload),
            port: DOWNLINK_PORT,
        }
    }

    pub fn to_broker_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.to_ttn())
    }
}
