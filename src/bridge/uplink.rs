//! Uplink envelopes as published by the network server.
//!
//! Only the fields the bridge needs are typed; everything else in the
//! message is ignored. Every metadata field is optional.

use chrono::Local;
use serde::Deserialize;
use serde_json::{Map, Number, Value};
use std::fmt::Display;

/// Device id segment of `<app>/devices/<device id>/up`.
pub fn device_id_from_topic(topic: &str) -> Option<&str> {
    let mut segments = topic.split('/');
    let _application = segments.next()?;
    if segments.next()? != "devices" {
        return None;
    }
    segments.next().filter(|id| !id.is_empty())
}

#[derive(Debug, Clone, Deserialize)]
pub struct UplinkEnvelope {
    #[serde(default)]
    pub counter: Option<u64>,
    #[serde(default)]
    pub payload_fields: Option<Value>,
    #[serde(default)]
    pub metadata: Option<UplinkMetadata>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UplinkMetadata {
    #[serde(default)]
    pub frequency: Option<Number>,
    #[serde(default)]
    pub gateways: Option<Vec<GatewayMetadata>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayMetadata {
    #[serde(default)]
    pub gtw_id: Option<String>,
    #[serde(default)]
    pub latitude: Option<Number>,
    #[serde(default)]
    pub longitude: Option<Number>,
    #[serde(default)]
    pub rssi: Option<Number>,
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::String(text) => text.is_empty(),
        _ => false,
    }
}

fn or_blank<T: Display>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

impl UplinkEnvelope {
    pub fn parse(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    /// First receiving gateway, if any.
    pub fn gateway(&self) -> Option<&GatewayMetadata> {
        self.metadata
            .as_ref()
            .and_then(|m| m.gateways.as_ref())
            .and_then(|g| g.first())
    }

    pub fn frequency(&self) -> Option<&Number> {
        self.metadata.as_ref().and_then(|m| m.frequency.as_ref())
    }

    /// Decoded application payload; `None` when missing or empty.
    pub fn application_payload(&self) -> Option<&Value> {
        self.payload_fields.as_ref().filter(|v| !is_empty_value(v))
    }

    /// Metadata fields to merge into the forwarded payload. Absent metadata
    /// yields no field.
    pub fn enrichment(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        if let Some(counter) = self.counter {
            fields.insert("counter".into(), Value::from(counter));
        }
        if let Some(gateway) = self.gateway() {
            if let Some(id) = &gateway.gtw_id {
                fields.insert("gatewayId".into(), Value::String(id.clone()));
            }
            if let Some(latitude) = &gateway.latitude {
                fields.insert("latitude".into(), Value::Number(latitude.clone()));
            }
            if let Some(longitude) = &gateway.longitude {
                fields.insert("longitude".into(), Value::Number(longitude.clone()));
            }
        }
        if let Some(frequency) = self.frequency() {
            fields.insert("frequency".into(), Value::Number(frequency.clone()));
        }
        if let Some(rssi) = self.gateway().and_then(|g| g.rssi.as_ref()) {
            fields.insert("rssi".into(), Value::Number(rssi.clone()));
        }
        fields
    }

    /// Payload to forward. With `add_gateway_info` an object payload gets the
    /// enrichment fields merged in; other payload shapes are forwarded as-is.
    pub fn forwarded_payload(&self, add_gateway_info: bool) -> Option<Value> {
        let payload = self.application_payload()?.clone();
        if !add_gateway_info {
            return Some(payload);
        }

        match payload {
            Value::Object(mut fields) => {
                fields.extend(self.enrichment());
                Some(Value::Object(fields))
            }
            other => Some(other),
        }
    }

    /// `HH:MM:SS Message received (counter/device/gateway/lat/lon/freq/rssi): payload`
    pub fn summary(&self, device_id: &str, payload: &str) -> String {
        let gateway = self.gateway();
        format!(
            "{} Message received ({}/{}/{}/{}/{}/{}/{}): {}",
            Local::now().format("%H:%M:%S"),
            or_blank(self.counter),
            device_id,
            or_blank(gateway.and_then(|g| g.gtw_id.as_ref())),
            or_blank(gateway.and_then(|g| g.latitude.as_ref())),
            or_blank(gateway.and_then(|g| g.longitude.as_ref())),
            or_blank(self.frequency()),
            or_blank(gateway.and_then(|g| g.rssi.as_ref())),
            payload
        )
    }
}
