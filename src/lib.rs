//! Bridge between a LoRaWAN network server's MQTT broker and a cloud
//! ingestion service (IoT hub).
//!
//! Uplinks are filtered, their device is created on first sight, and the
//! (optionally enriched) payload is sent over a per-device connection kept
//! in a [`pool::DeviceConnectionPool`]. Cloud-to-device messages received on
//! those connections are published back to the broker as downlinks.

pub mod bridge;
pub mod config;
pub mod directory;
pub mod ingestion;
pub mod mqtt;
pub mod notify;
pub mod pool;
pub mod whitelist;

#[cfg(test)]
pub(crate) mod test_support;

pub use bridge::{BridgeError, BridgeSettings, MessageBridge, UplinkOutcome};
pub use config::{BridgeConfig, ConfigError, DeviceKeyKind};
pub use notify::{Notifier, TracingNotifier};
pub use pool::{DeviceConnectionPool, PoolSettings};
pub use whitelist::{WhiteList, WhitelistStatus};
