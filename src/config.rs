//! Bridge configuration.
//!
//! Loaded once at startup from a TOML file. Field names are snake_case; the
//! PascalCase option names used by older deployments are accepted as aliases.
//!
//! ```toml
//! [bridge]
//! application_id = "my-ttn-app"
//! remove_devices_after_minutes = 10
//! device_key_kind = "Primary"
//! whitelist_file = "whitelist.json"
//!
//! [broker]
//! host = "eu.thethings.network"
//! access_key = "ttn-account-v2.xxxx"
//!
//! [ingestion]
//! connection_string = "HostName=myhub.azure-devices.net;SharedAccessKeyName=iothubowner;SharedAccessKey=..."
//! short_host_name = "myhub"
//! ```

use crate::ingestion::connection_string::ConnectionString;
use crate::pool::PoolSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Complete bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub bridge: BridgeSection,
    pub broker: BrokerSection,
    pub ingestion: IngestionSection,
}

/// Which of the two per-device symmetric keys is used to open connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DeviceKeyKind {
    #[default]
    Primary,
    Secondary,
}

/// Pipeline and pool behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSection {
    /// Application id (EUI) on the network server; also the MQTT username
    /// and the first segment of every device topic.
    #[serde(alias = "ApplicationId", alias = "ApplicationEui")]
    pub application_id: String,

    /// Idle threshold after which a pooled device connection is reclaimed.
    #[serde(alias = "RemoveDevicesAfterMinutes")]
    pub remove_devices_after_minutes: u64,

    /// Minimum interval between two eviction sweeps. Defaults to the idle threshold.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_check_interval_minutes: Option<u64>,

    #[serde(default, alias = "DeviceKeyKind")]
    pub device_key_kind: DeviceKeyKind,

    #[serde(default = "default_true", alias = "ExitOnConnectionClosed")]
    pub exit_on_connection_closed: bool,

    /// Suppress pool removal notifications on the status channel.
    #[serde(default, alias = "SilentRemoval")]
    pub silent_removal: bool,

    /// Optional device whitelist (JSON list of `{"accept": "<device id>"}`).
    #[serde(
        default,
        alias = "WhiteListFileName",
        skip_serializing_if = "Option::is_none"
    )]
    pub whitelist_file: Option<PathBuf>,

    /// Enrich forwarded payloads with counter and gateway metadata.
    #[serde(default, alias = "AddGatewayInfo")]
    pub add_gateway_info: bool,

    /// Uplinks shorter than this are treated as rogue frames and dropped.
    #[serde(default = "default_min_payload_bytes")]
    pub min_payload_bytes: usize,

    /// Pause between two receive waits of a device connection.
    #[serde(default = "default_receive_pause_secs")]
    pub receive_pause_secs: u64,

    /// Statistics reporting interval (seconds, 0 to disable).
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

/// Network-server MQTT broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSection {
    #[serde(alias = "BrokerHostName")]
    pub host: String,

    #[serde(default = "default_broker_port")]
    pub port: u16,

    /// Uplink subscription pattern.
    #[serde(default = "default_topic", alias = "Topic")]
    pub topic: String,

    #[serde(
        default,
        alias = "KeepAlivePeriod",
        skip_serializing_if = "Option::is_none"
    )]
    pub keep_alive_secs: Option<u16>,

    #[serde(alias = "ApplicationAccessKey")]
    pub access_key: String,
}

/// Cloud ingestion service (IoT hub).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionSection {
    /// Service connection string used for the device registry.
    #[serde(alias = "IngestionConnectionString")]
    pub connection_string: String,

    /// Hub name without the `.azure-devices.net` suffix.
    #[serde(alias = "ShortIngestionHostName")]
    pub short_host_name: String,

    /// Lifetime of generated SAS tokens.
    #[serde(default = "default_sas_ttl_secs")]
    pub sas_token_ttl_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_min_payload_bytes() -> usize {
    200
}

fn default_receive_pause_secs() -> u64 {
    5
}

fn default_stats_interval() -> u64 {
    60
}

fn default_broker_port() -> u16 {
    1883
}

fn default_topic() -> String {
    "+/devices/+/up".to_string()
}

fn default_sas_ttl_secs() -> u64 {
    24 * 60 * 60
}

impl BridgeConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_toml(&content)?;
        debug!("Loaded configuration from {}", path.as_ref().display());
        Ok(config)
    }

    /// Parse and validate configuration text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Default location: `~/.config/ttn-bridge/bridge.toml`.
    pub fn default_path() -> PathBuf {
        let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push(".config/ttn-bridge/bridge.toml");
        path
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bridge.application_id.trim().is_empty() {
            return Err(ConfigError::Invalid("application_id is empty".into()));
        }
        if self.bridge.remove_devices_after_minutes == 0 {
            return Err(ConfigError::Invalid(
                "remove_devices_after_minutes must be greater than zero".into(),
            ));
        }
        if self.bridge.idle_check_interval_minutes == Some(0) {
            return Err(ConfigError::Invalid(
                "idle_check_interval_minutes must be greater than zero".into(),
            ));
        }
        if self.broker.host.trim().is_empty() {
            return Err(ConfigError::Invalid("broker host is empty".into()));
        }
        if self.broker.topic.trim().is_empty() {
            return Err(ConfigError::Invalid("broker topic is empty".into()));
        }
        if self.ingestion.short_host_name.trim().is_empty() {
            return Err(ConfigError::Invalid("short_host_name is empty".into()));
        }

        let service = ConnectionString::parse(&self.ingestion.connection_string)
            .map_err(|e| ConfigError::Invalid(format!("ingestion connection string: {}", e)))?;
        if service.host_name().is_none() || service.shared_access_key().is_none() {
            return Err(ConfigError::Invalid(
                "ingestion connection string needs HostName and SharedAccessKey".into(),
            ));
        }

        Ok(())
    }

    /// Fully qualified ingestion host (`<short>.azure-devices.net`).
    pub fn ingestion_host(&self) -> String {
        format!("{}.azure-devices.net", self.ingestion.short_host_name)
    }

    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.bridge.remove_devices_after_minutes * 60)
    }

    pub fn pool_settings(&self) -> PoolSettings {
        let check_minutes = self
            .bridge
            .idle_check_interval_minutes
            .unwrap_or(self.bridge.remove_devices_after_minutes);

        PoolSettings {
            ingestion_host: self.ingestion_host(),
            idle_threshold: self.idle_threshold(),
            idle_check_interval: Duration::from_secs(check_minutes * 60),
            receive_pause: Duration::from_secs(self.bridge.receive_pause_secs),
            silent_removal: self.bridge.silent_removal,
        }
    }

    /// Example configuration written by `gen-config`.
    pub fn example() -> Self {
        Self {
            bridge: BridgeSection {
                application_id: "my-ttn-app".into(),
                remove_devices_after_minutes: 10,
                idle_check_interval_minutes: None,
                device_key_kind: DeviceKeyKind::Primary,
                exit_on_connection_closed: true,
                silent_removal: false,
                whitelist_file: Some(PathBuf::from("whitelist.json")),
                add_gateway_info: false,
                min_payload_bytes: default_min_payload_bytes(),
                receive_pause_secs: default_receive_pause_secs(),
                stats_interval_secs: default_stats_interval(),
            },
            broker: BrokerSection {
                host: "eu.thethings.network".into(),
                port: default_broker_port(),
                topic: default_topic(),
                keep_alive_secs: Some(60),
                access_key: "ttn-account-v2.replace-me".into(),
            },
            ingestion: IngestionSection {
                connection_string:
                    "HostName=myhub.azure-devices.net;SharedAccessKeyName=iothubowner;SharedAccessKey=cmVwbGFjZS1tZQ=="
                        .into(),
                short_host_name: "myhub".into(),
                sas_token_ttl_secs: default_sas_ttl_secs(),
            },
        }
    }
}
