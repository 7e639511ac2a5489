//! Device identity registry on the ingestion side.
//!
//! Devices are created on first sight. A create that races with another
//! create (or with a device that already exists) falls back to a fetch, so
//! [`ensure_device`] is safe to call concurrently for the same id.

pub mod registry;

use crate::config::DeviceKeyKind;
use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

pub use registry::IotHubRegistry;

#[derive(Debug, Error)]
pub enum DirectoryError {
    /// Create refused because the id is taken.
    #[error("Device {0} already exists")]
    AlreadyExists(String),

    #[error("Device {0} not found")]
    NotFound(String),

    #[error("Registry request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Registry answered with an unexpected status.
    #[error("Registry returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Registry credentials invalid: {0}")]
    Credentials(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Enabled,
    Disabled,
}

/// A device identity with its two symmetric keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub device_id: String,
    pub status: DeviceStatus,
    pub primary_key: String,
    pub secondary_key: String,
}

impl DeviceRecord {
    pub fn is_enabled(&self) -> bool {
        self.status == DeviceStatus::Enabled
    }

    pub fn key(&self, kind: DeviceKeyKind) -> &str {
        match kind {
            DeviceKeyKind::Primary => &self.primary_key,
            DeviceKeyKind::Secondary => &self.secondary_key,
        }
    }
}

#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    /// Create a device identity. Fails with [`DirectoryError::AlreadyExists`]
    /// when the id is taken.
    async fn create_device(&self, device_id: &str) -> Result<DeviceRecord, DirectoryError>;

    async fn get_device(&self, device_id: &str) -> Result<DeviceRecord, DirectoryError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnsureOutcome {
    Created(DeviceRecord),
    Existing(DeviceRecord),
}

impl EnsureOutcome {
    pub fn is_created(&self) -> bool {
        matches!(self, EnsureOutcome::Created(_))
    }

    pub fn into_record(self) -> DeviceRecord {
        match self {
            EnsureOutcome::Created(record) | EnsureOutcome::Existing(record) => record,
        }
    }
}

/// Create-or-fetch.
pub async fn ensure_device(
    directory: &dyn DeviceDirectory,
    device_id: &str,
) -> Result<EnsureOutcome, DirectoryError> {
    match directory.create_device(device_id).await {
        Ok(record) => {
            debug!("Created device identity {}", device_id);
            Ok(EnsureOutcome::Created(record))
        }
        Err(DirectoryError::AlreadyExists(_)) => {
            let record = directory.get_device(device_id).await?;
            Ok(EnsureOutcome::Existing(record))
        }
        Err(e) => Err(e),
    }
}
