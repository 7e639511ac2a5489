//! IoT hub identity registry over the service REST API.

use super::{DeviceDirectory, DeviceRecord, DeviceStatus, DirectoryError};
use crate::ingestion::connection_string::ConnectionString;
use crate::ingestion::hub_client::API_VERSION;
use crate::ingestion::sas;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateDeviceRequest<'a> {
    device_id: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistryDevice {
    device_id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    authentication: Option<Authentication>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Authentication {
    #[serde(default)]
    symmetric_key: Option<SymmetricKey>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymmetricKey {
    #[serde(default)]
    primary_key: Option<String>,
    #[serde(default)]
    secondary_key: Option<String>,
}

impl From<RegistryDevice> for DeviceRecord {
    fn from(device: RegistryDevice) -> Self {
        let status = match device.status.as_deref() {
            Some(s) if s.eq_ignore_ascii_case("enabled") => DeviceStatus::Enabled,
            _ => DeviceStatus::Disabled,
        };
        let keys = device.authentication.and_then(|a| a.symmetric_key);
        let (primary_key, secondary_key) = match keys {
            Some(k) => (
                k.primary_key.unwrap_or_default(),
                k.secondary_key.unwrap_or_default(),
            ),
            None => (String::new(), String::new()),
        };

        DeviceRecord {
            device_id: device.device_id,
            status,
            primary_key,
            secondary_key,
        }
    }
}

/// Registry client authenticated with a service policy.
#[derive(Debug, Clone)]
pub struct IotHubRegistry {
    client: Client,
    host: String,
    policy_name: Option<String>,
    key: String,
    sas_token_ttl: Duration,
}

impl IotHubRegistry {
    pub fn new(
        service: &ConnectionString,
        sas_token_ttl: Duration,
    ) -> Result<Self, DirectoryError> {
        let host = service
            .host_name()
            .ok_or_else(|| DirectoryError::Credentials("missing HostName".into()))?;
        let key = service
            .shared_access_key()
            .ok_or_else(|| DirectoryError::Credentials("missing SharedAccessKey".into()))?;

        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;

        Ok(Self {
            client,
            host: host.to_string(),
            policy_name: service.shared_access_key_name().map(str::to_string),
            key: key.to_string(),
            sas_token_ttl,
        })
    }

    fn device_url(&self, device_id: &str) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(device_id.as_bytes()).collect();
        format!(
            "https://{}/devices/{}?api-version={}",
            self.host, encoded, API_VERSION
        )
    }

    fn authorization(&self) -> Result<String, DirectoryError> {
        let ttl = chrono::Duration::from_std(self.sas_token_ttl)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        sas::generate_sas_token(&self.host, &self.key, self.policy_name.as_deref(), Utc::now() + ttl)
            .map_err(|e| DirectoryError::Credentials(e.to_string()))
    }
}

async fn read_device(response: reqwest::Response) -> Result<DeviceRecord, DirectoryError> {
    let device: RegistryDevice = response.json().await?;
    Ok(device.into())
}

async fn unexpected(response: reqwest::Response) -> DirectoryError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    DirectoryError::Status { status, body }
}

#[async_trait]
impl DeviceDirectory for IotHubRegistry {
    async fn create_device(&self, device_id: &str) -> Result<DeviceRecord, DirectoryError> {
        let response = self
            .client
            .put(self.device_url(device_id))
            .header("Authorization", self.authorization()?)
            .json(&CreateDeviceRequest { device_id })
            .send()
            .await?;

        debug!("Registry create {} -> {}", device_id, response.status());
        match response.status() {
            StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
                Err(DirectoryError::AlreadyExists(device_id.to_string()))
            }
            s if s.is_success() => read_device(response).await,
            _ => Err(unexpected(response).await),
        }
    }

    async fn get_device(&self, device_id: &str) -> Result<DeviceRecord, DirectoryError> {
        let response = self
            .client
            .get(self.device_url(device_id))
            .header("Authorization", self.authorization()?)
            .send()
            .await?;

        debug!("Registry get {} -> {}", device_id, response.status());
        match response.status() {
            StatusCode::NOT_FOUND => Err(DirectoryError::NotFound(device_id.to_string())),
            s if s.is_success() => read_device(response).await,
            _ => Err(unexpected(response).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_device_maps_to_record() {
        let json = r#"{
            "deviceId": "D1",
            "generationId": "637",
            "etag": "MA==",
            "connectionState": "Disconnected",
            "status": "enabled",
            "authentication": {
                "symmetricKey": {"primaryKey": "cA==", "secondaryKey": "cw=="},
                "x509Thumbprint": {"primaryThumbprint": null, "secondaryThumbprint": null},
                "type": "sas"
            }
        }"#;
        let device: RegistryDevice = serde_json::from_str(json).expect("parse");
        let record = DeviceRecord::from(device);

        assert_eq!(record.device_id, "D1");
        assert!(record.is_enabled());
        assert_eq!(record.primary_key, "cA==");
        assert_eq!(record.secondary_key, "cw==");
    }

    #[test]
    fn test_disabled_status_and_missing_keys() {
        let device: RegistryDevice =
            serde_json::from_str(r#"{"deviceId": "D2", "status": "disabled"}"#).expect("parse");
        let record = DeviceRecord::from(device);

        assert_eq!(record.status, DeviceStatus::Disabled);
        assert!(record.primary_key.is_empty());
    }

    #[test]
    fn test_device_url_and_credentials() {
        let service = ConnectionString::parse(
            "HostName=hub.azure-devices.net;SharedAccessKeyName=iothubowner;SharedAccessKey=a2V5",
        )
        .expect("parse");
        let registry = IotHubRegistry::new(&service, Duration::from_secs(60)).expect("registry");

        assert_eq!(
            registry.device_url("D1"),
            "https://hub.azure-devices.net/devices/D1?api-version=2021-04-12"
        );
        let token = registry.authorization().expect("token");
        assert!(token.starts_with("SharedAccessSignature sr=hub.azure-devices.net&sig="));
        assert!(token.ends_with("&skn=iothubowner"));
    }

    #[test]
    fn test_missing_key_rejected() {
        let service = ConnectionString::parse("HostName=hub.azure-devices.net").expect("parse");
        assert!(matches!(
            IotHubRegistry::new(&service, Duration::from_secs(60)),
            Err(DirectoryError::Credentials(_))
        ));
    }
}
