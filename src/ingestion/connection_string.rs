use crate::ingestion::IngestionError;
use std::fmt;

/// `Key=Value;Key=Value` connection string as used by the ingestion service.
///
/// Values may contain `=` (base64 keys), only the first one splits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    parts: Vec<(String, String)>,
}

impl ConnectionString {
    pub fn parse(text: &str) -> Result<Self, IngestionError> {
        let mut parts = Vec::new();

        for segment in text.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            let (key, value) = segment.split_once('=').ok_or_else(|| {
                IngestionError::InvalidConnectionString(format!("segment without '=': {}", segment))
            })?;
            if key.is_empty() {
                return Err(IngestionError::InvalidConnectionString(format!(
                    "segment without key: {}",
                    segment
                )));
            }
            parts.push((key.to_string(), value.to_string()));
        }

        if parts.is_empty() {
            return Err(IngestionError::InvalidConnectionString(
                "connection string is empty".into(),
            ));
        }

        Ok(Self { parts })
    }

    /// Per-device connection string `HostName=..;DeviceId=..;SharedAccessKey=..`.
    pub fn for_device(host_name: &str, device_id: &str, key: &str) -> Self {
        Self {
            parts: vec![
                ("HostName".into(), host_name.into()),
                ("DeviceId".into(), device_id.into()),
                ("SharedAccessKey".into(), key.into()),
            ],
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.parts
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn host_name(&self) -> Option<&str> {
        self.get("HostName")
    }

    pub fn shared_access_key_name(&self) -> Option<&str> {
        self.get("SharedAccessKeyName")
    }

    pub fn shared_access_key(&self) -> Option<&str> {
        self.get("SharedAccessKey")
    }

    /// Like [`get`](Self::get) but reports the missing key.
    pub fn require(&self, key: &str) -> Result<&str, IngestionError> {
        self.get(key).ok_or_else(|| {
            IngestionError::InvalidConnectionString(format!("missing {}", key))
        })
    }
}

impl fmt::Display for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, (key, value)) in self.parts.iter().enumerate() {
            if i > 0 {
                write!(f, ";")?;
            }
            write!(f, "{}={}", key, value)?;
        }
        Ok(())
    }
}
