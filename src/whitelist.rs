//! Device whitelist.
//!
//! The whitelist file is a JSON list of `{"accept": "<device id>"}` objects.
//! A missing file disables filtering; a present file whose entries are all
//! empty yields an empty list, which accepts nothing.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum WhitelistError {
    #[error("Failed to read whitelist: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse whitelist: {0}")]
    Json(#[from] serde_json::Error),
}

/// One entry of the whitelist file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WhitelistEntry {
    #[serde(default)]
    pub accept: Option<String>,
}

/// Result of loading the whitelist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhitelistStatus {
    /// No whitelist file: every device is accepted.
    Disabled,
    /// Whitelist loaded with this many usable entries (0 accepts nothing).
    Loaded(usize),
}

impl fmt::Display for WhitelistStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WhitelistStatus::Disabled => write!(f, "No whitelist filtering"),
            WhitelistStatus::Loaded(0) => write!(f, "Whitelist is empty"),
            WhitelistStatus::Loaded(count) => write!(f, "Whitelist contains {} entries", count),
        }
    }
}

/// Static accept set, read-only after load.
#[derive(Debug, Default)]
pub struct WhiteList {
    accepted: Option<HashSet<String>>,
}

impl WhiteList {
    /// A whitelist that accepts every device.
    pub fn disabled() -> Self {
        Self { accepted: None }
    }

    /// Build a whitelist from parsed entries, dropping empty accept literals.
    pub fn from_entries(entries: impl IntoIterator<Item = WhitelistEntry>) -> Self {
        let accepted = entries
            .into_iter()
            .filter_map(|entry| entry.accept)
            .filter(|id| !id.is_empty())
            .collect();

        Self {
            accepted: Some(accepted),
        }
    }

    /// Load the whitelist file. A missing (or unconfigured) file disables filtering.
    pub fn load(path: Option<&Path>) -> Result<(Self, WhitelistStatus), WhitelistError> {
        let path = match path {
            Some(path) if path.exists() => path,
            Some(path) => {
                info!("Whitelist file {} not found, filtering disabled", path.display());
                return Ok((Self::disabled(), WhitelistStatus::Disabled));
            }
            None => return Ok((Self::disabled(), WhitelistStatus::Disabled)),
        };

        let content = std::fs::read_to_string(path)?;
        let entries: Vec<WhitelistEntry> = serde_json::from_str(&content)?;
        let whitelist = Self::from_entries(entries);
        let status = whitelist.status();

        debug!("Loaded whitelist {}: {}", path.display(), status);
        Ok((whitelist, status))
    }

    pub fn status(&self) -> WhitelistStatus {
        match &self.accepted {
            None => WhitelistStatus::Disabled,
            Some(accepted) => WhitelistStatus::Loaded(accepted.len()),
        }
    }

    /// Membership test; always true while filtering is disabled.
    pub fn accept(&self, device_id: &str) -> bool {
        match &self.accepted {
            None => true,
            Some(accepted) => accepted.contains(device_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_list(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(content.as_bytes()).expect("write");
        file
    }

    #[test]
    fn test_missing_file_disables_filtering() {
        let (whitelist, status) =
            WhiteList::load(Some(Path::new("/no/such/whitelist.json"))).expect("load");

        assert_eq!(status, WhitelistStatus::Disabled);
        assert!(whitelist.accept("D1"));
        assert!(whitelist.accept("anything"));
    }

    #[test]
    fn test_unconfigured_file_disables_filtering() {
        let (whitelist, status) = WhiteList::load(None).expect("load");
        assert_eq!(status, WhitelistStatus::Disabled);
        assert!(whitelist.accept("D1"));
    }

    #[test]
    fn test_empty_entries_accept_nothing() {
        let file = write_list(r#"[{"accept": ""}, {}, {"accept": null}]"#);
        let (whitelist, status) = WhiteList::load(Some(file.path())).expect("load");

        assert_eq!(status, WhitelistStatus::Loaded(0));
        assert!(!whitelist.accept("D1"));
        assert!(!whitelist.accept(""));
    }

    #[test]
    fn test_membership() {
        let file = write_list(r#"[{"accept":"D1"}]"#);
        let (whitelist, status) = WhiteList::load(Some(file.path())).expect("load");

        assert_eq!(status, WhitelistStatus::Loaded(1));
        assert!(whitelist.accept("D1"));
        assert!(!whitelist.accept("D2"));
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        let file = write_list("not json");
        assert!(matches!(
            WhiteList::load(Some(file.path())),
            Err(WhitelistError::Json(_))
        ));
    }

    #[test]
    fn test_status_messages() {
        assert_eq!(
            WhitelistStatus::Disabled.to_string(),
            "No whitelist filtering"
        );
        assert_eq!(WhitelistStatus::Loaded(0).to_string(), "Whitelist is empty");
        assert_eq!(
            WhitelistStatus::Loaded(3).to_string(),
            "Whitelist contains 3 entries"
        );
    }
}
