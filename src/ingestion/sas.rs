//! Shared access signature tokens.
//!
//! `SharedAccessSignature sr=<uri>&sig=<sig>&se=<expiry>[&skn=<policy>]` where
//! `sig` is base64(HMAC-SHA256(base64-decoded key, "<uri>\n<expiry>")).

use crate::ingestion::IngestionError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

const BLOCK_SIZE: usize = 64;

/// HMAC-SHA256 (RFC 2104).
pub fn hmac_sha256(key: &[u8], message: &[u8]) -> [u8; 32] {
    let mut block_key = [0u8; BLOCK_SIZE];
    if key.len() > BLOCK_SIZE {
        block_key[..32].copy_from_slice(&Sha256::digest(key));
    } else {
        block_key[..key.len()].copy_from_slice(key);
    }

    let mut inner_pad = [0x36u8; BLOCK_SIZE];
    let mut outer_pad = [0x5cu8; BLOCK_SIZE];
    for i in 0..BLOCK_SIZE {
        inner_pad[i] ^= block_key[i];
        outer_pad[i] ^= block_key[i];
    }

    let mut inner = Sha256::new();
    inner.update(inner_pad);
    inner.update(message);
    let inner_hash = inner.finalize();

    let mut outer = Sha256::new();
    outer.update(outer_pad);
    outer.update(inner_hash);

    let mut mac = [0u8; 32];
    mac.copy_from_slice(&outer.finalize());
    mac
}

fn url_encode(text: &str) -> String {
    url::form_urlencoded::byte_serialize(text.as_bytes()).collect()
}

/// Sign `resource_uri` with the base64 `key` until `expiry`.
pub fn generate_sas_token(
    resource_uri: &str,
    key: &str,
    policy_name: Option<&str>,
    expiry: DateTime<Utc>,
) -> Result<String, IngestionError> {
    let key = STANDARD
        .decode(key)
        .map_err(|e| IngestionError::InvalidKey(e.to_string()))?;

    let encoded_uri = url_encode(resource_uri);
    let expiry = expiry.timestamp();
    let to_sign = format!("{}\n{}", encoded_uri, expiry);
    let signature = STANDARD.encode(hmac_sha256(&key, to_sign.as_bytes()));

    let mut token = format!(
        "SharedAccessSignature sr={}&sig={}&se={}",
        encoded_uri,
        url_encode(&signature),
        expiry
    );
    if let Some(policy) = policy_name {
        token.push_str("&skn=");
        token.push_str(policy);
    }

    Ok(token)
}
