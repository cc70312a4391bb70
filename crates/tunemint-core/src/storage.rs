//! ============================================================================
//! Content-Addressed Upload Client - IPFS Pinning via Pinata
//! ============================================================================
//! Uploads binary blobs and JSON documents to a pinning service and returns
//! content identifiers. Gateway URLs are derived deterministically from CIDs.
//! ============================================================================

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::types::{Result, TunemintError};

/// Pinata file-pinning endpoint
const PINATA_PIN_FILE_URL: &str = "https://api.pinata.cloud/pinning/pinFileToIPFS";

/// Pinata JSON-pinning endpoint
const PINATA_PIN_JSON_URL: &str = "https://api.pinata.cloud/pinning/pinJSONToIPFS";

/// Default public gateway base
const DEFAULT_GATEWAY: &str = "https://gateway.pinata.cloud/ipfs/";

/// Abstraction over content-addressed storage, so the reconciler can be
/// exercised against an in-memory fake.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Pin raw bytes; returns the content identifier.
    async fn upload_blob(&self, bytes: Vec<u8>, name: &str) -> Result<String>;

    /// Pin a JSON document; returns the content identifier.
    async fn upload_json(&self, document: &serde_json::Value, name: &str) -> Result<String>;

    /// Fetch a remote URL and pin its content; returns the content identifier.
    async fn pin_remote(&self, url: &str, name: &str) -> Result<String>;

    /// Consumer-facing retrieval URL, derived from the content address.
    fn gateway_url(&self, cid: &str) -> String;
}

/// Pinning client backed by the Pinata HTTP API
pub struct PinataClient {
    client: reqwest::Client,
    jwt: String,
    gateway_base: String,
}

impl PinataClient {
    pub fn new(jwt: String) -> Self {
        Self::with_gateway(jwt, DEFAULT_GATEWAY.to_string())
    }

    pub fn with_gateway(jwt: String, gateway_base: String) -> Self {
        let gateway_base = if gateway_base.ends_with('/') {
            gateway_base
        } else {
            format!("{}/", gateway_base)
        };
        Self {
            client: reqwest::Client::new(),
            jwt,
            gateway_base,
        }
    }
}

#[async_trait]
impl ArtifactStore for PinataClient {
    async fn upload_blob(&self, bytes: Vec<u8>, name: &str) -> Result<String> {
        debug!("Pinning blob {} ({} bytes)", name, bytes.len());

        let part = reqwest::multipart::Part::bytes(bytes).file_name(name.to_string());
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .client
            .post(PINATA_PIN_FILE_URL)
            .header("Authorization", format!("Bearer {}", self.jwt))
            .multipart(form)
            .send()
            .await
            .map_err(|e| TunemintError::UploadFailed(format!("pin file call failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(TunemintError::UploadFailed(format!(
                "pin file returned {}: {}",
                status, body
            )));
        }

        let pinned: PinResponse = response
            .json()
            .await
            .map_err(|e| TunemintError::UploadFailed(format!("bad pin response: {}", e)))?;

        info!("Pinned {} -> {}", name, pinned.ipfs_hash);
        Ok(pinned.ipfs_hash)
    }

    async fn upload_json(&self, document: &serde_json::Value, name: &str) -> Result<String> {
        debug!("Pinning JSON document {}", name);

        let body = serde_json::json!({
            "pinataMetadata": { "name": name },
            "pinataContent": document,
        });

        let response = self
            .client
            .post(PINATA_PIN_JSON_URL)
            .header("Authorization", format!("Bearer {}", self.jwt))
            .json(&body)
            .send()
            .await
            .map_err(|e| TunemintError::UploadFailed(format!("pin JSON call failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(TunemintError::UploadFailed(format!(
                "pin JSON returned {}: {}",
                status, body
            )));
        }

        let pinned: PinResponse = response
            .json()
            .await
            .map_err(|e| TunemintError::UploadFailed(format!("bad pin response: {}", e)))?;

        info!("Pinned {} -> {}", name, pinned.ipfs_hash);
        Ok(pinned.ipfs_hash)
    }

    async fn pin_remote(&self, url: &str, name: &str) -> Result<String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| TunemintError::UploadFailed(format!("fetch of {} failed: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(TunemintError::UploadFailed(format!(
                "fetch of {} returned {}",
                url,
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| TunemintError::UploadFailed(format!("read of {} failed: {}", url, e)))?;

        self.upload_blob(bytes.to_vec(), name).await
    }

    fn gateway_url(&self, cid: &str) -> String {
        format!("{}{}", self.gateway_base, cid)
    }
}

// ============================================================================
// Pinata API Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct PinResponse {
    #[serde(rename = "IpfsHash")]
    ipfs_hash: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_url_derivation() {
        let client = PinataClient::new("jwt".into());
        assert_eq!(
            client.gateway_url("QmHash"),
            "https://gateway.pinata.cloud/ipfs/QmHash"
        );

        // Custom gateways are normalized to a trailing slash
        let client = PinataClient::with_gateway("jwt".into(), "https://gw.example/ipfs".into());
        assert_eq!(client.gateway_url("QmHash"), "https://gw.example/ipfs/QmHash");
    }

    #[test]
    fn test_pin_response_parsing() {
        let raw = r#"{"IpfsHash":"QmHash","PinSize":1234,"Timestamp":"2025-06-01T00:00:00Z"}"#;
        let parsed: PinResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.ipfs_hash, "QmHash");
    }
}
