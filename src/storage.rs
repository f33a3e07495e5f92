//! Object storage client.
//!
//! Download-by-path for raw bytes plus signed, time-limited URL issuance for
//! read access, against a Supabase-style storage REST surface. The service
//! key comes from the `STORAGE_SERVICE_KEY` environment variable.

use anyhow::{bail, Result};
use std::time::Duration;

use crate::config::StorageConfig;

pub struct StorageClient {
    http: reqwest::Client,
    service_key: String,
    config: StorageConfig,
}

impl StorageClient {
    pub fn new(config: &StorageConfig) -> Result<Self> {
        let service_key = std::env::var("STORAGE_SERVICE_KEY")
            .map_err(|_| anyhow::anyhow!("STORAGE_SERVICE_KEY environment variable not set"))?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            http,
            service_key,
            config: config.clone(),
        })
    }

    /// Download the raw bytes of an object by its storage path. Returns
    /// `None` when the object does not exist, so callers can distinguish a
    /// missing object from a broken store.
    pub async fn download(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let url = format!(
            "{}/object/{}/{}",
            self.config.url, self.config.bucket, path
        );

        let response = self
            .http
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.service_key))
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Ok(None);
        }
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("storage download error {}: {}", status, body_text);
        }

        Ok(Some(response.bytes().await?.to_vec()))
    }

    /// Issue a signed, time-limited read URL for an object.
    pub async fn signed_url(&self, path: &str) -> Result<String> {
        let url = format!(
            "{}/object/sign/{}/{}",
            self.config.url, self.config.bucket, path
        );
        let body = serde_json::json!({ "expiresIn": self.config.signed_url_ttl_secs });

        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.service_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("storage sign error {}: {}", status, body_text);
        }

        let json: serde_json::Value = response.json().await?;
        let signed = json
            .get("signedURL")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("Invalid sign response: missing signedURL"))?;

        // The API returns a path relative to the storage base.
        Ok(format!("{}{}", self.config.url, signed))
    }
}
