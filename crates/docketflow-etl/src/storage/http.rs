//! Read-only artifact access over a public base URL
//!
//! Lets an operator without bucket credentials resume from the published
//! datasets (`{base_url}/manifest.parquet`, `{base_url}/comments.parquet`, ...).

use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::StatusCode;
use std::path::Path;
use tracing::{debug, info, instrument};

use super::{stream_atomically, ArtifactStore};
use crate::error::{EtlError, Result};

#[derive(Debug, Clone)]
pub struct PublicUrlStore {
    client: reqwest::Client,
    base_url: String,
}

impl PublicUrlStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn url_for(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key.trim_start_matches('/'))
    }
}

#[async_trait]
impl ArtifactStore for PublicUrlStore {
    #[instrument(skip(self, dest))]
    async fn download(&self, key: &str, dest: &Path) -> Result<bool> {
        let url = self.url_for(key);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| EtlError::storage("get", &url, e))?;

        match response.status() {
            StatusCode::OK => {},
            StatusCode::NOT_FOUND | StatusCode::FORBIDDEN => {
                debug!("{} not published ({})", url, response.status());
                return Ok(false);
            },
            status => {
                return Err(EtlError::storage("get", &url, format!("unexpected status {}", status)));
            },
        }

        let chunks = response
            .bytes_stream()
            .map_err(|e| EtlError::storage("read body", &url, e));
        let bytes = stream_atomically(dest, chunks).await?;

        info!("Downloaded {} ({} bytes)", url, bytes);
        Ok(true)
    }

    async fn upload(&self, key: &str, _src: &Path) -> Result<()> {
        Err(EtlError::storage(
            "upload",
            key,
            "public URL store is read-only; configure R2 credentials to publish",
        ))
    }
}
