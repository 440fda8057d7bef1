//! S3-compatible backend
//!
//! Serves both the public source bucket (anonymous, us-east-1) and the
//! credentialed durable bucket (e.g. Cloudflare R2 with a custom endpoint).

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::{retry::RetryConfig, Credentials, Region},
    error::DisplayErrorContext,
    operation::get_object::GetObjectOutput,
    primitives::ByteStream,
    Client,
};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use tracing::{debug, info, instrument};

use super::{copy_atomically, ArtifactStore, ListPage, ListRequest, SourceStore};
use crate::error::{EtlError, Result};

/// Public bucket mirroring regulations.gov
pub const DEFAULT_SOURCE_BUCKET: &str = "mirrulations";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    /// `None` for anonymous access
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub path_style: bool,
    /// SDK-level attempts per request, including the first
    pub max_attempts: u32,
}

impl S3Config {
    /// Anonymous access to a public bucket
    pub fn public(bucket: impl Into<String>) -> Self {
        Self {
            endpoint: None,
            region: "us-east-1".to_string(),
            bucket: bucket.into(),
            access_key: None,
            secret_key: None,
            path_style: false,
            max_attempts: 3,
        }
    }

    /// Source bucket settings from `SOURCE_BUCKET`, `SOURCE_REGION`,
    /// `SOURCE_ENDPOINT`
    pub fn source_from_env() -> Self {
        let mut config =
            Self::public(env::var("SOURCE_BUCKET").unwrap_or_else(|_| DEFAULT_SOURCE_BUCKET.to_string()));
        if let Ok(region) = env::var("SOURCE_REGION") {
            config.region = region;
        }
        config.endpoint = env::var("SOURCE_ENDPOINT").ok();
        config
    }

    /// Durable bucket settings from the `R2_*` variables
    ///
    /// Returns `None` when no credentials are configured; the run can then
    /// only read artifacts through `R2_PUBLIC_URL`.
    pub fn durable_from_env() -> Option<Self> {
        let access_key = env::var("R2_ACCESS_KEY_ID").ok().filter(|v| !v.is_empty())?;
        let secret_key = env::var("R2_SECRET_ACCESS_KEY").ok().filter(|v| !v.is_empty())?;

        Some(Self {
            endpoint: env::var("R2_ENDPOINT").ok(),
            region: env::var("R2_REGION").unwrap_or_else(|_| "auto".to_string()),
            bucket: env::var("R2_BUCKET_NAME").unwrap_or_else(|_| "docketflow".to_string()),
            access_key: Some(access_key),
            secret_key: Some(secret_key),
            path_style: env::var("R2_PATH_STYLE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(true),
            max_attempts: 5,
        })
    }

    pub fn is_anonymous(&self) -> bool {
        self.access_key.is_none() || self.secret_key.is_none()
    }
}

#[derive(Clone)]
pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    pub async fn new(config: S3Config) -> Result<Self> {
        if config.bucket.is_empty() {
            return Err(EtlError::config("S3 bucket name cannot be empty"));
        }

        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(config.region.clone()));

        loader = match (&config.access_key, &config.secret_key) {
            (Some(access), Some(secret)) => {
                loader.credentials_provider(Credentials::new(access, secret, None, None, "docketflow"))
            },
            _ => loader.no_credentials(),
        };

        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }

        let sdk_config = loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.path_style)
            .retry_config(RetryConfig::standard().with_max_attempts(config.max_attempts.max(1)))
            .build();

        info!(
            bucket = %config.bucket,
            anonymous = config.is_anonymous(),
            "S3 client initialized"
        );

        Ok(Self {
            client: Client::from_conf(s3_config),
            bucket: config.bucket,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Start a GET; `Ok(None)` when the object does not exist
    async fn request_object(&self, key: &str) -> Result<Option<GetObjectOutput>> {
        match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(response) => Ok(Some(response)),
            Err(err) => {
                let missing = err.as_service_error().map(|e| e.is_no_such_key()).unwrap_or(false)
                    || err.raw_response().map(|r| r.status().as_u16()) == Some(404);
                if missing {
                    Ok(None)
                } else {
                    Err(EtlError::storage("get", key, DisplayErrorContext(&err)))
                }
            },
        }
    }
}

#[async_trait]
impl SourceStore for S3Store {
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn list_page(&self, request: &ListRequest) -> Result<ListPage> {
        let mut call = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&request.prefix);

        if let Some(delimiter) = &request.delimiter {
            call = call.delimiter(delimiter);
        }
        if let Some(token) = &request.continuation {
            call = call.continuation_token(token);
        }

        let response = call
            .send()
            .await
            .map_err(|e| EtlError::storage("list", &request.prefix, DisplayErrorContext(&e)))?;

        let keys = response
            .contents()
            .iter()
            .filter_map(|obj| obj.key().map(str::to_string))
            .collect();
        let common_prefixes = response
            .common_prefixes()
            .iter()
            .filter_map(|p| p.prefix().map(str::to_string))
            .collect();
        let next = if response.is_truncated().unwrap_or(false) {
            response.next_continuation_token().map(str::to_string)
        } else {
            None
        };

        Ok(ListPage {
            keys,
            common_prefixes,
            next,
        })
    }

    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let Some(response) = self.request_object(key).await? else {
            return Ok(None);
        };

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| EtlError::storage("read body", key, e))?
            .into_bytes()
            .to_vec();

        debug!("Downloaded {} bytes from s3://{}/{}", data.len(), self.bucket, key);
        Ok(Some(data))
    }
}

#[async_trait]
impl ArtifactStore for S3Store {
    #[instrument(skip(self, dest), fields(bucket = %self.bucket))]
    async fn download(&self, key: &str, dest: &Path) -> Result<bool> {
        let Some(response) = self.request_object(key).await? else {
            return Ok(false);
        };

        // Stream to disk: datasets can run to several GB
        let bytes = copy_atomically(dest, response.body.into_async_read())
            .await
            .map_err(|e| EtlError::storage("read body", key, e))?;
        info!(
            "Downloaded s3://{}/{} ({:.1} MB) to {}",
            self.bucket,
            key,
            bytes as f64 / (1024.0 * 1024.0),
            dest.display()
        );
        Ok(true)
    }

    #[instrument(skip(self, src), fields(bucket = %self.bucket))]
    async fn upload(&self, key: &str, src: &Path) -> Result<()> {
        let size = tokio::fs::metadata(src).await?.len();
        let body = ByteStream::from_path(src)
            .await
            .map_err(|e| EtlError::storage("read", src.display().to_string(), e))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/octet-stream")
            .body(body)
            .send()
            .await
            .map_err(|e| EtlError::storage("upload", key, DisplayErrorContext(&e)))?;

        info!(
            "Uploaded {} ({:.1} MB) to s3://{}/{}",
            src.display(),
            size as f64 / (1024.0 * 1024.0),
            self.bucket,
            key
        );
        Ok(())
    }
}
