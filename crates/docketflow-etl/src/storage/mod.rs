//! Object storage seams
//!
//! The pipeline talks to two stores:
//!
//! - a **source** store holding the raw JSON corpus ([`SourceStore`]),
//!   read-only, listed page by page;
//! - a **durable** store holding the run's artifacts ([`ArtifactStore`]),
//!   used to resume from a previous run and to publish the new one.
//!
//! Both are passed around as trait objects so tests can substitute
//! [`memory::MemoryStore`].

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWriteExt};

use crate::error::{EtlError, Result};

pub mod http;
pub mod memory;
pub mod s3;

pub use http::PublicUrlStore;
pub use memory::MemoryStore;
pub use s3::{S3Config, S3Store};

/// One page request against a prefix
#[derive(Debug, Clone, Default)]
pub struct ListRequest {
    pub prefix: String,
    /// When set, keys are rolled up into common prefixes at this delimiter
    pub delimiter: Option<String>,
    pub continuation: Option<String>,
}

impl ListRequest {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Default::default()
        }
    }

    pub fn with_delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = Some(delimiter.into());
        self
    }

    pub fn after(&self, token: String) -> Self {
        Self {
            continuation: Some(token),
            ..self.clone()
        }
    }
}

/// One page of listing results
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub keys: Vec<String>,
    pub common_prefixes: Vec<String>,
    /// Token for the next page, `None` on the last page
    pub next: Option<String>,
}

/// Read access to the raw corpus
#[async_trait]
pub trait SourceStore: Send + Sync {
    async fn list_page(&self, request: &ListRequest) -> Result<ListPage>;

    /// Fetch an object body, `Ok(None)` when it does not exist
    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>>;
}

/// Durable home of the merged datasets and the manifest
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Download `key` into `dest`. Returns `false` when the artifact does not
    /// exist remotely.
    async fn download(&self, key: &str, dest: &Path) -> Result<bool>;

    async fn upload(&self, key: &str, src: &Path) -> Result<()>;
}

/// Sibling temp path a download is written to before the rename
fn download_path(dest: &Path) -> PathBuf {
    dest.with_extension("download")
}

async fn create_download(dest: &Path) -> Result<(PathBuf, File)> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = download_path(dest);
    let file = File::create(&tmp).await?;
    Ok((tmp, file))
}

/// Rename a complete download into place, or drop the partial one
async fn finish_download(tmp: &Path, dest: &Path, written: Result<u64>) -> Result<u64> {
    match written {
        Ok(bytes) => {
            tokio::fs::rename(tmp, dest).await?;
            Ok(bytes)
        },
        Err(e) => {
            let _ = tokio::fs::remove_file(tmp).await;
            Err(e)
        },
    }
}

/// Copy `reader` to `dest` through a sibling temp file
///
/// `dest` is only replaced once the whole body has been written; a read
/// error leaves any previous file untouched.
pub(crate) async fn copy_atomically<R>(dest: &Path, reader: R) -> Result<u64>
where
    R: AsyncRead + Send,
{
    let (tmp, mut file) = create_download(dest).await?;
    let written = async {
        let mut reader = std::pin::pin!(reader);
        let bytes = tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await?;
        Ok::<_, EtlError>(bytes)
    }
    .await;
    finish_download(&tmp, dest, written).await
}

/// Write a stream of body chunks to `dest` through a sibling temp file
pub(crate) async fn stream_atomically<S, B>(dest: &Path, chunks: S) -> Result<u64>
where
    S: Stream<Item = Result<B>> + Send,
    B: AsRef<[u8]> + Send,
{
    let (tmp, mut file) = create_download(dest).await?;
    let written = async {
        let mut chunks = std::pin::pin!(chunks);
        let mut bytes = 0u64;
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            file.write_all(chunk.as_ref()).await?;
            bytes += chunk.as_ref().len() as u64;
        }
        file.flush().await?;
        Ok::<_, EtlError>(bytes)
    }
    .await;
    finish_download(&tmp, dest, written).await
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use futures::stream;

    #[tokio::test]
    async fn test_copy_replaces_destination() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("nested/manifest.parquet");

        let bytes = copy_atomically(&dest, &b"PAR1body"[..]).await.unwrap();

        assert_eq!(bytes, 8);
        assert_eq!(std::fs::read(&dest).unwrap(), b"PAR1body");
        assert!(!download_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_streamed_chunks_are_concatenated() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("comments.parquet");
        let chunks = stream::iter(vec![Ok::<_, EtlError>(b"PAR1".to_vec()), Ok(vec![0u8; 4096]), Ok(b"PAR1".to_vec())]);

        let bytes = stream_atomically(&dest, chunks).await.unwrap();

        assert_eq!(bytes, 4104);
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), 4104);
    }

    #[tokio::test]
    async fn test_interrupted_stream_keeps_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("comments.parquet");
        std::fs::write(&dest, b"previous").unwrap();

        let chunks = stream::iter(vec![
            Ok(b"PAR1partial".to_vec()),
            Err(EtlError::storage("read body", "comments.parquet", "connection reset")),
        ]);
        let result = stream_atomically(&dest, chunks).await;

        assert!(matches!(result, Err(EtlError::Storage { .. })));
        assert_eq!(std::fs::read(&dest).unwrap(), b"previous");
        assert!(!download_path(&dest).exists());
    }
}
