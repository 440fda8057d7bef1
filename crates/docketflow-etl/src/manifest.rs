//! Processed-key manifest
//!
//! `manifest.parquet` holds one `key` column listing every source object
//! whose row is already in a merged dataset. It is only rewritten after the
//! merge has succeeded, so a crash in between re-processes keys instead of
//! losing them.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use arrow::array::{ArrayRef, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use tracing::{info, instrument};

use crate::columnar::{read_string_column, write_parquet_atomic, writer_properties, DEFAULT_ROW_GROUP_SIZE};
use crate::error::Result;
use crate::storage::ArtifactStore;

pub const MANIFEST_FILE: &str = "manifest.parquet";
pub const KEY_COLUMN: &str = "key";

fn manifest_schema() -> SchemaRef {
    static SCHEMA: OnceLock<SchemaRef> = OnceLock::new();
    SCHEMA
        .get_or_init(|| Arc::new(Schema::new(vec![Field::new(KEY_COLUMN, DataType::Utf8, false)])))
        .clone()
}

pub struct ManifestStore {
    local_path: PathBuf,
    remote: Option<Arc<dyn ArtifactStore>>,
}

impl ManifestStore {
    pub fn new(output_dir: &Path, remote: Option<Arc<dyn ArtifactStore>>) -> Self {
        Self {
            local_path: output_dir.join(MANIFEST_FILE),
            remote,
        }
    }

    pub fn path(&self) -> &Path {
        &self.local_path
    }

    /// Local file first, then the durable copy, else an empty set
    ///
    /// A durable copy that does not exist is a cold start. Any other failure
    /// to reach the durable store is returned: starting empty would make the
    /// next upload overwrite the published datasets.
    #[instrument(skip(self), fields(path = %self.local_path.display()))]
    pub async fn load(&self) -> Result<HashSet<String>> {
        if tokio::fs::try_exists(&self.local_path).await? {
            let keys = self.read_local().await?;
            info!("Loaded manifest: {} processed keys", keys.len());
            return Ok(keys);
        }

        if let Some(remote) = &self.remote {
            if remote.download(MANIFEST_FILE, &self.local_path).await? {
                let keys = self.read_local().await?;
                info!("Downloaded manifest from durable store: {} processed keys", keys.len());
                return Ok(keys);
            }
        }

        info!("No manifest found, starting fresh");
        Ok(HashSet::new())
    }

    /// Replace the manifest with `keys`, written sorted through a temp file
    #[instrument(skip(self, keys), fields(keys = keys.len()))]
    pub async fn save(&self, keys: &HashSet<String>) -> Result<()> {
        let mut sorted: Vec<String> = keys.iter().cloned().collect();
        sorted.sort_unstable();

        let path = self.local_path.clone();
        let count = sorted.len();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let schema = manifest_schema();
            let column: ArrayRef = Arc::new(StringArray::from(sorted));
            let batch = RecordBatch::try_new(schema.clone(), vec![column])?;
            write_parquet_atomic(&path, &schema, [Ok(batch)], writer_properties(DEFAULT_ROW_GROUP_SIZE))?;
            Ok(())
        })
        .await??;

        info!("Saved manifest: {} keys", count);
        Ok(())
    }

    async fn read_local(&self) -> Result<HashSet<String>> {
        let path = self.local_path.clone();
        tokio::task::spawn_blocking(move || -> Result<HashSet<String>> {
            Ok(read_string_column(&path, KEY_COLUMN)?.into_iter().flatten().collect())
        })
        .await?
    }
}
