//! In-memory store for tests and local dry runs
//!
//! Mirrors the S3 listing contract (lexicographic order, delimiter rollup,
//! continuation tokens) and records every GET so callers can assert which
//! keys were fetched.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};

use super::{copy_atomically, ArtifactStore, ListPage, ListRequest, SourceStore};
use crate::error::{EtlError, Result};

const DEFAULT_PAGE_SIZE: usize = 1000;

#[derive(Debug)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
    page_size: usize,
    fetch_log: Mutex<Vec<String>>,
    get_failures: Mutex<HashMap<String, u32>>,
    list_failures: Mutex<HashMap<String, u32>>,
    fail_uploads: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            page_size: DEFAULT_PAGE_SIZE,
            fetch_log: Mutex::new(Vec::new()),
            get_failures: Mutex::new(HashMap::new()),
            list_failures: Mutex::new(HashMap::new()),
            fail_uploads: AtomicBool::new(false),
        }
    }

    /// Entries (keys plus rolled-up prefixes) returned per listing page
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn insert(&self, key: impl Into<String>, body: impl Into<Vec<u8>>) {
        if let Ok(mut objects) = self.objects.write() {
            objects.insert(key.into(), body.into());
        }
    }

    pub fn insert_json(&self, key: impl Into<String>, value: &serde_json::Value) {
        self.insert(key, value.to_string().into_bytes());
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.read().ok()?.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects
            .read()
            .map(|objects| objects.contains_key(key))
            .unwrap_or(false)
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects
            .read()
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Every key passed to `get_object`, in call order, retries included
    pub fn fetched_keys(&self) -> Vec<String> {
        self.fetch_log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    pub fn clear_fetch_log(&self) {
        if let Ok(mut log) = self.fetch_log.lock() {
            log.clear();
        }
    }

    /// Make the next `times` GETs of `key` fail with a storage error
    pub fn fail_times(&self, key: impl Into<String>, times: u32) {
        if let Ok(mut failures) = self.get_failures.lock() {
            failures.insert(key.into(), times);
        }
    }

    /// Make the next `times` listing pages under `prefix` fail
    pub fn fail_listing(&self, prefix: impl Into<String>, times: u32) {
        if let Ok(mut failures) = self.list_failures.lock() {
            failures.insert(prefix.into(), times);
        }
    }

    pub fn set_fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }

    fn take_failure(failures: &Mutex<HashMap<String, u32>>, key: &str) -> bool {
        let Ok(mut failures) = failures.lock() else {
            return false;
        };
        match failures.get_mut(key) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            },
            _ => false,
        }
    }
}

#[async_trait]
impl SourceStore for MemoryStore {
    async fn list_page(&self, request: &ListRequest) -> Result<ListPage> {
        if Self::take_failure(&self.list_failures, &request.prefix) {
            return Err(EtlError::storage("list", &request.prefix, "injected failure"));
        }

        let objects = self
            .objects
            .read()
            .map_err(|_| EtlError::storage("list", &request.prefix, "lock poisoned"))?;

        let mut page = ListPage::default();
        let mut entries = 0;
        let mut last_key: Option<&String> = None;

        let candidates = objects.keys().filter(|key| {
            key.starts_with(&request.prefix)
                && request
                    .continuation
                    .as_deref()
                    .map_or(true, |token| key.as_str() > token)
        });

        for key in candidates {
            let rolled_up = request.delimiter.as_deref().and_then(|delimiter| {
                let rest = &key[request.prefix.len()..];
                rest.find(delimiter)
                    .map(|idx| format!("{}{}", request.prefix, &rest[..idx + delimiter.len()]))
            });

            let is_new_entry = match &rolled_up {
                Some(prefix) => page.common_prefixes.last() != Some(prefix),
                None => true,
            };

            if is_new_entry {
                if entries == self.page_size {
                    page.next = last_key.cloned();
                    break;
                }
                entries += 1;
                match rolled_up {
                    Some(prefix) => page.common_prefixes.push(prefix),
                    None => page.keys.push(key.clone()),
                }
            }
            last_key = Some(key);
        }

        Ok(page)
    }

    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if let Ok(mut log) = self.fetch_log.lock() {
            log.push(key.to_string());
        }
        if Self::take_failure(&self.get_failures, key) {
            return Err(EtlError::storage("get", key, "injected failure"));
        }
        Ok(self.get(key))
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn download(&self, key: &str, dest: &Path) -> Result<bool> {
        match self.get(key) {
            Some(bytes) => {
                copy_atomically(dest, bytes.as_slice()).await?;
                Ok(true)
            },
            None => Ok(false),
        }
    }

    async fn upload(&self, key: &str, src: &Path) -> Result<()> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(EtlError::storage("upload", key, "injected failure"));
        }
        let bytes = tokio::fs::read(src).await?;
        self.insert(key, bytes);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn seeded(page_size: usize) -> MemoryStore {
        let store = MemoryStore::new().with_page_size(page_size);
        for key in [
            "raw-data/EPA/a.json",
            "raw-data/EPA/b.json",
            "raw-data/FDA/a.json",
            "raw-data/FDA/b.json",
            "raw-data/USDA/a.json",
            "other/x.json",
        ] {
            store.insert(key, b"{}".to_vec());
        }
        store
    }

    #[tokio::test]
    async fn test_delimiter_rollup_across_pages() {
        let store = seeded(2);
        let request = ListRequest::new("raw-data/").with_delimiter("/");

        let first = store.list_page(&request).await.unwrap();
        assert_eq!(first.common_prefixes, vec!["raw-data/EPA/", "raw-data/FDA/"]);
        let token = first.next.expect("more pages");

        let second = store.list_page(&request.after(token)).await.unwrap();
        assert_eq!(second.common_prefixes, vec!["raw-data/USDA/"]);
        assert!(second.next.is_none());
    }

    #[tokio::test]
    async fn test_flat_listing_pages() {
        let store = seeded(3);
        let request = ListRequest::new("raw-data/");

        let first = store.list_page(&request).await.unwrap();
        assert_eq!(first.keys.len(), 3);
        let second = store.list_page(&request.after(first.next.unwrap())).await.unwrap();
        assert_eq!(second.keys, vec!["raw-data/FDA/b.json", "raw-data/USDA/a.json"]);
        assert!(second.next.is_none());
    }

    #[tokio::test]
    async fn test_injected_get_failures_then_success() {
        let store = seeded(10);
        store.fail_times("raw-data/EPA/a.json", 2);

        assert!(store.get_object("raw-data/EPA/a.json").await.is_err());
        assert!(store.get_object("raw-data/EPA/a.json").await.is_err());
        assert!(store.get_object("raw-data/EPA/a.json").await.unwrap().is_some());
        assert!(store.get_object("raw-data/EPA/missing.json").await.unwrap().is_none());
        assert_eq!(store.fetched_keys().len(), 4);
    }

    #[tokio::test]
    async fn test_artifact_roundtrip_through_files() {
        let store = MemoryStore::new();
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("manifest.parquet");
        std::fs::write(&src, b"bytes").unwrap();

        store.upload("manifest.parquet", &src).await.unwrap();
        let dest = dir.path().join("restore/manifest.parquet");
        assert!(store.download("manifest.parquet", &dest).await.unwrap());
        assert_eq!(std::fs::read(dest).unwrap(), b"bytes");
        assert!(!store.download("comments.parquet", &dir.path().join("c")).await.unwrap());

        store.set_fail_uploads(true);
        assert!(store.upload("manifest.parquet", &src).await.is_err());
    }
}
