//! Artifact transfer with the durable store
//!
//! Keys mirror paths relative to the output directory: `dockets.parquet`,
//! `manifest.parquet`, `optimized/comments/year=2023/data_0.parquet`, ...

use std::path::{Component, Path};

use serde::Serialize;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::error::Result;
use crate::manifest::MANIFEST_FILE;
use crate::optimize::OPTIMIZED_DIR;
use crate::record::RecordKind;
use crate::storage::ArtifactStore;

#[derive(Debug, Clone, Default, Serialize)]
pub struct UploadReport {
    pub uploaded: Vec<String>,
    /// (key, error) for every artifact that failed to upload
    pub failures: Vec<(String, String)>,
}

impl UploadReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Storage key for a file under `output_dir`
pub fn artifact_key(output_dir: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(output_dir).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Option<_>>()?;
    (!parts.is_empty()).then(|| parts.join("/"))
}

/// Fetch published datasets missing locally so the merge can append to them
///
/// Returns the kinds that were restored.
pub async fn download_existing(
    remote: &dyn ArtifactStore,
    output_dir: &Path,
    kinds: &[RecordKind],
) -> Result<Vec<RecordKind>> {
    info!("Downloading existing datasets from durable store...");
    let mut restored = Vec::new();
    for &kind in kinds {
        let local = output_dir.join(kind.file_name());
        if local.exists() {
            continue;
        }
        if remote.download(&kind.file_name(), &local).await? {
            let size = tokio::fs::metadata(&local).await?.len();
            info!("{} ({:.1} MB)", kind.file_name(), size as f64 / (1024.0 * 1024.0));
            restored.push(kind);
        } else {
            warn!("{} not found in durable store", kind.file_name());
        }
    }
    Ok(restored)
}

/// Upload datasets of `kinds`, the manifest and, when `include_optimized`
/// is set, the optimized layout
///
/// The optimized tree is only published by runs that rebuilt it; otherwise it
/// may lag behind the datasets being uploaded. Individual failures are
/// collected, never returned as an error; the local files stay in place for a
/// later retry.
pub async fn publish(
    remote: &dyn ArtifactStore,
    output_dir: &Path,
    kinds: &[RecordKind],
    include_optimized: bool,
) -> UploadReport {
    let mut files = Vec::new();
    for kind in kinds {
        files.push(output_dir.join(kind.file_name()));
    }
    files.push(output_dir.join(MANIFEST_FILE));

    let optimized = output_dir.join(OPTIMIZED_DIR);
    if include_optimized && optimized.is_dir() {
        files.extend(
            WalkDir::new(&optimized)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().is_file())
                .map(|entry| entry.into_path())
                .filter(|path| path.extension().is_some_and(|ext| ext == "parquet")),
        );
    }

    let mut report = UploadReport::default();
    for path in files.into_iter().filter(|p| p.is_file()) {
        let Some(key) = artifact_key(output_dir, &path) else {
            continue;
        };
        match remote.upload(&key, &path).await {
            Ok(()) => report.uploaded.push(key),
            Err(e) => {
                warn!("Upload of {} failed: {}", key, e);
                report.failures.push((key, e.to_string()));
            },
        }
    }

    info!(
        "Published {} artifacts ({} failed)",
        report.uploaded.len(),
        report.failures.len()
    );
    report
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    #[test]
    fn test_artifact_key() {
        let root = Path::new("/data/out");
        assert_eq!(
            artifact_key(root, Path::new("/data/out/optimized/comments/year=2023/data_0.parquet")).as_deref(),
            Some("optimized/comments/year=2023/data_0.parquet")
        );
        assert_eq!(artifact_key(root, Path::new("/elsewhere/x.parquet")), None);
        assert_eq!(artifact_key(root, root), None);
    }

    #[tokio::test]
    async fn test_publish_collects_every_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path();
        std::fs::write(out.join("dockets.parquet"), b"d").unwrap();
        std::fs::write(out.join("manifest.parquet"), b"m").unwrap();
        std::fs::create_dir_all(out.join("optimized/comments/year=2023")).unwrap();
        std::fs::write(out.join("optimized/comments/year=2023/data_0.parquet"), b"c").unwrap();
        std::fs::write(out.join("optimized/dockets.parquet"), b"s").unwrap();
        std::fs::write(out.join("optimized/README"), b"skip").unwrap();

        let remote = MemoryStore::new();
        let report = publish(&remote, out, &RecordKind::ALL, true).await;

        assert!(report.is_clean());
        assert_eq!(
            report.uploaded,
            vec![
                "dockets.parquet",
                "manifest.parquet",
                "optimized/comments/year=2023/data_0.parquet",
                "optimized/dockets.parquet",
            ]
        );
        assert_eq!(remote.get("manifest.parquet").unwrap(), b"m");
    }

    #[tokio::test]
    async fn test_stale_optimized_layout_stays_local() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path();
        std::fs::write(out.join("comments.parquet"), b"c").unwrap();
        std::fs::write(out.join("manifest.parquet"), b"m").unwrap();
        std::fs::create_dir_all(out.join("optimized/comments/year=2023")).unwrap();
        std::fs::write(out.join("optimized/comments/year=2023/data_0.parquet"), b"old").unwrap();

        let remote = MemoryStore::new();
        let report = publish(&remote, out, &[RecordKind::Comment], false).await;

        assert_eq!(report.uploaded, vec!["comments.parquet", "manifest.parquet"]);
        assert!(remote.get("optimized/comments/year=2023/data_0.parquet").is_none());
    }

    #[tokio::test]
    async fn test_publish_failures_are_reported_not_raised() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("comments.parquet"), b"c").unwrap();

        let remote = MemoryStore::new();
        remote.set_fail_uploads(true);
        let report = publish(&remote, dir.path(), &[RecordKind::Comment], false).await;

        assert!(report.uploaded.is_empty());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, "comments.parquet");
        assert!(dir.path().join("comments.parquet").exists());
    }

    #[tokio::test]
    async fn test_download_existing_skips_local_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("dockets.parquet"), b"local").unwrap();

        let remote = MemoryStore::new();
        remote.insert("dockets.parquet", b"remote".to_vec());
        remote.insert("documents.parquet", b"remote".to_vec());

        let restored = download_existing(&remote, dir.path(), &RecordKind::ALL).await.unwrap();
        assert_eq!(restored, vec![RecordKind::Document]);
        assert_eq!(std::fs::read(dir.path().join("dockets.parquet")).unwrap(), b"local");
        assert!(!dir.path().join("comments.parquet").exists());
    }
}
