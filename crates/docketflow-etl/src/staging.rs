//! Per-(agency, kind) staging files
//!
//! Layout: `{staging_dir}/{kind}/{AGENCY}.parquet`, always written with the
//! kind's declared schema. Paths never collide across agencies, so staging
//! writes need no coordination.
//!
//! Each staging file has a `{AGENCY}.keys.json` sidecar listing the source
//! keys behind its rows. The sidecar is written first, so a staging file on
//! disk always has its keys; `merge --only` recovery relies on that to record
//! them in the manifest.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::columnar::{rows_to_batch, write_parquet_atomic, writer_properties, DEFAULT_ROW_GROUP_SIZE};
use crate::error::Result;
use crate::record::{RecordKind, Row};

pub const STAGING_DIR: &str = "staging";

pub fn staging_path(staging_dir: &Path, agency: &str, kind: RecordKind) -> PathBuf {
    staging_dir.join(kind.name()).join(format!("{}.parquet", agency))
}

fn keys_path(staging_file: &Path) -> PathBuf {
    staging_file.with_extension("keys.json")
}

/// Write `rows` for one agency. Empty input writes nothing and returns 0.
pub fn write_staging(staging_dir: &Path, agency: &str, kind: RecordKind, rows: &[Row]) -> Result<usize> {
    write_staging_with_keys(staging_dir, agency, kind, rows, &[])
}

/// Like [`write_staging`], recording `keys` in the sidecar first
pub fn write_staging_with_keys(
    staging_dir: &Path,
    agency: &str,
    kind: RecordKind,
    rows: &[Row],
    keys: &[String],
) -> Result<usize> {
    if rows.is_empty() {
        return Ok(0);
    }

    let path = staging_path(staging_dir, agency, kind);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(keys_path(&path), serde_json::to_vec(keys)?)?;

    let schema = kind.schema();
    let batch = rows_to_batch(&schema, rows)?;
    let written = write_parquet_atomic(&path, &schema, [Ok(batch)], writer_properties(DEFAULT_ROW_GROUP_SIZE))?;

    debug!("Staged {} {} rows at {}", written, kind, path.display());
    Ok(written)
}

/// Pending staging files for `kind`, sorted by path
pub fn staging_files(staging_dir: &Path, kind: RecordKind) -> Result<Vec<PathBuf>> {
    let dir = staging_dir.join(kind.name());
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "parquet") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Source keys behind the pending staging files of `kinds`
///
/// Sidecars without a staging file are ignored: their rows never landed.
pub fn staged_keys(staging_dir: &Path, kinds: &[RecordKind]) -> Result<BTreeSet<String>> {
    let mut keys = BTreeSet::new();
    for &kind in kinds {
        for file in staging_files(staging_dir, kind)? {
            let sidecar = keys_path(&file);
            if !sidecar.is_file() {
                continue;
            }
            let listed: Vec<String> = serde_json::from_slice(&std::fs::read(&sidecar)?)?;
            keys.extend(listed);
        }
    }
    Ok(keys)
}

/// Delete a consumed staging file and its sidecar
pub fn discard_staged(staging_file: &Path) -> std::io::Result<()> {
    if staging_file.exists() {
        std::fs::remove_file(staging_file)?;
    }
    let sidecar = keys_path(staging_file);
    if sidecar.exists() {
        std::fs::remove_file(sidecar)?;
    }
    Ok(())
}

/// Remove leftovers of an interrupted run
pub fn clear_staging(staging_dir: &Path) -> Result<bool> {
    if !staging_dir.exists() {
        return Ok(false);
    }
    std::fs::remove_dir_all(staging_dir)?;
    Ok(true)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::columnar::{read_string_column, row_count};

    fn docket(id: &str) -> Row {
        vec![Some(id.to_string()), Some("EPA".into()), None, None, None, None]
    }

    #[test]
    fn test_empty_rows_write_nothing() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(write_staging(dir.path(), "EPA", RecordKind::Docket, &[]).unwrap(), 0);
        assert!(!staging_path(dir.path(), "EPA", RecordKind::Docket).exists());
        assert!(staging_files(dir.path(), RecordKind::Docket).unwrap().is_empty());
    }

    #[test]
    fn test_write_and_list() {
        let dir = tempfile::tempdir().unwrap();
        write_staging(dir.path(), "FDA", RecordKind::Docket, &[docket("F-1")]).unwrap();
        let written = write_staging(dir.path(), "EPA", RecordKind::Docket, &[docket("E-1"), docket("E-2")]).unwrap();
        assert_eq!(written, 2);

        let files = staging_files(dir.path(), RecordKind::Docket).unwrap();
        assert_eq!(
            files,
            vec![
                dir.path().join("dockets/EPA.parquet"),
                dir.path().join("dockets/FDA.parquet")
            ]
        );
        assert_eq!(row_count(&files[0]).unwrap(), 2);
        assert_eq!(
            read_string_column(&files[0], "docket_id").unwrap(),
            vec![Some("E-1".to_string()), Some("E-2".to_string())]
        );
        assert!(staging_files(dir.path(), RecordKind::Comment).unwrap().is_empty());
    }

    #[test]
    fn test_staged_keys_follow_staging_files() {
        let dir = tempfile::tempdir().unwrap();
        let keys = vec!["raw-data/EPA/x/text-x/docket/E-1.json".to_string()];
        write_staging_with_keys(dir.path(), "EPA", RecordKind::Docket, &[docket("E-1")], &keys).unwrap();

        // sidecar whose staging file never landed
        std::fs::write(dir.path().join("dockets/FDA.keys.json"), br#"["orphan"]"#).unwrap();

        let found = staged_keys(dir.path(), &RecordKind::ALL).unwrap();
        assert_eq!(found.into_iter().collect::<Vec<_>>(), keys);
        assert_eq!(staging_files(dir.path(), RecordKind::Docket).unwrap().len(), 1);
    }

    #[test]
    fn test_clear_staging() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join(STAGING_DIR);
        assert!(!clear_staging(&staging).unwrap());
        write_staging(&staging, "EPA", RecordKind::Docket, &[docket("E-1")]).unwrap();
        assert!(clear_staging(&staging).unwrap());
        assert!(!staging.exists());
    }
}
