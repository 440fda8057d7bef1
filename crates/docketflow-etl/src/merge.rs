//! Streaming merge of staging files into the per-kind datasets
//!
//! Inputs are streamed one batch at a time into a single `ArrowWriter`, so
//! memory stays bounded by the batch size rather than the dataset. Every
//! batch is conformed to the kind's declared schema first:
//!
//! - columns missing from an older file are filled with nulls,
//! - string-like columns with another encoding (e.g. `LargeUtf8`) are cast,
//! - columns are emitted in declared order, unknown columns are dropped.
//!
//! The result goes to `{kind}_merged.parquet` and is renamed over the dataset
//! only after the writer is closed. Until then the previous dataset is
//! untouched.

use std::fs::File;
use std::path::{Path, PathBuf};

use arrow::array::{new_null_array, ArrayRef};
use arrow::compute::cast;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::columnar::{open_reader, row_count, writer_properties, DEFAULT_ROW_GROUP_SIZE};
use crate::error::{EtlError, Result};
use crate::record::RecordKind;
use crate::staging::{discard_staged, staging_files};

#[derive(Debug, Clone, Serialize)]
pub struct MergeReport {
    pub kind: RecordKind,
    /// Staging files consumed
    pub staged_files: usize,
    /// Whether the previous dataset was part of the merge
    pub included_existing: bool,
    /// Rows in the dataset after the merge
    pub rows: usize,
    pub output: PathBuf,
}

/// Reshape `batch` to exactly `target`'s columns and types
pub fn conform_batch(batch: &RecordBatch, target: &SchemaRef) -> Result<RecordBatch> {
    let rows = batch.num_rows();
    let columns = target
        .fields()
        .iter()
        .map(|field| -> Result<ArrayRef> {
            match batch.column_by_name(field.name()) {
                Some(column) if column.data_type() == field.data_type() => Ok(column.clone()),
                Some(column) => Ok(cast(column, field.data_type())?),
                None => Ok(new_null_array(field.data_type(), rows)),
            }
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(RecordBatch::try_new(target.clone(), columns)?)
}

pub fn merged_temp_path(output_dir: &Path, kind: RecordKind) -> PathBuf {
    output_dir.join(format!("{}_merged.parquet", kind.name()))
}

/// Merge pending staging files of `kind` into `{output_dir}/{kind}.parquet`
///
/// Returns `None` when nothing is staged. With `include_existing` unset the
/// current dataset is replaced instead of extended. A read error on any
/// input aborts the merge with [`EtlError::Merge`], leaving the dataset and
/// the staging files as they were.
pub fn merge_kind(
    staging_dir: &Path,
    output_dir: &Path,
    kind: RecordKind,
    include_existing: bool,
) -> Result<Option<MergeReport>> {
    let staged = staging_files(staging_dir, kind)?;
    if staged.is_empty() {
        return Ok(None);
    }

    std::fs::create_dir_all(output_dir)?;
    let output = output_dir.join(kind.file_name());
    let with_existing = include_existing && output.is_file();

    info!("Merging {} staging files for {}...", staged.len(), kind);

    let rows = if staged.len() == 1 && !with_existing {
        std::fs::rename(&staged[0], &output)?;
        discard_staged(&staged[0])?;
        let rows = row_count(&output)?;
        info!("{}: moved single file ({} rows)", kind, rows);
        rows
    } else {
        let mut inputs = Vec::with_capacity(staged.len() + 1);
        if with_existing {
            inputs.push(output.clone());
        }
        inputs.extend(staged.iter().cloned());

        let temp = merged_temp_path(output_dir, kind);
        let rows = match stream_inputs(&temp, kind, &inputs) {
            Ok(rows) => rows,
            Err(e) => {
                let _ = std::fs::remove_file(&temp);
                return Err(e);
            },
        };

        std::fs::rename(&temp, &output)?;
        for file in &staged {
            if let Err(e) = discard_staged(file) {
                warn!("Failed to remove merged staging file {}: {}", file.display(), e);
            }
        }
        info!("{}: merged {} total rows", kind, rows);
        rows
    };

    Ok(Some(MergeReport {
        kind,
        staged_files: staged.len(),
        included_existing: with_existing,
        rows,
        output,
    }))
}

fn stream_inputs(temp: &Path, kind: RecordKind, inputs: &[PathBuf]) -> Result<usize> {
    let target = kind.schema();
    let file = File::create(temp)?;
    let mut writer = ArrowWriter::try_new(file, target.clone(), Some(writer_properties(DEFAULT_ROW_GROUP_SIZE)))?;

    let mut total = 0;
    for path in inputs {
        let read_error = |source: EtlError| EtlError::Merge {
            kind,
            path: path.clone(),
            source: Box::new(source),
        };

        let reader = open_reader(path).map_err(read_error)?;
        let mut file_rows = 0;
        for batch in reader {
            let batch = batch.map_err(|e| read_error(e.into()))?;
            let batch = conform_batch(&batch, &target).map_err(read_error)?;
            file_rows += batch.num_rows();
            writer.write(&batch)?;
        }
        debug!("{}: appended {} rows from {}", kind, file_rows, path.display());
        total += file_rows;
    }

    writer.close()?;
    Ok(total)
}

/// Merge each kind in turn
///
/// Stops at the first failing kind. The staging directory is removed once
/// every kind merged and nothing is left in it.
pub fn merge_all(
    staging_dir: &Path,
    output_dir: &Path,
    kinds: &[RecordKind],
    include_existing: bool,
) -> Result<Vec<MergeReport>> {
    let mut reports = Vec::new();
    for &kind in kinds {
        if let Some(report) = merge_kind(staging_dir, output_dir, kind, include_existing)? {
            reports.push(report);
        }
        let _ = std::fs::remove_dir(staging_dir.join(kind.name()));
    }

    if staging_dir.is_dir() && std::fs::remove_dir(staging_dir).is_err() {
        debug!("Staging directory {} still holds files", staging_dir.display());
    }
    Ok(reports)
}
