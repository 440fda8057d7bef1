//! Arrow/Parquet helpers shared by staging, merge, manifest and optimizer

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, StringArray};
use arrow::compute::cast;
use arrow::datatypes::{DataType, SchemaRef};
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::{ParquetRecordBatchReader, ParquetRecordBatchReaderBuilder};
use parquet::arrow::{ArrowWriter, ProjectionMask};
use parquet::basic::Compression;
use parquet::file::properties::{WriterProperties, WriterVersion};

use crate::error::{EtlError, Result};
use crate::record::Row;

/// Rows per row group in merged and optimized files
pub const DEFAULT_ROW_GROUP_SIZE: usize = 100_000;

/// Rows per batch when streaming files back in
pub const READ_BATCH_SIZE: usize = 8192;

pub fn writer_properties(row_group_size: usize) -> WriterProperties {
    WriterProperties::builder()
        .set_writer_version(WriterVersion::PARQUET_2_0)
        .set_compression(Compression::ZSTD(Default::default()))
        .set_max_row_group_size(row_group_size.max(1))
        .build()
}

/// Build a batch from rows aligned with `schema`'s columns
pub fn rows_to_batch(schema: &SchemaRef, rows: &[Row]) -> Result<RecordBatch> {
    let columns: Vec<ArrayRef> = (0..schema.fields().len())
        .map(|idx| {
            let values: StringArray = rows
                .iter()
                .map(|row| row.get(idx).and_then(|cell| cell.as_deref()))
                .collect();
            Arc::new(values) as ArrayRef
        })
        .collect();

    Ok(RecordBatch::try_new(schema.clone(), columns)?)
}

/// Sibling temp path used while a file is being written
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write `batches` to `path` through a temp file, returning the row count
///
/// The destination only ever holds a complete file.
pub fn write_parquet_atomic<I>(
    path: &Path,
    schema: &SchemaRef,
    batches: I,
    props: WriterProperties,
) -> Result<usize>
where
    I: IntoIterator<Item = Result<RecordBatch>>,
{
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp = temp_path(path);
    let written = write_parquet(&tmp, schema, batches, props);
    match written {
        Ok(rows) => {
            std::fs::rename(&tmp, path)?;
            Ok(rows)
        },
        Err(e) => {
            let _ = std::fs::remove_file(&tmp);
            Err(e)
        },
    }
}

fn write_parquet<I>(path: &Path, schema: &SchemaRef, batches: I, props: WriterProperties) -> Result<usize>
where
    I: IntoIterator<Item = Result<RecordBatch>>,
{
    let file = File::create(path)?;
    let mut writer = ArrowWriter::try_new(file, schema.clone(), Some(props))?;
    let mut rows = 0;
    for batch in batches {
        let batch = batch?;
        rows += batch.num_rows();
        writer.write(&batch)?;
    }
    writer.close()?;
    Ok(rows)
}

pub fn open_reader(path: &Path) -> Result<ParquetRecordBatchReader> {
    let file = File::open(path)?;
    Ok(ParquetRecordBatchReaderBuilder::try_new(file)?
        .with_batch_size(READ_BATCH_SIZE)
        .build()?)
}

/// Stream only the named columns of `path`
pub fn open_projected_reader(path: &Path, columns: &[&str]) -> Result<ParquetRecordBatchReader> {
    let file = File::open(path)?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
    let leaves: Vec<usize> = builder
        .parquet_schema()
        .columns()
        .iter()
        .enumerate()
        .filter(|(_, column)| columns.contains(&column.name()))
        .map(|(idx, _)| idx)
        .collect();
    let mask = ProjectionMask::leaves(builder.parquet_schema(), leaves);
    Ok(builder
        .with_projection(mask)
        .with_batch_size(READ_BATCH_SIZE)
        .build()?)
}

/// Row count from the footer, without decoding data pages
pub fn row_count(path: &Path) -> Result<usize> {
    let file = File::open(path)?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
    Ok(builder.metadata().file_metadata().num_rows().max(0) as usize)
}

/// Column `name` of `batch` as Utf8, casting other string-like encodings
pub fn utf8_column(batch: &RecordBatch, name: &str) -> Result<Option<StringArray>> {
    let Some(column) = batch.column_by_name(name) else {
        return Ok(None);
    };
    let column = if column.data_type() == &DataType::Utf8 {
        column.clone()
    } else {
        cast(column, &DataType::Utf8)?
    };
    let strings = column
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| EtlError::NotFound(format!("Expected Utf8 column '{}'", name)))?;
    Ok(Some(strings.clone()))
}

/// Read one string column of a whole file
pub fn read_string_column(path: &Path, name: &str) -> Result<Vec<Option<String>>> {
    let mut values = Vec::new();
    for batch in open_projected_reader(path, &[name])? {
        let batch = batch?;
        let column = utf8_column(&batch, name)?
            .ok_or_else(|| EtlError::NotFound(format!("Column '{}' missing in {}", name, path.display())))?;
        values.extend(column.iter().map(|v| v.map(str::to_string)));
    }
    Ok(values)
}
