//! Read-optimized layout
//!
//! ```text
//! optimized/
//!   dockets.parquet                 sorted by (agency_code, modify_date)
//!   documents.parquet               sorted by (agency_code, posted_date)
//!   comments/
//!     year=2023/data_0.parquet      sorted by (agency_code, docket_id, posted_date)
//!     year=other/data_0.parquet     null, malformed or out-of-range dates
//! ```
//!
//! Comments are partitioned one year at a time so peak memory is a single
//! year's rows. The whole layout is rebuilt on every run and swapped in.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use arrow::array::{BooleanArray, StringArray};
use arrow::compute::{concat_batches, filter_record_batch, lexsort_to_indices, take, SortColumn, SortOptions};
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::columnar::{
    open_projected_reader, open_reader, utf8_column, write_parquet_atomic, writer_properties,
    DEFAULT_ROW_GROUP_SIZE,
};
use crate::error::Result;
use crate::merge::conform_batch;
use crate::record::RecordKind;

pub const OPTIMIZED_DIR: &str = "optimized";
pub const OTHER_PARTITION: &str = "other";

const COMMENT_SORT: &[&str] = &["agency_code", "docket_id", "posted_date"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizeOptions {
    pub row_group_size: usize,
    /// Inclusive bounds of a valid partition year
    pub min_year: u16,
    pub max_year: u16,
}

impl Default for OptimizeOptions {
    fn default() -> Self {
        Self {
            row_group_size: DEFAULT_ROW_GROUP_SIZE,
            min_year: 2000,
            max_year: 2030,
        }
    }
}

impl OptimizeOptions {
    /// Parse a 4-character prefix as a partition year
    pub fn valid_year(&self, prefix: &str) -> Option<u16> {
        if prefix.len() != 4 || !prefix.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let year: u16 = prefix.parse().ok()?;
        (self.min_year..=self.max_year).contains(&year).then_some(year)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PartitionReport {
    /// (partition label, rows) in write order
    pub partitions: Vec<(String, usize)>,
    pub total_rows: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OptimizeReport {
    pub comments: Option<PartitionReport>,
    /// (dataset, rows) for sorted copies
    pub sorted: Vec<(RecordKind, usize)>,
}

fn year_prefix(date: &str) -> Option<&str> {
    date.get(..4)
}

/// Stable ascending sort by `columns`, nulls last
pub fn sort_batch(batch: &RecordBatch, columns: &[&str]) -> Result<RecordBatch> {
    if batch.num_rows() <= 1 {
        return Ok(batch.clone());
    }

    let options = SortOptions {
        descending: false,
        nulls_first: false,
    };
    let sort_columns: Vec<SortColumn> = columns
        .iter()
        .filter_map(|name| batch.column_by_name(name))
        .map(|values| SortColumn {
            values: values.clone(),
            options: Some(options),
        })
        .collect();
    if sort_columns.is_empty() {
        return Ok(batch.clone());
    }

    let indices = lexsort_to_indices(&sort_columns, None)?;
    let sorted = batch
        .columns()
        .iter()
        .map(|column| take(column.as_ref(), &indices, None))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(RecordBatch::try_new(batch.schema(), sorted)?)
}

/// Distinct 4-character `posted_date` prefixes that are valid years
fn discover_years(merged_file: &Path, options: &OptimizeOptions) -> Result<BTreeSet<u16>> {
    let mut years = BTreeSet::new();
    let mut prefixes = BTreeSet::new();
    for batch in open_projected_reader(merged_file, &["posted_date"])? {
        let batch = batch?;
        let Some(dates) = utf8_column(&batch, "posted_date")? else {
            continue;
        };
        for date in dates.iter().flatten() {
            if let Some(prefix) = year_prefix(date) {
                if prefixes.insert(prefix.to_string()) {
                    if let Some(year) = options.valid_year(prefix) {
                        years.insert(year);
                    }
                }
            }
        }
    }
    debug!("Found {} distinct date prefixes, {} valid years", prefixes.len(), years.len());
    Ok(years)
}

/// Stream `merged_file` and keep rows whose `posted_date` passes `keep`
fn collect_matching<F>(merged_file: &Path, schema: &SchemaRef, keep: F) -> Result<RecordBatch>
where
    F: Fn(Option<&str>) -> bool,
{
    let mut selected = Vec::new();
    for batch in open_reader(merged_file)? {
        let batch = conform_batch(&batch?, schema)?;
        let dates = utf8_column(&batch, "posted_date")?
            .unwrap_or_else(|| StringArray::new_null(batch.num_rows()));
        let mask: BooleanArray = dates.iter().map(|date| Some(keep(date))).collect();
        let filtered = filter_record_batch(&batch, &mask)?;
        if filtered.num_rows() > 0 {
            selected.push(filtered);
        }
    }
    Ok(concat_batches(schema, &selected)?)
}

fn write_partition(dir: &Path, label: &str, table: &RecordBatch, options: &OptimizeOptions) -> Result<usize> {
    let path = dir.join(format!("year={}", label)).join("data_0.parquet");
    let sorted = sort_batch(table, COMMENT_SORT)?;
    write_parquet_atomic(
        &path,
        &sorted.schema(),
        [Ok(sorted)],
        writer_properties(options.row_group_size),
    )
}

/// Rebuild the year-partitioned comments layout at `out_dir`
pub fn partition_comments(
    merged_file: &Path,
    out_dir: &Path,
    options: &OptimizeOptions,
) -> Result<PartitionReport> {
    let schema = RecordKind::Comment.schema();
    let building = sibling(out_dir, "building");
    if building.exists() {
        std::fs::remove_dir_all(&building)?;
    }
    std::fs::create_dir_all(&building)?;

    let years = discover_years(merged_file, options)?;
    let mut report = PartitionReport::default();

    for year in &years {
        let label = format!("{:04}", year);
        let table = collect_matching(merged_file, &schema, |date| {
            date.and_then(year_prefix) == Some(label.as_str())
        })?;
        let rows = write_partition(&building, &label, &table, options)?;
        info!("Partition year={}: {} rows", label, rows);
        report.partitions.push((label, rows));
        report.total_rows += rows;
    }

    let other = collect_matching(merged_file, &schema, |date| {
        !date
            .and_then(year_prefix)
            .and_then(|prefix| options.valid_year(prefix))
            .is_some_and(|year| years.contains(&year))
    })?;
    if other.num_rows() > 0 {
        let rows = write_partition(&building, OTHER_PARTITION, &other, options)?;
        info!("Partition year={}: {} rows", OTHER_PARTITION, rows);
        report.partitions.push((OTHER_PARTITION.to_string(), rows));
        report.total_rows += rows;
    }

    swap_dir(&building, out_dir)?;
    Ok(report)
}

/// Rewrite a whole dataset sorted by (agency_code, kind's date column)
pub fn sort_dataset(
    kind: RecordKind,
    merged_file: &Path,
    out_file: &Path,
    options: &OptimizeOptions,
) -> Result<usize> {
    let schema = kind.schema();
    let mut batches = Vec::new();
    for batch in open_reader(merged_file)? {
        batches.push(conform_batch(&batch?, &schema)?);
    }
    let table = concat_batches(&schema, &batches)?;
    drop(batches);

    let sorted = sort_batch(&table, &["agency_code", kind.sort_date_column()])?;
    let rows = write_parquet_atomic(out_file, &schema, [Ok(sorted)], writer_properties(options.row_group_size))?;
    info!("Sorted {}: {} rows", kind, rows);
    Ok(rows)
}

/// Rebuild `{output_dir}/optimized` from whichever datasets exist
pub fn optimize_all(output_dir: &Path, options: &OptimizeOptions) -> Result<OptimizeReport> {
    let optimized = output_dir.join(OPTIMIZED_DIR);
    std::fs::create_dir_all(&optimized)?;
    let mut report = OptimizeReport::default();

    for kind in RecordKind::ALL {
        let merged = output_dir.join(kind.file_name());
        if !merged.is_file() {
            debug!("No {} dataset to optimize", kind);
            continue;
        }
        match kind {
            RecordKind::Comment => {
                report.comments = Some(partition_comments(&merged, &optimized.join(kind.name()), options)?);
            },
            RecordKind::Docket | RecordKind::Document => {
                let rows = sort_dataset(kind, &merged, &optimized.join(kind.file_name()), options)?;
                report.sorted.push((kind, rows));
            },
        }
    }

    Ok(report)
}

fn sibling(dir: &Path, suffix: &str) -> PathBuf {
    let mut name = dir.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".{}", suffix));
    dir.with_file_name(name)
}

/// Replace `target` with `fresh`, keeping the old tree until the rename lands
fn swap_dir(fresh: &Path, target: &Path) -> Result<()> {
    let retired = sibling(target, "old");
    if retired.exists() {
        std::fs::remove_dir_all(&retired)?;
    }
    if target.exists() {
        std::fs::rename(target, &retired)?;
    }
    std::fs::rename(fresh, target)?;
    if retired.exists() {
        std::fs::remove_dir_all(&retired)?;
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::columnar::{read_string_column, row_count, rows_to_batch};
    use crate::record::Row;

    fn comment(id: &str, agency: &str, docket: &str, posted: Option<&str>) -> Row {
        vec![
            Some(id.into()),
            Some(docket.into()),
            Some(agency.into()),
            None,
            Some("text".into()),
            Some("Public Submission".into()),
            posted.map(str::to_string),
            None,
            None,
        ]
    }

    fn write_comments(path: &Path, rows: &[Row]) {
        let schema = RecordKind::Comment.schema();
        let batch = rows_to_batch(&schema, rows).unwrap();
        write_parquet_atomic(path, &schema, [Ok(batch)], writer_properties(100)).unwrap();
    }

    #[test]
    fn test_valid_year() {
        let options = OptimizeOptions::default();
        assert_eq!(options.valid_year("2023"), Some(2023));
        assert_eq!(options.valid_year("1999"), None);
        assert_eq!(options.valid_year("2031"), None);
        assert_eq!(options.valid_year("20x3"), None);
        assert_eq!(options.valid_year("202"), None);
    }

    #[test]
    fn test_every_comment_lands_in_exactly_one_partition() {
        let dir = tempfile::tempdir().unwrap();
        let merged = dir.path().join("comments.parquet");
        write_comments(
            &merged,
            &[
                comment("C-1", "FDA", "FDA-1", Some("2023-05-01T00:00:00Z")),
                comment("C-2", "EPA", "EPA-2", Some("2023-01-01T00:00:00Z")),
                comment("C-3", "EPA", "EPA-1", Some("2023-03-01T00:00:00Z")),
                comment("C-4", "EPA", "EPA-1", Some("2021-12-31T23:59:59Z")),
                comment("C-5", "EPA", "EPA-1", None),
                comment("C-6", "EPA", "EPA-1", Some("garbage")),
                comment("C-7", "EPA", "EPA-1", Some("1987-01-01")),
                comment("C-8", "EPA", "EPA-1", Some("2023")),
            ],
        );

        let out = dir.path().join("optimized/comments");
        let report = partition_comments(&merged, &out, &OptimizeOptions::default()).unwrap();

        assert_eq!(report.total_rows, 8);
        assert_eq!(
            report.partitions,
            vec![("2021".to_string(), 1), ("2023".to_string(), 4), ("other".to_string(), 3)]
        );

        let year_2023 = out.join("year=2023/data_0.parquet");
        let dates = read_string_column(&year_2023, "posted_date").unwrap();
        assert!(dates.iter().all(|d| d.as_deref().is_some_and(|d| d.starts_with("2023"))));

        // sorted by (agency_code, docket_id, posted_date)
        let ids = read_string_column(&year_2023, "comment_id").unwrap();
        assert_eq!(
            ids,
            vec![Some("C-8".into()), Some("C-3".into()), Some("C-2".into()), Some("C-1".into())]
        );

        let other = read_string_column(&out.join("year=other/data_0.parquet"), "comment_id").unwrap();
        let mut other: Vec<String> = other.into_iter().flatten().collect();
        other.sort();
        assert_eq!(other, vec!["C-5", "C-6", "C-7"]);
    }

    #[test]
    fn test_last_four_digit_year_keeps_its_rows() {
        let dir = tempfile::tempdir().unwrap();
        let merged = dir.path().join("comments.parquet");
        write_comments(
            &merged,
            &[
                comment("C-1", "EPA", "EPA-1", Some("9999-12-31")),
                comment("C-2", "EPA", "EPA-1", Some("9998-01-01")),
            ],
        );
        let options = OptimizeOptions {
            min_year: 9998,
            max_year: 9999,
            ..OptimizeOptions::default()
        };

        let report = partition_comments(&merged, &dir.path().join("comments"), &options).unwrap();

        assert_eq!(
            report.partitions,
            vec![("9998".to_string(), 1), ("9999".to_string(), 1)]
        );
        assert_eq!(report.total_rows, 2);
    }

    #[test]
    fn test_rebuild_replaces_previous_layout() {
        let dir = tempfile::tempdir().unwrap();
        let merged = dir.path().join("comments.parquet");
        let out = dir.path().join("optimized/comments");

        write_comments(&merged, &[comment("C-1", "EPA", "E", Some("2019-01-01"))]);
        partition_comments(&merged, &out, &OptimizeOptions::default()).unwrap();
        assert!(out.join("year=2019").exists());

        write_comments(&merged, &[comment("C-2", "EPA", "E", Some("2020-01-01"))]);
        partition_comments(&merged, &out, &OptimizeOptions::default()).unwrap();
        assert!(!out.join("year=2019").exists());
        assert_eq!(row_count(&out.join("year=2020/data_0.parquet")).unwrap(), 1);
        assert!(!sibling(&out, "building").exists());
        assert!(!sibling(&out, "old").exists());
    }

    #[test]
    fn test_sort_dataset_orders_dockets() {
        let dir = tempfile::tempdir().unwrap();
        let merged = dir.path().join("dockets.parquet");
        let schema = RecordKind::Docket.schema();
        let rows: Vec<Row> = vec![
            vec![Some("F-1".into()), Some("FDA".into()), None, None, Some("2020".into()), None],
            vec![Some("E-2".into()), Some("EPA".into()), None, None, None, None],
            vec![Some("E-1".into()), Some("EPA".into()), None, None, Some("2021".into()), None],
        ];
        let batch = rows_to_batch(&schema, &rows).unwrap();
        write_parquet_atomic(&merged, &schema, [Ok(batch)], writer_properties(100)).unwrap();

        let out = dir.path().join("optimized/dockets.parquet");
        let rows = sort_dataset(RecordKind::Docket, &merged, &out, &OptimizeOptions::default()).unwrap();
        assert_eq!(rows, 3);
        assert_eq!(
            read_string_column(&out, "docket_id").unwrap(),
            vec![Some("E-1".into()), Some("E-2".into()), Some("F-1".into())]
        );
    }

    #[test]
    fn test_optimize_all_skips_missing_datasets() {
        let dir = tempfile::tempdir().unwrap();
        write_comments(
            &dir.path().join("comments.parquet"),
            &[comment("C-1", "EPA", "E", Some("2022-02-02"))],
        );

        let report = optimize_all(dir.path(), &OptimizeOptions::default()).unwrap();
        assert_eq!(report.comments.unwrap().total_rows, 1);
        assert!(report.sorted.is_empty());
        assert!(dir
            .path()
            .join("optimized/comments/year=2022/data_0.parquet")
            .exists());
    }
}
