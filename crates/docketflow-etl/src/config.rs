// Pipeline run configuration

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

use crate::error::{EtlError, Result};
use crate::fetch::{FetchOptions, DEFAULT_WORKERS};
use crate::listing::DEFAULT_PREFIX;
use crate::optimize::OptimizeOptions;
use crate::record::RecordKind;
use crate::retry::RetryPolicy;

/// Default number of agencies processed concurrently
pub const DEFAULT_PARALLEL_AGENCIES: usize = 5;

/// Default number of agencies per batch slice
pub const DEFAULT_BATCH_SIZE: usize = 45;

/// A 0-indexed slice of the discovered agency list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSlice {
    pub number: usize,
    pub size: usize,
}

impl BatchSlice {
    /// Index of the first agency in this slice
    pub fn start(&self) -> usize {
        self.number.saturating_mul(self.size)
    }

    pub fn apply(&self, agencies: Vec<String>) -> Vec<String> {
        agencies.into_iter().skip(self.start()).take(self.size).collect()
    }
}

/// Normalize agency codes: trimmed, upper-cased, blanks and repeats dropped
///
/// First occurrence wins, so the caller's order is kept. Each code maps to
/// exactly one agency task and one staging file per kind.
pub fn normalize_agencies<I, S>(agencies: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    agencies
        .into_iter()
        .map(|a| a.as_ref().trim().to_uppercase())
        .filter(|a| !a.is_empty() && seen.insert(a.clone()))
        .collect()
}

/// Configuration for one pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Datasets, manifest, staging and optimized layout live here
    pub output_dir: PathBuf,

    /// Root prefix of the source corpus
    pub source_prefix: String,

    /// Record kinds processed by this run
    pub kinds: Vec<RecordKind>,

    /// Explicit agency list (None = discover from the source bucket)
    pub agencies: Option<Vec<String>>,

    /// Restrict the run to one slice of the agency list
    pub batch: Option<BatchSlice>,

    /// Concurrent GETs per (agency, kind)
    pub workers: usize,

    /// Agencies processed concurrently
    pub parallel_agencies: usize,

    /// Re-ingest the selected kinds from scratch
    pub full_refresh: bool,

    /// Merge pending staging files and stop
    pub merge_only: bool,

    /// Do not publish artifacts to the durable store
    pub skip_upload: bool,

    /// Rebuild the optimized layout after merging
    pub optimize: bool,

    pub retry: RetryPolicy,

    pub optimize_options: OptimizeOptions,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            source_prefix: DEFAULT_PREFIX.to_string(),
            kinds: RecordKind::ALL.to_vec(),
            agencies: None,
            batch: None,
            workers: DEFAULT_WORKERS,
            parallel_agencies: DEFAULT_PARALLEL_AGENCIES,
            full_refresh: false,
            merge_only: false,
            skip_upload: false,
            optimize: false,
            retry: RetryPolicy::default(),
            optimize_options: OptimizeOptions::default(),
        }
    }
}

impl PipelineConfig {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_kinds(mut self, kinds: impl IntoIterator<Item = RecordKind>) -> Self {
        let mut kinds: Vec<RecordKind> = kinds.into_iter().collect();
        kinds.sort();
        kinds.dedup();
        self.kinds = kinds;
        self
    }

    /// Everything except comments
    pub fn skip_comments(self) -> Self {
        self.with_kinds([RecordKind::Docket, RecordKind::Document])
    }

    pub fn only_comments(self) -> Self {
        self.with_kinds([RecordKind::Comment])
    }

    /// Codes are upper-cased like extracted rows; blanks and repeats are dropped
    pub fn with_agencies<I, S>(mut self, agencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.agencies = Some(normalize_agencies(agencies));
        self
    }

    pub fn with_batch(mut self, number: usize, size: usize) -> Self {
        self.batch = Some(BatchSlice { number, size });
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_parallel_agencies(mut self, parallel: usize) -> Self {
        self.parallel_agencies = parallel;
        self
    }

    pub fn with_full_refresh(mut self, full_refresh: bool) -> Self {
        self.full_refresh = full_refresh;
        self
    }

    pub fn with_merge_only(mut self, merge_only: bool) -> Self {
        self.merge_only = merge_only;
        self
    }

    pub fn with_skip_upload(mut self, skip_upload: bool) -> Self {
        self.skip_upload = skip_upload;
        self
    }

    pub fn with_optimize(mut self, optimize: bool) -> Self {
        self.optimize = optimize;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_source_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.source_prefix = prefix.into();
        self
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.output_dir.join(crate::staging::STAGING_DIR)
    }

    pub fn fetch_options(&self) -> FetchOptions {
        FetchOptions {
            workers: self.workers,
            retry: self.retry,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.output_dir.as_os_str().is_empty() {
            return Err(EtlError::config("Output directory cannot be empty"));
        }
        if self.source_prefix.trim_matches('/').is_empty() {
            return Err(EtlError::config("Source prefix cannot be empty"));
        }
        if self.kinds.is_empty() {
            return Err(EtlError::config("At least one record kind must be selected"));
        }
        if self.workers == 0 {
            return Err(EtlError::config("Workers must be greater than 0"));
        }
        if self.parallel_agencies == 0 {
            return Err(EtlError::config("Parallel agencies must be greater than 0"));
        }
        if self.retry.max_attempts == 0 {
            return Err(EtlError::config("Retry attempts must be greater than 0"));
        }
        if let Some(batch) = &self.batch {
            if batch.size == 0 {
                return Err(EtlError::config("Batch size must be greater than 0"));
            }
        }
        if self.optimize_options.row_group_size == 0 {
            return Err(EtlError::config("Row group size must be greater than 0"));
        }
        if self.optimize_options.max_year > 9999 {
            return Err(EtlError::config("Partition years must have four digits"));
        }
        if self.optimize_options.min_year > self.optimize_options.max_year {
            return Err(EtlError::config(format!(
                "Invalid year range {}..={}",
                self.optimize_options.min_year, self.optimize_options.max_year
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.workers, 10);
        assert_eq!(config.parallel_agencies, 5);
        assert_eq!(config.source_prefix, "raw-data");
        assert_eq!(config.kinds, RecordKind::ALL.to_vec());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_kind_selection() {
        let config = PipelineConfig::default().skip_comments();
        assert_eq!(config.kinds, vec![RecordKind::Docket, RecordKind::Document]);

        let config = PipelineConfig::default().only_comments();
        assert_eq!(config.kinds, vec![RecordKind::Comment]);
    }

    #[test]
    fn test_agency_normalization() {
        let config = PipelineConfig::default().with_agencies(["epa", " FDA ", ""]);
        assert_eq!(config.agencies, Some(vec!["EPA".to_string(), "FDA".to_string()]));
    }

    #[test]
    fn test_repeated_agencies_collapse() {
        let config = PipelineConfig::default().with_agencies(["FDA", "EPA", "epa", " fda", "EPA"]);
        assert_eq!(config.agencies, Some(vec!["FDA".to_string(), "EPA".to_string()]));
    }

    #[test]
    fn test_batch_slice() {
        let agencies: Vec<String> = (0..10).map(|i| format!("A{i}")).collect();
        let slice = BatchSlice { number: 1, size: 4 };
        assert_eq!(slice.apply(agencies.clone()), vec!["A4", "A5", "A6", "A7"]);

        let last = BatchSlice { number: 2, size: 4 };
        assert_eq!(last.apply(agencies.clone()), vec!["A8", "A9"]);

        let past_end = BatchSlice { number: 9, size: 4 };
        assert!(past_end.apply(agencies.clone()).is_empty());

        let huge = BatchSlice {
            number: usize::MAX,
            size: 45,
        };
        assert_eq!(huge.start(), usize::MAX);
        assert!(huge.apply(agencies).is_empty());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(PipelineConfig::default().with_workers(0).validate().is_err());
        assert!(PipelineConfig::default().with_parallel_agencies(0).validate().is_err());
        assert!(PipelineConfig::default().with_kinds(Vec::new()).validate().is_err());
        assert!(PipelineConfig::default().with_batch(0, 0).validate().is_err());
        assert!(PipelineConfig::default()
            .with_retry(RetryPolicy::immediate(0))
            .validate()
            .is_err());

        let mut five_digit_year = PipelineConfig::default();
        five_digit_year.optimize_options.max_year = 10000;
        assert!(five_digit_year.validate().is_err());
    }
}
