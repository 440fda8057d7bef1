// Agency orchestrator
//
// One run walks LOAD_MANIFEST -> DISCOVER_AGENCIES -> PROCESS_AGENCIES
// -> MERGE_STAGING -> SAVE_MANIFEST -> OPTIMIZE -> UPLOAD.
//
// Agencies are processed in parallel with buffer_unordered; each agency runs
// in its own spawned task so a panic is contained to that agency. The merge
// only starts once every agency task has finished, and the manifest is only
// saved once the merge has succeeded.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

use crate::config::{normalize_agencies, PipelineConfig};
use crate::error::{EtlError, Result};
use crate::fetch::{fetch_and_extract, FetchOptions};
use crate::listing::{list_agencies, list_objects};
use crate::manifest::ManifestStore;
use crate::merge::{merge_all, MergeReport};
use crate::optimize::{optimize_all, OptimizeReport};
use crate::record::RecordKind;
use crate::staging::{clear_staging, staged_keys, write_staging_with_keys};
use crate::storage::{ArtifactStore, SourceStore};
use crate::upload::{download_existing, publish};

/// Counters shared by the agency tasks
///
/// Updated once per (agency, kind) after the staging file is on disk, so the
/// keys recorded here always have their rows staged.
#[derive(Debug, Default)]
pub struct RunTally {
    pub rows_per_kind: BTreeMap<RecordKind, usize>,
    pub new_keys: Vec<String>,
    pub failed_keys: usize,
    pub dropped_keys: usize,
}

impl RunTally {
    pub fn record(&mut self, kind: RecordKind, rows: usize, keys: Vec<String>, failed: usize, dropped: usize) {
        *self.rows_per_kind.entry(kind).or_default() += rows;
        self.new_keys.extend(keys);
        self.failed_keys += failed;
        self.dropped_keys += dropped;
    }

    pub fn staged_rows(&self) -> usize {
        self.rows_per_kind.values().sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AgencyFailure {
    pub agency: String,
    pub error: String,
}

/// End-of-run report
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub agencies: usize,
    pub rows_per_kind: BTreeMap<RecordKind, usize>,
    pub new_keys: usize,
    pub failed_keys: usize,
    pub dropped_keys: usize,
    pub failed_agencies: Vec<AgencyFailure>,
    pub merged: Vec<MergeReport>,
    pub manifest_keys: Option<usize>,
    pub optimized: Option<OptimizeReport>,
    pub uploaded: Vec<String>,
    pub upload_failures: Vec<(String, String)>,
}

impl RunSummary {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            finished_at: started_at,
            agencies: 0,
            rows_per_kind: BTreeMap::new(),
            new_keys: 0,
            failed_keys: 0,
            dropped_keys: 0,
            failed_agencies: Vec::new(),
            merged: Vec::new(),
            manifest_keys: None,
            optimized: None,
            uploaded: Vec::new(),
            upload_failures: Vec::new(),
        }
    }

    fn finish(mut self) -> Self {
        self.finished_at = Utc::now();
        self
    }

    pub fn rows(&self, kind: RecordKind) -> usize {
        self.rows_per_kind.get(&kind).copied().unwrap_or(0)
    }

    /// Human-readable report logged at the end of a run
    pub fn render(&self) -> String {
        let mut lines = vec!["Run Summary:".to_string()];
        lines.push(format!("- Agencies processed: {}", self.agencies));
        for kind in RecordKind::ALL {
            if let Some(rows) = self.rows_per_kind.get(&kind) {
                lines.push(format!("- {}: {} rows", kind, rows));
            }
        }
        lines.push(format!("- New files processed: {}", self.new_keys));
        if self.failed_keys > 0 || self.dropped_keys > 0 {
            lines.push(format!(
                "- Failed files: {} (dropped records: {})",
                self.failed_keys, self.dropped_keys
            ));
        }
        for failure in &self.failed_agencies {
            lines.push(format!("- Failed agency {}: {}", failure.agency, failure.error));
        }
        for report in &self.merged {
            lines.push(format!("- Merged {}: {} total rows", report.kind, report.rows));
        }
        if let Some(keys) = self.manifest_keys {
            lines.push(format!("- Manifest keys: {}", keys));
        }
        if let Some(optimized) = &self.optimized {
            if let Some(comments) = &optimized.comments {
                lines.push(format!(
                    "- Optimized comments: {} rows in {} partitions",
                    comments.total_rows,
                    comments.partitions.len()
                ));
            }
            for (kind, rows) in &optimized.sorted {
                lines.push(format!("- Optimized {}: {} rows sorted", kind, rows));
            }
        }
        if !self.uploaded.is_empty() || !self.upload_failures.is_empty() {
            lines.push(format!(
                "- Uploaded: {} ({} failed)",
                self.uploaded.len(),
                self.upload_failures.len()
            ));
        }
        let elapsed = self.finished_at - self.started_at;
        lines.push(format!(
            "- Completed in {:.1}s",
            elapsed.num_milliseconds() as f64 / 1000.0
        ));
        lines.join("\n")
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

/// Everything one agency task needs, owned so it can be spawned
#[derive(Clone)]
struct AgencyJob {
    source: Arc<dyn SourceStore>,
    manifest: Arc<HashSet<String>>,
    tally: Arc<Mutex<RunTally>>,
    prefix: String,
    kinds: Vec<RecordKind>,
    staging_dir: PathBuf,
    fetch: FetchOptions,
}

impl AgencyJob {
    async fn run(self, agency: String) -> Result<usize> {
        let mut staged = 0;
        for &kind in &self.kinds {
            let keys = list_objects(
                self.source.as_ref(),
                &self.prefix,
                &agency,
                kind,
                &self.manifest,
                &self.fetch.retry,
            )
            .await?;
            if keys.is_empty() {
                continue;
            }

            let outcome = fetch_and_extract(self.source.as_ref(), keys, kind, &self.fetch).await;
            let failed = outcome.failed_keys.len();
            let dropped = outcome.dropped_keys.len();
            let succeeded = outcome.succeeded_keys;
            let rows = outcome.rows;

            let staging_dir = self.staging_dir.clone();
            let agency_code = agency.clone();
            let (rows, succeeded) = tokio::task::spawn_blocking(move || -> Result<(usize, Vec<String>)> {
                let written = write_staging_with_keys(&staging_dir, &agency_code, kind, &rows, &succeeded)?;
                Ok((written, succeeded))
            })
            .await??;

            info!(agency = %agency, kind = %kind, rows, failed, dropped, "Staged rows");
            staged += rows;

            {
                let mut tally = self
                    .tally
                    .lock()
                    .map_err(|_| EtlError::Task("run tally lock poisoned".to_string()))?;
                tally.record(kind, rows, succeeded, failed, dropped);
            }
        }
        Ok(staged)
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    source: Arc<dyn SourceStore>,
    /// Read side of the durable store (manifest and dataset restore)
    artifacts: Option<Arc<dyn ArtifactStore>>,
    /// Write side of the durable store
    publisher: Option<Arc<dyn ArtifactStore>>,
    progress: bool,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, source: Arc<dyn SourceStore>) -> Self {
        Self {
            config,
            source,
            artifacts: None,
            publisher: None,
            progress: true,
        }
    }

    pub fn with_artifacts(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = Some(store);
        self
    }

    pub fn with_publisher(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.publisher = Some(store);
        self
    }

    /// Durable store used for both restore and publish
    pub fn with_durable_store(self, store: Arc<dyn ArtifactStore>) -> Self {
        self.with_artifacts(store.clone()).with_publisher(store)
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn manifest_store(&self) -> ManifestStore {
        ManifestStore::new(&self.config.output_dir, self.artifacts.clone())
    }

    /// Run the full pipeline
    pub async fn run(&self) -> Result<RunSummary> {
        self.config.validate()?;
        let mut summary = RunSummary::new(Utc::now());
        let output_dir = self.config.output_dir.clone();
        let staging_dir = self.config.staging_dir();
        let kinds = self.config.kinds.clone();
        tokio::fs::create_dir_all(&output_dir).await?;

        info!("Output directory: {}", output_dir.display());

        if self.config.merge_only {
            return self.merge_staged(summary).await;
        }

        let stale = staging_dir.clone();
        if tokio::task::spawn_blocking(move || clear_staging(&stale)).await?? {
            warn!("Removed stale staging files from an interrupted run");
        }

        // LOAD_MANIFEST
        let manifest_store = self.manifest_store();
        let previous = manifest_store.load().await?;
        let manifest = if self.config.full_refresh {
            let kept: HashSet<String> = previous
                .iter()
                .filter(|key| !RecordKind::from_key(key).is_some_and(|kind| kinds.contains(&kind)))
                .cloned()
                .collect();
            info!(
                "Full refresh: ignoring {} manifest keys of the selected kinds",
                previous.len() - kept.len()
            );
            kept
        } else {
            if !previous.is_empty() {
                if let Some(remote) = &self.artifacts {
                    download_existing(remote.as_ref(), &output_dir, &kinds).await?;
                }
            }
            previous.clone()
        };

        // DISCOVER_AGENCIES
        let agencies = self.resolve_agencies().await?;
        summary.agencies = agencies.len();
        if agencies.is_empty() {
            warn!("No agencies to process!");
            return Ok(summary.finish());
        }

        // PROCESS_AGENCIES
        info!(
            "Processing {} agencies (parallel={}, workers={})",
            agencies.len(),
            self.config.parallel_agencies,
            self.config.workers
        );
        let tally = Arc::new(Mutex::new(RunTally::default()));
        summary.failed_agencies = self.process_agencies(agencies, Arc::new(manifest), tally.clone()).await;

        let tally = {
            let mut guard = tally
                .lock()
                .map_err(|_| EtlError::Task("run tally lock poisoned".to_string()))?;
            std::mem::take(&mut *guard)
        };
        summary.rows_per_kind = tally.rows_per_kind.clone();
        summary.new_keys = tally.new_keys.len();
        summary.failed_keys = tally.failed_keys;
        summary.dropped_keys = tally.dropped_keys;

        // MERGE_STAGING
        if tally.staged_rows() > 0 {
            info!("Merging staging files...");
            let include_existing = !self.config.full_refresh;
            let (staging, out, merge_kinds) = (staging_dir.clone(), output_dir.clone(), kinds.clone());
            summary.merged =
                tokio::task::spawn_blocking(move || merge_all(&staging, &out, &merge_kinds, include_existing))
                    .await??;

            let cleanup = staging_dir.clone();
            tokio::task::spawn_blocking(move || clear_staging(&cleanup)).await??;
            info!("Cleaned up staging directory");
        }

        // SAVE_MANIFEST
        if !tally.new_keys.is_empty() {
            let mut keys = if self.config.full_refresh {
                let replaced: HashSet<RecordKind> = summary.merged.iter().map(|report| report.kind).collect();
                previous
                    .into_iter()
                    .filter(|key| !RecordKind::from_key(key).is_some_and(|kind| replaced.contains(&kind)))
                    .collect()
            } else {
                previous
            };
            keys.extend(tally.new_keys);
            manifest_store.save(&keys).await?;
            summary.manifest_keys = Some(keys.len());
        }

        self.finish_run(summary).await
    }

    /// Merge whatever is staged, record its keys and stop
    async fn merge_staged(&self, mut summary: RunSummary) -> Result<RunSummary> {
        info!("Merge-only mode - merging existing staging files...");
        let staging_dir = self.config.staging_dir();
        let output_dir = self.config.output_dir.clone();
        let kinds = self.config.kinds.clone();

        let (staging, read_kinds) = (staging_dir.clone(), kinds.clone());
        let pending = tokio::task::spawn_blocking(move || staged_keys(&staging, &read_kinds)).await??;

        let (staging, out) = (staging_dir.clone(), output_dir.clone());
        summary.merged = tokio::task::spawn_blocking(move || merge_all(&staging, &out, &kinds, true)).await??;
        summary.new_keys = pending.len();

        if !pending.is_empty() {
            let manifest_store = self.manifest_store();
            let mut keys = manifest_store.load().await?;
            keys.extend(pending);
            manifest_store.save(&keys).await?;
            summary.manifest_keys = Some(keys.len());
        }

        info!("Merge complete!");
        let summary = summary.finish();
        info!("{}", summary.render());
        Ok(summary)
    }

    /// Optional OPTIMIZE and UPLOAD stages shared by every mode that
    /// produces datasets
    async fn finish_run(&self, mut summary: RunSummary) -> Result<RunSummary> {
        if self.config.optimize && summary.optimized.is_none() {
            summary.optimized = Some(self.optimize().await?);
        }

        if !self.config.skip_upload {
            match &self.publisher {
                Some(publisher) => {
                    info!("Uploading to durable store...");
                    let report = publish(
                        publisher.as_ref(),
                        &self.config.output_dir,
                        &self.config.kinds,
                        summary.optimized.is_some(),
                    )
                    .await;
                    summary.uploaded = report.uploaded;
                    summary.upload_failures = report.failures;
                },
                None => warn!("Skipping upload (durable store credentials not configured)"),
            }
        }

        let summary = summary.finish();
        info!("{}", summary.render());
        Ok(summary)
    }

    /// Rebuild the optimized layout from existing local datasets, then
    /// publish unless uploads are skipped
    pub async fn run_optimize(&self) -> Result<RunSummary> {
        self.config.validate()?;
        let mut summary = RunSummary::new(Utc::now());
        summary.optimized = Some(self.optimize().await?);
        self.finish_run(summary).await
    }

    /// Rebuild the optimized layout from the local datasets
    pub async fn optimize(&self) -> Result<OptimizeReport> {
        info!("Rebuilding optimized layout...");
        let output_dir = self.config.output_dir.clone();
        let options = self.config.optimize_options;
        tokio::task::spawn_blocking(move || optimize_all(&output_dir, &options)).await?
    }

    async fn resolve_agencies(&self) -> Result<Vec<String>> {
        let agencies = match &self.config.agencies {
            Some(agencies) => normalize_agencies(agencies),
            None => {
                info!("Fetching agency list...");
                let agencies =
                    list_agencies(self.source.as_ref(), &self.config.source_prefix, &self.config.retry).await?;
                info!("Found {} agencies", agencies.len());
                agencies
            },
        };

        Ok(match self.config.batch {
            Some(batch) => {
                let sliced = batch.apply(agencies);
                info!(
                    "Batch {}: agencies {}..{} ({} agencies)",
                    batch.number,
                    batch.start(),
                    batch.start().saturating_add(sliced.len()),
                    sliced.len()
                );
                sliced
            },
            None => agencies,
        })
    }

    /// Process agencies in parallel using buffer_unordered
    async fn process_agencies(
        &self,
        agencies: Vec<String>,
        manifest: Arc<HashSet<String>>,
        tally: Arc<Mutex<RunTally>>,
    ) -> Vec<AgencyFailure> {
        let total = agencies.len();
        let progress = self.progress_bar(total as u64);
        let job = AgencyJob {
            source: self.source.clone(),
            manifest,
            tally,
            prefix: self.config.source_prefix.clone(),
            kinds: self.config.kinds.clone(),
            staging_dir: self.config.staging_dir(),
            fetch: self.config.fetch_options(),
        };

        let results: Vec<(String, Result<usize>)> = stream::iter(agencies)
            .map(|agency| {
                let job = job.clone();
                let progress = progress.clone();
                async move {
                    let handle = tokio::spawn(job.run(agency.clone()));
                    let result = match handle.await {
                        Ok(result) => result,
                        Err(e) => Err(EtlError::from(e)),
                    };
                    progress.inc(1);
                    progress.set_message(agency.clone());
                    (agency, result)
                }
            })
            .buffer_unordered(self.config.parallel_agencies.max(1))
            .collect()
            .await;
        progress.finish_and_clear();

        let mut failures = Vec::new();
        for (agency, result) in results {
            if let Err(e) = result {
                error!(agency = %agency, error = %e, "✗ Agency failed");
                failures.push(AgencyFailure {
                    agency,
                    error: e.to_string(),
                });
            }
        }
        failures.sort_by(|a, b| a.agency.cmp(&b.agency));

        info!(
            "Parallel processing complete: {} / {} agencies successful",
            total - failures.len(),
            total
        );
        failures
    }

    fn progress_bar(&self, total: u64) -> ProgressBar {
        if !self.progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(total);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} agencies {msg}")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        pb
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_tally_accumulates() {
        let mut tally = RunTally::default();
        tally.record(RecordKind::Comment, 3, vec!["a".into(), "b".into(), "c".into()], 1, 0);
        tally.record(RecordKind::Comment, 2, vec!["d".into(), "e".into()], 0, 1);
        tally.record(RecordKind::Docket, 1, vec!["f".into()], 0, 0);

        assert_eq!(tally.rows_per_kind[&RecordKind::Comment], 5);
        assert_eq!(tally.staged_rows(), 6);
        assert_eq!(tally.new_keys.len(), 6);
        assert_eq!(tally.failed_keys, 1);
        assert_eq!(tally.dropped_keys, 1);
    }

    #[test]
    fn test_render_summary() {
        let mut summary = RunSummary::new(Utc::now());
        summary.agencies = 2;
        summary.rows_per_kind.insert(RecordKind::Docket, 2);
        summary.rows_per_kind.insert(RecordKind::Comment, 100);
        summary.new_keys = 102;
        summary.failed_agencies.push(AgencyFailure {
            agency: "FDA".into(),
            error: "listing failed".into(),
        });
        summary.manifest_keys = Some(102);

        let text = summary.finish().render();
        assert!(text.contains("Agencies processed: 2"));
        assert!(text.contains("dockets: 2 rows"));
        assert!(text.contains("comments: 100 rows"));
        assert!(text.contains("New files processed: 102"));
        assert!(text.contains("Failed agency FDA: listing failed"));
        assert!(text.contains("Manifest keys: 102"));
    }

    #[test]
    fn test_summary_serializes_kind_keys() {
        let mut summary = RunSummary::new(Utc::now());
        summary.rows_per_kind.insert(RecordKind::Document, 5);
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["rows_per_kind"]["document"], 5);
    }
}
