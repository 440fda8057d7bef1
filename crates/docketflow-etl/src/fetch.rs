// Parallel fetch-and-extract stage
//
// Downloads source objects with a bounded worker pool, parses each as JSON
// and runs the kind's extractor. Per-object failures are recorded and never
// abort siblings; results come back in completion order.

use futures::stream::{self, StreamExt};
use std::time::Instant;
use tracing::{debug, warn};

use crate::error::EtlError;
use crate::record::{RecordKind, Row};
use crate::retry::RetryPolicy;
use crate::storage::SourceStore;

/// Default concurrent GETs per (agency, kind)
pub const DEFAULT_WORKERS: usize = 10;

#[derive(Debug, Clone, Copy)]
pub struct FetchOptions {
    pub workers: usize,
    pub retry: RetryPolicy,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            retry: RetryPolicy::default(),
        }
    }
}

/// Result of one fetch batch
#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub rows: Vec<Row>,
    /// Keys that produced a row; the only ones eligible for the manifest
    pub succeeded_keys: Vec<String>,
    /// Missing objects, exhausted retries or undecodable JSON
    pub failed_keys: Vec<String>,
    /// Parsed fine but the extractor rejected the document
    pub dropped_keys: Vec<String>,
}

enum ObjectOutcome {
    Row(Row),
    Dropped,
    Failed(EtlError),
}

async fn fetch_one(store: &dyn SourceStore, key: &str, kind: RecordKind, retry: &RetryPolicy) -> ObjectOutcome {
    let body = match retry.run("GET", || store.get_object(key)).await {
        Ok(Some(body)) => body,
        Ok(None) => return ObjectOutcome::Failed(EtlError::NotFound(key.to_string())),
        Err(e) => return ObjectOutcome::Failed(e),
    };

    let document: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(document) => document,
        Err(e) => return ObjectOutcome::Failed(e.into()),
    };

    match kind.extract(&document) {
        Some(row) => ObjectOutcome::Row(row),
        None => ObjectOutcome::Dropped,
    }
}

/// Fetch and extract `keys` with at most `options.workers` requests in flight
pub async fn fetch_and_extract(
    store: &dyn SourceStore,
    keys: Vec<String>,
    kind: RecordKind,
    options: &FetchOptions,
) -> FetchOutcome {
    let started = Instant::now();
    let total = keys.len();
    let retry = options.retry;

    let results: Vec<(String, ObjectOutcome)> = stream::iter(keys)
        .map(|key| async move {
            let outcome = fetch_one(store, &key, kind, &retry).await;
            (key, outcome)
        })
        .buffer_unordered(options.workers.max(1))
        .collect()
        .await;

    let mut outcome = FetchOutcome::default();
    for (key, result) in results {
        match result {
            ObjectOutcome::Row(row) => {
                outcome.rows.push(row);
                outcome.succeeded_keys.push(key);
            },
            ObjectOutcome::Dropped => {
                debug!("Dropped {}: no usable record id", key);
                outcome.dropped_keys.push(key);
            },
            ObjectOutcome::Failed(e) => {
                warn!("Failed to fetch {}: {}", key, e);
                outcome.failed_keys.push(key);
            },
        }
    }

    debug!(
        "Fetched {} {}: {} rows, {} dropped, {} failed in {:.2}s",
        total,
        kind,
        outcome.rows.len(),
        outcome.dropped_keys.len(),
        outcome.failed_keys.len(),
        started.elapsed().as_secs_f64()
    );

    outcome
}
