//! Remote object listing
//!
//! Source keys follow `{prefix}/{AGENCY}/{docket}/text-{docket}/{folder}/{id}.json`.
//! Agency discovery uses a delimiter listing so the full object list is never
//! walked; per-agency listing drives continuation tokens until exhausted.

use std::collections::{BTreeSet, HashSet};
use tracing::{debug, instrument};

use crate::error::Result;
use crate::record::RecordKind;
use crate::retry::RetryPolicy;
use crate::storage::{ListPage, ListRequest, SourceStore};

/// Default root prefix of the raw corpus
pub const DEFAULT_PREFIX: &str = "raw-data";

/// Counters for one (agency, kind) listing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListingStats {
    /// Keys matching the kind's pattern
    pub scanned: usize,
    /// Matching keys already in the manifest
    pub skipped: usize,
    pub new: usize,
}

/// Whether a source key holds a `kind` record
pub fn matches_kind(key: &str, kind: RecordKind) -> bool {
    key.contains("/text-") && key.contains(kind.folder()) && key.ends_with(".json")
}

/// Sorted, de-duplicated agency codes directly under `prefix`
#[instrument(skip(store, retry))]
pub async fn list_agencies(
    store: &dyn SourceStore,
    prefix: &str,
    retry: &RetryPolicy,
) -> Result<Vec<String>> {
    let root = format!("{}/", prefix.trim_end_matches('/'));
    let request = ListRequest::new(root.as_str()).with_delimiter("/");

    let mut agencies = BTreeSet::new();
    for_each_page(store, &request, retry, |page| {
        for common in page.common_prefixes {
            let agency = common
                .strip_prefix(&root)
                .unwrap_or(&common)
                .trim_end_matches('/');
            if !agency.is_empty() {
                agencies.insert(agency.to_string());
            }
        }
    })
    .await?;

    debug!("Discovered {} agencies under {}", agencies.len(), root);
    Ok(agencies.into_iter().collect())
}

/// Keys of `kind` records for one agency that are not yet in `manifest`
#[instrument(skip(store, manifest, retry), fields(kind = %kind))]
pub async fn list_objects(
    store: &dyn SourceStore,
    prefix: &str,
    agency: &str,
    kind: RecordKind,
    manifest: &HashSet<String>,
    retry: &RetryPolicy,
) -> Result<Vec<String>> {
    let (keys, stats) = list_objects_with_stats(store, prefix, agency, kind, manifest, retry).await?;
    debug!(
        "[{}] {}: scanned {}, skipped {}, new {}",
        agency, kind, stats.scanned, stats.skipped, stats.new
    );
    Ok(keys)
}

pub async fn list_objects_with_stats(
    store: &dyn SourceStore,
    prefix: &str,
    agency: &str,
    kind: RecordKind,
    manifest: &HashSet<String>,
    retry: &RetryPolicy,
) -> Result<(Vec<String>, ListingStats)> {
    let request = ListRequest::new(format!("{}/{}/", prefix.trim_end_matches('/'), agency));

    let mut keys = Vec::new();
    let mut stats = ListingStats::default();
    for_each_page(store, &request, retry, |page| {
        for key in page.keys {
            if !matches_kind(&key, kind) {
                continue;
            }
            stats.scanned += 1;
            if manifest.contains(&key) {
                stats.skipped += 1;
            } else {
                keys.push(key);
            }
        }
    })
    .await?;

    stats.new = keys.len();
    Ok((keys, stats))
}

/// Drive continuation tokens until the listing is exhausted, retrying each
/// page independently.
async fn for_each_page<F>(
    store: &dyn SourceStore,
    first: &ListRequest,
    retry: &RetryPolicy,
    mut visit: F,
) -> Result<()>
where
    F: FnMut(ListPage),
{
    let mut request = first.clone();
    let mut pages = 0usize;

    loop {
        let page = retry
            .run("LIST", || store.list_page(&request))
            .await?;
        pages += 1;

        let next = page.next.clone();
        visit(page);

        match next {
            Some(token) => request = first.after(token),
            None => break,
        }
    }

    debug!("Listed {} in {} page(s)", first.prefix, pages);
    Ok(())
}
