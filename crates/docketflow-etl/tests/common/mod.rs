//! Shared fixtures for pipeline integration tests
//!
//! Builds a small Mirrulations-shaped corpus in a [`MemoryStore`]:
//!
//! ```text
//! raw-data/{AGENCY}/{DOCKET}/text-{DOCKET}/docket/{DOCKET}.json
//! raw-data/{AGENCY}/{DOCKET}/text-{DOCKET}/documents/{ID}.json
//! raw-data/{AGENCY}/{DOCKET}/text-{DOCKET}/comments/{ID}.json
//! ```
#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::path::Path;
use std::sync::Arc;

use docketflow_etl::storage::MemoryStore;
use docketflow_etl::{Pipeline, PipelineConfig, RetryPolicy};
use serde_json::{json, Value};

pub const PREFIX: &str = "raw-data";

/// Source corpus under construction
pub struct Corpus {
    pub store: Arc<MemoryStore>,
}

impl Corpus {
    pub fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::new().with_page_size(25)),
        }
    }

    pub fn docket_key(agency: &str, docket: &str) -> String {
        format!("{PREFIX}/{agency}/{docket}/text-{docket}/docket/{docket}.json")
    }

    pub fn document_key(agency: &str, docket: &str, id: &str) -> String {
        format!("{PREFIX}/{agency}/{docket}/text-{docket}/documents/{id}.json")
    }

    pub fn comment_key(agency: &str, docket: &str, id: &str) -> String {
        format!("{PREFIX}/{agency}/{docket}/text-{docket}/comments/{id}.json")
    }

    pub fn add_docket(&self, agency: &str, docket: &str) -> String {
        let key = Self::docket_key(agency, docket);
        self.store.insert_json(
            key.clone(),
            &json!({
                "data": {
                    "id": docket,
                    "type": "dockets",
                    "attributes": {
                        "agencyId": agency,
                        "title": format!("Docket {docket}"),
                        "docketType": "Rulemaking",
                        "modifyDate": "2023-05-01T12:00:00Z",
                        "dkAbstract": "Abstract"
                    }
                }
            }),
        );
        key
    }

    pub fn add_document(&self, agency: &str, docket: &str, id: &str, title: Option<&str>) -> String {
        let key = Self::document_key(agency, docket, id);
        let mut attributes = json!({
            "agencyId": agency,
            "docketId": docket,
            "documentType": "Proposed Rule",
            "postedDate": "2023-02-10T05:00:00Z",
            "modifyDate": "2023-02-11T05:00:00Z",
            "fileFormats": [{ "fileUrl": format!("https://downloads.regulations.gov/{id}/content.pdf") }]
        });
        if let Some(title) = title {
            attributes["title"] = Value::String(title.to_string());
        }
        self.store.insert_json(
            key.clone(),
            &json!({ "data": { "id": id, "type": "documents", "attributes": attributes } }),
        );
        key
    }

    pub fn add_comment(&self, agency: &str, docket: &str, id: &str, posted: Option<&str>) -> String {
        let key = Self::comment_key(agency, docket, id);
        let mut attributes = json!({
            "agencyId": agency,
            "docketId": docket,
            "title": format!("Comment {id}"),
            "comment": "Please reconsider.",
            "documentType": "Public Submission",
            "modifyDate": "2023-06-01T00:00:00Z",
            "receiveDate": "2023-05-30T00:00:00Z"
        });
        if let Some(posted) = posted {
            attributes["postedDate"] = Value::String(posted.to_string());
        }
        self.store.insert_json(
            key.clone(),
            &json!({ "data": { "id": id, "type": "comments", "attributes": attributes } }),
        );
        key
    }

    /// EPA with 2 dockets, 5 documents and 100 comments
    ///
    /// Comments: 60 posted in 2023, 39 in 2022, one without a posted date.
    pub fn epa() -> Self {
        let corpus = Self::new();
        let dockets = ["EPA-HQ-OAR-2022-0001", "EPA-HQ-OAR-2023-0002"];
        for docket in dockets {
            corpus.add_docket("EPA", docket);
        }
        for i in 0..5 {
            let docket = dockets[i % 2];
            corpus.add_document("EPA", docket, &format!("{docket}-{:04}", i + 1), Some("Notice"));
        }
        for i in 0..100 {
            let docket = dockets[i % 2];
            let posted = match i {
                0..=59 => Some("2023-03-15T04:00:00Z"),
                60..=98 => Some("2022-11-02T04:00:00Z"),
                _ => None,
            };
            corpus.add_comment("EPA", docket, &format!("{docket}-C{:04}", i), posted);
        }
        corpus
    }
}

/// Pipeline over `corpus` with test-friendly retries and no progress bar
pub fn pipeline(corpus: &Corpus, config: PipelineConfig) -> Pipeline {
    Pipeline::new(config.with_retry(RetryPolicy::immediate(3)), corpus.store.clone()).with_progress(false)
}

/// Defaults for tests: explicit output dir, small pools, no upload
pub fn config(output_dir: &Path) -> PipelineConfig {
    PipelineConfig::new(output_dir)
        .with_workers(4)
        .with_parallel_agencies(2)
        .with_skip_upload(true)
}
