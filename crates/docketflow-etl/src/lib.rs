//! Docketflow ETL Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Incremental extraction of the Mirrulations regulatory corpus into three
//! columnar datasets (dockets, documents, comments).
//!
//! # Pipeline
//!
//! - **Listing**: enumerate agencies and JSON objects in the source bucket,
//!   skipping keys already recorded in the manifest
//! - **Fetch**: bounded-concurrency GET + JSON parse + field extraction
//! - **Staging**: one Parquet file per (agency, kind)
//! - **Merge**: streaming merge of staging files into the published datasets
//! - **Manifest**: the set of processed source keys, saved after the merge
//! - **Optimize**: year-partitioned comments, sorted dockets and documents
//! - **Upload**: publish artifacts to the durable store
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use docketflow_etl::{Pipeline, PipelineConfig};
//! use docketflow_etl::storage::{S3Config, S3Store};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let source = S3Store::new(S3Config::source_from_env()).await?;
//!     let config = PipelineConfig::new("./output")
//!         .with_agencies(["EPA"])
//!         .with_skip_upload(true);
//!
//!     let summary = Pipeline::new(config, Arc::new(source)).run().await?;
//!     println!("{}", summary.render());
//!     Ok(())
//! }
//! ```

pub mod columnar;
pub mod config;
pub mod error;
pub mod fetch;
pub mod listing;
pub mod manifest;
pub mod merge;
pub mod optimize;
pub mod orchestrator;
pub mod record;
pub mod retry;
pub mod staging;
pub mod storage;
pub mod upload;

pub use config::{BatchSlice, PipelineConfig};
pub use error::{EtlError, Result};
pub use optimize::OptimizeOptions;
pub use orchestrator::{Pipeline, RunSummary};
pub use record::{RecordKind, Row};
pub use retry::RetryPolicy;
