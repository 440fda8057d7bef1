//! Docketflow ETL - Mirrulations S3 to Parquet

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use docketflow_common::logging::{init_logging, LogConfig, LogLevel};
use docketflow_etl::storage::{ArtifactStore, PublicUrlStore, S3Config, S3Store};
use docketflow_etl::{Pipeline, PipelineConfig, RecordKind, RunSummary};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "docketflow-etl")]
#[command(author, version, about = "Mirrulations S3 to Parquet ETL")]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    run: RunArgs,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the incremental pipeline (default)
    Run(RunArgs),

    /// Merge pending staging files into the datasets and exit
    Merge(CommonArgs),

    /// Rebuild the optimized layout from local datasets
    Optimize {
        #[command(flatten)]
        common: CommonArgs,

        /// Do not publish the optimized layout
        #[arg(long)]
        skip_upload: bool,
    },
}

#[derive(Args, Debug, Clone)]
struct CommonArgs {
    /// Output directory
    #[arg(short, long, env = "OUTPUT_DIR", default_value = "./output")]
    output_dir: PathBuf,

    /// Skip comments
    #[arg(long, conflicts_with = "only_comments")]
    skip_comments: bool,

    /// Only process comments
    #[arg(long)]
    only_comments: bool,

    /// Record kinds to process (comma-separated: dockets,documents,comments)
    #[arg(long, value_delimiter = ',', conflicts_with_all = ["skip_comments", "only_comments"])]
    kinds: Vec<RecordKind>,
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Top-level prefix of the source bucket
    #[arg(long, env = "SOURCE_PREFIX", default_value = docketflow_etl::listing::DEFAULT_PREFIX)]
    source_prefix: String,

    /// Agencies to process (comma-separated)
    #[arg(short, long = "agency", env = "AGENCIES", value_delimiter = ',')]
    agencies: Vec<String>,

    /// Skip upload to the durable store
    #[arg(long)]
    skip_upload: bool,

    /// Re-ingest the selected kinds, ignoring the manifest
    #[arg(long)]
    full_refresh: bool,

    /// Parallel downloads per agency
    #[arg(long, default_value_t = docketflow_etl::fetch::DEFAULT_WORKERS)]
    workers: usize,

    /// Agencies processed in parallel
    #[arg(long, default_value_t = docketflow_etl::config::DEFAULT_PARALLEL_AGENCIES)]
    parallel_agencies: usize,

    /// Batch number (0-indexed) of the discovered agency list
    #[arg(long)]
    batch_number: Option<usize>,

    /// Agencies per batch
    #[arg(long, default_value_t = docketflow_etl::config::DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// Rebuild the optimized layout after merging
    #[arg(long)]
    optimize: bool,

    /// Write the run summary as JSON to this path
    #[arg(long)]
    summary_json: Option<PathBuf>,
}

impl CommonArgs {
    fn config(&self) -> PipelineConfig {
        let config = PipelineConfig::new(&self.output_dir);
        if !self.kinds.is_empty() {
            config.with_kinds(self.kinds.iter().copied())
        } else if self.skip_comments {
            config.skip_comments()
        } else if self.only_comments {
            config.only_comments()
        } else {
            config
        }
    }
}

impl RunArgs {
    fn config(&self) -> PipelineConfig {
        let mut config = self
            .common
            .config()
            .with_source_prefix(&self.source_prefix)
            .with_workers(self.workers)
            .with_parallel_agencies(self.parallel_agencies)
            .with_full_refresh(self.full_refresh)
            .with_skip_upload(self.skip_upload)
            .with_optimize(self.optimize);
        if !self.agencies.is_empty() {
            config = config.with_agencies(&self.agencies);
        }
        if let Some(number) = self.batch_number {
            config = config.with_batch(number, self.batch_size);
        }
        config
    }
}

/// Read side and write side of the durable store
///
/// Credentials give both; a public URL alone only allows resuming.
async fn durable_stores() -> Result<(Option<Arc<dyn ArtifactStore>>, Option<Arc<dyn ArtifactStore>>)> {
    if let Some(config) = S3Config::durable_from_env() {
        let store: Arc<dyn ArtifactStore> = Arc::new(
            S3Store::new(config)
                .await
                .context("Failed to initialize durable store")?,
        );
        return Ok((Some(store.clone()), Some(store)));
    }

    match std::env::var("R2_PUBLIC_URL") {
        Ok(url) if !url.trim().is_empty() => {
            info!("Durable store credentials missing, resuming from {}", url);
            let store: Arc<dyn ArtifactStore> = Arc::new(PublicUrlStore::new(url));
            Ok((Some(store), None))
        },
        _ => {
            warn!("No durable store configured; starting from local state only");
            Ok((None, None))
        },
    }
}

async fn build_pipeline(config: PipelineConfig) -> Result<Pipeline> {
    let source = S3Store::new(S3Config::source_from_env())
        .await
        .context("Failed to initialize source store")?;
    let (artifacts, publisher) = durable_stores().await?;

    let mut pipeline = Pipeline::new(config, Arc::new(source));
    if let Some(store) = artifacts {
        pipeline = pipeline.with_artifacts(store);
    }
    if let Some(store) = publisher {
        pipeline = pipeline.with_publisher(store);
    }
    Ok(pipeline)
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Initialize logging based on verbose flag
    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("docketflow-etl".to_string())
        .filter_directives("aws_smithy_runtime=warn,aws_config=warn,hyper=warn")
        .build()
        // Environment variables take precedence
        .merge_env()?;

    let _guard = init_logging(&log_config)?;

    let (summary, summary_json): (RunSummary, Option<PathBuf>) = match cli.command {
        Some(Command::Merge(common)) => {
            let config = common.config().with_merge_only(true).with_skip_upload(true);
            let pipeline = build_pipeline(config).await?;
            (pipeline.run().await.context("Merge failed")?, None)
        },
        Some(Command::Optimize { common, skip_upload }) => {
            let config = common.config().with_skip_upload(skip_upload);
            let pipeline = build_pipeline(config).await?;
            (pipeline.run_optimize().await.context("Optimize failed")?, None)
        },
        Some(Command::Run(args)) => {
            let pipeline = build_pipeline(args.config()).await?;
            (pipeline.run().await.context("Pipeline failed")?, args.summary_json)
        },
        None => {
            let pipeline = build_pipeline(cli.run.config()).await?;
            (pipeline.run().await.context("Pipeline failed")?, cli.run.summary_json)
        },
    };

    if let Some(path) = summary_json {
        summary
            .write_json(&path)
            .with_context(|| format!("Failed to write summary to {}", path.display()))?;
        info!("Summary written to {}", path.display());
    }

    info!("Done!");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use docketflow_etl::BatchSlice;

    #[test]
    fn test_default_command_is_run() {
        let cli = Cli::try_parse_from(["docketflow-etl", "--agency", "epa,fda", "--batch-number", "2"]).unwrap();
        assert!(cli.command.is_none());

        let config = cli.run.config();
        assert_eq!(config.agencies, Some(vec!["EPA".to_string(), "FDA".to_string()]));
        assert_eq!(config.batch, Some(BatchSlice { number: 2, size: 45 }));
        assert_eq!(config.workers, 10);
        assert_eq!(config.source_prefix, "raw-data");
        assert!(!config.full_refresh);
    }

    #[test]
    fn test_source_prefix_flag() {
        let cli = Cli::try_parse_from(["docketflow-etl", "run", "--source-prefix", "mirror/raw-data"]).unwrap();
        let Some(Command::Run(args)) = cli.command else {
            panic!("expected run subcommand");
        };
        let config = args.config();
        assert_eq!(config.source_prefix, "mirror/raw-data");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_repeated_agency_flags_collapse() {
        let cli = Cli::try_parse_from(["docketflow-etl", "--agency", "EPA,epa", "--agency", "FDA"]).unwrap();
        assert_eq!(
            cli.run.config().agencies,
            Some(vec!["EPA".to_string(), "FDA".to_string()])
        );
    }

    #[test]
    fn test_kind_selection_flags() {
        let cli = Cli::try_parse_from(["docketflow-etl", "run", "--kinds", "comments,dockets"]).unwrap();
        let Some(Command::Run(args)) = cli.command else {
            panic!("expected run subcommand");
        };
        assert_eq!(args.config().kinds, vec![RecordKind::Docket, RecordKind::Comment]);

        assert!(Cli::try_parse_from(["docketflow-etl", "--skip-comments", "--only-comments"]).is_err());
        assert!(Cli::try_parse_from(["docketflow-etl", "--kinds", "attachments"]).is_err());
    }

    #[test]
    fn test_merge_subcommand() {
        let cli = Cli::try_parse_from(["docketflow-etl", "merge", "--output-dir", "/tmp/out", "--only-comments"]).unwrap();
        let Some(Command::Merge(common)) = cli.command else {
            panic!("expected merge subcommand");
        };
        let config = common.config();
        assert_eq!(config.output_dir, PathBuf::from("/tmp/out"));
        assert_eq!(config.kinds, vec![RecordKind::Comment]);
    }
}
