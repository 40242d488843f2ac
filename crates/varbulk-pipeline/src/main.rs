//! varbulk - bulk load, upsert and export for variant tables

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use varbulk_common::logging::{init_logging, LogConfig, LogLevel};
use varbulk_common::TableName;
use varbulk_pipeline::db::{create_pool, health_check, DbConfig};
use varbulk_pipeline::source::{read_record_file, Snapshot};
use varbulk_pipeline::{
    BatchUpserter, ExportOptions, LoadOptions, PipelineConfig, StagedLoader, StreamingExporter,
};

#[derive(Parser, Debug)]
#[command(name = "varbulk")]
#[command(author, version, about = "Bulk loader and exporter for PostgreSQL variant tables")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replace a table with the contents of a tab-delimited snapshot
    Load {
        /// Snapshot file; `.gz` files are decompressed first
        #[arg(short, long)]
        file: PathBuf,

        /// Target table, optionally schema-qualified
        #[arg(short, long)]
        table: String,

        /// Identifier column checked for nulls before promotion
        #[arg(long)]
        id_column: Option<String>,

        /// Lookup column to index after promotion (repeatable)
        #[arg(long = "index-column")]
        index_columns: Vec<String>,

        /// Do not build lookup indexes, including the identifier's
        #[arg(long)]
        no_indexes: bool,

        /// Skip ANALYZE after promotion
        #[arg(long)]
        no_analyze: bool,

        /// Per-statement timeout for the load
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Insert records from a tab-delimited file, skipping existing keys
    Upsert {
        #[arg(short, long)]
        file: PathBuf,

        #[arg(short, long)]
        table: String,

        /// Records per INSERT statement
        #[arg(long)]
        chunk_size: Option<usize>,
    },

    /// Stream a query's results to a tab-delimited file
    Export {
        #[arg(short, long)]
        output: PathBuf,

        /// SQL query to export
        #[arg(short, long, conflicts_with = "query_file", required_unless_present = "query_file")]
        query: Option<String>,

        /// File holding the SQL query
        #[arg(long)]
        query_file: Option<PathBuf>,

        /// Rows per fetch
        #[arg(long)]
        page_size: Option<usize>,

        /// Header line column (repeatable); omitted means no header
        #[arg(long = "header")]
        headers: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env().unwrap_or_default();
    if cli.verbose {
        log_config.level = LogLevel::Debug;
    }
    let _log_guard = init_logging(&log_config)?;

    let config = PipelineConfig::from_env().context("Invalid pipeline configuration")?;
    let db_config = DbConfig::from_env()?;

    let pool = create_pool(&db_config)
        .await
        .context("Failed to connect to database")?;
    health_check(&pool).await?;

    let mut conn = pool.acquire().await?;

    match cli.command {
        Command::Load {
            file,
            table,
            id_column,
            index_columns,
            no_indexes,
            no_analyze,
            timeout_secs,
        } => {
            let target = TableName::parse(&table)?;

            let options = load_options(
                &config,
                id_column,
                index_columns,
                no_indexes,
                no_analyze,
                timeout_secs,
            );

            let snapshot = Snapshot::open(&file).await?;
            let spinner = spinner(&format!("Loading {} into {}", file.display(), target));
            let result = StagedLoader::new(options)
                .load(&mut conn, snapshot.reader().await?, &target)
                .await;
            spinner.finish_and_clear();

            let result = result.with_context(|| format!("Load into {} failed", target))?;
            info!(table = %target, rows = result.total_rows, "Load complete");
            print_summary(&result)?;
        },

        Command::Upsert {
            file,
            table,
            chunk_size,
        } => {
            let target = TableName::parse(&table)?;
            let records = read_record_file(&file).await?;

            let spinner = spinner(&format!("Upserting {} records into {}", records.len(), target));
            let summary = BatchUpserter::new(chunk_size.unwrap_or(config.chunk_size))
                .upsert(&mut conn, &records, &target)
                .await;
            spinner.finish_and_clear();

            let summary = summary.with_context(|| format!("Upsert into {} failed", target))?;
            print_summary(&summary)?;
        },

        Command::Export {
            output,
            query,
            query_file,
            page_size,
            headers,
        } => {
            let query = match (query, query_file) {
                (Some(query), _) => query,
                (None, Some(path)) => tokio::fs::read_to_string(&path)
                    .await
                    .with_context(|| format!("Failed to read query file {}", path.display()))?,
                (None, None) => bail!("either --query or --query-file is required"),
            };

            let mut options = ExportOptions {
                page_size: page_size.unwrap_or(config.page_size),
                ..ExportOptions::default()
            };
            if !headers.is_empty() {
                options = options.with_headers(headers);
            }

            let spinner = spinner(&format!("Exporting to {}", output.display()));
            let summary = StreamingExporter::new(options)
                .export_to_path(&mut conn, &query, &output)
                .await;
            spinner.finish_and_clear();

            let summary = summary.with_context(|| format!("Export to {} failed", output.display()))?;
            print_summary(&summary)?;
        },
    }

    Ok(())
}

fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}") {
        pb.set_style(style);
    }
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn print_summary(summary: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(summary)?);
    Ok(())
}

/// Command-line flags layered over the environment's defaults
fn load_options(
    config: &PipelineConfig,
    id_column: Option<String>,
    index_columns: Vec<String>,
    no_indexes: bool,
    no_analyze: bool,
    timeout_secs: Option<u64>,
) -> LoadOptions {
    let mut options = config.load_options();
    if let Some(id_column) = id_column {
        options.id_column = id_column;
    }
    if !index_columns.is_empty() {
        options.index_columns = index_columns;
    }
    options.create_indexes = !no_indexes;
    options.analyze = !no_analyze;
    if let Some(secs) = timeout_secs {
        options.statement_timeout = (secs > 0).then_some(Duration::from_secs(secs));
    }
    options
}
