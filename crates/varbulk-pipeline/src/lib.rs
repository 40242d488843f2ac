//! varbulk Pipeline Library
//!
//! Bulk loading and exporting of variant tables in PostgreSQL.
//!
//! # Components
//!
//! - **[`StagedLoader`]**: replaces a whole table from a tab-delimited
//!   snapshot through a staging table, validated before promotion
//! - **[`BatchUpserter`]**: inserts in-memory records in chunks, skipping
//!   rows whose key already exists
//! - **[`StreamingExporter`]**: pages a query's results to a sink through a
//!   server-side cursor
//! - **[`Validator`]**: the rule set deciding whether staged data may go live
//!
//! Every operation takes a caller-owned `&mut PgConnection` and runs in its
//! own transaction on it.
//!
//! # Example
//!
//! ```no_run
//! use sqlx::{Connection, PgConnection};
//! use varbulk_common::TableName;
//! use varbulk_pipeline::{LoadOptions, StagedLoader};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut conn = PgConnection::connect("postgresql://localhost/variants").await?;
//!     let source = tokio::io::BufReader::new(tokio::fs::File::open("clinvar.tsv").await?);
//!     let target = TableName::parse("public.clinvar_variants")?;
//!
//!     let result = StagedLoader::new(LoadOptions::default())
//!         .load(&mut conn, source, &target)
//!         .await?;
//!     println!("{} rows live", result.total_rows);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod export;
pub mod loader;
pub mod schema;
pub mod source;
pub mod upsert;
pub mod validator;

pub use config::PipelineConfig;
pub use error::{ExportError, LoadError, SourceError, UpsertError};
pub use export::{ExportOptions, ExportSummary, StreamingExporter};
pub use loader::{LoadOptions, LoadResult, StagedLoader};
pub use upsert::{BatchUpserter, Record, UpsertSummary};
pub use validator::{validate, Outcome, ValidationReport, ValidationRule, Validator};
