//! Pipeline configuration
//!
//! Defaults for the CLI, read from the environment (after `.env` is loaded).
//! Command-line flags override anything set here.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::export::DEFAULT_PAGE_SIZE;
use crate::loader::{LoadOptions, DEFAULT_ID_COLUMN};
use crate::upsert::{DEFAULT_CHUNK_SIZE, MAX_BIND_PARAMS};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Records per upsert statement
    pub chunk_size: usize,

    /// Rows per export fetch
    pub page_size: usize,

    /// Identifier column checked before promotion
    pub id_column: String,

    /// Lookup columns indexed after promotion, besides the identifier
    pub index_columns: Vec<String>,

    /// Upper bound on any single statement of a load
    pub statement_timeout_secs: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            page_size: DEFAULT_PAGE_SIZE,
            id_column: DEFAULT_ID_COLUMN.to_string(),
            index_columns: Vec::new(),
            statement_timeout_secs: None,
        }
    }
}

impl PipelineConfig {
    /// Read `VARBULK_*` variables; unset ones keep their defaults
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(value) = var("VARBULK_CHUNK_SIZE") {
            config.chunk_size = value
                .parse()
                .with_context(|| format!("VARBULK_CHUNK_SIZE is not a number: {value}"))?;
        }
        if let Some(value) = var("VARBULK_PAGE_SIZE") {
            config.page_size = value
                .parse()
                .with_context(|| format!("VARBULK_PAGE_SIZE is not a number: {value}"))?;
        }
        if let Some(value) = var("VARBULK_ID_COLUMN") {
            config.id_column = value.trim().to_string();
        }
        if let Some(value) = var("VARBULK_INDEX_COLUMNS") {
            config.index_columns = value
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(value) = var("VARBULK_STATEMENT_TIMEOUT_SECS") {
            let secs: u64 = value.parse().with_context(|| {
                format!("VARBULK_STATEMENT_TIMEOUT_SECS is not a number: {value}")
            })?;
            config.statement_timeout_secs = (secs > 0).then_some(secs);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            bail!("chunk_size must be greater than 0");
        }
        if self.chunk_size > MAX_BIND_PARAMS {
            bail!(
                "chunk_size {} exceeds the {} bind parameter limit",
                self.chunk_size,
                MAX_BIND_PARAMS
            );
        }
        if self.page_size == 0 {
            bail!("page_size must be greater than 0");
        }
        if self.id_column.is_empty() {
            bail!("id_column must not be empty");
        }
        Ok(())
    }

    /// Load options seeded from this configuration
    ///
    /// The identifier lookup index is always requested; `index_columns` adds
    /// to it.
    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            id_column: self.id_column.clone(),
            create_indexes: true,
            index_columns: self.index_columns.clone(),
            statement_timeout: self.statement_timeout_secs.map(Duration::from_secs),
            ..LoadOptions::default()
        }
    }
}
