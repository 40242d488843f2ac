//! Shared PostgreSQL container harness for varbulk integration tests
//!
//! These tests require Docker. Run with:
//!
//! ```bash
//! cargo test -p varbulk-pipeline -- --ignored --nocapture
//! ```

#![allow(dead_code)]

use anyhow::{Context, Result};
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres as PgDb};
use std::time::Duration;
use testcontainers::{core::IntoContainerPort, runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tracing::{debug, info};

/// Plain variant table; no constraints, so null identifiers reach validation
pub const VARIANTS_DDL: &str = "CREATE TABLE variants (
    id bigint,
    gene_symbol text,
    clinical_significance text
)";

/// Keyed variant table for conflict-skipping inserts
pub const KEYED_VARIANTS_DDL: &str = "CREATE TABLE keyed_variants (
    id bigint PRIMARY KEY,
    gene_symbol text,
    clinical_significance text
)";

pub const VARIANTS_HEADER: &str = "id\tgene_symbol\tclinical_significance\n";

pub struct TestPostgres {
    _container: ContainerAsync<Postgres>,
    pool: PgPool,
}

impl TestPostgres {
    pub async fn start() -> Result<Self> {
        info!("Starting PostgreSQL test container...");

        let container = Postgres::default()
            .with_tag("16-alpine")
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container
            .get_host()
            .await
            .context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432.tcp())
            .await
            .context("Failed to get container port")?;

        let connection_string =
            format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);
        debug!("PostgreSQL connection: {}", connection_string);

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&connection_string)
            .await
            .context("Failed to connect to PostgreSQL")?;

        Ok(Self {
            _container: container,
            pool,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn conn(&self) -> Result<PoolConnection<PgDb>> {
        self.pool.acquire().await.context("Failed to acquire connection")
    }

    pub async fn execute(&self, sql: &str) -> Result<()> {
        sqlx::raw_sql(sql)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to execute: {sql}"))?;
        Ok(())
    }

    /// `id, gene_symbol, clinical_significance` of `table`, ordered by id
    pub async fn variant_rows(
        &self,
        table: &str,
    ) -> Result<Vec<(Option<i64>, Option<String>, Option<String>)>> {
        let sql = format!(
            "SELECT id, gene_symbol, clinical_significance FROM {table} ORDER BY id NULLS FIRST"
        );
        sqlx::query_as(&sql)
            .fetch_all(&self.pool)
            .await
            .context("Failed to read variant rows")
    }

    pub async fn count(&self, table: &str) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {table}");
        sqlx::query_scalar(&sql)
            .fetch_one(&self.pool)
            .await
            .context("Failed to count rows")
    }

    pub async fn index_names(&self, table: &str) -> Result<Vec<String>> {
        sqlx::query_scalar(
            "SELECT indexname::text FROM pg_indexes WHERE tablename = $1 ORDER BY indexname",
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list indexes")
    }
}

/// Tab-delimited variant snapshot with a header line
pub fn variant_snapshot(rows: &[(&str, &str, &str)]) -> String {
    let mut out = VARIANTS_HEADER.to_string();
    for (id, gene, significance) in rows {
        out.push_str(&format!("{id}\t{gene}\t{significance}\n"));
    }
    out
}

pub fn init_test_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,varbulk_pipeline=debug,sqlx=warn,testcontainers=info")
        }))
        .with_test_writer()
        .try_init();
}
