//! Chunked insert-if-absent of in-memory records
//!
//! Records are split into chunks of at most `chunk_size`; each chunk is one
//! multi-row `INSERT .. ON CONFLICT DO NOTHING`. All chunks of a call share
//! one transaction, so a failing chunk rolls back the whole call. Rows whose
//! unique key already exists are left untouched, which makes re-running a
//! call (or interleaving calls from several workers) safe.

use serde::Serialize;
use serde_json::Value;
use sqlx::{Connection, PgConnection, Postgres, QueryBuilder};
use tracing::{debug, info, instrument};
use varbulk_common::TableName;

use crate::error::UpsertError;
use crate::schema::{self, column_list};

/// Default number of records per INSERT statement
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Bind parameters PostgreSQL accepts in one statement
pub const MAX_BIND_PARAMS: usize = u16::MAX as usize;

/// One row keyed by column name
pub type Record = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertSummary {
    pub inserted: u64,
    /// Rows dropped because their key already existed
    pub skipped: u64,
    pub chunks: usize,
}

#[derive(Debug, Clone)]
pub struct BatchUpserter {
    chunk_size: usize,
}

impl Default for BatchUpserter {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl BatchUpserter {
    pub fn new(chunk_size: usize) -> Self {
        Self { chunk_size }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Insert `records` into `table`, ignoring key conflicts
    ///
    /// Input problems (mismatched column sets, unusable chunk size) are
    /// reported before the store is contacted.
    #[instrument(
        skip(self, conn, records, table),
        fields(table = %table, records = records.len(), chunk_size = self.chunk_size)
    )]
    pub async fn upsert(
        &self,
        conn: &mut PgConnection,
        records: &[Record],
        table: &TableName,
    ) -> Result<UpsertSummary, UpsertError> {
        let Some(columns) = shared_columns(records)? else {
            return Ok(UpsertSummary::default());
        };
        self.check_chunk_size(columns.len())?;

        let mut tx = conn.begin().await?;

        let table_columns = schema::table_columns(&mut tx, table)
            .await?
            .ok_or_else(|| UpsertError::TableNotFound(table.to_string()))?;

        let casts = columns
            .iter()
            .map(|column| {
                table_columns
                    .iter()
                    .find(|c| &c.name == column)
                    .map(|c| c.data_type.as_str())
                    .ok_or_else(|| UpsertError::UnknownColumn {
                        table: table.to_string(),
                        column: column.clone(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let total_chunks = records.len().div_ceil(self.chunk_size);
        let mut inserted = 0u64;

        for (chunk_idx, chunk) in records.chunks(self.chunk_size).enumerate() {
            let affected = insert_chunk(&mut tx, table, &columns, &casts, chunk).await?;
            inserted += affected;
            debug!(
                chunk = chunk_idx + 1,
                total_chunks,
                rows = chunk.len(),
                inserted = affected,
                "Chunk inserted"
            );
        }

        tx.commit().await?;

        let summary = UpsertSummary {
            inserted,
            skipped: records.len() as u64 - inserted,
            chunks: total_chunks,
        };
        info!(
            inserted = summary.inserted,
            skipped = summary.skipped,
            chunks = summary.chunks,
            "Upsert committed"
        );

        Ok(summary)
    }

    fn check_chunk_size(&self, columns: usize) -> Result<(), UpsertError> {
        if self.chunk_size == 0 {
            return Err(UpsertError::InvalidChunkSize);
        }
        if self.chunk_size.saturating_mul(columns) > MAX_BIND_PARAMS {
            return Err(UpsertError::TooManyParameters {
                chunk_size: self.chunk_size,
                columns,
                max: MAX_BIND_PARAMS,
            });
        }
        Ok(())
    }
}

/// Column set every record must share, or `None` for an empty batch
fn shared_columns(records: &[Record]) -> Result<Option<Vec<String>>, UpsertError> {
    let Some(first) = records.first() else {
        return Ok(None);
    };
    if first.is_empty() {
        return Err(UpsertError::NoColumns);
    }

    let expected: Vec<String> = first.keys().cloned().collect();

    for (index, record) in records.iter().enumerate().skip(1) {
        let same = record.len() == expected.len() && expected.iter().all(|k| record.contains_key(k));
        if !same {
            return Err(UpsertError::MismatchedColumns {
                index,
                expected,
                found: record.keys().cloned().collect(),
            });
        }
    }

    Ok(Some(expected))
}

async fn insert_chunk(
    conn: &mut PgConnection,
    table: &TableName,
    columns: &[String],
    casts: &[&str],
    chunk: &[Record],
) -> Result<u64, sqlx::Error> {
    let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
        "INSERT INTO {} ({}) ",
        table.quoted(),
        column_list(columns.iter().map(String::as_str))
    ));

    // values travel as text and are cast to the declared column type
    query_builder.push_values(chunk, |mut b, record| {
        for (column, cast) in columns.iter().zip(casts) {
            b.push_bind(record.get(column).and_then(value_text));
            b.push_unseparated("::");
            b.push_unseparated(*cast);
        }
    });

    query_builder.push(" ON CONFLICT DO NOTHING");

    let result = query_builder.build().execute(conn).await?;
    Ok(result.rows_affected())
}

/// Text form of a JSON value as PostgreSQL input syntax
///
/// Arrays and objects stay JSON, which suits `json`/`jsonb` columns only.
fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(_) | Value::Object(_) => Some(value.to_string()),
    }
}
