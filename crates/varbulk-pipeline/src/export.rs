//! Paged, constant-memory export of query results
//!
//! The query runs behind a server-side `NO SCROLL` cursor inside a
//! `READ ONLY` transaction. Pages of `page_size` rows are fetched, encoded
//! in the same tab-delimited dialect `COPY ... TO` produces, written to the
//! sink and flushed before the next fetch.

use serde::Serialize;
use sqlx::{Connection, PgConnection, Row};
use std::io;
use std::path::Path;
use std::time::Instant;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, instrument, warn};

use crate::error::ExportError;

/// Rows requested per `FETCH`
pub const DEFAULT_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportOptions {
    pub page_size: usize,
    /// Write `headers` as the first line
    pub include_headers: bool,
    /// Header line written verbatim; not checked against the query's columns
    pub headers: Vec<String>,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            include_headers: false,
            headers: Vec::new(),
        }
    }
}

impl ExportOptions {
    /// Options that emit `headers` before the first row
    pub fn with_headers(mut self, headers: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.headers = headers.into_iter().map(Into::into).collect();
        self.include_headers = true;
        self
    }

    pub fn validate(&self) -> Result<(), ExportError> {
        if self.page_size == 0 {
            return Err(ExportError::InvalidOptions(
                "page_size must be greater than 0".to_string(),
            ));
        }
        if self.include_headers && self.headers.is_empty() {
            return Err(ExportError::InvalidOptions(
                "include_headers is set but no headers were given".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExportSummary {
    pub rows_written: u64,
    /// `FETCH` round trips, including the final short page
    pub pages_fetched: u64,
}

#[derive(Debug, Clone, Default)]
pub struct StreamingExporter {
    options: ExportOptions,
}

impl StreamingExporter {
    pub fn new(options: ExportOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ExportOptions {
        &self.options
    }

    /// Stream the result of `query` to `sink`
    ///
    /// `query` is trusted SQL and must be a single row-returning statement.
    /// On error whatever was already written stays on the sink.
    #[instrument(skip(self, conn, query, sink), fields(page_size = self.options.page_size))]
    pub async fn export<W>(
        &self,
        conn: &mut PgConnection,
        query: &str,
        sink: W,
    ) -> Result<ExportSummary, ExportError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        self.options.validate()?;
        let query = normalize_query(query)?;

        let started = Instant::now();
        let mut summary = ExportSummary::default();
        let mut sink_touched = false;

        match self
            .stream(conn, query, sink, &mut summary, &mut sink_touched)
            .await
        {
            Ok(()) => {
                info!(
                    rows = summary.rows_written,
                    pages = summary.pages_fetched,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Export complete"
                );
                Ok(summary)
            },
            Err(err) => {
                if sink_touched {
                    warn!(
                        rows_written = err.rows_written(),
                        error = %err,
                        "Export aborted; sink holds a partial artifact"
                    );
                }
                Err(err)
            },
        }
    }

    /// Create (or truncate) `path` and export into it
    pub async fn export_to_path(
        &self,
        conn: &mut PgConnection,
        query: &str,
        path: impl AsRef<Path>,
    ) -> Result<ExportSummary, ExportError> {
        self.options.validate()?;

        let file = tokio::fs::File::create(path.as_ref())
            .await
            .map_err(|source| ExportError::Write {
                rows_written: 0,
                source,
            })?;

        self.export(conn, query, file).await
    }

    async fn stream<W>(
        &self,
        conn: &mut PgConnection,
        query: &str,
        mut sink: W,
        summary: &mut ExportSummary,
        sink_touched: &mut bool,
    ) -> Result<(), ExportError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let page_size = self.options.page_size;
        let cursor = cursor_name();

        let mut tx = conn.begin().await.map_err(db_error(0))?;

        let declare = format!(
            "SET TRANSACTION READ ONLY; DECLARE {cursor} NO SCROLL CURSOR FOR {query}"
        );
        sqlx::raw_sql(&declare)
            .execute(&mut *tx)
            .await
            .map_err(db_error(0))?;
        debug!(%cursor, "Cursor declared");

        let mut page = Vec::new();
        let mut fields: Vec<Option<String>> = Vec::new();

        if self.options.include_headers {
            let headers: Vec<Option<&str>> =
                self.options.headers.iter().map(|h| Some(h.as_str())).collect();
            encode_record(&headers, &mut page);
            *sink_touched = true;
            sink.write_all(&page).await.map_err(write_error(0))?;
        }

        let fetch = format!("FETCH FORWARD {page_size} FROM {cursor}");

        loop {
            // simple protocol: every value arrives in its text form
            let rows = sqlx::raw_sql(&fetch)
                .fetch_all(&mut *tx)
                .await
                .map_err(db_error(summary.rows_written))?;
            summary.pages_fetched += 1;

            let fetched = rows.len();
            page.clear();
            for row in rows {
                fields.clear();
                for i in 0..row.len() {
                    let value: Option<String> = row
                        .try_get_unchecked(i)
                        .map_err(db_error(summary.rows_written))?;
                    fields.push(value);
                }
                encode_record(&fields, &mut page);
            }

            if !page.is_empty() {
                *sink_touched = true;
                sink.write_all(&page)
                    .await
                    .map_err(write_error(summary.rows_written))?;
            }
            sink.flush().await.map_err(write_error(summary.rows_written))?;
            summary.rows_written += fetched as u64;

            debug!(
                page = summary.pages_fetched,
                rows = fetched,
                total = summary.rows_written,
                "Page written"
            );

            if fetched < page_size {
                break;
            }
        }

        let close = format!("CLOSE {cursor}");
        sqlx::raw_sql(&close)
            .execute(&mut *tx)
            .await
            .map_err(db_error(summary.rows_written))?;
        tx.commit().await.map_err(db_error(summary.rows_written))?;

        Ok(())
    }
}

/// Strip trailing terminators; `DECLARE .. FOR` takes a bare statement
fn normalize_query(query: &str) -> Result<&str, ExportError> {
    let query = query.trim().trim_end_matches(|c: char| c == ';' || c.is_whitespace());
    if query.is_empty() {
        return Err(ExportError::InvalidOptions("query is empty".to_string()));
    }
    Ok(query)
}

fn cursor_name() -> String {
    format!("varbulk_export_{}", uuid::Uuid::new_v4().simple())
}

fn db_error(rows_written: u64) -> impl FnOnce(sqlx::Error) -> ExportError {
    move |source| ExportError::Database {
        rows_written,
        source,
    }
}

fn write_error(rows_written: u64) -> impl FnOnce(io::Error) -> ExportError {
    move |source| ExportError::Write {
        rows_written,
        source,
    }
}

/// Append one line in the COPY csv dialect
///
/// NULL is an empty unquoted field and `''` is written as `""`, so the two
/// survive a reload through `StagedLoader`.
fn encode_record<S: AsRef<str>>(fields: &[Option<S>], out: &mut Vec<u8>) {
    let single = fields.len() == 1;
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.push(b'\t');
        }
        let Some(value) = field else { continue };
        let value: &str = value.as_ref();
        if needs_quotes(value, single) {
            out.push(b'"');
            for byte in value.bytes() {
                if byte == b'"' {
                    out.push(b'"');
                }
                out.push(byte);
            }
            out.push(b'"');
        } else {
            out.extend_from_slice(value.as_bytes());
        }
    }
    out.push(b'\n');
}

fn needs_quotes(value: &str, single: bool) -> bool {
    // a lone `\.` line would read back as end-of-data
    value.is_empty()
        || value.bytes().any(|b| matches!(b, b'\t' | b'"' | b'\r' | b'\n'))
        || (single && value == "\\.")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_valid() {
        let options = ExportOptions::default();
        assert_eq!(options.page_size, DEFAULT_PAGE_SIZE);
        assert!(!options.include_headers);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_headers_required_when_included() {
        let options = ExportOptions {
            include_headers: true,
            ..ExportOptions::default()
        };
        assert!(matches!(options.validate(), Err(ExportError::InvalidOptions(_))));

        let options = ExportOptions::default().with_headers(["id", "gene_symbol"]);
        assert!(options.include_headers);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_zero_page_size_rejected() {
        let options = ExportOptions {
            page_size: 0,
            ..ExportOptions::default()
        };
        assert!(matches!(options.validate(), Err(ExportError::InvalidOptions(_))));
    }

    #[test]
    fn test_normalize_query() {
        assert_eq!(
            normalize_query("  SELECT * FROM variants ;\n").unwrap(),
            "SELECT * FROM variants"
        );
        assert_eq!(normalize_query("SELECT 1;;").unwrap(), "SELECT 1");
        assert!(normalize_query(" ; ").is_err());
        assert!(normalize_query("").is_err());
    }

    #[test]
    fn test_cursor_names_unique() {
        let a = cursor_name();
        let b = cursor_name();
        assert_ne!(a, b);
        assert!(a.starts_with("varbulk_export_"));
        assert!(a.len() <= varbulk_common::types::MAX_IDENTIFIER_LEN);
    }

    #[test]
    fn test_write_error_keeps_io_source() {
        let err = write_error(7)(io::Error::other("broken pipe"));
        assert_eq!(err.rows_written(), 7);
        assert!(matches!(err, ExportError::Write { .. }));
    }

    fn encoded(fields: &[Option<&str>]) -> String {
        let mut out = Vec::new();
        encode_record(fields, &mut out);
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_null_and_empty_string_differ() {
        assert_eq!(encoded(&[None]), "\n");
        assert_eq!(encoded(&[Some("")]), "\"\"\n");
        assert_eq!(encoded(&[Some("a"), None, Some("")]), "a\t\t\"\"\n");
        assert_eq!(encoded(&[None, None]), "\t\n");
    }

    #[test]
    fn test_special_characters_quoted() {
        assert_eq!(encoded(&[Some("say \"hi\"")]), "\"say \"\"hi\"\"\"\n");
        assert_eq!(encoded(&[Some("tab\there"), Some("1")]), "\"tab\there\"\t1\n");
        assert_eq!(encoded(&[Some("two\nlines")]), "\"two\nlines\"\n");
        assert_eq!(encoded(&[Some("cr\r")]), "\"cr\r\"\n");
        assert_eq!(encoded(&[Some("Benign, likely")]), "Benign, likely\n");
    }

    #[test]
    fn test_end_of_data_marker_quoted_when_alone() {
        assert_eq!(encoded(&[Some("\\.")]), "\"\\.\"\n");
        assert_eq!(encoded(&[Some("\\."), Some("1")]), "\\.\t1\n");
    }
}
