//! Error types for the load, upsert and export operations and their inputs
//!
//! None of these operations retry internally. Load and upsert errors always
//! mean the transaction was rolled back; export errors may leave a partial
//! artifact on the sink (see [`ExportError::rows_written`]).

use crate::validator::ValidationReport;
use thiserror::Error;
use varbulk_common::VarbulkError;

/// Failure of a staged load; the target table is unchanged
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Load into {table} rejected: {reason} ({report})")]
    Rejected {
        table: String,
        reason: String,
        report: ValidationReport,
    },

    #[error("Target table {0} does not exist")]
    TableNotFound(String),

    #[error("Target table {0} is being loaded by another session")]
    TableBusy(String),

    #[error("Source for {0} is empty; a header row is required")]
    MissingHeader(String),

    #[error("Header does not match columns of {table}: expected [{expected}], found [{found}]")]
    HeaderMismatch {
        table: String,
        expected: String,
        found: String,
    },

    #[error("Column {column} does not exist on {table}")]
    UnknownColumn { table: String, column: String },

    #[error(transparent)]
    InvalidName(#[from] VarbulkError),

    #[error("Failed to read source: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl LoadError {
    /// Validation report behind a rejection, if this was one
    pub fn report(&self) -> Option<&ValidationReport> {
        match self {
            LoadError::Rejected { report, .. } => Some(report),
            _ => None,
        }
    }
}

/// Failure of a batch upsert; every chunk of the call was rolled back
#[derive(Error, Debug)]
pub enum UpsertError {
    #[error("Record {index} has columns {found:?}, expected {expected:?}")]
    MismatchedColumns {
        index: usize,
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("Records have no columns")]
    NoColumns,

    #[error("Chunk size must be greater than 0")]
    InvalidChunkSize,

    #[error("Chunk of {chunk_size} records x {columns} columns exceeds {max} bind parameters")]
    TooManyParameters {
        chunk_size: usize,
        columns: usize,
        max: usize,
    },

    #[error("Table {0} does not exist")]
    TableNotFound(String),

    #[error("Column {column} does not exist on {table}")]
    UnknownColumn { table: String, column: String },

    #[error(transparent)]
    InvalidName(#[from] VarbulkError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Failure of a streaming export
///
/// Output written before the failure stays on the sink.
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Invalid export options: {0}")]
    InvalidOptions(String),

    #[error("Query failed after {rows_written} rows were written: {source}")]
    Database {
        rows_written: u64,
        #[source]
        source: sqlx::Error,
    },

    #[error("Writing to sink failed after {rows_written} rows: {source}")]
    Write {
        rows_written: u64,
        #[source]
        source: std::io::Error,
    },
}

impl ExportError {
    /// Rows already on the sink when the export aborted
    pub fn rows_written(&self) -> u64 {
        match self {
            ExportError::InvalidOptions(_) => 0,
            ExportError::Database { rows_written, .. } | ExportError::Write { rows_written, .. } => {
                *rows_written
            },
        }
    }

    /// Whether the sink holds a partial artifact the caller may want to discard
    pub fn is_partial(&self) -> bool {
        self.rows_written() > 0
    }
}

/// Failure reading a snapshot or record file
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed delimited input: {0}")]
    Parse(#[from] csv_async::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_names_table_and_counts() {
        let err = LoadError::Rejected {
            table: "public.variants".to_string(),
            reason: "2 rows with null identifier".to_string(),
            report: ValidationReport {
                total_rows: 10,
                null_identifiers: 2,
                unique_identifiers: 8,
            },
        };

        let message = err.to_string();
        assert!(message.contains("public.variants"));
        assert!(message.contains("2 rows with null identifier"));
        assert!(message.contains("total_rows=10"));
        assert!(message.contains("unique_identifiers=8"));
        assert_eq!(err.report().map(|r| r.null_identifiers), Some(2));
    }

    #[test]
    fn test_export_partial_flag() {
        let err = ExportError::Write {
            rows_written: 1500,
            source: std::io::Error::other("disk full"),
        };
        assert!(err.is_partial());
        assert_eq!(err.rows_written(), 1500);
        assert!(!ExportError::InvalidOptions("page_size".into()).is_partial());
    }
}
