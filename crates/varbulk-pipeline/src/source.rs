//! Snapshot files and record files read by the CLI
//!
//! Gzip snapshots (`*.gz`) are decompressed once into a temporary file so
//! the loader can stream plain bytes into `COPY`.

use flate2::read::MultiGzDecoder;
use futures::StreamExt;
use serde_json::Value;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use tokio::fs::File;
use tokio::io::{AsyncRead, BufReader};
use tracing::{debug, info};

use crate::error::SourceError;
use crate::upsert::Record;

/// A readable snapshot on disk
///
/// Holds the decompressed temporary copy, if any, until dropped.
#[derive(Debug)]
pub struct Snapshot {
    origin: PathBuf,
    readable: PathBuf,
    _decompressed: Option<TempPath>,
}

impl Snapshot {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let origin = path.as_ref().to_path_buf();

        tokio::fs::metadata(&origin)
            .await
            .map_err(|source| io_error(&origin, source))?;

        if !is_gzip(&origin) {
            return Ok(Self {
                readable: origin.clone(),
                origin,
                _decompressed: None,
            });
        }

        let src = origin.clone();
        let temp = tokio::task::spawn_blocking(move || decompress_to_temp(&src))
            .await
            .map_err(|e| io_error(&origin, io::Error::other(e.to_string())))?
            .map_err(|source| io_error(&origin, source))?;

        info!(
            source = %origin.display(),
            decompressed = %temp.display(),
            "Decompressed gzip snapshot"
        );

        Ok(Self {
            readable: temp.to_path_buf(),
            origin,
            _decompressed: Some(temp),
        })
    }

    /// Path the snapshot was opened from
    pub fn origin(&self) -> &Path {
        &self.origin
    }

    pub async fn reader(&self) -> Result<BufReader<File>, SourceError> {
        let file = File::open(&self.readable)
            .await
            .map_err(|source| io_error(&self.origin, source))?;
        Ok(BufReader::new(file))
    }
}

fn is_gzip(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gz"))
}

fn decompress_to_temp(path: &Path) -> io::Result<TempPath> {
    let input = std::fs::File::open(path)?;
    let mut decoder = MultiGzDecoder::new(io::BufReader::new(input));

    let mut temp = tempfile::Builder::new()
        .prefix("varbulk-")
        .suffix(".tsv")
        .tempfile()?;
    let bytes = io::copy(&mut decoder, &mut temp)?;
    temp.flush()?;

    debug!(bytes, "Gzip stream decompressed");
    Ok(temp.into_temp_path())
}

/// Read a headed, tab-delimited file into records
///
/// Empty fields become JSON null, everything else a string; the store casts
/// each value to its column type.
pub async fn read_records<R>(reader: R) -> Result<Vec<Record>, SourceError>
where
    R: AsyncRead + Unpin + Send,
{
    let mut reader = csv_async::AsyncReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .create_reader(reader);

    let headers: Vec<String> = reader.headers().await?.iter().map(String::from).collect();

    let mut records = Vec::new();
    let mut rows = reader.records();
    while let Some(row) = rows.next().await {
        let row = row?;
        let record: Record = headers
            .iter()
            .zip(row.iter())
            .map(|(column, field)| {
                let value = if field.is_empty() {
                    Value::Null
                } else {
                    Value::String(field.to_string())
                };
                (column.clone(), value)
            })
            .collect();
        records.push(record);
    }

    Ok(records)
}

/// Open `path` (gzip or plain) and read its records
pub async fn read_record_file(path: impl AsRef<Path>) -> Result<Vec<Record>, SourceError> {
    let snapshot = Snapshot::open(path).await?;
    read_records(snapshot.reader().await?).await
}

fn io_error(path: &Path, source: io::Error) -> SourceError {
    SourceError::Io {
        path: path.display().to_string(),
        source,
    }
}
