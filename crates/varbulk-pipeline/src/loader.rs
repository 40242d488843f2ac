//! Zero-downtime table replacement from a delimited snapshot
//!
//! A load runs entirely inside one transaction:
//!
//! 1. take a per-table advisory lock (fail fast if another load holds it)
//! 2. check the source header against the target's columns
//! 3. create a staging table shaped like the target
//! 4. `COPY` the source into it
//! 5. compute a [`ValidationReport`] and ask the [`Validator`]
//! 6. hand over owner, grants and owned sequences, then rename target away,
//!    rename staging into place and drop the old table
//! 7. optionally build lookup indexes and `ANALYZE`
//!
//! Any error, a rejection, or dropping the future rolls the transaction
//! back, so readers only ever see the old table or the complete new one.

use serde::Serialize;
use sqlx::postgres::PgCopyIn;
use sqlx::{Connection, Executor, PgConnection};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tracing::{debug, info, instrument, warn};
use varbulk_common::types::MAX_IDENTIFIER_LEN;
use varbulk_common::TableName;

use crate::error::LoadError;
use crate::schema::{self, column_list};
use crate::validator::{Outcome, ValidationReport, Validator};

/// Primary identifier column assumed when none is configured
pub const DEFAULT_ID_COLUMN: &str = "id";

/// Bytes read from the source per COPY data message
pub const COPY_CHUNK_BYTES: usize = 64 * 1024;

/// Tab-delimited CSV dialect shared with the exporter; empty field = NULL
const COPY_FORMAT: &str = "FORMAT csv, DELIMITER E'\\t', NULL ''";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOptions {
    /// Column whose null/distinct counts gate promotion
    pub id_column: String,

    /// Copy the target's own indexes (including primary key and unique
    /// constraints) onto the staging table before loading
    pub preserve_indexes: bool,

    /// Build `idx_<table>_<column>` lookup indexes after promotion
    pub create_indexes: bool,

    /// Search columns indexed alongside `id_column` when `create_indexes`
    pub index_columns: Vec<String>,

    /// Refresh planner statistics on the promoted table
    pub analyze: bool,

    /// `SET LOCAL statement_timeout` for the load transaction
    pub statement_timeout: Option<Duration>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            id_column: DEFAULT_ID_COLUMN.to_string(),
            preserve_indexes: true,
            create_indexes: false,
            index_columns: Vec::new(),
            analyze: true,
            statement_timeout: None,
        }
    }
}

impl LoadOptions {
    /// Identifier first, then search columns, without repeats
    fn lookup_columns(&self) -> Vec<&str> {
        let mut columns = vec![self.id_column.as_str()];
        for column in &self.index_columns {
            if !columns.contains(&column.as_str()) {
                columns.push(column);
            }
        }
        columns
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadResult {
    pub total_rows: i64,
    pub unique_ids: i64,
    /// Row count reported by the server at the end of COPY
    pub rows_copied: u64,
    pub indexes_created: Vec<String>,
}

#[derive(Debug, Default)]
pub struct StagedLoader {
    options: LoadOptions,
    validator: Validator,
}

impl StagedLoader {
    pub fn new(options: LoadOptions) -> Self {
        Self {
            options,
            validator: Validator::default(),
        }
    }

    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = validator;
        self
    }

    pub fn options(&self) -> &LoadOptions {
        &self.options
    }

    /// Replace the contents of `target` with the rows in `source`
    ///
    /// `source` must start with a tab-delimited header naming every column
    /// of `target` in table order.
    #[instrument(skip(self, conn, source, target), fields(table = %target))]
    pub async fn load<R>(
        &self,
        conn: &mut PgConnection,
        mut source: R,
        target: &TableName,
    ) -> Result<LoadResult, LoadError>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        let started = Instant::now();
        let mut tx = conn.begin().await?;

        // keyed on the resolved name, which survives the promotion's renames
        let locked: Option<bool> = sqlx::query_scalar(
            "SELECT pg_try_advisory_xact_lock(hashtextextended(
                 'varbulk:load:' || quote_ident(n.nspname) || '.' || quote_ident(c.relname), 0))
             FROM pg_class c
             JOIN pg_namespace n ON n.oid = c.relnamespace
             WHERE c.oid = to_regclass($1)",
        )
        .bind(target.quoted())
        .fetch_optional(&mut *tx)
        .await?;
        match locked {
            None => return Err(LoadError::TableNotFound(target.to_string())),
            Some(false) => return Err(LoadError::TableBusy(target.to_string())),
            Some(true) => {},
        }

        if let Some(timeout) = self.options.statement_timeout {
            let sql = format!("SET LOCAL statement_timeout = {}", timeout.as_millis());
            (&mut *tx).execute(sqlx::raw_sql(&sql)).await?;
        }

        let columns = schema::table_columns(&mut tx, target)
            .await?
            .ok_or_else(|| LoadError::TableNotFound(target.to_string()))?;
        let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();

        let required = if self.options.create_indexes {
            self.options.lookup_columns()
        } else {
            vec![self.options.id_column.as_str()]
        };
        for column in required {
            if !names.contains(&column) {
                return Err(LoadError::UnknownColumn {
                    table: target.to_string(),
                    column: column.to_string(),
                });
            }
        }

        let mut header = String::new();
        if source.read_line(&mut header).await? == 0 {
            return Err(LoadError::MissingHeader(target.to_string()));
        }
        check_header(target, &header, &names)?;

        let staging = target.staging();
        let like = if self.options.preserve_indexes {
            "INCLUDING ALL"
        } else {
            "INCLUDING ALL EXCLUDING INDEXES"
        };
        let sql = format!(
            "CREATE TABLE {} (LIKE {} {})",
            staging.quoted(),
            target.quoted(),
            like
        );
        (&mut *tx).execute(sqlx::raw_sql(&sql)).await?;
        debug!(staging = %staging, "Created staging table");

        let copy_sql = format!(
            "COPY {} ({}) FROM STDIN WITH ({})",
            staging.quoted(),
            column_list(names.iter().copied()),
            COPY_FORMAT
        );
        let mut copy = tx.copy_in_raw(&copy_sql).await?;
        let rows_copied = match stream_into(&mut source, &mut copy).await {
            Ok(bytes) => {
                let rows = copy.finish().await?;
                debug!(staging = %staging, rows, bytes, "Source copied into staging table");
                rows
            },
            Err(err) => {
                if let Err(abort_err) = copy.abort(err.to_string()).await {
                    debug!(error = %abort_err, "COPY abort after source failure");
                }
                return Err(err);
            },
        };

        let report = self.staging_report(&mut tx, &staging).await?;

        if let Outcome::Reject(reason) = self.validator.validate(&report) {
            if let Err(err) = tx.rollback().await {
                // sqlx rolls back a dropped transaction on the connection's next use
                warn!(error = %err, "Rollback of rejected load failed");
            }
            warn!(%report, %reason, "Staged load rejected; target left unchanged");
            return Err(LoadError::Rejected {
                table: target.to_string(),
                reason,
                report,
            });
        }

        carry_over(&mut tx, target, &staging).await?;

        let backup = target.backup();
        let promote = format!(
            "ALTER TABLE {target} RENAME TO {backup_name};
             ALTER TABLE {staging} RENAME TO {target_name};
             DROP TABLE {backup};",
            target = target.quoted(),
            backup_name = backup.quoted_name(),
            staging = staging.quoted(),
            target_name = target.quoted_name(),
            backup = backup.quoted(),
        );
        (&mut *tx).execute(sqlx::raw_sql(&promote)).await?;
        debug!("Staging table promoted");

        let mut indexes_created = Vec::new();
        if self.options.create_indexes {
            for column in self.options.lookup_columns() {
                let index = index_name(target.name(), column);
                let sql = format!(
                    "CREATE INDEX {} ON {} ({})",
                    column_list([index.as_str()]),
                    target.quoted(),
                    column_list([column])
                );
                (&mut *tx).execute(sqlx::raw_sql(&sql)).await?;
                indexes_created.push(index);
            }
        }

        if self.options.analyze {
            let sql = format!("ANALYZE {}", target.quoted());
            (&mut *tx).execute(sqlx::raw_sql(&sql)).await?;
        }

        tx.commit().await?;

        info!(
            total_rows = report.total_rows,
            unique_ids = report.unique_identifiers,
            indexes = indexes_created.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Table replaced"
        );

        Ok(LoadResult {
            total_rows: report.total_rows,
            unique_ids: report.unique_identifiers,
            rows_copied,
            indexes_created,
        })
    }

    async fn staging_report(
        &self,
        conn: &mut PgConnection,
        staging: &TableName,
    ) -> Result<ValidationReport, sqlx::Error> {
        let id = column_list([self.options.id_column.as_str()]);
        let sql = format!(
            "SELECT
                COUNT(*) AS total_rows,
                COUNT(*) FILTER (WHERE {id} IS NULL) AS null_identifiers,
                COUNT(DISTINCT {id}) AS unique_identifiers
             FROM {staging}",
            id = id,
            staging = staging.quoted()
        );

        sqlx::query_as::<_, ValidationReport>(&sql)
            .persistent(false)
            .fetch_one(conn)
            .await
    }
}

/// Give `staging` the target's owner, grants and owned sequences
///
/// `LIKE` copies neither privileges nor ownership, and a `serial` column's
/// sequence would otherwise be dropped along with the old table.
async fn carry_over(
    conn: &mut PgConnection,
    target: &TableName,
    staging: &TableName,
) -> Result<(), sqlx::Error> {
    let owner: String = sqlx::query_scalar(
        "SELECT quote_ident(pg_get_userbyid(relowner)) FROM pg_class WHERE oid = to_regclass($1)",
    )
    .bind(target.quoted())
    .fetch_one(&mut *conn)
    .await?;

    let grants: Vec<(String, String, bool)> = sqlx::query_as(
        "SELECT CASE WHEN a.grantee = 0 THEN 'PUBLIC'
                     ELSE quote_ident(pg_get_userbyid(a.grantee)) END,
                a.privilege_type,
                a.is_grantable
         FROM pg_class c, aclexplode(c.relacl) a
         WHERE c.oid = to_regclass($1) AND a.grantee <> c.relowner",
    )
    .bind(target.quoted())
    .fetch_all(&mut *conn)
    .await?;

    let sequences: Vec<(String, String)> = sqlx::query_as(
        "SELECT d.objid::regclass::text, a.attname::text
         FROM pg_depend d
         JOIN pg_class s ON s.oid = d.objid AND s.relkind = 'S'
         JOIN pg_attribute a ON a.attrelid = d.refobjid AND a.attnum = d.refobjsubid
         WHERE d.classid = 'pg_class'::regclass
           AND d.refclassid = 'pg_class'::regclass
           AND d.refobjid = to_regclass($1)
           AND d.deptype = 'a'",
    )
    .bind(target.quoted())
    .fetch_all(&mut *conn)
    .await?;

    // OWNED BY needs table and sequence to share an owner, so this goes first
    let mut statements = vec![format!("ALTER TABLE {} OWNER TO {owner}", staging.quoted())];
    for (sequence, column) in &sequences {
        statements.push(format!(
            "ALTER SEQUENCE {sequence} OWNED BY {}.{}",
            staging.quoted(),
            column_list([column.as_str()])
        ));
    }
    for (grantee, privilege, grantable) in &grants {
        statements.push(format!(
            "GRANT {privilege} ON {} TO {grantee}{}",
            staging.quoted(),
            if *grantable { " WITH GRANT OPTION" } else { "" }
        ));
    }

    conn.execute(sqlx::raw_sql(&statements.join(";\n"))).await?;
    debug!(
        owner = %owner,
        grants = grants.len(),
        sequences = sequences.len(),
        "Carried ownership over to staging table"
    );
    Ok(())
}

/// Forward the rest of `source` to the server in fixed-size chunks
async fn stream_into<R>(
    source: &mut R,
    copy: &mut PgCopyIn<&mut PgConnection>,
) -> Result<u64, LoadError>
where
    R: AsyncBufRead + Unpin + Send,
{
    let mut buf = vec![0u8; COPY_CHUNK_BYTES];
    let mut total = 0u64;

    loop {
        let n = source.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        copy.send(&buf[..n]).await?;
        total += n as u64;
    }
}

/// The header must name exactly the target's columns, in order
fn check_header(target: &TableName, line: &str, expected: &[&str]) -> Result<(), LoadError> {
    let line = line.trim_end_matches(['\n', '\r']);
    let line = line.strip_prefix('\u{feff}').unwrap_or(line);
    let found: Vec<&str> = line.split('\t').collect();

    if found != expected {
        return Err(LoadError::HeaderMismatch {
            table: target.to_string(),
            expected: expected.join(", "),
            found: found.join(", "),
        });
    }

    Ok(())
}

/// `idx_<table>_<column>`, cut to the identifier limit on a char boundary
fn index_name(table: &str, column: &str) -> String {
    let mut name = format!("idx_{}_{}", table, column);
    if name.len() > MAX_IDENTIFIER_LEN {
        let mut cut = MAX_IDENTIFIER_LEN;
        while !name.is_char_boundary(cut) {
            cut -= 1;
        }
        name.truncate(cut);
    }
    name
}
