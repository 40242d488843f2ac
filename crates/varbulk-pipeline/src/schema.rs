//! Catalog lookups for target tables

use sqlx::PgConnection;
use varbulk_common::TableName;

/// A live column of a relation, in attribute order
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ColumnInfo {
    pub name: String,
    /// Declared type as rendered by `format_type`, usable in a cast
    pub data_type: String,
    pub nullable: bool,
}

/// Columns of `table`, or `None` if the relation does not exist
pub async fn table_columns(
    conn: &mut PgConnection,
    table: &TableName,
) -> Result<Option<Vec<ColumnInfo>>, sqlx::Error> {
    let exists: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
        .bind(table.quoted())
        .fetch_one(&mut *conn)
        .await?;

    if !exists {
        return Ok(None);
    }

    let columns = sqlx::query_as::<_, ColumnInfo>(
        r#"
        SELECT
            a.attname::text AS name,
            format_type(a.atttypid, a.atttypmod) AS data_type,
            NOT a.attnotnull AS nullable
        FROM pg_catalog.pg_attribute a
        WHERE a.attrelid = $1::regclass
          AND a.attnum > 0
          AND NOT a.attisdropped
        ORDER BY a.attnum
        "#,
    )
    .bind(table.quoted())
    .fetch_all(&mut *conn)
    .await?;

    Ok(Some(columns))
}

/// Comma-joined quoted column list for SQL text
///
/// Names come from the catalog, so only embedded quotes need escaping.
pub fn column_list<'a>(names: impl IntoIterator<Item = &'a str>) -> String {
    names
        .into_iter()
        .map(|n| format!("\"{}\"", n.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_list_quotes() {
        assert_eq!(
            column_list(["id", "GeneSymbol", "odd\"name"]),
            r#""id", "GeneSymbol", "odd""name""#
        );
        assert_eq!(column_list(Vec::<&str>::new()), "");
    }
}
