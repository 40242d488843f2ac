//! Relation naming shared by the loader, upserter and exporter
//!
//! Every name that ends up interpolated into SQL text (tables, columns,
//! cursors, indexes) is validated here first and always emitted
//! double-quoted. Names are therefore case-sensitive exactly as given.

use crate::error::{Result, VarbulkError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// PostgreSQL truncates identifiers longer than this (NAMEDATALEN - 1)
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Check that `name` is a plain SQL identifier
///
/// Accepts `[A-Za-z_][A-Za-z0-9_$]*` up to [`MAX_IDENTIFIER_LEN`] bytes.
pub fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let first = chars
        .next()
        .ok_or_else(|| VarbulkError::invalid_identifier(name, "empty identifier"))?;

    if !(first.is_ascii_alphabetic() || first == '_') {
        return Err(VarbulkError::invalid_identifier(
            name,
            "must start with a letter or underscore",
        ));
    }

    if let Some(bad) = chars.find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '$')) {
        return Err(VarbulkError::invalid_identifier(
            name,
            format!("character {:?} is not allowed", bad),
        ));
    }

    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(VarbulkError::invalid_identifier(
            name,
            format!("longer than {} bytes", MAX_IDENTIFIER_LEN),
        ));
    }

    Ok(())
}

/// Validate and double-quote a single identifier
pub fn quote_identifier(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("\"{}\"", name))
}

/// Optionally schema-qualified table name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TableName {
    schema: Option<String>,
    name: String,
}

impl TableName {
    pub fn new(schema: Option<&str>, name: &str) -> Result<Self> {
        if let Some(schema) = schema {
            validate_identifier(schema)?;
        }
        validate_identifier(name)?;

        Ok(Self {
            schema: schema.map(str::to_string),
            name: name.to_string(),
        })
    }

    /// Parse `name` or `schema.name`
    pub fn parse(qualified: &str) -> Result<Self> {
        match qualified.split_once('.') {
            Some((schema, name)) => Self::new(Some(schema), name),
            None => Self::new(None, qualified),
        }
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    /// Unqualified relation name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Quoted, qualified form ready for SQL text: `"public"."variants"`
    pub fn quoted(&self) -> String {
        match &self.schema {
            Some(schema) => format!("\"{}\".\"{}\"", schema, self.name),
            None => format!("\"{}\"", self.name),
        }
    }

    /// Quoted unqualified name, as required by `ALTER TABLE .. RENAME TO`
    pub fn quoted_name(&self) -> String {
        format!("\"{}\"", self.name)
    }

    /// Per-invocation staging relation in the same schema
    pub fn staging(&self) -> Self {
        self.temporary("stg")
    }

    /// Per-invocation name the live table is parked under during promotion
    pub fn backup(&self) -> Self {
        self.temporary("old")
    }

    fn temporary(&self, tag: &str) -> Self {
        Self {
            schema: self.schema.clone(),
            name: temporary_name(&self.name, tag),
        }
    }
}

/// `<base>_<tag>_<utc timestamp>_<token>`, truncating `base` so the suffix
/// (and with it the uniqueness) survives the identifier length limit
fn temporary_name(base: &str, tag: &str) -> String {
    let token = Uuid::new_v4().simple().to_string();
    let suffix = format!(
        "_{}_{}_{}",
        tag,
        Utc::now().format("%Y%m%d%H%M%S"),
        &token[..8]
    );
    let keep = MAX_IDENTIFIER_LEN.saturating_sub(suffix.len()).min(base.len());
    format!("{}{}", &base[..keep], suffix)
}

impl FromStr for TableName {
    type Err = VarbulkError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TableName {
    type Error = VarbulkError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<TableName> for String {
    fn from(value: TableName) -> Self {
        value.to_string()
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.name),
            None => f.write_str(&self.name),
        }
    }
}
