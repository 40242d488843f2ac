//! Promotion gate for staged loads
//!
//! A [`ValidationReport`] is computed once per load attempt from the staging
//! table. The [`Validator`] turns it into an [`Outcome`]; nothing else
//! decides whether a staging table may replace the live one.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Aggregate counts over a staged dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ValidationReport {
    pub total_rows: i64,
    pub null_identifiers: i64,
    pub unique_identifiers: i64,
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total_rows={}, null_identifiers={}, unique_identifiers={}",
            self.total_rows, self.null_identifiers, self.unique_identifiers
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Accept,
    Reject(String),
}

impl Outcome {
    pub fn is_accept(&self) -> bool {
        matches!(self, Outcome::Accept)
    }
}

/// A single integrity rule
///
/// Returns the rejection reason, or `None` when the report passes.
pub trait ValidationRule: Send + Sync {
    fn name(&self) -> &'static str;

    fn check(&self, report: &ValidationReport) -> Option<String>;
}

/// Rejects any dataset containing a row without a primary identifier
#[derive(Debug, Clone, Copy, Default)]
pub struct NullIdentifierRule;

impl ValidationRule for NullIdentifierRule {
    fn name(&self) -> &'static str {
        "null_identifier"
    }

    fn check(&self, report: &ValidationReport) -> Option<String> {
        match report.null_identifiers {
            0 => None,
            1 => Some("1 row with null identifier".to_string()),
            n => Some(format!("{} rows with null identifier", n)),
        }
    }
}

/// Rejects datasets where a non-null identifier appears more than once
///
/// Not part of the default rule set: tables keyed on something other than
/// the identifier legitimately repeat it.
#[derive(Debug, Clone, Copy, Default)]
pub struct DuplicateIdentifierRule;

impl ValidationRule for DuplicateIdentifierRule {
    fn name(&self) -> &'static str {
        "duplicate_identifier"
    }

    fn check(&self, report: &ValidationReport) -> Option<String> {
        let identified = report.total_rows - report.null_identifiers;
        let duplicates = identified - report.unique_identifiers;
        (duplicates > 0).then(|| format!("{} rows with duplicate identifier", duplicates))
    }
}

/// Ordered rule set; the first rejecting rule wins
pub struct Validator {
    rules: Vec<Box<dyn ValidationRule>>,
}

impl Validator {
    /// A validator with no rules accepts everything
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn with_rule(mut self, rule: impl ValidationRule + 'static) -> Self {
        self.rules.push(Box::new(rule));
        self
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    pub fn validate(&self, report: &ValidationReport) -> Outcome {
        self.rules
            .iter()
            .find_map(|rule| rule.check(report))
            .map_or(Outcome::Accept, Outcome::Reject)
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::empty().with_rule(NullIdentifierRule)
    }
}

impl fmt::Debug for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Validator")
            .field("rules", &self.rule_names())
            .finish()
    }
}

/// Apply the default rule set
pub fn validate(report: &ValidationReport) -> Outcome {
    Validator::default().validate(report)
}
