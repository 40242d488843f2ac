//! Error types shared by varbulk crates

use thiserror::Error;

/// Result type alias for varbulk-common operations
pub type Result<T> = std::result::Result<T, VarbulkError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VarbulkError {
    #[error("Invalid identifier '{name}': {reason}")]
    InvalidIdentifier { name: String, reason: String },
}

impl VarbulkError {
    pub fn invalid_identifier(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidIdentifier {
            name: name.into(),
            reason: reason.into(),
        }
    }
}
