//! varbulk Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, error handling and logging for the varbulk workspace.
//!
//! - **Types**: validated, quoted relation names and per-invocation
//!   staging names
//! - **Logging**: tracing subscriber setup for every binary
//!
//! # Example
//!
//! ```
//! use varbulk_common::TableName;
//!
//! let target = TableName::parse("public.variants")?;
//! assert_eq!(target.quoted(), "\"public\".\"variants\"");
//! assert!(target.staging().name().starts_with("variants_stg_"));
//! # Ok::<(), varbulk_common::VarbulkError>(())
//! ```

pub mod error;
pub mod logging;
pub mod types;

pub use error::{Result, VarbulkError};
pub use types::{quote_identifier, validate_identifier, TableName};
