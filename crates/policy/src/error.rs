//! Policy error types.

use thiserror::Error;

/// Errors raised while compiling filters and permission rules.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A filter referenced a column the table does not declare.
    #[error("unknown column '{column}' on table '{table}'")]
    UnknownColumn { table: String, column: String },

    /// A filter expression is structurally invalid.
    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    /// A raw text predicate appeared in an ordinary filter.
    #[error("raw text predicates must be built with RawSql")]
    RawTextNotAllowed,

    /// A raw text predicate failed the injection scan.
    #[error("injection pattern detected in raw predicate: {0}")]
    InjectionDetected(String),

    /// A stored permission rule could not be decoded.
    #[error("invalid permission rule: {0}")]
    InvalidRule(String),

    /// Failed to parse serialized input.
    #[error("failed to parse: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, Error>;
