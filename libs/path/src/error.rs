//! Error types for path and ID parsing.

use thiserror::Error;

/// Errors that can occur when parsing or validating paths and IDs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PathError {
    /// A path segment is empty (`/a//b`).
    #[error("path segment cannot be empty")]
    EmptySegment,

    /// A path segment contains characters outside `[a-z0-9._-]`.
    #[error("invalid path segment: '{0}'")]
    InvalidSegment(String),

    /// A runtime ID string is empty.
    #[error("ID cannot be empty")]
    EmptyId,

    /// A runtime ID is missing the underscore separator.
    #[error("ID missing underscore separator")]
    MissingSeparator,

    /// A runtime ID has an invalid prefix.
    #[error("invalid ID prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The ULID portion of a runtime ID is invalid.
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),
}
