//! Error types for tree transformations and validation.

use gantry_path::PathId;
use serde::Serialize;
use thiserror::Error;

/// A structural rejection raised while transforming the tree.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TreeError {
    /// The path already names a node of the other kind.
    #[error("path '{path}' already names a {existing}")]
    ConflictingPath {
        path: PathId,
        existing: &'static str,
    },

    /// A child was inserted under a node that is not its parent path.
    #[error("'{child}' is not a direct child of '{parent}'")]
    InvalidHierarchy { parent: PathId, child: PathId },

    /// The addressed group does not exist.
    #[error("unknown group '{0}'")]
    UnknownGroup(PathId),
}

/// One field-level validation failure, surfaced in 422 responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// Tree invariant violations collected over a whole snapshot.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("group tree validation failed: {}", summarize(.errors))]
pub struct ValidationError {
    pub errors: Vec<FieldError>,
}

impl ValidationError {
    pub fn new(errors: Vec<FieldError>) -> Self {
        Self { errors }
    }

    pub fn single(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            errors: vec![FieldError {
                field: field.into(),
                message: message.into(),
            }],
        }
    }
}

fn summarize(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| format!("{}: {}", e.field, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}
