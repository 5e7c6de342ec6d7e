//! # gantry-path
//!
//! Path identifiers and stable task/deployment IDs for the gantry
//! control plane.
//!
//! ## Design Principles
//!
//! - Group and app identifiers are hierarchical paths (`/prod/api/web`)
//!   with strict parsing and a canonical string representation
//! - All identifiers support roundtrip serialization (parse → format → parse)
//! - Opaque runtime IDs (tasks, deployments) are typed to prevent mixing
//!   different resource kinds
//!
//! ## Formats
//!
//! Paths are `/`-joined segment sequences; a leading `/` marks an absolute
//! path and the bare `/` is the root. Runtime IDs use a prefixed ULID
//! format, e.g.:
//!
//! - `task_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `deploy_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//!
//! ULID-backed IDs are time-ordered and sortable; the prefix gives type
//! safety and human readability.

mod error;
mod macros;
mod path;
mod types;

pub use error::PathError;
pub use path::PathId;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
