//! The declarative state model: versioned snapshots of the group tree.
//!
//! Everything in this module is a pure value. Transformations return new
//! snapshots (path-copy on update) and never mutate in place; the committed
//! root only ever changes by swapping one immutable snapshot for another.

mod app;
mod error;
mod group;
mod root;
mod timestamp;
mod update;

pub use app::{
    AppSpec, BackoffStrategy, Constraint, ConstraintOperator, Container, ContainerVolume,
    HealthCheckProtocol, HealthCheckSpec, PortDefinition, Resources, UpgradeStrategy,
};
pub use error::{FieldError, TreeError, ValidationError};
pub use group::Group;
pub use root::RootGroup;
pub use timestamp::Timestamp;
pub use update::{GroupUpdate, UpdateKind};
