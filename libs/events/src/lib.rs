//! # gantry-events
//!
//! Event type definitions and the in-process event bus for the gantry
//! control plane.
//!
//! ## Design Principles
//!
//! - Events are immutable records of observed transitions
//! - Every event carries its wall-clock `timestamp` and a machine-readable
//!   `eventType` discriminator on the wire
//! - Delivery is at-least-once and unordered across topics; subscribers
//!   that fall behind drop events rather than block publishers
//!
//! ## Event Types
//!
//! Events are organized by source:
//! - Group mutations (`group_change_*`, `api_post_event`)
//! - Deployment lifecycle (`deployment_*`)
//! - Task status (`status_update_event`)
//! - Health supervision (`failed_health_check`, `health_status_changed`,
//!   `unhealthy_task_kill_event`)

mod bus;
mod types;

pub use bus::{EventBus, EventSubscription};
pub use types::*;
