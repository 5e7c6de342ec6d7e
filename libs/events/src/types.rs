//! Event type definitions for all control-plane events.
//!
//! On the wire every event is a flat JSON object tagged by `eventType`,
//! with camelCase field names and an RFC 3339 `timestamp`.

use chrono::{DateTime, Utc};
use gantry_path::{DeploymentId, PathId, TaskId};
use serde::{Deserialize, Serialize};

/// All event type names as constants.
pub mod event_types {
    // Group mutations
    pub const GROUP_CHANGE_SUCCESS: &str = "group_change_success";
    pub const GROUP_CHANGE_FAILED: &str = "group_change_failed";
    pub const API_POST_EVENT: &str = "api_post_event";

    // Deployments
    pub const DEPLOYMENT_INFO: &str = "deployment_info";
    pub const DEPLOYMENT_SUCCESS: &str = "deployment_success";
    pub const DEPLOYMENT_FAILED: &str = "deployment_failed";
    pub const DEPLOYMENT_CANCELED: &str = "deployment_canceled";

    // Tasks
    pub const STATUS_UPDATE_EVENT: &str = "status_update_event";

    // Health
    pub const FAILED_HEALTH_CHECK: &str = "failed_health_check";
    pub const HEALTH_STATUS_CHANGED: &str = "health_status_changed";
    pub const UNHEALTHY_TASK_KILL_EVENT: &str = "unhealthy_task_kill_event";
}

/// A control-plane event.
///
/// The serde representation matches the external wire format: the variant
/// name becomes the `eventType` field, everything else is inlined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventType", rename_all = "snake_case")]
pub enum Event {
    /// A root mutation was validated, persisted, and handed to the executor.
    #[serde(rename_all = "camelCase")]
    GroupChangeSuccess {
        timestamp: DateTime<Utc>,
        group_id: PathId,
        version: String,
    },

    /// A root mutation was rejected or failed to persist.
    #[serde(rename_all = "camelCase")]
    GroupChangeFailed {
        timestamp: DateTime<Utc>,
        group_id: PathId,
        reason: String,
    },

    /// A mutating API call was accepted.
    #[serde(rename_all = "camelCase")]
    ApiPostEvent {
        timestamp: DateTime<Utc>,
        uri: String,
        group_id: PathId,
    },

    /// A deployment step started executing.
    #[serde(rename_all = "camelCase")]
    DeploymentInfo {
        timestamp: DateTime<Utc>,
        deployment_id: DeploymentId,
        current_step: usize,
        total_steps: usize,
    },

    /// All steps of a deployment completed.
    #[serde(rename_all = "camelCase")]
    DeploymentSuccess {
        timestamp: DateTime<Utc>,
        deployment_id: DeploymentId,
    },

    /// A deployment gave up after exhausting its retry budget.
    #[serde(rename_all = "camelCase")]
    DeploymentFailed {
        timestamp: DateTime<Utc>,
        deployment_id: DeploymentId,
        reason: String,
    },

    /// A deployment was canceled by a force-update.
    #[serde(rename_all = "camelCase")]
    DeploymentCanceled {
        timestamp: DateTime<Utc>,
        deployment_id: DeploymentId,
    },

    /// A task changed runtime state.
    #[serde(rename_all = "camelCase")]
    StatusUpdateEvent {
        timestamp: DateTime<Utc>,
        app_id: PathId,
        task_id: TaskId,
        task_status: String,
    },

    /// A health probe of a running task failed past its grace period.
    #[serde(rename_all = "camelCase")]
    FailedHealthCheck {
        timestamp: DateTime<Utc>,
        app_id: PathId,
        task_id: TaskId,
        version: String,
    },

    /// A task's aliveness judgment flipped.
    #[serde(rename_all = "camelCase")]
    HealthStatusChanged {
        timestamp: DateTime<Utc>,
        app_id: PathId,
        task_id: TaskId,
        version: String,
        alive: bool,
    },

    /// A persistently unhealthy task was handed to the launcher for a kill.
    #[serde(rename_all = "camelCase")]
    UnhealthyTaskKillEvent {
        timestamp: DateTime<Utc>,
        app_id: PathId,
        task_id: TaskId,
        version: String,
        reason: String,
    },
}

impl Event {
    /// The wire `eventType` value for this event.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Event::GroupChangeSuccess { .. } => event_types::GROUP_CHANGE_SUCCESS,
            Event::GroupChangeFailed { .. } => event_types::GROUP_CHANGE_FAILED,
            Event::ApiPostEvent { .. } => event_types::API_POST_EVENT,
            Event::DeploymentInfo { .. } => event_types::DEPLOYMENT_INFO,
            Event::DeploymentSuccess { .. } => event_types::DEPLOYMENT_SUCCESS,
            Event::DeploymentFailed { .. } => event_types::DEPLOYMENT_FAILED,
            Event::DeploymentCanceled { .. } => event_types::DEPLOYMENT_CANCELED,
            Event::StatusUpdateEvent { .. } => event_types::STATUS_UPDATE_EVENT,
            Event::FailedHealthCheck { .. } => event_types::FAILED_HEALTH_CHECK,
            Event::HealthStatusChanged { .. } => event_types::HEALTH_STATUS_CHANGED,
            Event::UnhealthyTaskKillEvent { .. } => event_types::UNHEALTHY_TASK_KILL_EVENT,
        }
    }
}
