//! Task launch facade and mock implementation.
//!
//! The facade abstracts the cluster-resource matcher that physically
//! launches and kills task instances:
//! - Launching one task of an app version
//! - Killing a task with a reason
//! - Observing the running set
//!
//! Operations are idempotent on `(task, action)` so retries are safe. A
//! mock implementation is provided for testing and standalone mode.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use gantry_path::{PathId, TaskId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::model::{AppSpec, Timestamp};

/// Runtime state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Staging,
    Running,
    Killed,
    Failed,
}

impl TaskState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Staging => "TASK_STAGING",
            Self::Running => "TASK_RUNNING",
            Self::Killed => "TASK_KILLED",
            Self::Failed => "TASK_FAILED",
        }
    }
}

/// One running (or recently launched) instance of an app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub id: TaskId,
    pub app_id: PathId,
    pub version: Timestamp,
    pub state: TaskState,
    pub host: String,
    pub ports: Vec<u16>,
    pub started_at: Timestamp,
}

/// Why a task is being killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillReason {
    FailedHealthChecks,
    ScaleDown,
    Upgrade,
    AppDeleted,
}

impl std::fmt::Display for KillReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::FailedHealthChecks => "failed_health_checks",
            Self::ScaleDown => "scale_down",
            Self::Upgrade => "upgrade",
            Self::AppDeleted => "app_deleted",
        };
        write!(f, "{s}")
    }
}

/// Errors from the launch facade.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("launch of '{app_id}' failed: {reason}")]
    LaunchFailed { app_id: PathId, reason: String },

    #[error("unknown task '{0}'")]
    UnknownTask(TaskId),
}

/// The task-launch facade.
#[async_trait]
pub trait TaskLauncher: Send + Sync {
    /// Launches one task of `spec`.
    async fn launch(&self, spec: &AppSpec) -> Result<TaskStatus, LaunchError>;

    /// Kills a task. Killing an already-dead task is a no-op.
    async fn kill(&self, task_id: &TaskId, reason: KillReason) -> Result<(), LaunchError>;

    /// All running tasks of an app, any version.
    async fn running_tasks(&self, app_id: &PathId) -> Vec<TaskStatus>;

    /// Running tasks of one app version.
    async fn tasks_for_version(&self, app_id: &PathId, version: &Timestamp) -> Vec<TaskStatus>;

    /// Whether the task's node is currently reachable. Unreachable tasks
    /// must not be killed on health grounds.
    async fn is_reachable(&self, task_id: &TaskId) -> bool;
}

/// Mock launcher for testing and standalone mode.
///
/// Launched tasks go straight to `Running`. Tests can script launch
/// failures per app and mark tasks unreachable.
pub struct MockTaskLauncher {
    state: Mutex<MockState>,
    next_port: AtomicU16,
}

#[derive(Default)]
struct MockState {
    tasks: HashMap<TaskId, TaskStatus>,
    unreachable: HashSet<TaskId>,
    scripted_failures: HashMap<PathId, u32>,
    kill_log: Vec<(TaskId, KillReason)>,
    launch_count: u64,
}

impl MockTaskLauncher {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            next_port: AtomicU16::new(31000),
        }
    }

    /// Scripts the next `count` launches of `app_id` to fail.
    pub fn fail_next_launches(&self, app_id: &PathId, count: u32) {
        self.state
            .lock()
            .unwrap()
            .scripted_failures
            .insert(app_id.clone(), count);
    }

    /// Marks a task as unreachable (simulated network partition).
    pub fn set_unreachable(&self, task_id: &TaskId, unreachable: bool) {
        let mut state = self.state.lock().unwrap();
        if unreachable {
            state.unreachable.insert(*task_id);
        } else {
            state.unreachable.remove(task_id);
        }
    }

    /// Kills recorded so far, in order.
    #[must_use]
    pub fn kill_log(&self) -> Vec<(TaskId, KillReason)> {
        self.state.lock().unwrap().kill_log.clone()
    }

    /// Total launch attempts, including scripted failures.
    #[must_use]
    pub fn launch_count(&self) -> u64 {
        self.state.lock().unwrap().launch_count
    }
}

impl Default for MockTaskLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskLauncher for MockTaskLauncher {
    async fn launch(&self, spec: &AppSpec) -> Result<TaskStatus, LaunchError> {
        let mut state = self.state.lock().unwrap();
        state.launch_count += 1;

        if let Some(remaining) = state.scripted_failures.get_mut(&spec.id) {
            if *remaining > 0 {
                *remaining -= 1;
                debug!(app_id = %spec.id, "Scripted launch failure");
                return Err(LaunchError::LaunchFailed {
                    app_id: spec.id.clone(),
                    reason: "scripted failure".to_string(),
                });
            }
        }

        let port_count = spec.port_definitions.len().max(1);
        let ports: Vec<u16> = (0..port_count)
            .map(|_| self.next_port.fetch_add(1, Ordering::SeqCst))
            .collect();

        let task = TaskStatus {
            id: TaskId::new(),
            app_id: spec.id.clone(),
            version: spec.version,
            state: TaskState::Running,
            host: "127.0.0.1".to_string(),
            ports,
            started_at: Timestamp::now(),
        };
        info!(app_id = %spec.id, task_id = %task.id, "Launched task");
        state.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn kill(&self, task_id: &TaskId, reason: KillReason) -> Result<(), LaunchError> {
        let mut state = self.state.lock().unwrap();
        if let Some(task) = state.tasks.get_mut(task_id) {
            if task.state == TaskState::Running {
                task.state = TaskState::Killed;
                info!(task_id = %task_id, %reason, "Killed task");
                state.kill_log.push((*task_id, reason));
            }
        }
        Ok(())
    }

    async fn running_tasks(&self, app_id: &PathId) -> Vec<TaskStatus> {
        let state = self.state.lock().unwrap();
        let mut tasks: Vec<TaskStatus> = state
            .tasks
            .values()
            .filter(|t| &t.app_id == app_id && t.state == TaskState::Running)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.id);
        tasks
    }

    async fn tasks_for_version(&self, app_id: &PathId, version: &Timestamp) -> Vec<TaskStatus> {
        self.running_tasks(app_id)
            .await
            .into_iter()
            .filter(|t| &t.version == version)
            .collect()
    }

    async fn is_reachable(&self, task_id: &TaskId) -> bool {
        !self.state.lock().unwrap().unreachable.contains(task_id)
    }
}
