//! Reconciliation: the group manager and the deployment executor.

mod executor;

pub use executor::{DeploymentExecutor, DeploymentHandle, DeploymentListener};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};

use async_trait::async_trait;
use chrono::Utc;
use gantry_events::{Event, EventBus};
use gantry_path::{DeploymentId, PathId};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::model::{Group, RootGroup, Timestamp, TreeError, ValidationError};
use crate::planner::DeploymentPlan;
use crate::repo::{Commit, GroupRepository, RepoError};

/// Errors surfaced by the manager.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error("deployment '{deployment_id}' is in progress; retry with force")]
    DeploymentInProgress { deployment_id: DeploymentId },

    #[error("repository failure: {0}")]
    Repository(#[from] RepoError),

    #[error("unknown version '{version}' of '{path}'")]
    UnknownVersion { path: PathId, version: Timestamp },
}

struct ManagerInner {
    repo: Arc<dyn GroupRepository>,
    bus: EventBus,
    executor: DeploymentExecutor,
    /// Root-mutation lock: at most one mutation in flight, held across
    /// read → validate → plan → persist → handoff.
    mutation_lock: Mutex<()>,
    /// The committed root; readers load the Arc without blocking writers.
    current: RwLock<Arc<RootGroup>>,
    /// The deployment currently driving the cluster, if any.
    active: Mutex<Option<DeploymentHandle>>,
    /// Whether any commit was ever persisted (guards the first CAS).
    bootstrapped: AtomicBool,
}

/// Single-writer guardian of the committed root.
///
/// All mutations funnel through [`GroupManager::update_root`]; reads see
/// the last committed snapshot. The manager owns the executor's lifetime
/// and hands it a narrow completion callback per plan, so the executor
/// never references the manager.
pub struct GroupManager {
    inner: Arc<ManagerInner>,
}

impl GroupManager {
    /// Loads the committed root (or starts empty) and wires the executor.
    pub async fn new(
        repo: Arc<dyn GroupRepository>,
        bus: EventBus,
        executor: DeploymentExecutor,
    ) -> Result<Self, ManagerError> {
        let (current, bootstrapped) = match repo.current_root().await? {
            Some(root) => (root, true),
            None => (RootGroup::empty(Timestamp::now()), false),
        };

        info!(version = %current.version(), bootstrapped, "Group manager loaded root");
        Ok(Self {
            inner: Arc::new(ManagerInner {
                repo,
                bus,
                executor,
                mutation_lock: Mutex::new(()),
                current: RwLock::new(Arc::new(current)),
                active: Mutex::new(None),
                bootstrapped: AtomicBool::new(bootstrapped),
            }),
        })
    }

    /// The current committed root, always consistent.
    #[must_use]
    pub fn root(&self) -> Arc<RootGroup> {
        Arc::clone(&self.inner.current.read().unwrap())
    }

    /// A group from the current root.
    #[must_use]
    pub fn group(&self, id: &PathId) -> Option<Group> {
        self.root().group(id).cloned()
    }

    /// A group from a stored root version.
    pub async fn group_at(
        &self,
        id: &PathId,
        version: &Timestamp,
    ) -> Result<Option<Group>, ManagerError> {
        let Some(root) = self.inner.repo.root_at(version).await? else {
            return Ok(None);
        };
        Ok(root.group(id).cloned())
    }

    /// Stored versions in which the group exists, newest first.
    pub async fn versions(&self, id: &PathId) -> Result<Vec<Timestamp>, ManagerError> {
        let mut versions = Vec::new();
        for version in self.inner.repo.root_versions().await? {
            if id.is_root() {
                versions.push(version);
                continue;
            }
            if let Some(root) = self.inner.repo.root_at(&version).await? {
                if root.group(id).is_some() {
                    versions.push(version);
                }
            }
        }
        Ok(versions)
    }

    /// The id of the deployment currently in flight, if any.
    pub async fn active_deployment(&self) -> Option<DeploymentId> {
        self.inner.active.lock().await.as_ref().map(|h| h.id)
    }

    /// The single mutation entry point.
    ///
    /// Applies `f` to the committed root under the root-mutation lock,
    /// validates the result, persists it together with the computed plan
    /// (CAS on the root version), publishes the change, and hands the plan
    /// to the executor. Fails with [`ManagerError::DeploymentInProgress`]
    /// when a deployment is in flight and `force` is not set; with force,
    /// the in-flight plan is canceled and drained first.
    pub async fn update_root<F>(
        &self,
        path: &PathId,
        f: F,
        force: bool,
    ) -> Result<DeploymentPlan, ManagerError>
    where
        F: FnOnce(&RootGroup, Timestamp) -> Result<RootGroup, TreeError>,
    {
        let inner = &self.inner;
        let _guard = inner.mutation_lock.lock().await;

        let current = self.root();
        let version = Timestamp::monotonic_after(&current.version());

        let result = self
            .mutate_locked(path, &current, version, f, force)
            .await;

        if let Err(e) = &result {
            inner.bus.publish(Event::GroupChangeFailed {
                timestamp: Utc::now(),
                group_id: path.clone(),
                reason: e.to_string(),
            });
        }
        result
    }

    async fn mutate_locked<F>(
        &self,
        path: &PathId,
        current: &Arc<RootGroup>,
        version: Timestamp,
        f: F,
        force: bool,
    ) -> Result<DeploymentPlan, ManagerError>
    where
        F: FnOnce(&RootGroup, Timestamp) -> Result<RootGroup, TreeError>,
    {
        let inner = &self.inner;

        let target = f(current.as_ref(), version)?;
        target.validate()?;

        let plan = DeploymentPlan::new((**current).clone(), target.clone(), version);

        // Resolve any in-flight deployment before touching the repository.
        let prior = {
            let mut active = inner.active.lock().await;
            match active.take() {
                None => None,
                Some(handle) if !force => {
                    let deployment_id = handle.id;
                    *active = Some(handle);
                    return Err(ManagerError::DeploymentInProgress { deployment_id });
                }
                Some(handle) => Some(handle),
            }
        };
        if let Some(handle) = prior {
            info!(deployment_id = %handle.id, path = %path, "Force-canceling in-flight deployment");
            handle.cancel();
            // Let in-flight actions drain; the executor publishes
            // `deployment_canceled` on its way out.
            handle.wait().await;
        }

        let expected_root = if inner.bootstrapped.load(Ordering::SeqCst) {
            Some(current.version())
        } else {
            None
        };
        inner
            .repo
            .commit(Commit {
                root: target.clone(),
                apps: plan.changed_specs().into_iter().cloned().collect(),
                plan: plan.clone(),
                expected_root,
            })
            .await?;

        *inner.current.write().unwrap() = Arc::new(target);
        inner.bootstrapped.store(true, Ordering::SeqCst);

        inner.bus.publish(Event::GroupChangeSuccess {
            timestamp: Utc::now(),
            group_id: path.clone(),
            version: version.to_string(),
        });

        info!(
            path = %path,
            version = %version,
            deployment_id = %plan.id,
            steps = plan.steps.len(),
            "Root committed"
        );

        // Store the handle under the lock so the completion callback (which
        // also takes the lock) can only clear it after it exists.
        {
            let mut active = inner.active.lock().await;
            let listener = Arc::new(FinishedListener {
                inner: Arc::downgrade(inner),
            });
            let handle = inner.executor.start(plan.clone(), listener);
            *active = Some(handle);
        }

        Ok(plan)
    }

    /// Computes the plan a mutation would produce without committing,
    /// executing, or publishing anything.
    pub async fn dry_run<F>(&self, f: F) -> Result<DeploymentPlan, ManagerError>
    where
        F: FnOnce(&RootGroup, Timestamp) -> Result<RootGroup, TreeError>,
    {
        let current = self.root();
        let version = Timestamp::monotonic_after(&current.version());
        let target = f(current.as_ref(), version)?;
        target.validate()?;
        Ok(DeploymentPlan::new((*current).clone(), target, version))
    }
}

/// Clears the active slot and drops the persisted plan once a deployment
/// finishes. Holds only a weak reference: the executor never keeps the
/// manager alive.
struct FinishedListener {
    inner: Weak<ManagerInner>,
}

impl FinishedListener {
    async fn clear(&self, id: DeploymentId) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        {
            let mut active = inner.active.lock().await;
            if active.as_ref().map(|h| h.id) == Some(id) {
                *active = None;
            }
        }
        if let Err(e) = inner.repo.delete_plan(&id).await {
            warn!(deployment_id = %id, error = %e, "Failed to drop completed plan");
        }
    }
}

#[async_trait]
impl DeploymentListener for FinishedListener {
    async fn on_success(&self, id: DeploymentId) {
        self.clear(id).await;
    }

    async fn on_failure(&self, id: DeploymentId, _reason: String) {
        self.clear(id).await;
    }

    async fn on_canceled(&self, id: DeploymentId) {
        self.clear(id).await;
    }
}
