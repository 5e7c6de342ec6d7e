//! In-memory repository for tests and standalone mode.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use gantry_path::{DeploymentId, PathId};

use crate::model::{AppSpec, RootGroup, Timestamp};
use crate::planner::DeploymentPlan;

use super::{Commit, GroupRepository, RepoError};

/// Repository backed by process memory. Contents vanish on restart.
#[derive(Default)]
pub struct MemoryRepository {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    head: Option<Timestamp>,
    roots: BTreeMap<Timestamp, RootGroup>,
    apps: BTreeMap<(PathId, Timestamp), AppSpec>,
    plans: BTreeMap<DeploymentId, DeploymentPlan>,
}

impl MemoryRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GroupRepository for MemoryRepository {
    async fn ping(&self) -> Result<(), RepoError> {
        Ok(())
    }

    async fn current_root(&self) -> Result<Option<RootGroup>, RepoError> {
        let inner = self.inner.read().unwrap();
        Ok(inner.head.and_then(|v| inner.roots.get(&v).cloned()))
    }

    async fn commit(&self, commit: Commit) -> Result<(), RepoError> {
        let mut inner = self.inner.write().unwrap();
        if inner.head != commit.expected_root {
            return Err(RepoError::VersionConflict {
                expected: commit.expected_root.map(|v| v.to_string()),
                actual: inner.head.map(|v| v.to_string()),
            });
        }

        let version = commit.root.version();
        inner.roots.insert(version, commit.root);
        for app in commit.apps {
            inner.apps.insert((app.id.clone(), app.version), app);
        }
        inner.plans.insert(commit.plan.id, commit.plan);
        inner.head = Some(version);
        Ok(())
    }

    async fn root_at(&self, version: &Timestamp) -> Result<Option<RootGroup>, RepoError> {
        Ok(self.inner.read().unwrap().roots.get(version).cloned())
    }

    async fn root_versions(&self) -> Result<Vec<Timestamp>, RepoError> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .roots
            .keys()
            .rev()
            .copied()
            .collect())
    }

    async fn app_at(
        &self,
        id: &PathId,
        version: &Timestamp,
    ) -> Result<Option<AppSpec>, RepoError> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .apps
            .get(&(id.clone(), *version))
            .cloned())
    }

    async fn plans_in_flight(&self) -> Result<Vec<DeploymentPlan>, RepoError> {
        Ok(self.inner.read().unwrap().plans.values().cloned().collect())
    }

    async fn delete_plan(&self, id: &DeploymentId) -> Result<(), RepoError> {
        self.inner.write().unwrap().plans.remove(id);
        Ok(())
    }
}
