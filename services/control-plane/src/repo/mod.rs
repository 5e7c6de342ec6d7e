//! The snapshot repository.
//!
//! Persists immutable snapshots keyed by `(kind, id, version)`: root
//! snapshots, app specs, and deployment plans in flight. The "current"
//! root is tagged separately and only moves under compare-and-swap on the
//! root version; with the manager's single-writer discipline a CAS failure
//! means a bug or a second writer, and the pre-mutation root stays
//! authoritative.

mod memory;
mod sqlite;

pub use memory::MemoryRepository;
pub use sqlite::SqliteRepository;

use async_trait::async_trait;
use gantry_path::{DeploymentId, PathId};
use thiserror::Error;

use crate::model::{AppSpec, RootGroup, Timestamp};
use crate::planner::DeploymentPlan;

/// Storage kinds, used as key prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Root,
    App,
    Plan,
}

impl Kind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Root => "root",
            Kind::App => "app",
            Kind::Plan => "plan",
        }
    }
}

/// Errors from repository operations.
#[derive(Debug, Error)]
pub enum RepoError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("root version conflict: expected {expected:?}, found {actual:?}")]
    VersionConflict {
        expected: Option<String>,
        actual: Option<String>,
    },
}

impl From<rusqlite::Error> for RepoError {
    fn from(e: rusqlite::Error) -> Self {
        RepoError::Storage(e.to_string())
    }
}

/// One atomic commit: the new root, the app versions it changed, and the
/// plan that will converge the cluster onto it.
#[derive(Debug, Clone)]
pub struct Commit {
    pub root: RootGroup,
    pub apps: Vec<AppSpec>,
    pub plan: DeploymentPlan,
    /// CAS guard: the root version the writer read before mutating.
    pub expected_root: Option<Timestamp>,
}

/// Versioned key-value store for snapshots.
#[async_trait]
pub trait GroupRepository: Send + Sync {
    /// Cheap reachability probe, used at startup.
    async fn ping(&self) -> Result<(), RepoError>;

    /// The currently tagged root, if any commit has happened.
    async fn current_root(&self) -> Result<Option<RootGroup>, RepoError>;

    /// Atomically persists a commit and moves the current-root tag.
    async fn commit(&self, commit: Commit) -> Result<(), RepoError>;

    /// A specific stored root version.
    async fn root_at(&self, version: &Timestamp) -> Result<Option<RootGroup>, RepoError>;

    /// All stored root versions, newest first.
    async fn root_versions(&self) -> Result<Vec<Timestamp>, RepoError>;

    /// A specific stored app version.
    async fn app_at(&self, id: &PathId, version: &Timestamp)
        -> Result<Option<AppSpec>, RepoError>;

    /// Deployment plans that have not completed.
    async fn plans_in_flight(&self) -> Result<Vec<DeploymentPlan>, RepoError>;

    /// Drops a completed plan.
    async fn delete_plan(&self, id: &DeploymentId) -> Result<(), RepoError>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared contract tests run against every repository implementation.

    use super::*;

    fn ts(n: i64) -> Timestamp {
        use chrono::TimeZone;
        Timestamp::from_datetime(chrono::Utc.timestamp_millis_opt(n).unwrap())
    }

    fn sample_commit(version: Timestamp, expected: Option<Timestamp>) -> Commit {
        let app = AppSpec::new("/a/web".parse().unwrap(), "run", 1).with_version(version);
        let root = RootGroup::empty(ts(0))
            .put_app(app.clone(), version)
            .unwrap();
        let plan = DeploymentPlan::new(RootGroup::empty(ts(0)), root.clone(), version);
        Commit {
            root,
            apps: vec![app],
            plan,
            expected_root: expected,
        }
    }

    pub async fn exercise_repository(repo: &dyn GroupRepository) {
        repo.ping().await.unwrap();
        assert!(repo.current_root().await.unwrap().is_none());

        // First commit expects no prior root.
        let first = sample_commit(ts(100), None);
        let first_plan_id = first.plan.id;
        repo.commit(first).await.unwrap();

        let head = repo.current_root().await.unwrap().unwrap();
        assert_eq!(head.version(), ts(100));

        // CAS with a stale expectation fails and leaves the head alone.
        let stale = sample_commit(ts(200), Some(ts(50)));
        assert!(matches!(
            repo.commit(stale).await,
            Err(RepoError::VersionConflict { .. })
        ));
        assert_eq!(repo.current_root().await.unwrap().unwrap().version(), ts(100));

        // CAS with the right expectation succeeds.
        let second = sample_commit(ts(200), Some(ts(100)));
        repo.commit(second).await.unwrap();
        assert_eq!(repo.current_root().await.unwrap().unwrap().version(), ts(200));

        // Versions come back newest first.
        let versions = repo.root_versions().await.unwrap();
        assert_eq!(versions, vec![ts(200), ts(100)]);

        // Old snapshots and app versions stay addressable.
        let old = repo.root_at(&ts(100)).await.unwrap().unwrap();
        assert_eq!(old.version(), ts(100));
        assert!(repo.root_at(&ts(42)).await.unwrap().is_none());

        let app_id: PathId = "/a/web".parse().unwrap();
        assert!(repo.app_at(&app_id, &ts(100)).await.unwrap().is_some());
        assert!(repo.app_at(&app_id, &ts(42)).await.unwrap().is_none());

        // Plans stay in flight until deleted.
        let in_flight = repo.plans_in_flight().await.unwrap();
        assert_eq!(in_flight.len(), 2);
        repo.delete_plan(&first_plan_id).await.unwrap();
        assert_eq!(repo.plans_in_flight().await.unwrap().len(), 1);
    }
}
