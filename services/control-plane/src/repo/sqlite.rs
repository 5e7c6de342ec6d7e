//! SQLite-backed repository.
//!
//! Durable storage for snapshots, enabling recovery after control-plane
//! restarts. One `snapshots` table keyed `(kind, id, version)` holds JSON
//! payloads; a single-row `head` table tags the current root and carries
//! the CAS guard.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use gantry_path::{DeploymentId, PathId};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::model::{AppSpec, RootGroup, Timestamp};
use crate::planner::DeploymentPlan;

use super::{Commit, GroupRepository, Kind, RepoError};

/// SQLite repository. All access funnels through one connection; the
/// single-writer discipline upstream keeps contention trivial.
pub struct SqliteRepository {
    conn: Mutex<Connection>,
}

impl SqliteRepository {
    /// Opens or creates a repository at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, RepoError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let repo = Self {
            conn: Mutex::new(conn),
        };
        repo.init_schema()?;
        Ok(repo)
    }

    /// Opens an in-memory repository (for testing).
    pub fn open_in_memory() -> Result<Self, RepoError> {
        let conn = Connection::open_in_memory()?;
        let repo = Self {
            conn: Mutex::new(conn),
        };
        repo.init_schema()?;
        Ok(repo)
    }

    fn init_schema(&self) -> Result<(), RepoError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS snapshots (
                kind TEXT NOT NULL,
                id TEXT NOT NULL,
                version TEXT NOT NULL,
                payload TEXT NOT NULL,
                PRIMARY KEY (kind, id, version)
            );

            CREATE TABLE IF NOT EXISTS head (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                root_version TEXT
            );

            INSERT OR IGNORE INTO head (id, root_version) VALUES (1, NULL);
            "#,
        )?;
        debug!("Repository schema initialized");
        Ok(())
    }

    fn head_version(conn: &Connection) -> Result<Option<Timestamp>, RepoError> {
        let raw: Option<String> =
            conn.query_row("SELECT root_version FROM head WHERE id = 1", [], |row| {
                row.get(0)
            })?;
        match raw {
            None => Ok(None),
            Some(s) => s
                .parse()
                .map(Some)
                .map_err(|e| RepoError::Storage(format!("corrupt head version: {e}"))),
        }
    }
}

#[async_trait]
impl GroupRepository for SqliteRepository {
    async fn ping(&self) -> Result<(), RepoError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    async fn current_root(&self) -> Result<Option<RootGroup>, RepoError> {
        let conn = self.conn.lock().unwrap();
        let Some(version) = Self::head_version(&conn)? else {
            return Ok(None);
        };
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM snapshots WHERE kind = ?1 AND id = ?2 AND version = ?3",
                params![Kind::Root.as_str(), "/", version.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        match payload {
            None => Ok(None),
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        }
    }

    async fn commit(&self, commit: Commit) -> Result<(), RepoError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let head = Self::head_version(&tx)?;
        if head != commit.expected_root {
            return Err(RepoError::VersionConflict {
                expected: commit.expected_root.map(|v| v.to_string()),
                actual: head.map(|v| v.to_string()),
            });
        }

        let version = commit.root.version();
        tx.execute(
            "INSERT OR REPLACE INTO snapshots (kind, id, version, payload) VALUES (?1, ?2, ?3, ?4)",
            params![
                Kind::Root.as_str(),
                "/",
                version.to_string(),
                serde_json::to_string(&commit.root)?
            ],
        )?;
        for app in &commit.apps {
            tx.execute(
                "INSERT OR REPLACE INTO snapshots (kind, id, version, payload) VALUES (?1, ?2, ?3, ?4)",
                params![
                    Kind::App.as_str(),
                    app.id.to_string(),
                    app.version.to_string(),
                    serde_json::to_string(app)?
                ],
            )?;
        }
        tx.execute(
            "INSERT OR REPLACE INTO snapshots (kind, id, version, payload) VALUES (?1, ?2, ?3, ?4)",
            params![
                Kind::Plan.as_str(),
                commit.plan.id.to_string(),
                commit.plan.version.to_string(),
                serde_json::to_string(&commit.plan)?
            ],
        )?;
        tx.execute(
            "UPDATE head SET root_version = ?1 WHERE id = 1",
            params![version.to_string()],
        )?;

        tx.commit()?;
        Ok(())
    }

    async fn root_at(&self, version: &Timestamp) -> Result<Option<RootGroup>, RepoError> {
        let conn = self.conn.lock().unwrap();
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM snapshots WHERE kind = ?1 AND id = ?2 AND version = ?3",
                params![Kind::Root.as_str(), "/", version.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        match payload {
            None => Ok(None),
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        }
    }

    async fn root_versions(&self) -> Result<Vec<Timestamp>, RepoError> {
        let conn = self.conn.lock().unwrap();
        // Fixed-width RFC 3339 strings sort chronologically.
        let mut stmt = conn.prepare(
            "SELECT version FROM snapshots WHERE kind = ?1 ORDER BY version DESC",
        )?;
        let versions = stmt
            .query_map(params![Kind::Root.as_str()], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;

        versions
            .into_iter()
            .map(|s| {
                s.parse()
                    .map_err(|e| RepoError::Storage(format!("corrupt version key: {e}")))
            })
            .collect()
    }

    async fn app_at(
        &self,
        id: &PathId,
        version: &Timestamp,
    ) -> Result<Option<AppSpec>, RepoError> {
        let conn = self.conn.lock().unwrap();
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM snapshots WHERE kind = ?1 AND id = ?2 AND version = ?3",
                params![Kind::App.as_str(), id.to_string(), version.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        match payload {
            None => Ok(None),
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        }
    }

    async fn plans_in_flight(&self) -> Result<Vec<DeploymentPlan>, RepoError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT payload FROM snapshots WHERE kind = ?1 ORDER BY version ASC",
        )?;
        let payloads = stmt
            .query_map(params![Kind::Plan.as_str()], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;

        payloads
            .into_iter()
            .map(|json| serde_json::from_str(&json).map_err(RepoError::from))
            .collect()
    }

    async fn delete_plan(&self, id: &DeploymentId) -> Result<(), RepoError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM snapshots WHERE kind = ?1 AND id = ?2",
            params![Kind::Plan.as_str(), id.to_string()],
        )?;
        Ok(())
    }
}
