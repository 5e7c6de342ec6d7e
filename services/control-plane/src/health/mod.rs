//! Health supervision.
//!
//! The registry owns one supervisor actor per `(app id, app version,
//! check)`. Supervisors are created when the executor first launches a
//! workload version with checks and retired when no running tasks of that
//! version remain.

mod probe;
mod supervisor;

pub use probe::{check_http, check_tcp, ProbeOutcome};
pub use supervisor::{Health, HealthMessage, HealthSupervisor};

use std::collections::HashMap;
use std::sync::Arc;

use gantry_events::EventBus;
use gantry_path::{PathId, TaskId};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, info};

use crate::actors::{run_actor, ActorHandle};
use crate::launch::TaskLauncher;
use crate::model::{AppSpec, Timestamp};

const SUPERVISOR_MAILBOX: usize = 64;

type SupervisorKey = (PathId, Timestamp, usize);

struct Slot {
    handle: ActorHandle<HealthMessage>,
    shutdown: watch::Sender<bool>,
}

/// Owns and addresses the health supervisor actors.
pub struct HealthRegistry {
    launcher: Arc<dyn TaskLauncher>,
    bus: EventBus,
    supervisors: Mutex<HashMap<SupervisorKey, Slot>>,
}

impl HealthRegistry {
    pub fn new(launcher: Arc<dyn TaskLauncher>, bus: EventBus) -> Self {
        Self {
            launcher,
            bus,
            supervisors: Mutex::new(HashMap::new()),
        }
    }

    /// Ensures a supervisor runs for every check of this app version.
    pub async fn ensure(&self, spec: &AppSpec) {
        let mut supervisors = self.supervisors.lock().await;
        for (index, check) in spec.health_checks.iter().enumerate() {
            let key = (spec.id.clone(), spec.version, index);
            if supervisors.contains_key(&key) {
                continue;
            }

            let (tx, rx) = mpsc::channel(SUPERVISOR_MAILBOX);
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let handle = ActorHandle::new(tx);

            let actor = HealthSupervisor::new(
                spec.id.clone(),
                spec.version,
                check.clone(),
                index,
                Arc::clone(&self.launcher),
                self.bus.clone(),
                handle.clone(),
            );
            tokio::spawn(run_actor(actor, rx, shutdown_rx));

            info!(app_id = %spec.id, version = %spec.version, check = index, "Health supervisor started");
            supervisors.insert(
                key,
                Slot {
                    handle,
                    shutdown: shutdown_tx,
                },
            );
        }
    }

    /// Retires every supervisor of one app version.
    pub async fn retire_version(&self, app_id: &PathId, version: &Timestamp) {
        let mut supervisors = self.supervisors.lock().await;
        let keys: Vec<SupervisorKey> = supervisors
            .keys()
            .filter(|(id, v, _)| id == app_id && v == version)
            .cloned()
            .collect();
        for key in keys {
            if let Some(slot) = supervisors.remove(&key) {
                let _ = slot.handle.try_send(HealthMessage::Stop);
                let _ = slot.shutdown.send(true);
                debug!(app_id = %app_id, version = %version, "Health supervisor retired");
            }
        }
    }

    /// Retires every supervisor of an app, all versions.
    pub async fn purge_app(&self, app_id: &PathId) {
        let mut supervisors = self.supervisors.lock().await;
        let keys: Vec<SupervisorKey> = supervisors
            .keys()
            .filter(|(id, _, _)| id == app_id)
            .cloned()
            .collect();
        for key in keys {
            if let Some(slot) = supervisors.remove(&key) {
                let _ = slot.handle.try_send(HealthMessage::Stop);
                let _ = slot.shutdown.send(true);
            }
        }
    }

    /// Delivers an externally produced result (command-protocol checks) to
    /// every supervisor of the app version.
    pub async fn deliver(
        &self,
        app_id: &PathId,
        version: &Timestamp,
        task_id: TaskId,
        outcome: ProbeOutcome,
    ) {
        let supervisors = self.supervisors.lock().await;
        for ((id, v, _), slot) in supervisors.iter() {
            if id == app_id && v == version {
                let _ = slot
                    .handle
                    .send(HealthMessage::Result {
                        version: *version,
                        task_id,
                        outcome: outcome.clone(),
                    })
                    .await;
            }
        }
    }

    /// A task is alive when every check of its version judges it alive.
    /// Versions without supervisors (no checks declared) count as alive.
    pub async fn task_alive(&self, app_id: &PathId, version: &Timestamp, task_id: TaskId) -> bool {
        let handles: Vec<ActorHandle<HealthMessage>> = {
            let supervisors = self.supervisors.lock().await;
            supervisors
                .iter()
                .filter(|((id, v, _), _)| id == app_id && v == version)
                .map(|(_, slot)| slot.handle.clone())
                .collect()
        };

        for handle in handles {
            let (reply, rx) = oneshot::channel();
            if handle
                .send(HealthMessage::TaskHealth { task_id, reply })
                .await
                .is_err()
            {
                continue;
            }
            match rx.await {
                Ok(health) if !health.alive => return false,
                _ => {}
            }
        }
        true
    }

    /// Merged health records of one app version: a task is alive only if
    /// every check says so, failure counts take the worst check.
    pub async fn app_health(
        &self,
        app_id: &PathId,
        version: &Timestamp,
    ) -> HashMap<TaskId, Health> {
        let handles: Vec<ActorHandle<HealthMessage>> = {
            let supervisors = self.supervisors.lock().await;
            supervisors
                .iter()
                .filter(|((id, v, _), _)| id == app_id && v == version)
                .map(|(_, slot)| slot.handle.clone())
                .collect()
        };

        let mut merged: HashMap<TaskId, Health> = HashMap::new();
        for handle in handles {
            let (reply, rx) = oneshot::channel();
            if handle.send(HealthMessage::AppHealth { reply }).await.is_err() {
                continue;
            }
            let Ok(records) = rx.await else { continue };
            for (task_id, health) in records {
                merged
                    .entry(task_id)
                    .and_modify(|existing| {
                        existing.alive = existing.alive && health.alive;
                        if health.consecutive_failures > existing.consecutive_failures {
                            existing.consecutive_failures = health.consecutive_failures;
                            existing.last_failure = health.last_failure;
                            existing.last_failure_cause = health.last_failure_cause.clone();
                        }
                    })
                    .or_insert(health);
            }
        }
        merged
    }

    /// Number of live supervisors.
    pub async fn supervisor_count(&self) -> usize {
        self.supervisors.lock().await.len()
    }

    /// Stops every supervisor (graceful shutdown).
    pub async fn stop_all(&self) {
        let mut supervisors = self.supervisors.lock().await;
        for (_, slot) in supervisors.drain() {
            let _ = slot.handle.try_send(HealthMessage::Stop);
            let _ = slot.shutdown.send(true);
        }
        info!("All health supervisors stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launch::{MockTaskLauncher, TaskLauncher};
    use crate::model::HealthCheckSpec;
    use gantry_events::Event;

    fn spec_with_command_check(id: &str, max_failures: u32) -> AppSpec {
        let mut spec = AppSpec::new(id.parse().unwrap(), "run", 1);
        spec.health_checks = vec![HealthCheckSpec {
            protocol: crate::model::HealthCheckProtocol::Command {
                value: "./check".to_string(),
            },
            grace_period_secs: 0,
            interval_secs: 60,
            timeout_secs: 5,
            max_consecutive_failures: max_failures,
        }];
        spec
    }

    async fn drain_event(
        sub: &mut gantry_events::EventSubscription,
        event_type: &str,
    ) -> Event {
        loop {
            let event = tokio::time::timeout(std::time::Duration::from_secs(2), sub.recv())
                .await
                .expect("timed out waiting for event")
                .expect("bus closed");
            if event.event_type() == event_type {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn test_three_failures_kill_task() {
        let launcher = Arc::new(MockTaskLauncher::new());
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        let registry = HealthRegistry::new(launcher.clone(), bus.clone());

        let spec = spec_with_command_check("/a/web", 3);
        let task = launcher.launch(&spec).await.unwrap();
        registry.ensure(&spec).await;

        for _ in 0..3 {
            registry
                .deliver(
                    &spec.id,
                    &spec.version,
                    task.id,
                    ProbeOutcome::Unhealthy {
                        cause: "probe failed".to_string(),
                    },
                )
                .await;
        }

        // Three failed-check events, one aliveness flip, one kill.
        for _ in 0..3 {
            drain_event(&mut sub, "failed_health_check").await;
        }
        let flipped = drain_event(&mut sub, "health_status_changed").await;
        assert!(matches!(
            flipped,
            Event::HealthStatusChanged { alive: false, .. }
        ));
        drain_event(&mut sub, "unhealthy_task_kill_event").await;

        let kills = launcher.kill_log();
        assert_eq!(kills.len(), 1);
        assert_eq!(kills[0].0, task.id);
    }

    #[tokio::test]
    async fn test_unreachable_task_is_not_killed() {
        let launcher = Arc::new(MockTaskLauncher::new());
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        let registry = HealthRegistry::new(launcher.clone(), bus.clone());

        let spec = spec_with_command_check("/a/web", 2);
        let task = launcher.launch(&spec).await.unwrap();
        launcher.set_unreachable(&task.id, true);
        registry.ensure(&spec).await;

        for _ in 0..2 {
            registry
                .deliver(
                    &spec.id,
                    &spec.version,
                    task.id,
                    ProbeOutcome::Unhealthy {
                        cause: "probe failed".to_string(),
                    },
                )
                .await;
        }

        // Failure events still flow; the kill is suppressed.
        drain_event(&mut sub, "failed_health_check").await;
        drain_event(&mut sub, "failed_health_check").await;
        drain_event(&mut sub, "health_status_changed").await;

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(launcher.kill_log().is_empty());
        assert!(!registry.task_alive(&spec.id, &spec.version, task.id).await);
    }

    #[tokio::test]
    async fn test_recovery_resets_failures_and_flips_alive() {
        let launcher = Arc::new(MockTaskLauncher::new());
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        let registry = HealthRegistry::new(launcher.clone(), bus.clone());

        let spec = spec_with_command_check("/a/web", 1);
        let task = launcher.launch(&spec).await.unwrap();
        registry.ensure(&spec).await;

        registry
            .deliver(
                &spec.id,
                &spec.version,
                task.id,
                ProbeOutcome::Unhealthy {
                    cause: "down".to_string(),
                },
            )
            .await;
        let down = drain_event(&mut sub, "health_status_changed").await;
        assert!(matches!(down, Event::HealthStatusChanged { alive: false, .. }));

        // The mock kills the task at the threshold; relaunch a fresh one
        // and verify a healthy fold flips aliveness back.
        let task = launcher.launch(&spec).await.unwrap();
        registry
            .deliver(&spec.id, &spec.version, task.id, ProbeOutcome::Healthy)
            .await;
        assert!(registry.task_alive(&spec.id, &spec.version, task.id).await);

        let health = registry.app_health(&spec.id, &spec.version).await;
        let record = health.get(&task.id).unwrap();
        assert_eq!(record.consecutive_failures, 0);
        assert!(record.first_success.is_some());
    }

    #[tokio::test]
    async fn test_retire_version_stops_supervisors() {
        let launcher = Arc::new(MockTaskLauncher::new());
        let registry = HealthRegistry::new(launcher.clone(), EventBus::new());

        let spec = spec_with_command_check("/a/web", 3);
        registry.ensure(&spec).await;
        assert_eq!(registry.supervisor_count().await, 1);

        // Idempotent: re-ensuring the same version adds nothing.
        registry.ensure(&spec).await;
        assert_eq!(registry.supervisor_count().await, 1);

        registry.retire_version(&spec.id, &spec.version).await;
        assert_eq!(registry.supervisor_count().await, 0);
    }
}
