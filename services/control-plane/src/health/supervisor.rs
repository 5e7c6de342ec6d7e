//! The per-workload health supervisor actor.
//!
//! One supervisor exists per `(app id, app version, check)`. On every tick
//! it purges records for tasks that left the running set, dispatches one
//! probe worker per running task, and reschedules itself; probe results
//! come back through its own mailbox and are folded one at a time.
//!
//! Command-protocol checks are never scheduled here: their results are
//! delivered asynchronously by the task runtime through the same
//! `Result` message.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use gantry_events::{Event, EventBus};
use gantry_path::{PathId, TaskId};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::actors::{Actor, ActorError, ActorHandle};
use crate::launch::{KillReason, TaskLauncher, TaskStatus};
use crate::model::{HealthCheckProtocol, HealthCheckSpec, Timestamp};

use super::probe::{check_http, check_tcp, ProbeOutcome};

/// The supervisor's judgment about one task.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    pub consecutive_failures: u32,
    pub first_success: Option<Timestamp>,
    pub last_success: Option<Timestamp>,
    pub last_failure: Option<Timestamp>,
    pub last_failure_cause: Option<String>,
    pub alive: bool,
}

impl Health {
    /// The zero record: no history, alive.
    #[must_use]
    pub fn zero() -> Self {
        Self {
            consecutive_failures: 0,
            first_success: None,
            last_success: None,
            last_failure: None,
            last_failure_cause: None,
            alive: true,
        }
    }

    /// The aliveness invariant: alive iff under the failure threshold,
    /// with a zero threshold forcing alive.
    #[must_use]
    pub fn is_alive(consecutive_failures: u32, max_consecutive_failures: u32) -> bool {
        max_consecutive_failures == 0 || consecutive_failures < max_consecutive_failures
    }
}

/// Messages handled by the supervisor.
#[derive(Debug)]
pub enum HealthMessage {
    /// Periodic probe cycle.
    Tick,

    /// A probe (or runtime-delivered command check) result.
    Result {
        version: Timestamp,
        task_id: TaskId,
        outcome: ProbeOutcome,
    },

    /// Reply with one task's record (zero if unknown).
    TaskHealth {
        task_id: TaskId,
        reply: oneshot::Sender<Health>,
    },

    /// Reply with every record.
    AppHealth {
        reply: oneshot::Sender<HashMap<TaskId, Health>>,
    },

    /// Cancel the scheduled tick and exit.
    Stop,
}

/// Actor probing one check of one app version.
pub struct HealthSupervisor {
    app_id: PathId,
    app_version: Timestamp,
    check: HealthCheckSpec,
    launcher: Arc<dyn TaskLauncher>,
    bus: EventBus,
    mailbox: ActorHandle<HealthMessage>,
    health: HashMap<TaskId, Health>,
    scheduled_tick: Option<JoinHandle<()>>,
    name: String,
}

impl HealthSupervisor {
    pub fn new(
        app_id: PathId,
        app_version: Timestamp,
        check: HealthCheckSpec,
        check_index: usize,
        launcher: Arc<dyn TaskLauncher>,
        bus: EventBus,
        mailbox: ActorHandle<HealthMessage>,
    ) -> Self {
        let name = format!("health:{app_id}@{app_version}#{check_index}");
        Self {
            app_id,
            app_version,
            check,
            launcher,
            bus,
            mailbox,
            health: HashMap::new(),
            scheduled_tick: None,
            name,
        }
    }

    async fn handle_tick(&mut self) {
        let tasks = self
            .launcher
            .tasks_for_version(&self.app_id, &self.app_version)
            .await;

        // Purge records for tasks that left the running set.
        self.health.retain(|id, _| tasks.iter().any(|t| &t.id == id));

        for task in &tasks {
            self.dispatch_probe(task);
        }

        debug!(
            supervisor = %self.name,
            tasks = tasks.len(),
            "Health tick dispatched"
        );
        self.reschedule();
    }

    fn dispatch_probe(&self, task: &TaskStatus) {
        let (path, port_index) = match &self.check.protocol {
            HealthCheckProtocol::Http { path, port_index } => (Some(path.clone()), *port_index),
            HealthCheckProtocol::Tcp { port_index } => (None, *port_index),
            // Delivered by the task runtime, never scheduled here.
            HealthCheckProtocol::Command { .. } => return,
        };

        let Some(port) = task.ports.get(port_index).copied() else {
            warn!(
                supervisor = %self.name,
                task_id = %task.id,
                port_index,
                "Task exposes no port at the check's port index"
            );
            return;
        };

        let addr = format!("{}:{}", task.host, port);
        let timeout = self.check.probe_timeout();
        let mailbox = self.mailbox.clone();
        let version = self.app_version;
        let task_id = task.id;

        tokio::spawn(async move {
            let outcome = match path {
                Some(path) => check_http(&addr, &path, timeout).await,
                None => check_tcp(&addr, timeout).await,
            };
            let _ = mailbox
                .send(HealthMessage::Result {
                    version,
                    task_id,
                    outcome,
                })
                .await;
        });
    }

    fn reschedule(&mut self) {
        if let Some(tick) = self.scheduled_tick.take() {
            tick.abort();
        }
        let mailbox = self.mailbox.clone();
        let interval = std::time::Duration::from_secs(self.check.interval_secs);
        self.scheduled_tick = Some(tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let _ = mailbox.send(HealthMessage::Tick).await;
        }));
    }

    async fn fold_result(&mut self, task_id: TaskId, outcome: ProbeOutcome) {
        // Results for tasks outside the running set are dropped entirely.
        let tasks = self
            .launcher
            .tasks_for_version(&self.app_id, &self.app_version)
            .await;
        let Some(task) = tasks.iter().find(|t| t.id == task_id) else {
            debug!(supervisor = %self.name, task_id = %task_id, "Dropping result for unknown task");
            return;
        };

        let now = Timestamp::now();
        let prev = self.health.get(&task_id).cloned().unwrap_or_else(Health::zero);
        let max_failures = self.check.max_consecutive_failures;
        let mut next = prev.clone();

        match outcome {
            ProbeOutcome::Healthy => {
                if next.first_success.is_none() {
                    next.first_success = Some(now);
                }
                next.last_success = Some(now);
                next.consecutive_failures = 0;
                next.alive = true;
            }
            ProbeOutcome::Unhealthy { cause } => {
                // Grace suppresses failures before the first success.
                let grace_ends =
                    task.started_at.millis() + (self.check.grace_period_secs as i64) * 1000;
                if prev.first_success.is_none() && now.millis() < grace_ends {
                    debug!(
                        supervisor = %self.name,
                        task_id = %task_id,
                        "Discarding failure inside grace period"
                    );
                    return;
                }

                next.consecutive_failures += 1;
                next.last_failure = Some(now);
                next.last_failure_cause = Some(cause);
                next.alive = Health::is_alive(next.consecutive_failures, max_failures);

                self.bus.publish(Event::FailedHealthCheck {
                    timestamp: Utc::now(),
                    app_id: self.app_id.clone(),
                    task_id,
                    version: self.app_version.to_string(),
                });

                if max_failures > 0 && next.consecutive_failures >= max_failures {
                    if self.launcher.is_reachable(&task_id).await {
                        if let Err(e) = self
                            .launcher
                            .kill(&task_id, KillReason::FailedHealthChecks)
                            .await
                        {
                            warn!(
                                supervisor = %self.name,
                                task_id = %task_id,
                                error = %e,
                                "Kill request failed"
                            );
                        } else {
                            self.bus.publish(Event::UnhealthyTaskKillEvent {
                                timestamp: Utc::now(),
                                app_id: self.app_id.clone(),
                                task_id,
                                version: self.app_version.to_string(),
                                reason: KillReason::FailedHealthChecks.to_string(),
                            });
                        }
                    } else {
                        // A network partition must not cause mass termination.
                        debug!(
                            supervisor = %self.name,
                            task_id = %task_id,
                            "Task unreachable, suppressing kill"
                        );
                    }
                }
            }
        }

        // The aliveness transition is judged against the pre-fold record.
        if next.alive != prev.alive {
            self.bus.publish(Event::HealthStatusChanged {
                timestamp: Utc::now(),
                app_id: self.app_id.clone(),
                task_id,
                version: self.app_version.to_string(),
                alive: next.alive,
            });
        }

        self.health.insert(task_id, next);
    }
}

#[async_trait]
impl Actor for HealthSupervisor {
    type Message = HealthMessage;

    fn name(&self) -> &str {
        &self.name
    }

    async fn on_start(&mut self) -> Result<(), ActorError> {
        // Probe immediately; the tick then self-schedules.
        self.mailbox
            .try_send(HealthMessage::Tick)
            .map_err(|e| ActorError::Transient(e.to_string()))?;
        Ok(())
    }

    async fn handle(&mut self, msg: HealthMessage) -> Result<bool, ActorError> {
        match msg {
            HealthMessage::Tick => {
                self.handle_tick().await;
                Ok(true)
            }
            HealthMessage::Result {
                version,
                task_id,
                outcome,
            } => {
                if version != self.app_version {
                    debug!(supervisor = %self.name, "Dropping result for foreign version");
                    return Ok(true);
                }
                self.fold_result(task_id, outcome).await;
                Ok(true)
            }
            HealthMessage::TaskHealth { task_id, reply } => {
                let health = self
                    .health
                    .get(&task_id)
                    .cloned()
                    .unwrap_or_else(Health::zero);
                let _ = reply.send(health);
                Ok(true)
            }
            HealthMessage::AppHealth { reply } => {
                let _ = reply.send(self.health.clone());
                Ok(true)
            }
            HealthMessage::Stop => Ok(false),
        }
    }

    async fn on_stop(&mut self) {
        if let Some(tick) = self.scheduled_tick.take() {
            tick.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_record_is_alive() {
        let zero = Health::zero();
        assert!(zero.alive);
        assert_eq!(zero.consecutive_failures, 0);
        assert!(zero.first_success.is_none());
    }

    #[test]
    fn test_aliveness_invariant() {
        assert!(Health::is_alive(0, 3));
        assert!(Health::is_alive(2, 3));
        assert!(!Health::is_alive(3, 3));
        assert!(!Health::is_alive(7, 3));
        // Zero threshold forces alive.
        assert!(Health::is_alive(100, 0));
    }
}
