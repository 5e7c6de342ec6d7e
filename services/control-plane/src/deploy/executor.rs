//! The deployment executor: drives plan steps against the launch facade.
//!
//! Steps run strictly in order; the actions inside a step fan out
//! concurrently. Each action resolves when its target condition holds.
//! Failed launches retry under the app's backoff strategy until the
//! cumulative delay exhausts `max_launch_delay`, which fails the whole
//! deployment. Cancellation is checked between launches so in-flight
//! facade calls drain instead of dangling.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use gantry_events::{Event, EventBus};
use gantry_path::{DeploymentId, PathId};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::health::HealthRegistry;
use crate::launch::{KillReason, TaskLauncher, TaskStatus};
use crate::model::AppSpec;
use crate::planner::{Action, DeploymentPlan};

/// How long a kill is allowed to take effect before an action gives up.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Poll interval while waiting on task state or capacity headroom.
const WAIT_INTERVAL: Duration = Duration::from_millis(100);

/// Narrow completion interface supplied at plan start; breaks the cycle
/// between the manager and the executor.
#[async_trait]
pub trait DeploymentListener: Send + Sync {
    async fn on_success(&self, id: DeploymentId);
    async fn on_failure(&self, id: DeploymentId, reason: String);
    async fn on_canceled(&self, id: DeploymentId);
}

/// Handle to a running deployment.
pub struct DeploymentHandle {
    pub id: DeploymentId,
    cancel: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl DeploymentHandle {
    /// Instructs the deployment to stop issuing new actions.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// Waits for the deployment task to wind down.
    pub async fn wait(self) {
        let _ = self.join.await;
    }
}

#[derive(Debug)]
enum ActionError {
    Canceled,
    Failed(String),
}

/// Everything an action needs, cheap to clone per spawned action.
#[derive(Clone)]
struct ActionContext {
    launcher: Arc<dyn TaskLauncher>,
    health: Arc<HealthRegistry>,
    bus: EventBus,
    backoff: Arc<Mutex<HashMap<PathId, u32>>>,
    cancel: watch::Receiver<bool>,
}

impl ActionContext {
    fn canceled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Sleeps unless canceled first.
    async fn sleep(&self, duration: Duration) -> Result<(), ActionError> {
        let mut cancel = self.cancel.clone();
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = cancel.changed() => {
                if *cancel.borrow() {
                    Err(ActionError::Canceled)
                } else {
                    Ok(())
                }
            }
        }
    }

    fn publish_status(&self, task: &TaskStatus, status: &str) {
        self.bus.publish(Event::StatusUpdateEvent {
            timestamp: Utc::now(),
            app_id: task.app_id.clone(),
            task_id: task.id,
            task_status: status.to_string(),
        });
    }

    /// Launches one task, retrying under the app's backoff strategy.
    /// `slept` accumulates across the whole action.
    async fn launch_one(
        &self,
        app: &AppSpec,
        slept: &mut Duration,
    ) -> Result<TaskStatus, ActionError> {
        loop {
            if self.canceled() {
                return Err(ActionError::Canceled);
            }
            match self.launcher.launch(app).await {
                Ok(task) => {
                    self.backoff.lock().unwrap().insert(app.id.clone(), 0);
                    self.publish_status(&task, task.state.as_str());
                    return Ok(task);
                }
                Err(e) => {
                    let failures = {
                        let mut backoff = self.backoff.lock().unwrap();
                        let count = backoff.entry(app.id.clone()).or_insert(0);
                        *count += 1;
                        *count
                    };
                    let delay = app.backoff.delay(failures);
                    *slept += delay;
                    if *slept > app.backoff.max_launch_delay() {
                        return Err(ActionError::Failed(format!(
                            "backoff exhausted for '{}': {e}",
                            app.id
                        )));
                    }
                    debug!(
                        app_id = %app.id,
                        failures,
                        delay_ms = delay.as_millis(),
                        "Launch failed, backing off"
                    );
                    self.sleep(delay).await?;
                }
            }
        }
    }

    async fn kill_task(&self, task: &TaskStatus, reason: KillReason) -> Result<(), ActionError> {
        self.launcher
            .kill(&task.id, reason)
            .await
            .map_err(|e| ActionError::Failed(format!("kill of '{}' failed: {e}", task.id)))?;
        self.publish_status(task, "TASK_KILLED");
        Ok(())
    }
}

/// The reconciliation executor.
pub struct DeploymentExecutor {
    launcher: Arc<dyn TaskLauncher>,
    health: Arc<HealthRegistry>,
    bus: EventBus,
    /// Consecutive launch failures per app. Survives across deployments:
    /// a scaling change keeps the counter, a configuration change resets it.
    backoff: Arc<Mutex<HashMap<PathId, u32>>>,
}

impl DeploymentExecutor {
    pub fn new(
        launcher: Arc<dyn TaskLauncher>,
        health: Arc<HealthRegistry>,
        bus: EventBus,
    ) -> Self {
        Self {
            launcher,
            health,
            bus,
            backoff: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Starts driving a plan. The returned handle cancels or awaits it;
    /// completion is reported through `listener`.
    pub fn start(
        &self,
        plan: DeploymentPlan,
        listener: Arc<dyn DeploymentListener>,
    ) -> DeploymentHandle {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let ctx = ActionContext {
            launcher: Arc::clone(&self.launcher),
            health: Arc::clone(&self.health),
            bus: self.bus.clone(),
            backoff: Arc::clone(&self.backoff),
            cancel: cancel_rx,
        };
        let id = plan.id;
        let join = tokio::spawn(run_plan(plan, ctx, listener));
        DeploymentHandle {
            id,
            cancel: cancel_tx,
            join,
        }
    }
}

async fn run_plan(plan: DeploymentPlan, ctx: ActionContext, listener: Arc<dyn DeploymentListener>) {
    let id = plan.id;
    let total_steps = plan.steps.len();
    info!(deployment_id = %id, steps = total_steps, "Deployment starting");

    for (index, step) in plan.steps.into_iter().enumerate() {
        if ctx.canceled() {
            finish_canceled(&ctx, id, &listener).await;
            return;
        }

        ctx.bus.publish(Event::DeploymentInfo {
            timestamp: Utc::now(),
            deployment_id: id,
            current_step: index + 1,
            total_steps,
        });

        let mut handles = Vec::new();
        for action in step.actions {
            let ctx = ctx.clone();
            handles.push(tokio::spawn(run_action(action, ctx)));
        }

        let mut canceled = false;
        let mut failure: Option<String> = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(ActionError::Canceled)) => canceled = true,
                Ok(Err(ActionError::Failed(reason))) => failure = Some(reason),
                Err(e) => failure = Some(format!("action task failed: {e}")),
            }
        }

        if let Some(reason) = failure {
            warn!(deployment_id = %id, %reason, "Deployment failed");
            ctx.bus.publish(Event::DeploymentFailed {
                timestamp: Utc::now(),
                deployment_id: id,
                reason: reason.clone(),
            });
            listener.on_failure(id, reason).await;
            return;
        }
        if canceled {
            finish_canceled(&ctx, id, &listener).await;
            return;
        }
    }

    info!(deployment_id = %id, "Deployment succeeded");
    ctx.bus.publish(Event::DeploymentSuccess {
        timestamp: Utc::now(),
        deployment_id: id,
    });
    listener.on_success(id).await;
}

async fn finish_canceled(ctx: &ActionContext, id: DeploymentId, listener: &Arc<dyn DeploymentListener>) {
    info!(deployment_id = %id, "Deployment canceled");
    ctx.bus.publish(Event::DeploymentCanceled {
        timestamp: Utc::now(),
        deployment_id: id,
    });
    listener.on_canceled(id).await;
}

async fn run_action(action: Action, ctx: ActionContext) -> Result<(), ActionError> {
    match action {
        Action::Start { app } => {
            ctx.health.ensure(&app).await;
            converge_up(&app, app.instances as usize, &ctx).await
        }
        Action::Scale { app, to, .. } => {
            ctx.health.ensure(&app).await;
            let running = ctx.launcher.running_tasks(&app.id).await;
            if running.len() > to as usize {
                kill_surplus(&app, &running, to as usize, KillReason::ScaleDown, &ctx).await?;
            }
            converge_up(&app, to as usize, &ctx).await
        }
        Action::Stop { app } => {
            for task in ctx.launcher.running_tasks(&app.id).await {
                ctx.kill_task(&task, KillReason::AppDeleted).await?;
            }
            await_condition(&ctx, || {
                let launcher = Arc::clone(&ctx.launcher);
                let id = app.id.clone();
                async move { launcher.running_tasks(&id).await.is_empty() }
            })
            .await?;
            ctx.health.purge_app(&app.id).await;
            Ok(())
        }
        Action::Restart { old, new } => rolling_restart(&old, &new, &ctx).await,
    }
}

/// Launches until `target` tasks of the app are running.
async fn converge_up(app: &AppSpec, target: usize, ctx: &ActionContext) -> Result<(), ActionError> {
    let mut slept = Duration::ZERO;
    loop {
        if ctx.canceled() {
            return Err(ActionError::Canceled);
        }
        let running = ctx.launcher.running_tasks(&app.id).await.len();
        if running >= target {
            return Ok(());
        }
        ctx.launch_one(app, &mut slept).await?;
    }
}

/// Kills surplus tasks, newest first, and waits for the drain.
async fn kill_surplus(
    app: &AppSpec,
    running: &[TaskStatus],
    target: usize,
    reason: KillReason,
    ctx: &ActionContext,
) -> Result<(), ActionError> {
    let mut tasks: Vec<&TaskStatus> = running.iter().collect();
    tasks.sort_by(|a, b| b.id.cmp(&a.id));
    for task in tasks.iter().take(running.len() - target) {
        ctx.kill_task(task, reason).await?;
    }

    await_condition(ctx, || {
        let launcher = Arc::clone(&ctx.launcher);
        let id = app.id.clone();
        async move { launcher.running_tasks(&id).await.len() <= target }
    })
    .await
}

/// Rolling upgrade honoring the app's capacity bounds: the healthy count
/// never drops below `ceil(old.instances * minimum_health_capacity)` and
/// the total never exceeds `ceil(old.instances * (1 + maximum_over_capacity))`.
async fn rolling_restart(
    old: &AppSpec,
    new: &AppSpec,
    ctx: &ActionContext,
) -> Result<(), ActionError> {
    let old_count = old.instances as usize;
    let min_healthy = (old_count as f64 * new.upgrade.minimum_health_capacity).ceil() as usize;
    // The surge bound is relative to the old instance count, but the new
    // target must stay reachable once the old tasks are gone.
    let max_total = ((old_count as f64 * (1.0 + new.upgrade.maximum_over_capacity)).ceil()
        as usize)
        .max(new.instances as usize);

    // A configuration change resets the launch backoff counter.
    ctx.backoff.lock().unwrap().remove(&new.id);
    ctx.health.ensure(new).await;

    info!(
        app_id = %new.id,
        min_healthy,
        max_total,
        target = new.instances,
        "Rolling restart starting"
    );

    let mut slept = Duration::ZERO;
    let mut stalled = Duration::ZERO;
    loop {
        if ctx.canceled() {
            return Err(ActionError::Canceled);
        }

        let old_tasks = ctx.launcher.tasks_for_version(&new.id, &old.version).await;
        let new_tasks = ctx.launcher.tasks_for_version(&new.id, &new.version).await;

        if old_tasks.is_empty() && new_tasks.len() >= new.instances as usize {
            if new_tasks.len() > new.instances as usize {
                kill_surplus(new, &new_tasks, new.instances as usize, KillReason::Upgrade, ctx)
                    .await?;
            }
            ctx.health.retire_version(&new.id, &old.version).await;
            return Ok(());
        }

        let mut healthy = 0usize;
        let mut unhealthy_old: Option<&TaskStatus> = None;
        for task in &old_tasks {
            if ctx.health.task_alive(&new.id, &old.version, task.id).await {
                healthy += 1;
            } else if unhealthy_old.is_none() {
                unhealthy_old = Some(task);
            }
        }
        for task in &new_tasks {
            if ctx.health.task_alive(&new.id, &new.version, task.id).await {
                healthy += 1;
            }
        }
        let total = old_tasks.len() + new_tasks.len();

        // Killing an already-unhealthy old task never lowers the healthy
        // count, so it is always allowed.
        if let Some(task) = unhealthy_old {
            ctx.kill_task(task, KillReason::Upgrade).await?;
            stalled = Duration::ZERO;
            continue;
        }

        if new_tasks.len() < new.instances as usize && total < max_total {
            ctx.launch_one(new, &mut slept).await?;
            stalled = Duration::ZERO;
            continue;
        }

        if !old_tasks.is_empty() && healthy > min_healthy {
            // Oldest old task goes first.
            let victim = old_tasks
                .iter()
                .min_by_key(|t| t.id)
                .expect("old_tasks is non-empty");
            ctx.kill_task(victim, KillReason::Upgrade).await?;
            stalled = Duration::ZERO;
            continue;
        }

        // No move is legal right now: wait for probes to mark new tasks
        // healthy, bounded so a pathological capacity config cannot wedge
        // the deployment forever.
        stalled += WAIT_INTERVAL;
        if stalled > new.backoff.max_launch_delay() {
            return Err(ActionError::Failed(format!(
                "rolling restart of '{}' stalled: {healthy} healthy of {total} running, \
                 min_healthy {min_healthy}, max_total {max_total}",
                new.id
            )));
        }
        ctx.sleep(WAIT_INTERVAL).await?;
    }
}

/// Polls `cond` until it holds, the drain timeout expires, or the
/// deployment is canceled.
async fn await_condition<F, Fut>(ctx: &ActionContext, cond: F) -> Result<(), ActionError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let mut waited = Duration::ZERO;
    loop {
        if cond().await {
            return Ok(());
        }
        if waited >= DRAIN_TIMEOUT {
            return Err(ActionError::Failed("timed out waiting for drain".to_string()));
        }
        waited += WAIT_INTERVAL;
        ctx.sleep(WAIT_INTERVAL).await?;
    }
}
