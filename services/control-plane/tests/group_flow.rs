//! End-to-end tests for the `/v2/groups` control flow.
//!
//! These drive the public API over a real listener: create, conflict,
//! scale, dry-run, force-override, delete, and the versions surface.

use std::sync::Arc;
use std::time::Duration;

use gantry_control_plane::api;
use gantry_control_plane::api::authz::AllowAll;
use gantry_control_plane::deploy::{DeploymentExecutor, GroupManager};
use gantry_control_plane::health::HealthRegistry;
use gantry_control_plane::launch::{MockTaskLauncher, TaskLauncher};
use gantry_control_plane::repo::MemoryRepository;
use gantry_control_plane::state::AppState;
use gantry_events::{Event, EventBus, EventSubscription};
use gantry_path::PathId;

struct Harness {
    base_url: String,
    client: reqwest::Client,
    launcher: Arc<MockTaskLauncher>,
    bus: EventBus,
    manager: Arc<GroupManager>,
}

async fn spawn_server() -> Harness {
    let launcher = Arc::new(MockTaskLauncher::new());
    let bus = EventBus::new();
    let health = Arc::new(HealthRegistry::new(launcher.clone(), bus.clone()));
    let executor = DeploymentExecutor::new(launcher.clone(), health.clone(), bus.clone());
    let repo = Arc::new(MemoryRepository::new());
    let manager = Arc::new(
        GroupManager::new(repo, bus.clone(), executor)
            .await
            .expect("manager"),
    );

    let state = AppState::new(
        manager.clone(),
        launcher.clone(),
        health,
        bus.clone(),
        Arc::new(AllowAll),
    );
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Harness {
        base_url: format!("http://{addr}"),
        client: reqwest::Client::new(),
        launcher,
        bus,
        manager,
    }
}

impl Harness {
    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn wait_idle(&self) {
        for _ in 0..200 {
            if self.manager.active_deployment().await.is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("deployment did not finish");
    }
}

async fn next_event(sub: &mut EventSubscription, event_type: &str) -> Event {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event bus closed");
        if event.event_type() == event_type {
            return event;
        }
    }
}

fn path(s: &str) -> PathId {
    s.parse().unwrap()
}

#[tokio::test]
async fn test_create_group_then_read_it() {
    let h = spawn_server().await;

    let resp = h
        .client
        .post(h.url("/v2/groups"))
        .json(&serde_json::json!({
            "id": "/a",
            "apps": [{"id": "b", "cmd": "run", "instances": 1}]
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 201);
    assert_eq!(resp.headers()["location"], "/a");
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body["deploymentId"]
        .as_str()
        .unwrap()
        .starts_with("deploy_"));
    assert!(body["version"].is_string());

    h.wait_idle().await;

    let resp = h.client.get(h.url("/v2/groups/a")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["id"], "/a");
    assert_eq!(body["apps"][0]["id"], "/a/b");
    assert_eq!(body["apps"][0]["instances"], 1);

    // One task is actually running.
    assert_eq!(h.launcher.running_tasks(&path("/a/b")).await.len(), 1);
}

#[tokio::test]
async fn test_double_create_conflicts() {
    let h = spawn_server().await;
    let body = serde_json::json!({
        "id": "/a",
        "apps": [{"id": "b", "cmd": "run", "instances": 1}]
    });

    let first = h
        .client
        .post(h.url("/v2/groups"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 201);
    h.wait_idle().await;

    let second = h
        .client
        .post(h.url("/v2/groups"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), 409);
}

#[tokio::test]
async fn test_scale_by_group_update() {
    let h = spawn_server().await;
    let mut sub = h.bus.subscribe();

    h.client
        .post(h.url("/v2/groups"))
        .json(&serde_json::json!({
            "id": "/a",
            "apps": [{"id": "b", "cmd": "run", "instances": 1}]
        }))
        .send()
        .await
        .unwrap();
    h.wait_idle().await;

    let resp = h
        .client
        .put(h.url("/v2/groups/a"))
        .json(&serde_json::json!({"scaleBy": 2.5}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    next_event(&mut sub, "deployment_success").await;
    h.wait_idle().await;

    let body: serde_json::Value = h
        .client
        .get(h.url("/v2/groups/a"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["apps"][0]["instances"], 3);
    assert_eq!(h.launcher.running_tasks(&path("/a/b")).await.len(), 3);
}

#[tokio::test]
async fn test_dry_run_returns_steps_without_mutating() {
    let h = spawn_server().await;

    h.client
        .post(h.url("/v2/groups"))
        .json(&serde_json::json!({
            "id": "/a",
            "apps": [{"id": "b", "cmd": "run", "instances": 1}]
        }))
        .send()
        .await
        .unwrap();
    h.wait_idle().await;

    let mut sub = h.bus.subscribe();
    let launches_before = h.launcher.launch_count();

    let resp = h
        .client
        .put(h.url("/v2/groups/a"))
        .query(&[("dryRun", "true")])
        .json(&serde_json::json!({"scaleBy": 2.0}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["steps"][0]["actions"][0]["action"], "ScaleApplication");
    assert_eq!(body["steps"][0]["actions"][0]["app"], "/a/b");

    // Nothing changed: same instance count, no new launches, no events.
    let group: serde_json::Value = h
        .client
        .get(h.url("/v2/groups/a"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(group["apps"][0]["instances"], 1);
    assert_eq!(h.launcher.launch_count(), launches_before);
    assert!(matches!(
        sub.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Empty)
    ));
}

#[tokio::test]
async fn test_force_override_cancels_in_flight_deployment() {
    let h = spawn_server().await;

    // Park the first deployment in a long launch backoff.
    h.launcher.fail_next_launches(&path("/slow/web"), 1000);
    let resp = h
        .client
        .post(h.url("/v2/groups"))
        .json(&serde_json::json!({
            "id": "/slow",
            "apps": [{
                "id": "web",
                "cmd": "run",
                "instances": 1,
                "backoff": {
                    "initialSecs": 30.0,
                    "factor": 1.0,
                    "maxSecs": 30.0,
                    "maxLaunchDelaySecs": 600.0
                }
            }]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let d1: serde_json::Value = resp.json().await.unwrap();

    // A second mutation without force is refused with the conflicting id.
    let resp = h
        .client
        .put(h.url("/v2/groups/other"))
        .json(&serde_json::json!({
            "apps": [{"id": "api", "cmd": "run", "instances": 1}]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
    let conflict: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(conflict["code"], "deployment_in_progress");
    assert!(conflict["detail"]
        .as_str()
        .unwrap()
        .contains(d1["deploymentId"].as_str().unwrap()));

    // With force, the stuck deployment is canceled and the new one lands.
    let mut sub = h.bus.subscribe();
    let resp = h
        .client
        .put(h.url("/v2/groups/other"))
        .query(&[("force", "true")])
        .json(&serde_json::json!({
            "apps": [{"id": "api", "cmd": "run", "instances": 1}]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let d2: serde_json::Value = resp.json().await.unwrap();
    assert_ne!(d1["deploymentId"], d2["deploymentId"]);

    next_event(&mut sub, "deployment_canceled").await;
    h.wait_idle().await;
    assert_eq!(h.launcher.running_tasks(&path("/other/api")).await.len(), 1);
}

#[tokio::test]
async fn test_delete_group() {
    let h = spawn_server().await;

    h.client
        .post(h.url("/v2/groups"))
        .json(&serde_json::json!({
            "id": "/a",
            "apps": [{"id": "b", "cmd": "run", "instances": 2}]
        }))
        .send()
        .await
        .unwrap();
    h.wait_idle().await;
    assert_eq!(h.launcher.running_tasks(&path("/a/b")).await.len(), 2);

    let resp = h.client.delete(h.url("/v2/groups/a")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    h.wait_idle().await;

    // Tasks are gone, and so is the group.
    assert!(h.launcher.running_tasks(&path("/a/b")).await.is_empty());
    let resp = h.client.get(h.url("/v2/groups/a")).send().await.unwrap();
    assert_eq!(resp.status(), 404);

    // Deleting it again is a 404.
    let resp = h.client.delete(h.url("/v2/groups/a")).send().await.unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_versions_surface() {
    let h = spawn_server().await;

    h.client
        .post(h.url("/v2/groups"))
        .json(&serde_json::json!({
            "id": "/a",
            "apps": [{"id": "b", "cmd": "run", "instances": 1}]
        }))
        .send()
        .await
        .unwrap();
    h.wait_idle().await;

    h.client
        .put(h.url("/v2/groups/a"))
        .json(&serde_json::json!({"scaleBy": 2.0}))
        .send()
        .await
        .unwrap();
    h.wait_idle().await;

    let versions: Vec<String> = h
        .client
        .get(h.url("/v2/groups/a/versions"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(versions.len(), 2);
    // Newest first.
    assert!(versions[0] > versions[1]);

    // The older snapshot still shows one instance.
    let resp = h
        .client
        .get(h.url(&format!("/v2/groups/a/versions/{}", versions[1])))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["apps"][0]["instances"], 1);

    // Unknown versions 404.
    let resp = h
        .client
        .get(h.url("/v2/groups/a/versions/2000-01-01T00:00:00.000Z"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_embed_tasks_and_counts() {
    let h = spawn_server().await;

    h.client
        .post(h.url("/v2/groups"))
        .json(&serde_json::json!({
            "id": "/a",
            "apps": [{"id": "b", "cmd": "run", "instances": 2}]
        }))
        .send()
        .await
        .unwrap();
    h.wait_idle().await;

    let body: serde_json::Value = h
        .client
        .get(h.url(
            "/v2/groups/a?embed=group.apps&embed=group.apps.tasks&embed=group.apps.counts",
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let app = &body["apps"][0];
    assert_eq!(app["tasksRunning"], 2);
    assert_eq!(app["tasksHealthy"], 2);
    assert_eq!(app["tasks"].as_array().unwrap().len(), 2);
    assert!(app["tasks"][0]["id"].as_str().unwrap().starts_with("task_"));
    // groups were not requested.
    assert!(body.get("groups").is_none());
}

#[tokio::test]
async fn test_unknown_group_is_404_and_bad_body_is_422() {
    let h = spawn_server().await;

    let resp = h.client.get(h.url("/v2/groups/nope")).send().await.unwrap();
    assert_eq!(resp.status(), 404);

    // A structural update whose app escapes the target group is rejected.
    let resp = h
        .client
        .put(h.url("/v2/groups/a"))
        .json(&serde_json::json!({
            "apps": [{"id": "/elsewhere/web", "cmd": "run", "instances": 1}]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 422);
}

#[tokio::test]
async fn test_revert_to_prior_version() {
    let h = spawn_server().await;

    h.client
        .post(h.url("/v2/groups"))
        .json(&serde_json::json!({
            "id": "/a",
            "apps": [{"id": "b", "cmd": "run", "instances": 1}]
        }))
        .send()
        .await
        .unwrap();
    h.wait_idle().await;

    h.client
        .put(h.url("/v2/groups/a"))
        .json(&serde_json::json!({"scaleBy": 4.0}))
        .send()
        .await
        .unwrap();
    h.wait_idle().await;

    let versions: Vec<String> = h
        .client
        .get(h.url("/v2/groups/a/versions"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let original = &versions[1];

    // Revert the subtree to its stored prior version.
    let resp = h
        .client
        .put(h.url("/v2/groups/a"))
        .json(&serde_json::json!({"version": original}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    h.wait_idle().await;

    let body: serde_json::Value = h
        .client
        .get(h.url("/v2/groups/a"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["apps"][0]["instances"], 1);
    assert_eq!(h.launcher.running_tasks(&path("/a/b")).await.len(), 1);
}
