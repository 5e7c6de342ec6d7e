//! Group API endpoints.
//!
//! The sole external contract of the control plane: declarative reads and
//! mutations of the group tree under `/v2/groups`. Group ids contain `/`,
//! so the tail of the URL is matched as a wildcard and the `/versions`
//! suffixes are parsed off it explicitly.

use axum::{
    extract::{OriginalUri, Path, Query, RawQuery, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use gantry_events::Event;
use gantry_path::{DeploymentId, PathId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;

use crate::api::authz::{bearer_token, AuthAction};
use crate::api::error::ApiError;
use crate::launch::TaskStatus;
use crate::model::{Group, GroupUpdate, RootGroup, Timestamp, TreeError, UpdateKind};
use crate::planner::DeploymentPlan;
use crate::state::AppState;

/// Create group routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/groups",
            get(get_root).post(post_root).put(put_root),
        )
        .route(
            "/groups/{*path}",
            get(get_path)
                .post(post_path)
                .put(put_path)
                .delete(delete_path),
        )
}

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MutateQuery {
    #[serde(default)]
    force: bool,
    #[serde(default)]
    dry_run: bool,
}

/// Response for every committed mutation.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeploymentResponse {
    deployment_id: DeploymentId,
    version: Timestamp,
}

impl From<&DeploymentPlan> for DeploymentResponse {
    fn from(plan: &DeploymentPlan) -> Self {
        Self {
            deployment_id: plan.id,
            version: plan.version,
        }
    }
}

/// Recognized `embed` values; everything else is ignored.
#[derive(Debug, Clone, Copy)]
struct EmbedSet {
    apps: bool,
    groups: bool,
    tasks: bool,
    counts: bool,
}

fn parse_embeds(query: Option<&str>) -> EmbedSet {
    let mut set = EmbedSet {
        apps: false,
        groups: false,
        tasks: false,
        counts: false,
    };
    let mut any = false;

    for pair in query.unwrap_or_default().split('&') {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        if key != "embed" {
            continue;
        }
        any = true;
        match value {
            "group.apps" => set.apps = true,
            "group.groups" => set.groups = true,
            "group.apps.tasks" => {
                set.apps = true;
                set.tasks = true;
            }
            "group.apps.counts" => {
                set.apps = true;
                set.counts = true;
            }
            // Accepted for compatibility; this deployment has no pods.
            "group.pods" => {}
            _ => {}
        }
    }

    if !any {
        set.apps = true;
        set.groups = true;
    }
    set
}

/// How a wildcard tail resolves.
#[derive(Debug, PartialEq)]
enum GroupRoute {
    Group(PathId),
    Versions(PathId),
    Version(PathId, Timestamp),
}

/// Splits the trailing `/versions[/{v}]` off the wildcard tail.
fn parse_group_route(tail: &str) -> Result<GroupRoute, ApiError> {
    let segments: Vec<&str> = tail.trim_matches('/').split('/').collect();

    let parse_prefix = |segments: &[&str]| -> Result<PathId, ApiError> {
        let joined = format!("/{}", segments.join("/"));
        joined
            .parse()
            .map_err(|e| ApiError::bad_request("invalid_group_id", format!("Invalid group id: {e}")))
    };

    if let [prefix @ .., marker] = segments.as_slice() {
        if *marker == "versions" {
            return Ok(GroupRoute::Versions(parse_prefix(prefix)?));
        }
    }
    if let [prefix @ .., marker, raw_version] = segments.as_slice() {
        if *marker == "versions" {
            let version: Timestamp = raw_version.parse().map_err(|_| {
                ApiError::bad_request(
                    "invalid_version",
                    format!("Invalid version timestamp '{raw_version}'"),
                )
            })?;
            return Ok(GroupRoute::Version(parse_prefix(prefix)?, version));
        }
    }

    Ok(GroupRoute::Group(parse_prefix(&segments)?))
}

async fn authorize(
    state: &AppState,
    headers: &HeaderMap,
    action: AuthAction,
    path: &PathId,
) -> Result<(), ApiError> {
    let token = bearer_token(headers);
    state
        .authorizer()
        .authorize(token.as_deref(), action, path)
        .await?;
    Ok(())
}

// =============================================================================
// Read Handlers
// =============================================================================

/// GET /v2/groups
async fn get_root(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Result<Response, ApiError> {
    authorize(&state, &headers, AuthAction::View, &PathId::root()).await?;
    let embeds = parse_embeds(query.as_deref());
    let root = state.manager().root();
    let body = render_group(&state, root.as_group(), embeds).await?;
    Ok(Json(body).into_response())
}

/// GET /v2/groups/{*path}, including the `/versions` sub-resources.
async fn get_path(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
) -> Result<Response, ApiError> {
    match parse_group_route(&path)? {
        GroupRoute::Group(id) => {
            authorize(&state, &headers, AuthAction::View, &id).await?;
            let Some(group) = state.manager().group(&id) else {
                return Err(ApiError::not_found(
                    "unknown_group",
                    format!("Group '{id}' does not exist"),
                ));
            };
            let embeds = parse_embeds(query.as_deref());
            let body = render_group(&state, &group, embeds).await?;
            Ok(Json(body).into_response())
        }
        GroupRoute::Versions(id) => {
            authorize(&state, &headers, AuthAction::View, &id).await?;
            let versions = state.manager().versions(&id).await?;
            Ok(Json(versions).into_response())
        }
        GroupRoute::Version(id, version) => {
            authorize(&state, &headers, AuthAction::View, &id).await?;
            let Some(group) = state.manager().group_at(&id, &version).await? else {
                return Err(ApiError::not_found(
                    "unknown_version",
                    format!("No version '{version}' of '{id}'"),
                ));
            };
            let embeds = parse_embeds(query.as_deref());
            let body = render_group(&state, &group, embeds).await?;
            Ok(Json(body).into_response())
        }
    }
}

// =============================================================================
// Mutation Handlers
// =============================================================================

/// POST /v2/groups
async fn post_root(
    state: State<AppState>,
    headers: HeaderMap,
    uri: OriginalUri,
    query: Query<MutateQuery>,
    body: Json<GroupUpdate>,
) -> Result<Response, ApiError> {
    create_group(state, headers, uri, query, PathId::root(), body).await
}

/// POST /v2/groups/{*path}
async fn post_path(
    state: State<AppState>,
    headers: HeaderMap,
    uri: OriginalUri,
    Path(path): Path<String>,
    query: Query<MutateQuery>,
    body: Json<GroupUpdate>,
) -> Result<Response, ApiError> {
    let base = parse_plain_group(&path)?;
    create_group(state, headers, uri, query, base, body).await
}

async fn create_group(
    State(state): State<AppState>,
    headers: HeaderMap,
    OriginalUri(uri): OriginalUri,
    Query(query): Query<MutateQuery>,
    base: PathId,
    Json(update): Json<GroupUpdate>,
) -> Result<Response, ApiError> {
    let target = update.target_path(&base);
    authorize(&state, &headers, AuthAction::Edit, &target).await?;

    if !matches!(update.kind(), UpdateKind::Structural) {
        return Err(ApiError::bad_request(
            "invalid_update",
            "Group creation accepts neither 'version' nor 'scaleBy'",
        ));
    }
    if target.is_root() {
        return Err(ApiError::bad_request(
            "missing_group_id",
            "Group creation requires a group id",
        ));
    }

    // Creation of an existing path is a conflict, app or group alike.
    // The check runs inside the mutation closure, against the locked
    // root, so concurrent creators of the same path cannot both pass.
    let plan = {
        let target = target.clone();
        let update = update.clone();
        state
            .manager()
            .update_root(
                &target.clone(),
                move |root, version| update.apply_create(root, &target, version),
                query.force,
            )
            .await?
    };

    state.bus().publish(Event::ApiPostEvent {
        timestamp: Utc::now(),
        uri: uri.path().to_string(),
        group_id: target.clone(),
    });

    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, target.to_string())],
        Json(DeploymentResponse::from(&plan)),
    )
        .into_response())
}

/// PUT /v2/groups
async fn put_root(
    state: State<AppState>,
    headers: HeaderMap,
    uri: OriginalUri,
    query: Query<MutateQuery>,
    body: Json<GroupUpdate>,
) -> Result<Response, ApiError> {
    upsert_group(state, headers, uri, query, PathId::root(), body).await
}

/// PUT /v2/groups/{*path}
async fn put_path(
    state: State<AppState>,
    headers: HeaderMap,
    uri: OriginalUri,
    Path(path): Path<String>,
    query: Query<MutateQuery>,
    body: Json<GroupUpdate>,
) -> Result<Response, ApiError> {
    let base = parse_plain_group(&path)?;
    upsert_group(state, headers, uri, query, base, body).await
}

type MutateFn = Box<dyn FnOnce(&RootGroup, Timestamp) -> Result<RootGroup, TreeError> + Send>;

async fn upsert_group(
    State(state): State<AppState>,
    headers: HeaderMap,
    OriginalUri(uri): OriginalUri,
    Query(query): Query<MutateQuery>,
    base: PathId,
    Json(update): Json<GroupUpdate>,
) -> Result<Response, ApiError> {
    let target = update.target_path(&base);
    authorize(&state, &headers, AuthAction::Edit, &target).await?;

    let mutate: MutateFn = match update.kind() {
        UpdateKind::Revert(version) => {
            // Resolve the stored subtree up front so the mutation itself
            // stays pure.
            let stored = state
                .manager()
                .group_at(&target, &version)
                .await?
                .ok_or_else(|| {
                    ApiError::not_found(
                        "unknown_version",
                        format!("No version '{version}' of '{target}'"),
                    )
                })?;
            Box::new(move |root, v| root.put_group(stored, v))
        }
        UpdateKind::Scale(factor) => {
            let target = target.clone();
            Box::new(move |root, v| GroupUpdate::apply_scale(root, &target, factor, v))
        }
        UpdateKind::Structural => {
            let target = target.clone();
            Box::new(move |root, v| update.apply_structural(root, &target, v))
        }
    };

    if query.dry_run {
        let plan = state.manager().dry_run(mutate).await?;
        return Ok(Json(steps_json(&plan)).into_response());
    }

    let plan = state
        .manager()
        .update_root(&target, mutate, query.force)
        .await?;

    state.bus().publish(Event::ApiPostEvent {
        timestamp: Utc::now(),
        uri: uri.path().to_string(),
        group_id: target,
    });

    Ok(Json(DeploymentResponse::from(&plan)).into_response())
}

/// DELETE /v2/groups/{*path}
async fn delete_path(
    State(state): State<AppState>,
    headers: HeaderMap,
    OriginalUri(uri): OriginalUri,
    Path(path): Path<String>,
    Query(query): Query<MutateQuery>,
) -> Result<Response, ApiError> {
    let target = parse_plain_group(&path)?;
    authorize(&state, &headers, AuthAction::Edit, &target).await?;

    if state.manager().root().group(&target).is_none() {
        return Err(ApiError::not_found(
            "unknown_group",
            format!("Group '{target}' does not exist"),
        ));
    }

    let plan = {
        let target = target.clone();
        state
            .manager()
            .update_root(
                &target.clone(),
                move |root, version| Ok(root.remove_group(&target, version)),
                query.force,
            )
            .await?
    };

    state.bus().publish(Event::ApiPostEvent {
        timestamp: Utc::now(),
        uri: uri.path().to_string(),
        group_id: target,
    });

    Ok(Json(DeploymentResponse::from(&plan)).into_response())
}

fn parse_plain_group(tail: &str) -> Result<PathId, ApiError> {
    format!("/{}", tail.trim_matches('/'))
        .parse()
        .map_err(|e| ApiError::bad_request("invalid_group_id", format!("Invalid group id: {e}")))
}

// =============================================================================
// Rendering
// =============================================================================

/// Dry-run response: the plan's steps without committing anything.
fn steps_json(plan: &DeploymentPlan) -> Value {
    json!({
        "steps": plan
            .steps
            .iter()
            .map(|step| {
                json!({
                    "actions": step
                        .actions
                        .iter()
                        .map(|action| {
                            json!({
                                "action": action.kind_name(),
                                "app": action.app_id().to_string(),
                            })
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect::<Vec<_>>(),
    })
}

async fn render_group(
    state: &AppState,
    group: &Group,
    embeds: EmbedSet,
) -> Result<Value, ApiError> {
    let mut tasks_by_app: HashMap<PathId, Vec<TaskStatus>> = HashMap::new();
    let mut healthy_by_app: HashMap<PathId, usize> = HashMap::new();

    if embeds.tasks || embeds.counts {
        for (id, _) in group.transitive_apps() {
            let tasks = state.launcher().running_tasks(&id).await;
            if embeds.counts {
                let mut healthy = 0usize;
                for task in &tasks {
                    if state.health().task_alive(&id, &task.version, task.id).await {
                        healthy += 1;
                    }
                }
                healthy_by_app.insert(id.clone(), healthy);
            }
            tasks_by_app.insert(id, tasks);
        }
    }

    build_group_json(group, embeds, &tasks_by_app, &healthy_by_app)
}

fn build_group_json(
    group: &Group,
    embeds: EmbedSet,
    tasks_by_app: &HashMap<PathId, Vec<TaskStatus>>,
    healthy_by_app: &HashMap<PathId, usize>,
) -> Result<Value, ApiError> {
    let mut body = json!({
        "id": group.id.to_string(),
        "version": group.version.to_string(),
    });

    if !group.dependencies.is_empty() {
        body["dependencies"] = serde_json::to_value(&group.dependencies)
            .map_err(|e| ApiError::internal("serialization_failed", e.to_string()))?;
    }

    if embeds.apps {
        let mut apps = Vec::new();
        for app in group.apps.values() {
            let mut rendered = serde_json::to_value(app)
                .map_err(|e| ApiError::internal("serialization_failed", e.to_string()))?;
            if embeds.tasks {
                let tasks = tasks_by_app.get(&app.id).cloned().unwrap_or_default();
                rendered["tasks"] = serde_json::to_value(tasks)
                    .map_err(|e| ApiError::internal("serialization_failed", e.to_string()))?;
            }
            if embeds.counts {
                let running = tasks_by_app.get(&app.id).map_or(0, Vec::len);
                let healthy = healthy_by_app.get(&app.id).copied().unwrap_or(0);
                rendered["tasksRunning"] = json!(running);
                rendered["tasksHealthy"] = json!(healthy);
            }
            apps.push(rendered);
        }
        body["apps"] = Value::Array(apps);
    }

    if embeds.groups {
        let mut groups = Vec::new();
        for sub in group.groups.values() {
            groups.push(build_group_json(sub, embeds, tasks_by_app, healthy_by_app)?);
        }
        body["groups"] = Value::Array(groups);
    }

    Ok(body)
}
