//! The deployment planner: diffs two root snapshots into ordered steps.
//!
//! Given the committed root and the requested one, the planner emits a
//! `DeploymentPlan` whose execution transforms the cluster from the former
//! to the latter. Actions within a step carry no dependency edge between
//! them and may run concurrently; steps are strictly sequential, and every
//! action's transitive dependencies complete in earlier steps.
//!
//! Planning is deterministic: identical inputs yield byte-identical plans
//! (BTree iteration plus lexical tie-break by app path).

use std::collections::BTreeMap;

use gantry_path::{DeploymentId, PathId};
use serde::{Deserialize, Serialize};

use crate::model::{AppSpec, RootGroup, Timestamp};

/// One executable action of a deployment step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Action {
    /// Launch a new app to its declared instance count.
    Start { app: AppSpec },

    /// Kill every task of a removed app.
    Stop { app: AppSpec },

    /// Adjust the instance count of an otherwise unchanged app.
    Scale { app: AppSpec, from: u32, to: u32 },

    /// Rolling upgrade from one definition to another.
    Restart { old: AppSpec, new: AppSpec },
}

impl Action {
    /// The app this action operates on.
    #[must_use]
    pub fn app_id(&self) -> &PathId {
        match self {
            Action::Start { app } | Action::Stop { app } | Action::Scale { app, .. } => &app.id,
            Action::Restart { new, .. } => &new.id,
        }
    }

    /// The spec the cluster should converge to (the old one for stops).
    #[must_use]
    pub fn spec(&self) -> &AppSpec {
        match self {
            Action::Start { app } | Action::Stop { app } | Action::Scale { app, .. } => app,
            Action::Restart { new, .. } => new,
        }
    }

    /// Wire name used in dry-run step listings.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Action::Start { .. } => "StartApplication",
            Action::Stop { .. } => "StopApplication",
            Action::Scale { .. } => "ScaleApplication",
            Action::Restart { .. } => "RestartApplication",
        }
    }
}

/// A set of actions with no dependency edges among them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentStep {
    pub actions: Vec<Action>,
}

/// The executable transformation from one committed root to the next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentPlan {
    pub id: DeploymentId,
    pub version: Timestamp,
    pub original: RootGroup,
    pub target: RootGroup,
    pub steps: Vec<DeploymentStep>,
}

impl DeploymentPlan {
    /// Diffs `original` against `target`.
    #[must_use]
    pub fn new(original: RootGroup, target: RootGroup, version: Timestamp) -> Self {
        let steps = plan_steps(&original, &target);
        Self {
            id: DeploymentId::new(),
            version,
            original,
            target,
            steps,
        }
    }

    /// True when the diff is empty and there is nothing to execute.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Every app touched by this plan, in lexical order.
    #[must_use]
    pub fn affected_apps(&self) -> Vec<&PathId> {
        let mut ids: Vec<&PathId> = self
            .steps
            .iter()
            .flat_map(|s| s.actions.iter().map(Action::app_id))
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// The target-side specs created or replaced by this plan, for
    /// persistence of affected app versions.
    #[must_use]
    pub fn changed_specs(&self) -> Vec<&AppSpec> {
        self.steps
            .iter()
            .flat_map(|s| s.actions.iter())
            .filter(|a| !matches!(a, Action::Stop { .. }))
            .map(Action::spec)
            .collect()
    }
}

fn plan_steps(original: &RootGroup, target: &RootGroup) -> Vec<DeploymentStep> {
    let from_apps = original.transitive_apps();
    let to_apps = target.transitive_apps();

    // Diff by app id; BTree iteration keeps this deterministic.
    let mut actions: Vec<Action> = Vec::new();
    for (id, app) in &to_apps {
        match from_apps.get(id) {
            None => actions.push(Action::Start { app: (*app).clone() }),
            Some(old) if old.definition_eq(*app) => {}
            Some(old) if old.is_scale_only_change(*app) => actions.push(Action::Scale {
                app: (*app).clone(),
                from: old.instances,
                to: app.instances,
            }),
            Some(old) => actions.push(Action::Restart {
                old: (*old).clone(),
                new: (*app).clone(),
            }),
        }
    }
    for (id, old) in &from_apps {
        if !to_apps.contains_key(id) {
            actions.push(Action::Stop { app: (*old).clone() });
        }
    }

    if actions.is_empty() {
        return Vec::new();
    }

    // Dependency level: the longest chain of dependency edges below the
    // action, counted over apps that themselves have actions. Dependencies
    // already satisfied (no action) add no edge. Stops resolve their
    // dependencies against the original tree; everything else against the
    // target.
    let mut levels: BTreeMap<PathId, usize> = BTreeMap::new();
    let action_ids: Vec<PathId> = actions.iter().map(|a| a.app_id().clone()).collect();
    for action in &actions {
        let tree = match action {
            Action::Stop { .. } => original,
            _ => target,
        };
        compute_level(tree, action.app_id(), &action_ids, &mut levels, 0);
    }

    let mut by_level: BTreeMap<usize, Vec<Action>> = BTreeMap::new();
    for action in actions {
        let level = levels.get(action.app_id()).copied().unwrap_or(0);
        by_level.entry(level).or_default().push(action);
    }

    by_level
        .into_values()
        .map(|mut actions| {
            actions.sort_by(|a, b| a.app_id().cmp(b.app_id()));
            DeploymentStep { actions }
        })
        .collect()
}

fn compute_level(
    tree: &RootGroup,
    id: &PathId,
    action_ids: &[PathId],
    levels: &mut BTreeMap<PathId, usize>,
    depth: usize,
) -> usize {
    if let Some(level) = levels.get(id) {
        return *level;
    }
    // Cycle/recursion guard; cyclic trees are rejected at validation time.
    if depth > action_ids.len() {
        return 0;
    }

    let level = tree
        .effective_dependencies(id)
        .into_iter()
        .filter(|dep| action_ids.contains(dep))
        .map(|dep| compute_level(tree, &dep, action_ids, levels, depth + 1) + 1)
        .max()
        .unwrap_or(0);

    levels.insert(id.clone(), level);
    level
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> PathId {
        s.parse().unwrap()
    }

    fn ts(n: i64) -> Timestamp {
        use chrono::TimeZone;
        Timestamp::from_datetime(chrono::Utc.timestamp_millis_opt(n).unwrap())
    }

    fn app(id: &str, instances: u32) -> AppSpec {
        AppSpec::new(path(id), "run", instances).with_version(ts(1))
    }

    fn root_with(apps: Vec<AppSpec>) -> RootGroup {
        let mut root = RootGroup::empty(ts(1));
        for app in apps {
            root = root.put_app(app, ts(1)).unwrap();
        }
        root
    }

    #[test]
    fn test_empty_diff_has_no_steps() {
        let a = root_with(vec![app("/a/web", 2)]);
        let plan = DeploymentPlan::new(a.clone(), a, ts(2));
        assert!(plan.is_empty());
    }

    #[test]
    fn test_added_and_removed_apps() {
        let from = root_with(vec![app("/a/old", 1)]);
        let to = root_with(vec![app("/a/new", 2)]);

        let plan = DeploymentPlan::new(from, to, ts(2));
        assert_eq!(plan.steps.len(), 1);
        let actions = &plan.steps[0].actions;
        assert_eq!(actions.len(), 2);
        assert!(matches!(&actions[0], Action::Start { app } if app.id == path("/a/new")));
        assert!(matches!(&actions[1], Action::Stop { app } if app.id == path("/a/old")));
    }

    #[test]
    fn test_scale_only_change_emits_scale() {
        let from = root_with(vec![app("/a/web", 1)]);
        let to = root_with(vec![app("/a/web", 3).with_version(ts(2))]);

        let plan = DeploymentPlan::new(from, to, ts(2));
        assert_eq!(plan.steps.len(), 1);
        assert!(matches!(
            &plan.steps[0].actions[0],
            Action::Scale { from: 1, to: 3, .. }
        ));
    }

    #[test]
    fn test_definition_change_emits_restart() {
        let from = root_with(vec![app("/a/web", 2)]);
        let mut changed = app("/a/web", 2).with_version(ts(2));
        changed.cmd = "run --v2".to_string();
        let to = root_with(vec![changed]);

        let plan = DeploymentPlan::new(from, to, ts(2));
        assert!(matches!(&plan.steps[0].actions[0], Action::Restart { .. }));
    }

    #[test]
    fn test_version_only_change_is_ignored() {
        let from = root_with(vec![app("/a/web", 2)]);
        let to = root_with(vec![app("/a/web", 2).with_version(ts(9))]);
        assert!(DeploymentPlan::new(from, to, ts(9)).is_empty());
    }

    #[test]
    fn test_dependencies_serialize_into_steps() {
        let db = app("/data/db", 1);
        let mut api = app("/svc/api", 1);
        api.dependencies = vec![path("/data/db")];
        let mut web = app("/svc/web", 1);
        web.dependencies = vec![path("/svc/api")];

        let to = root_with(vec![db, api, web]);
        let plan = DeploymentPlan::new(RootGroup::empty(ts(1)), to, ts(2));

        assert_eq!(plan.steps.len(), 3);
        assert_eq!(plan.steps[0].actions[0].app_id(), &path("/data/db"));
        assert_eq!(plan.steps[1].actions[0].app_id(), &path("/svc/api"));
        assert_eq!(plan.steps[2].actions[0].app_id(), &path("/svc/web"));
    }

    #[test]
    fn test_group_dependency_applies_to_all_members() {
        let db = app("/data/db", 1);
        let mut api = app("/svc/api", 1);
        api.dependencies = vec![path("/data")];

        let to = root_with(vec![db, api]);
        let plan = DeploymentPlan::new(RootGroup::empty(ts(1)), to, ts(2));

        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[0].actions[0].app_id(), &path("/data/db"));
        assert_eq!(plan.steps[1].actions[0].app_id(), &path("/svc/api"));
    }

    #[test]
    fn test_satisfied_dependency_adds_no_step() {
        // db already runs unchanged, so api has no edge to an action.
        let db = app("/data/db", 1);
        let mut api = app("/svc/api", 1);
        api.dependencies = vec![path("/data/db")];

        let from = root_with(vec![db.clone()]);
        let to = root_with(vec![db, api]);
        let plan = DeploymentPlan::new(from, to, ts(2));

        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].actions[0].app_id(), &path("/svc/api"));
    }

    #[test]
    fn test_plan_is_deterministic() {
        let to = root_with(vec![app("/b/y", 1), app("/a/x", 1), app("/c/z", 1)]);
        let from = RootGroup::empty(ts(1));

        let a = DeploymentPlan::new(from.clone(), to.clone(), ts(2));
        let b = DeploymentPlan::new(from, to, ts(2));

        let render = |p: &DeploymentPlan| {
            p.steps
                .iter()
                .map(|s| {
                    s.actions
                        .iter()
                        .map(|a| format!("{}:{}", a.kind_name(), a.app_id()))
                        .collect::<Vec<_>>()
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(render(&a), render(&b));
        // Lexical tie-break within the step.
        assert_eq!(
            render(&a)[0],
            vec![
                "StartApplication:/a/x",
                "StartApplication:/b/y",
                "StartApplication:/c/z"
            ]
        );
    }

    #[test]
    fn test_changed_specs_excludes_stops() {
        let from = root_with(vec![app("/a/old", 1)]);
        let to = root_with(vec![app("/a/new", 1)]);
        let plan = DeploymentPlan::new(from, to, ts(2));

        let ids: Vec<String> = plan
            .changed_specs()
            .iter()
            .map(|s| s.id.to_string())
            .collect();
        assert_eq!(ids, vec!["/a/new"]);
    }
}
