//! The root snapshot and its pure transformations.
//!
//! All operations are value-returning path-copies: the spine from the root
//! down to the change is rebuilt with the new version stamp, untouched
//! siblings are cloned as-is. Nothing is mutated in place.

use std::collections::{BTreeMap, BTreeSet};

use gantry_path::PathId;
use serde::{Deserialize, Serialize};

use super::{AppSpec, FieldError, Group, Timestamp, TreeError, ValidationError};

/// The distinguished top-level group: the whole declarative state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RootGroup {
    group: Group,
}

impl RootGroup {
    /// An empty root at `version`.
    #[must_use]
    pub fn empty(version: Timestamp) -> Self {
        Self {
            group: Group::empty(PathId::root(), version),
        }
    }

    /// Wraps an existing tree; the group's id must be the root path.
    pub fn from_group(group: Group) -> Result<Self, TreeError> {
        if !group.id.is_root() {
            return Err(TreeError::InvalidHierarchy {
                parent: PathId::root(),
                child: group.id,
            });
        }
        Ok(Self { group })
    }

    /// The version of the last structural change.
    #[must_use]
    pub fn version(&self) -> Timestamp {
        self.group.version
    }

    /// The underlying tree.
    #[must_use]
    pub fn as_group(&self) -> &Group {
        &self.group
    }

    /// Looks up a group anywhere in the tree.
    #[must_use]
    pub fn group(&self, id: &PathId) -> Option<&Group> {
        self.group.find_group(id)
    }

    /// Looks up an app anywhere in the tree.
    #[must_use]
    pub fn app(&self, id: &PathId) -> Option<&AppSpec> {
        self.group.find_app(id)
    }

    /// Every app in the tree, flattened, in lexical path order.
    #[must_use]
    pub fn transitive_apps(&self) -> BTreeMap<PathId, &AppSpec> {
        self.group.transitive_apps()
    }

    /// Inserts or replaces a subtree, auto-vivifying missing ancestors as
    /// empty groups. Every ancestor of the change is stamped with `version`.
    pub fn put_group(&self, group: Group, version: Timestamp) -> Result<Self, TreeError> {
        if group.id.is_root() {
            let mut group = group;
            group.version = version;
            return Ok(Self { group });
        }
        Ok(Self {
            group: put_group_in(&self.group, group, version)?,
        })
    }

    /// Inserts or replaces an app, auto-vivifying missing ancestors.
    pub fn put_app(&self, app: AppSpec, version: Timestamp) -> Result<Self, TreeError> {
        Ok(Self {
            group: put_app_in(&self.group, app, version)?,
        })
    }

    /// Detaches a subtree, pruning ancestors left empty by the removal.
    /// Removing the root path empties the whole tree.
    #[must_use]
    pub fn remove_group(&self, id: &PathId, version: Timestamp) -> Self {
        if id.is_root() {
            return Self::empty(version);
        }
        Self {
            group: remove_in(&self.group, id, version, Target::Group).0,
        }
    }

    /// Removes a single app, pruning ancestors left empty.
    #[must_use]
    pub fn remove_app(&self, id: &PathId, version: Timestamp) -> Self {
        Self {
            group: remove_in(&self.group, id, version, Target::App).0,
        }
    }

    /// Maps `f` over every app under `id`, stamping the touched spine with
    /// `version`.
    pub fn update_transitive_apps<F>(
        &self,
        id: &PathId,
        f: F,
        version: Timestamp,
    ) -> Result<Self, TreeError>
    where
        F: Fn(&AppSpec) -> AppSpec,
    {
        if self.group.find_group(id).is_none() {
            return Err(TreeError::UnknownGroup(id.clone()));
        }
        Ok(Self {
            group: map_apps_in(&self.group, id, &f, version),
        })
    }

    /// Checks the tree invariants: key/id agreement, direct-child
    /// placement, app/group path disjointness, and dependency acyclicity.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut errors = Vec::new();
        self.group.check_invariants(&mut errors);

        let apps = self.transitive_apps();
        let group_ids: BTreeSet<&PathId> =
            self.group.transitive_groups().iter().map(|g| &g.id).collect();
        for id in apps.keys() {
            if group_ids.contains(id) {
                errors.push(FieldError {
                    field: id.to_string(),
                    message: "path names both an app and a group".to_string(),
                });
            }
        }

        self.check_dependency_cycles(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::new(errors))
        }
    }

    /// The effective dependencies of an app: its own plus those declared
    /// on every ancestor group, each resolved to the set of app ids it
    /// names (a group dependency means every app under that group).
    #[must_use]
    pub fn effective_dependencies(&self, app_id: &PathId) -> BTreeSet<PathId> {
        let mut declared: Vec<PathId> = Vec::new();
        if let Some(app) = self.app(app_id) {
            declared.extend(app.dependencies.iter().cloned());
        }
        for ancestor in app_id.ancestors() {
            if let Some(group) = self.group(&ancestor) {
                declared.extend(group.dependencies.iter().cloned());
            }
        }

        let mut out = BTreeSet::new();
        for dep in declared {
            if self.app(&dep).is_some() {
                out.insert(dep);
            } else if let Some(group) = self.group(&dep) {
                out.extend(group.transitive_apps().keys().cloned());
            }
            // Unknown targets add no edge.
        }
        out.remove(app_id);
        out
    }

    fn check_dependency_cycles(&self, errors: &mut Vec<FieldError>) {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit(
            root: &RootGroup,
            id: &PathId,
            marks: &mut BTreeMap<PathId, Mark>,
        ) -> bool {
            match marks.get(id) {
                Some(Mark::Done) => return true,
                Some(Mark::Visiting) => return false,
                None => {}
            }
            marks.insert(id.clone(), Mark::Visiting);
            for dep in root.effective_dependencies(id) {
                if !visit(root, &dep, marks) {
                    return false;
                }
            }
            marks.insert(id.clone(), Mark::Done);
            true
        }

        let mut marks = BTreeMap::new();
        for id in self.transitive_apps().keys() {
            if !visit(self, id, &mut marks) {
                errors.push(FieldError {
                    field: id.to_string(),
                    message: "dependency cycle detected".to_string(),
                });
                return;
            }
        }
    }

    /// The tree with every version stamp normalized away, for comparisons
    /// that ignore ancestor-version churn.
    #[must_use]
    pub fn without_versions(&self) -> Self {
        fn strip(group: &Group) -> Group {
            Group {
                id: group.id.clone(),
                version: Timestamp::zero(),
                apps: group
                    .apps
                    .iter()
                    .map(|(k, a)| (k.clone(), a.clone().with_version(Timestamp::zero())))
                    .collect(),
                groups: group
                    .groups
                    .iter()
                    .map(|(k, g)| (k.clone(), strip(g)))
                    .collect(),
                dependencies: group.dependencies.clone(),
            }
        }
        Self {
            group: strip(&self.group),
        }
    }
}

/// The immediate child of `node` on the way down to `descendant`.
fn child_toward(node: &Group, descendant: &PathId) -> PathId {
    let depth = node.id.segments().len();
    PathId::from_segments(descendant.segments()[..depth + 1].iter().cloned())
        .expect("segments already validated")
}

fn put_group_in(node: &Group, target: Group, version: Timestamp) -> Result<Group, TreeError> {
    let child_id = child_toward(node, &target.id);
    if node.apps.contains_key(&child_id) {
        return Err(TreeError::ConflictingPath {
            path: child_id,
            existing: "app",
        });
    }

    let replacement = if child_id == target.id {
        target
    } else {
        let child = node
            .groups
            .get(&child_id)
            .cloned()
            .unwrap_or_else(|| Group::empty(child_id.clone(), version));
        put_group_in(&child, target, version)?
    };

    let mut out = node.clone();
    out.version = version;
    out.groups.insert(child_id, replacement);
    Ok(out)
}

fn put_app_in(node: &Group, app: AppSpec, version: Timestamp) -> Result<Group, TreeError> {
    let mut out = node.clone();
    out.version = version;

    if app.id.is_child_of(&node.id) {
        if node.groups.contains_key(&app.id) {
            return Err(TreeError::ConflictingPath {
                path: app.id,
                existing: "group",
            });
        }
        out.apps.insert(app.id.clone(), app);
        return Ok(out);
    }

    let child_id = child_toward(node, &app.id);
    if node.apps.contains_key(&child_id) {
        return Err(TreeError::ConflictingPath {
            path: child_id,
            existing: "app",
        });
    }
    let child = node
        .groups
        .get(&child_id)
        .cloned()
        .unwrap_or_else(|| Group::empty(child_id.clone(), version));
    out.groups.insert(child_id, put_app_in(&child, app, version)?);
    Ok(out)
}

#[derive(Clone, Copy, PartialEq)]
enum Target {
    Group,
    App,
}

/// Removes `id` from the subtree; returns the rebuilt node and whether
/// anything was removed. Groups emptied by the removal are pruned.
fn remove_in(node: &Group, id: &PathId, version: Timestamp, target: Target) -> (Group, bool) {
    let mut out = node.clone();

    if id.is_child_of(&node.id) {
        let removed = match target {
            Target::Group => out.groups.remove(id).is_some(),
            Target::App => out.apps.remove(id).is_some(),
        };
        if removed {
            out.version = version;
        }
        return (out, removed);
    }

    let child_id = child_toward(node, id);
    let Some(child) = node.groups.get(&child_id) else {
        return (out, false);
    };

    let (new_child, removed) = remove_in(child, id, version, target);
    if removed {
        out.version = version;
        if new_child.is_empty() {
            out.groups.remove(&child_id);
        } else {
            out.groups.insert(child_id, new_child);
        }
    }
    (out, removed)
}

fn map_apps_in<F>(node: &Group, at: &PathId, f: &F, version: Timestamp) -> Group
where
    F: Fn(&AppSpec) -> AppSpec,
{
    let mut out = node.clone();

    if at.contains(&node.id) {
        // Inside the target subtree: rewrite every app, recurse everywhere.
        out.version = version;
        out.apps = node
            .apps
            .iter()
            .map(|(k, a)| (k.clone(), f(a)))
            .collect();
        out.groups = node
            .groups
            .iter()
            .map(|(k, g)| (k.clone(), map_apps_in(g, at, f, version)))
            .collect();
        return out;
    }

    if node.id.contains(at) {
        // On the spine above the target: restamp and descend.
        out.version = version;
        let child_id = child_toward(node, at);
        if let Some(child) = node.groups.get(&child_id) {
            out.groups
                .insert(child_id, map_apps_in(child, at, f, version));
        }
    }
    out
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
        AppSpec::new(path(id), "run", instances)
    }

    #[test]
    fn test_put_app_auto_vivifies_ancestors() {
        let root = RootGroup::empty(ts(1));
        let root = root.put_app(app("/a/b/web", 1), ts(2)).unwrap();

        assert!(root.group(&path("/a")).is_some());
        assert!(root.group(&path("/a/b")).is_some());
        assert_eq!(root.app(&path("/a/b/web")).unwrap().instances, 1);
        assert_eq!(root.version(), ts(2));
        root.validate().unwrap();
    }

    #[test]
    fn test_put_group_replaces_subtree() {
        let root = RootGroup::empty(ts(1))
            .put_app(app("/a/web", 1), ts(2))
            .unwrap();

        let mut replacement = Group::empty(path("/a"), ts(3));
        let db = app("/a/db", 2);
        replacement.apps.insert(db.id.clone(), db);

        let root = root.put_group(replacement, ts(3)).unwrap();
        assert!(root.app(&path("/a/web")).is_none());
        assert_eq!(root.app(&path("/a/db")).unwrap().instances, 2);
    }

    #[test]
    fn test_put_group_over_app_path_conflicts() {
        let root = RootGroup::empty(ts(1))
            .put_app(app("/a/web", 1), ts(2))
            .unwrap();

        let err = root
            .put_group(Group::empty(path("/a/web"), ts(3)), ts(3))
            .unwrap_err();
        assert!(matches!(err, TreeError::ConflictingPath { .. }));

        // And descending through an app path conflicts too.
        let err = root
            .put_group(Group::empty(path("/a/web/sub"), ts(3)), ts(3))
            .unwrap_err();
        assert!(matches!(err, TreeError::ConflictingPath { .. }));
    }

    #[test]
    fn test_put_app_over_group_path_conflicts() {
        let root = RootGroup::empty(ts(1))
            .put_group(Group::empty(path("/a/sub"), ts(2)), ts(2))
            .unwrap();

        let err = root.put_app(app("/a/sub", 1), ts(3)).unwrap_err();
        assert!(matches!(err, TreeError::ConflictingPath { .. }));
    }

    #[test]
    fn test_remove_group_prunes_empty_ancestors() {
        let root = RootGroup::empty(ts(1))
            .put_app(app("/a/b/web", 1), ts(2))
            .unwrap();

        let root = root.remove_group(&path("/a/b"), ts(3));
        // /a held only /a/b, so it is pruned as well.
        assert!(root.group(&path("/a")).is_none());
        assert_eq!(root.version(), ts(3));
    }

    #[test]
    fn test_remove_missing_group_is_noop() {
        let root = RootGroup::empty(ts(1))
            .put_app(app("/a/web", 1), ts(2))
            .unwrap();
        let after = root.remove_group(&path("/b"), ts(3));
        assert_eq!(after.without_versions(), root.without_versions());
        // Version untouched since nothing was removed.
        assert_eq!(after.version(), ts(2));
    }

    #[test]
    fn test_remove_app_prunes_emptied_group() {
        let root = RootGroup::empty(ts(1))
            .put_app(app("/a/web", 1), ts(2))
            .unwrap()
            .put_app(app("/a/db", 1), ts(3))
            .unwrap();

        let root = root.remove_app(&path("/a/web"), ts(4));
        assert!(root.app(&path("/a/web")).is_none());
        assert!(root.group(&path("/a")).is_some());

        // Removing the last app prunes the group too.
        let root = root.remove_app(&path("/a/db"), ts(5));
        assert!(root.group(&path("/a")).is_none());
    }

    #[test]
    fn test_remove_root_empties_tree() {
        let root = RootGroup::empty(ts(1))
            .put_app(app("/a/web", 1), ts(2))
            .unwrap();
        let root = root.remove_group(&PathId::root(), ts(3));
        assert!(root.transitive_apps().is_empty());
    }

    #[test]
    fn test_update_transitive_apps_scales_subtree_only() {
        let root = RootGroup::empty(ts(1))
            .put_app(app("/a/web", 1), ts(2))
            .unwrap()
            .put_app(app("/a/db", 2), ts(3))
            .unwrap()
            .put_app(app("/b/api", 1), ts(4))
            .unwrap();

        let root = root
            .update_transitive_apps(&path("/a"), |a| a.clone().with_instances(a.instances * 2), ts(5))
            .unwrap();

        assert_eq!(root.app(&path("/a/web")).unwrap().instances, 2);
        assert_eq!(root.app(&path("/a/db")).unwrap().instances, 4);
        assert_eq!(root.app(&path("/b/api")).unwrap().instances, 1);
        assert_eq!(root.version(), ts(5));
    }

    #[test]
    fn test_update_transitive_apps_unknown_group() {
        let root = RootGroup::empty(ts(1));
        let err = root
            .update_transitive_apps(&path("/nope"), Clone::clone, ts(2))
            .unwrap_err();
        assert!(matches!(err, TreeError::UnknownGroup(_)));
    }

    #[test]
    fn test_put_get_identity_up_to_versions() {
        let root = RootGroup::empty(ts(1))
            .put_app(app("/a/b/web", 1), ts(2))
            .unwrap();

        let group = root.group(&path("/a/b")).unwrap().clone();
        let replayed = root.put_group(group, ts(9)).unwrap();
        assert_eq!(replayed.without_versions(), root.without_versions());
    }

    #[test]
    fn test_disjoint_puts_commute_up_to_versions() {
        let base = RootGroup::empty(ts(1));
        let g1 = {
            let mut g = Group::empty(path("/a"), ts(2));
            let a = app("/a/web", 1);
            g.apps.insert(a.id.clone(), a);
            g
        };
        let g2 = {
            let mut g = Group::empty(path("/b"), ts(2));
            let a = app("/b/api", 1);
            g.apps.insert(a.id.clone(), a);
            g
        };

        let left = base
            .put_group(g1.clone(), ts(3))
            .unwrap()
            .put_group(g2.clone(), ts(4))
            .unwrap();
        let right = base
            .put_group(g2, ts(3))
            .unwrap()
            .put_group(g1, ts(4))
            .unwrap();

        assert_eq!(left.without_versions(), right.without_versions());
    }

    #[test]
    fn test_validate_rejects_dependency_cycle() {
        let mut web = app("/a/web", 1);
        web.dependencies = vec![path("/a/db")];
        let mut db = app("/a/db", 1);
        db.dependencies = vec![path("/a/web")];

        let root = RootGroup::empty(ts(1))
            .put_app(web, ts(2))
            .unwrap()
            .put_app(db, ts(3))
            .unwrap();

        let err = root.validate().unwrap_err();
        assert!(err.errors[0].message.contains("cycle"));
    }

    #[test]
    fn test_effective_dependencies_resolve_groups() {
        let mut api = app("/svc/api", 1);
        api.dependencies = vec![path("/data")];

        let root = RootGroup::empty(ts(1))
            .put_app(api, ts(2))
            .unwrap()
            .put_app(app("/data/db", 1), ts(3))
            .unwrap()
            .put_app(app("/data/cache", 1), ts(4))
            .unwrap();

        let deps = root.effective_dependencies(&path("/svc/api"));
        let names: Vec<String> = deps.iter().map(ToString::to_string).collect();
        assert_eq!(names, vec!["/data/cache", "/data/db"]);
    }
}
