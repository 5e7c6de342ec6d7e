//! Groups: named folders in the path tree containing apps and sub-groups.

use std::collections::BTreeMap;

use gantry_path::PathId;
use serde::{Deserialize, Serialize};

use super::{AppSpec, FieldError, Timestamp};

/// One node of the group tree.
///
/// Invariants (checked by [`RootGroup::validate`](super::RootGroup::validate)):
/// every map key equals the value's id, every entry is a direct child path
/// of this group, and no path names both an app and a group anywhere in the
/// transitive tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: PathId,
    pub version: Timestamp,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub apps: BTreeMap<PathId, AppSpec>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub groups: BTreeMap<PathId, Group>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<PathId>,
}

impl Group {
    /// An empty group at `id`.
    #[must_use]
    pub fn empty(id: PathId, version: Timestamp) -> Self {
        Self {
            id,
            version,
            apps: BTreeMap::new(),
            groups: BTreeMap::new(),
            dependencies: Vec::new(),
        }
    }

    /// True when the group holds no apps and no sub-groups.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.apps.is_empty() && self.groups.is_empty()
    }

    /// Finds a group anywhere in this subtree.
    #[must_use]
    pub fn find_group(&self, id: &PathId) -> Option<&Group> {
        if &self.id == id {
            return Some(self);
        }
        if !self.id.contains(id) {
            return None;
        }
        self.groups.values().find_map(|g| g.find_group(id))
    }

    /// Finds an app anywhere in this subtree.
    #[must_use]
    pub fn find_app(&self, id: &PathId) -> Option<&AppSpec> {
        if let Some(app) = self.apps.get(id) {
            return Some(app);
        }
        self.groups
            .values()
            .filter(|g| g.id.contains(id))
            .find_map(|g| g.find_app(id))
    }

    /// Every app in this subtree, in lexical path order.
    #[must_use]
    pub fn transitive_apps(&self) -> BTreeMap<PathId, &AppSpec> {
        let mut out = BTreeMap::new();
        self.collect_apps(&mut out);
        out
    }

    fn collect_apps<'a>(&'a self, out: &mut BTreeMap<PathId, &'a AppSpec>) {
        for (id, app) in &self.apps {
            out.insert(id.clone(), app);
        }
        for group in self.groups.values() {
            group.collect_apps(out);
        }
    }

    /// Every group in this subtree, including itself.
    #[must_use]
    pub fn transitive_groups(&self) -> Vec<&Group> {
        let mut out = vec![self];
        for group in self.groups.values() {
            out.extend(group.transitive_groups());
        }
        out
    }

    /// Collects structural invariant violations into `errors`.
    pub(super) fn check_invariants(&self, errors: &mut Vec<FieldError>) {
        for (key, app) in &self.apps {
            if key != &app.id {
                errors.push(FieldError {
                    field: key.to_string(),
                    message: format!("app map key does not match spec id '{}'", app.id),
                });
            }
            if !app.id.is_child_of(&self.id) {
                errors.push(FieldError {
                    field: app.id.to_string(),
                    message: format!("app is not a direct child of group '{}'", self.id),
                });
            }
        }
        for (key, group) in &self.groups {
            if key != &group.id {
                errors.push(FieldError {
                    field: key.to_string(),
                    message: format!("group map key does not match group id '{}'", group.id),
                });
            }
            if !group.id.is_child_of(&self.id) {
                errors.push(FieldError {
                    field: group.id.to_string(),
                    message: format!("group is not a direct child of group '{}'", self.id),
                });
            }
            group.check_invariants(errors);
        }
    }
}
