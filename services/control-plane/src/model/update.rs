//! Group update documents: the declarative patch format of the v2 API.

use gantry_path::PathId;
use serde::{Deserialize, Serialize};

use super::{AppSpec, Group, RootGroup, Timestamp, TreeError};

/// A patch describing an intended mutation at a path.
///
/// The alternatives are mutually exclusive and checked in order: a
/// `version` means revert, a `scaleBy` means scale, anything else is a
/// structural merge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GroupUpdate {
    /// Target path, resolved relative to the request path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<PathId>,

    /// Revert the subtree to this stored version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Timestamp>,

    /// Multiply every transitive app's instance count, rounding up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_by: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apps: Option<Vec<AppSpec>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groups: Option<Vec<GroupUpdate>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<Vec<PathId>>,
}

/// The resolved meaning of an update document.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateKind {
    Revert(Timestamp),
    Scale(f64),
    Structural,
}

impl GroupUpdate {
    /// Which of the mutually exclusive alternatives applies.
    #[must_use]
    pub fn kind(&self) -> UpdateKind {
        if let Some(version) = self.version {
            UpdateKind::Revert(version)
        } else if let Some(factor) = self.scale_by {
            UpdateKind::Scale(factor)
        } else {
            UpdateKind::Structural
        }
    }

    /// The path this update addresses, resolved against the request path.
    #[must_use]
    pub fn target_path(&self, base: &PathId) -> PathId {
        match &self.id {
            Some(id) => id.canonical_path(base),
            None => base.clone(),
        }
    }

    /// Applies a scale update below `at`.
    pub fn apply_scale(
        root: &RootGroup,
        at: &PathId,
        factor: f64,
        version: Timestamp,
    ) -> Result<RootGroup, TreeError> {
        root.update_transitive_apps(
            at,
            |app| {
                let scaled = (f64::from(app.instances) * factor).ceil().max(0.0) as u32;
                app.clone().with_instances(scaled).with_version(version)
            },
            version,
        )
    }

    /// Applies a create at `at`: a structural merge, except that a path
    /// already naming a group or an app is rejected instead of merged
    /// into. Callers run this against the locked root so two concurrent
    /// creators cannot both pass the check.
    pub fn apply_create(
        &self,
        root: &RootGroup,
        at: &PathId,
        version: Timestamp,
    ) -> Result<RootGroup, TreeError> {
        if root.group(at).is_some() {
            return Err(TreeError::ConflictingPath {
                path: at.clone(),
                existing: "group",
            });
        }
        if root.app(at).is_some() {
            return Err(TreeError::ConflictingPath {
                path: at.clone(),
                existing: "app",
            });
        }
        self.apply_structural(root, at, version)
    }

    /// Applies a structural merge at `at`: declared apps and sub-groups are
    /// merged into the existing group (created if absent), leaving
    /// undeclared children untouched.
    pub fn apply_structural(
        &self,
        root: &RootGroup,
        at: &PathId,
        version: Timestamp,
    ) -> Result<RootGroup, TreeError> {
        let merged = self.merge_into(root.group(at), at, version)?;
        root.put_group(merged, version)
    }

    fn merge_into(
        &self,
        existing: Option<&Group>,
        at: &PathId,
        version: Timestamp,
    ) -> Result<Group, TreeError> {
        let mut group = existing
            .cloned()
            .unwrap_or_else(|| Group::empty(at.clone(), version));
        group.version = version;

        if let Some(deps) = &self.dependencies {
            group.dependencies = deps.iter().map(|d| d.canonical_path(at)).collect();
        }

        if let Some(apps) = &self.apps {
            for app in apps {
                let app = app
                    .clone()
                    .with_canonical_paths(at)
                    .with_version(version);
                if !app.id.is_child_of(at) {
                    return Err(TreeError::InvalidHierarchy {
                        parent: at.clone(),
                        child: app.id,
                    });
                }
                if group.groups.contains_key(&app.id) {
                    return Err(TreeError::ConflictingPath {
                        path: app.id,
                        existing: "group",
                    });
                }
                group.apps.insert(app.id.clone(), app);
            }
        }

        if let Some(subs) = &self.groups {
            for sub in subs {
                let Some(sub_id) = &sub.id else {
                    return Err(TreeError::InvalidHierarchy {
                        parent: at.clone(),
                        child: at.clone(),
                    });
                };
                let sub_id = sub_id.canonical_path(at);
                if !sub_id.is_child_of(at) {
                    return Err(TreeError::InvalidHierarchy {
                        parent: at.clone(),
                        child: sub_id,
                    });
                }
                if group.apps.contains_key(&sub_id) {
                    return Err(TreeError::ConflictingPath {
                        path: sub_id,
                        existing: "app",
                    });
                }
                let merged = sub.merge_into(group.groups.get(&sub_id), &sub_id, version)?;
                group.groups.insert(sub_id, merged);
            }
        }

        Ok(group)
    }
}
