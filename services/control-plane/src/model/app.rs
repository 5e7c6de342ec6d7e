//! Application specifications.
//!
//! An `AppSpec` is the complete declarative description of one long-running
//! workload. Specs are immutable values: every change produces a new spec
//! carrying a new version timestamp.

use std::collections::BTreeMap;

use gantry_path::PathId;
use serde::{Deserialize, Serialize};

use super::Timestamp;

/// Resource requirements per task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Resources {
    pub cpus: f64,
    pub mem: f64,
    pub disk: f64,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            cpus: 1.0,
            mem: 128.0,
            disk: 0.0,
        }
    }
}

/// Exponential launch backoff.
///
/// The k-th consecutive launch failure delays the next attempt by
/// `min(initial * factor^k, max)`; once the cumulative delay exceeds
/// `max_launch_delay` the deployment gives up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackoffStrategy {
    pub initial_secs: f64,
    pub factor: f64,
    pub max_secs: f64,
    pub max_launch_delay_secs: f64,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self {
            initial_secs: 1.0,
            factor: 1.15,
            max_secs: 60.0,
            max_launch_delay_secs: 300.0,
        }
    }
}

impl BackoffStrategy {
    /// Delay before the attempt following `failures` consecutive failures.
    #[must_use]
    pub fn delay(&self, failures: u32) -> std::time::Duration {
        let secs = (self.initial_secs * self.factor.powi(failures as i32)).min(self.max_secs);
        std::time::Duration::from_secs_f64(secs.max(0.0))
    }

    /// The total delay budget for one action.
    #[must_use]
    pub fn max_launch_delay(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.max_launch_delay_secs.max(0.0))
    }
}

/// Rolling-upgrade capacity bounds, as fractions of the old instance count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpgradeStrategy {
    /// Healthy instances never drop below `ceil(instances * this)`.
    pub minimum_health_capacity: f64,
    /// Total instances never exceed `ceil(instances * (1 + this))`.
    pub maximum_over_capacity: f64,
}

impl Default for UpgradeStrategy {
    fn default() -> Self {
        Self {
            minimum_health_capacity: 1.0,
            maximum_over_capacity: 1.0,
        }
    }
}

/// How a health check reaches the task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthCheckProtocol {
    #[serde(rename_all = "camelCase")]
    Http {
        #[serde(default = "default_http_path")]
        path: String,
        #[serde(default)]
        port_index: usize,
    },
    #[serde(rename_all = "camelCase")]
    Tcp {
        #[serde(default)]
        port_index: usize,
    },
    /// Executed by the task runtime; results arrive asynchronously and are
    /// never scheduled by the supervisor itself.
    #[serde(rename_all = "camelCase")]
    Command { value: String },
}

fn default_http_path() -> String {
    "/".to_string()
}

/// One health check declaration on an app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckSpec {
    #[serde(flatten)]
    pub protocol: HealthCheckProtocol,
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,
}

fn default_grace_period() -> u64 {
    300
}
fn default_interval() -> u64 {
    60
}
fn default_timeout() -> u64 {
    20
}
fn default_max_failures() -> u32 {
    3
}

impl HealthCheckSpec {
    /// A TCP check with defaults, mostly for tests.
    #[must_use]
    pub fn tcp(port_index: usize) -> Self {
        Self {
            protocol: HealthCheckProtocol::Tcp { port_index },
            grace_period_secs: default_grace_period(),
            interval_secs: default_interval(),
            timeout_secs: default_timeout(),
            max_consecutive_failures: default_max_failures(),
        }
    }

    /// Per-probe timeout: the declared timeout, capped just under the
    /// probe interval so one probe can never overlap the next tick.
    #[must_use]
    pub fn probe_timeout(&self) -> std::time::Duration {
        let cap = self.interval_secs.saturating_sub(1).max(1);
        std::time::Duration::from_secs(self.timeout_secs.min(cap))
    }
}

/// Placement constraint operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConstraintOperator {
    Unique,
    Cluster,
    GroupBy,
    Like,
    Unlike,
}

/// A placement constraint, carried declaratively and interpreted by the
/// external offer matcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Constraint {
    pub field: String,
    pub operator: ConstraintOperator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// A host port exposed by the app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortDefinition {
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default = "default_port_protocol")]
    pub protocol: String,
}

fn default_port_protocol() -> String {
    "tcp".to_string()
}

/// A volume mounted into the container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerVolume {
    pub container_path: String,
    pub host_path: String,
    #[serde(default = "default_volume_mode")]
    pub mode: String,
}

fn default_volume_mode() -> String {
    "RO".to_string()
}

/// Container parameters, declarative only; launching is the facade's job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub image: String,
    #[serde(default)]
    pub force_pull_image: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<ContainerVolume>,
}

/// The complete declarative description of one workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSpec {
    pub id: PathId,
    #[serde(default = "Timestamp::now")]
    pub version: Timestamp,
    pub cmd: String,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default = "default_instances")]
    pub instances: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<Container>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub health_checks: Vec<HealthCheckSpec>,
    #[serde(default)]
    pub backoff: BackoffStrategy,
    #[serde(default)]
    pub upgrade: UpgradeStrategy,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<Constraint>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub port_definitions: Vec<PortDefinition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<PathId>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

fn default_instances() -> u32 {
    1
}

impl AppSpec {
    /// A minimal spec, mostly for tests.
    #[must_use]
    pub fn new(id: PathId, cmd: &str, instances: u32) -> Self {
        Self {
            id,
            version: Timestamp::now(),
            cmd: cmd.to_string(),
            resources: Resources::default(),
            instances,
            container: None,
            health_checks: Vec::new(),
            backoff: BackoffStrategy::default(),
            upgrade: UpgradeStrategy::default(),
            constraints: Vec::new(),
            port_definitions: Vec::new(),
            dependencies: Vec::new(),
            env: BTreeMap::new(),
            labels: BTreeMap::new(),
        }
    }

    /// Returns the spec restamped with `version`.
    #[must_use]
    pub fn with_version(mut self, version: Timestamp) -> Self {
        self.version = version;
        self
    }

    /// Returns the spec with a different instance count.
    #[must_use]
    pub fn with_instances(mut self, instances: u32) -> Self {
        self.instances = instances;
        self
    }

    /// Resolves a possibly-relative id and relative dependencies against
    /// the enclosing group's path.
    #[must_use]
    pub fn with_canonical_paths(mut self, base: &PathId) -> Self {
        self.id = self.id.canonical_path(base);
        self.dependencies = self
            .dependencies
            .iter()
            .map(|d| d.canonical_path(base))
            .collect();
        self
    }

    /// Definition equality, ignoring the version stamp.
    #[must_use]
    pub fn definition_eq(&self, other: &AppSpec) -> bool {
        self.clone().with_version(Timestamp::zero())
            == other.clone().with_version(Timestamp::zero())
    }

    /// True when only the instance count differs.
    #[must_use]
    pub fn is_scale_only_change(&self, other: &AppSpec) -> bool {
        !self.definition_eq(other)
            && self
                .clone()
                .with_version(Timestamp::zero())
                .with_instances(0)
                == other
                    .clone()
                    .with_version(Timestamp::zero())
                    .with_instances(0)
    }

    /// True when the definition changed beyond scaling: a rolling upgrade.
    #[must_use]
    pub fn is_upgrade(&self, other: &AppSpec) -> bool {
        !self.definition_eq(other) && !self.is_scale_only_change(other)
    }
}
