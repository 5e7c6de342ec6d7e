//! Application state shared across request handlers.

use std::sync::Arc;

use gantry_events::EventBus;

use crate::api::authz::Authorizer;
use crate::deploy::GroupManager;
use crate::health::HealthRegistry;
use crate::launch::TaskLauncher;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    manager: Arc<GroupManager>,
    launcher: Arc<dyn TaskLauncher>,
    health: Arc<HealthRegistry>,
    bus: EventBus,
    authorizer: Arc<dyn Authorizer>,
}

impl AppState {
    /// Create a new application state.
    pub fn new(
        manager: Arc<GroupManager>,
        launcher: Arc<dyn TaskLauncher>,
        health: Arc<HealthRegistry>,
        bus: EventBus,
        authorizer: Arc<dyn Authorizer>,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                manager,
                launcher,
                health,
                bus,
                authorizer,
            }),
        }
    }

    pub fn manager(&self) -> &GroupManager {
        &self.inner.manager
    }

    pub fn launcher(&self) -> &Arc<dyn TaskLauncher> {
        &self.inner.launcher
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.inner.health
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn authorizer(&self) -> &Arc<dyn Authorizer> {
        &self.inner.authorizer
    }
}
