//! Gantry Control Plane
//!
//! The control plane is the central coordination service for the cluster:
//! it serves the declarative `/v2` API and reconciles the running fleet
//! toward the committed group tree.
//!
//! Exit codes: 0 on clean shutdown, 1 on configuration errors, 2 when the
//! repository is unreachable at start.

use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use gantry_control_plane::api;
use gantry_control_plane::api::authz::AllowAll;
use gantry_control_plane::config::Config;
use gantry_control_plane::deploy::{DeploymentExecutor, GroupManager};
use gantry_control_plane::health::HealthRegistry;
use gantry_control_plane::launch::MockTaskLauncher;
use gantry_control_plane::repo::{GroupRepository, MemoryRepository, SqliteRepository};
use gantry_control_plane::state::AppState;
use gantry_events::EventBus;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting gantry control plane");

    // Load configuration
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::from(1);
        }
    };
    info!(listen_addr = %config.listen_addr, "Configuration loaded");

    // Open the repository and verify it is reachable
    let repo: Arc<dyn GroupRepository> = if config.db_path.is_empty() {
        info!("Using in-memory repository");
        Arc::new(MemoryRepository::new())
    } else {
        match SqliteRepository::open(&config.db_path) {
            Ok(repo) => {
                info!(db_path = %config.db_path, "Repository opened");
                Arc::new(repo)
            }
            Err(e) => {
                error!(error = %e, "Failed to open repository");
                return ExitCode::from(2);
            }
        }
    };
    if let Err(e) = repo.ping().await {
        error!(error = %e, "Repository unreachable");
        return ExitCode::from(2);
    }

    // Wire the core components. The standalone launcher stands in for the
    // external cluster facade; production deployments supply a real one.
    let bus = EventBus::new();
    let launcher = Arc::new(MockTaskLauncher::new());
    if !config.dev_mode {
        info!("No cluster facade configured; running with the standalone launcher");
    }
    let health = Arc::new(HealthRegistry::new(launcher.clone(), bus.clone()));
    let executor = DeploymentExecutor::new(launcher.clone(), health.clone(), bus.clone());

    let manager = match GroupManager::new(repo, bus.clone(), executor).await {
        Ok(manager) => Arc::new(manager),
        Err(e) => {
            error!(error = %e, "Failed to load committed root");
            return ExitCode::from(2);
        }
    };

    let state = AppState::new(manager, launcher, health, bus, Arc::new(AllowAll));

    // Build and run the server
    let app = api::create_router(state);

    let listener = match tokio::net::TcpListener::bind(&config.listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, "Failed to bind listen address");
            return ExitCode::from(1);
        }
    };
    info!(addr = %config.listen_addr, "Listening for connections");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await;

    match served {
        Ok(()) => {
            info!("Clean shutdown");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Server error");
            ExitCode::from(1)
        }
    }
}
