//! Docmaker application composition root
//!
//! Builds the stage executors and the job manager from configuration and
//! composes the domain routers into a single application.

use axum::Router;
use docmaker_common::Config;
use docmaker_jobs::{JobManager, JobManagerConfig, JobsState};
use docmaker_stages::{StageConfig, StageExecutors, StageServiceFactory};

/// Create the application router and the job manager behind it.
///
/// Must be called from within a tokio runtime; the manager's workers are
/// spawned immediately. Callers own shutdown via `JobManager::shutdown`.
pub fn create_app(config: &Config) -> Result<(Router, JobManager), anyhow::Error> {
    config.validate()?;

    let executors = StageServiceFactory::create(StageConfig::from(config))?;
    Ok(create_app_with_executors(config, executors))
}

/// Same as `create_app`, with caller-supplied stage executors
pub fn create_app_with_executors(
    config: &Config,
    executors: StageExecutors,
) -> (Router, JobManager) {
    let manager = JobManager::start(JobManagerConfig::from(config), executors);
    let jobs_state = JobsState::new(manager.clone());

    // Build router — compose domain routers with shared infrastructure routes
    let app = Router::new()
        .route("/health", axum::routing::get(health_check))
        .route(
            "/",
            axum::routing::get(|| async { "Docmaker API v0.0.1-SNAPSHOT" }),
        )
        .merge(docmaker_jobs::routes().with_state(jobs_state));

    (app, manager)
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}
