// REST control API for the orchestrator

//! # Control API
//!
//! A REST surface over the engine layer: lifecycle control, workflow and run
//! inspection, dead-letter retries, pipeline execution, exception tracking,
//! approval decisions, and external signal delivery. The router carries an
//! [`ApiState`] with the orchestrator and pipeline engine; handlers stay
//! thin and all real logic lives in [`crate::engine`].

pub mod handlers;
pub mod types;

use axum::{
    routing::{get, post},
    Router,
};

pub use handlers::ApiState;

/// Build the control API router.
pub fn control_router(state: ApiState) -> Router {
    Router::new()
        // Lifecycle
        .route("/control/start", post(handlers::start))
        .route("/control/stop", post(handlers::stop))
        .route("/control/status", get(handlers::status))
        .route("/control/initialize", post(handlers::initialize))
        .route("/health", get(handlers::health))
        // Workflows
        .route("/workflows", get(handlers::list_workflows))
        .route("/workflows/:id/toggle", post(handlers::toggle_workflow))
        .route("/workflows/:id/trigger", post(handlers::trigger_workflow))
        // Runs and DLQ
        .route("/runs", get(handlers::list_runs))
        .route("/runs/stats", get(handlers::run_stats))
        .route("/dlq", get(handlers::list_dlq))
        .route("/dlq/:run_id/retry", post(handlers::retry_dlq))
        // Pipelines
        .route("/pipelines", get(handlers::list_pipelines))
        .route("/pipelines/:id/execute", post(handlers::execute_pipeline))
        // Exceptions
        .route(
            "/exceptions",
            get(handlers::list_exceptions).post(handlers::raise_exception),
        )
        .route("/exceptions/:id/resolve", post(handlers::resolve_exception))
        .route("/exceptions/:id/escalate", post(handlers::escalate_exception))
        .route("/exception-rules", get(handlers::list_exception_rules))
        // Approvals
        .route("/thresholds", get(handlers::list_thresholds))
        .route("/approvals", get(handlers::list_approvals))
        .route("/approvals/:run_id/decide", post(handlers::decide_approval))
        // External signals
        .route("/events/:name/signal", post(handlers::signal_event))
        .with_state(state)
}
