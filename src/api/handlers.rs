// REST handlers for the orchestrator control API

//! HTTP handlers mapping the control API onto the engine layer. Handlers are
//! thin: parse, delegate, serialize. Every error flows through
//! [`ApiError`], which maps the crate's error taxonomy onto HTTP status
//! codes.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use uuid::Uuid;

use crate::engine::{Orchestrator, PipelineEngine};
use crate::models::{ApprovalDecision, ExceptionFilter, RunFilter};
use crate::OrchestratorError;

use super::types::{
    DlqQuery, ErrorBody, HealthResponse, RaiseExceptionRequest, ResolveExceptionRequest,
    SignalResponse, TriggerResponse,
};

/// Shared state for the control API.
#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
    pub pipelines: Arc<PipelineEngine>,
}

/// Error wrapper translating `OrchestratorError` into HTTP responses.
pub struct ApiError(OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            OrchestratorError::WorkflowNotFound { .. }
            | OrchestratorError::RunNotFound { .. }
            | OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
            OrchestratorError::InvalidInput(_) | OrchestratorError::Configuration(_) => {
                StatusCode::BAD_REQUEST
            }
            OrchestratorError::AlreadyRunning { .. } => StatusCode::CONFLICT,
            OrchestratorError::CircuitOpen => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(ErrorBody {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

// Control plane

pub async fn start(State(state): State<ApiState>) -> impl IntoResponse {
    state.orchestrator.start();
    StatusCode::NO_CONTENT
}

pub async fn stop(State(state): State<ApiState>) -> impl IntoResponse {
    state.orchestrator.stop().await;
    StatusCode::NO_CONTENT
}

pub async fn status(State(state): State<ApiState>) -> ApiResult<impl serde::Serialize> {
    Ok(Json(state.orchestrator.status().await?))
}

pub async fn initialize(State(state): State<ApiState>) -> ApiResult<serde_json::Value> {
    state.orchestrator.initialize_defaults().await?;
    Ok(Json(serde_json::json!({ "initialized": true })))
}

pub async fn health(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        running: state.orchestrator.is_running(),
    })
}

// Workflows

pub async fn list_workflows(State(state): State<ApiState>) -> ApiResult<impl serde::Serialize> {
    Ok(Json(state.orchestrator.storage().list_workflows().await?))
}

pub async fn toggle_workflow(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<impl serde::Serialize> {
    Ok(Json(state.orchestrator.toggle_workflow(&id).await?))
}

pub async fn trigger_workflow(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<TriggerResponse> {
    let run_id = state.orchestrator.trigger_workflow(&id).await?;
    Ok(Json(TriggerResponse { run_id }))
}

// Runs and the dead-letter queue

pub async fn list_runs(
    State(state): State<ApiState>,
    Query(filter): Query<RunFilter>,
) -> ApiResult<impl serde::Serialize> {
    Ok(Json(state.orchestrator.storage().list_runs(&filter).await?))
}

pub async fn run_stats(State(state): State<ApiState>) -> ApiResult<impl serde::Serialize> {
    Ok(Json(state.orchestrator.run_stats().await?))
}

pub async fn list_dlq(
    State(state): State<ApiState>,
    Query(query): Query<DlqQuery>,
) -> ApiResult<impl serde::Serialize> {
    let limit = query.limit.unwrap_or(100);
    Ok(Json(state.orchestrator.storage().list_dead_letters(limit).await?))
}

pub async fn retry_dlq(
    State(state): State<ApiState>,
    Path(run_id): Path<Uuid>,
) -> ApiResult<TriggerResponse> {
    let run_id = state.orchestrator.retry_dlq(&run_id).await?;
    Ok(Json(TriggerResponse { run_id }))
}

// Pipelines

pub async fn list_pipelines(State(state): State<ApiState>) -> ApiResult<impl serde::Serialize> {
    Ok(Json(state.pipelines.list_pipelines().await?))
}

pub async fn execute_pipeline(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<impl serde::Serialize> {
    Ok(Json(state.pipelines.execute_pipeline(&id).await?))
}

// Exceptions

pub async fn list_exceptions(
    State(state): State<ApiState>,
    Query(filter): Query<ExceptionFilter>,
) -> ApiResult<impl serde::Serialize> {
    Ok(Json(state.orchestrator.exceptions().list(&filter).await?))
}

pub async fn raise_exception(
    State(state): State<ApiState>,
    Json(request): Json<RaiseExceptionRequest>,
) -> ApiResult<serde_json::Value> {
    let id = state
        .orchestrator
        .exceptions()
        .raise(
            &request.exception_type,
            request.severity,
            &request.description,
            request.run_id,
            request.financial_impact,
        )
        .await?;
    Ok(Json(serde_json::json!({ "id": id })))
}

pub async fn resolve_exception(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(request): Json<ResolveExceptionRequest>,
) -> ApiResult<impl serde::Serialize> {
    Ok(Json(
        state
            .orchestrator
            .exceptions()
            .resolve(&id, &request.action, request.notes.as_deref())
            .await?,
    ))
}

pub async fn escalate_exception(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl serde::Serialize> {
    Ok(Json(state.orchestrator.exceptions().escalate(&id).await?))
}

pub async fn list_exception_rules(
    State(state): State<ApiState>,
) -> ApiResult<impl serde::Serialize> {
    Ok(Json(state.orchestrator.exceptions().list_rules().await?))
}

// Approvals

pub async fn list_thresholds(State(state): State<ApiState>) -> ApiResult<impl serde::Serialize> {
    Ok(Json(state.orchestrator.storage().list_thresholds().await?))
}

pub async fn list_approvals(State(state): State<ApiState>) -> ApiResult<impl serde::Serialize> {
    Ok(Json(
        state.orchestrator.storage().list_pending_approvals().await?,
    ))
}

pub async fn decide_approval(
    State(state): State<ApiState>,
    Path(run_id): Path<Uuid>,
    Json(decision): Json<ApprovalDecision>,
) -> ApiResult<impl serde::Serialize> {
    Ok(Json(
        state.orchestrator.decide_approval(&run_id, &decision).await?,
    ))
}

// External signals

pub async fn signal_event(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> ApiResult<SignalResponse> {
    // Dispatch directly (not via the bus) so the caller learns which runs
    // started and the signal listener never double-dispatches.
    let runs_started = state.orchestrator.dispatch_signal(&name).await?;
    Ok(Json(SignalResponse {
        event_name: name,
        runs_started,
    }))
}
