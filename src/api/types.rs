// Control API request/response types

//! Request and response bodies for the REST control API. Domain models
//! serialize directly where they fit; the types here cover the operations
//! that need extra shape (raise/resolve payloads, trigger responses, the
//! uniform error body).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::ExceptionSeverity;

/// Uniform error body for every non-2xx response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Response to a manual trigger or DLQ retry.
#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    pub run_id: Uuid,
}

/// Response to an external signal delivery.
#[derive(Debug, Serialize)]
pub struct SignalResponse {
    pub event_name: String,
    pub runs_started: Vec<Uuid>,
}

/// Body for POST /exceptions.
#[derive(Debug, Deserialize)]
pub struct RaiseExceptionRequest {
    pub exception_type: String,
    pub severity: Option<ExceptionSeverity>,
    pub description: String,
    pub run_id: Option<Uuid>,
    pub financial_impact: Option<f64>,
}

/// Body for POST /exceptions/:id/resolve.
#[derive(Debug, Deserialize)]
pub struct ResolveExceptionRequest {
    pub action: String,
    pub notes: Option<String>,
}

/// Query string for GET /dlq.
#[derive(Debug, Deserialize)]
pub struct DlqQuery {
    pub limit: Option<usize>,
}

/// Response for GET /health.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub running: bool,
}
