// Workflow body registry - the uniform execution contract

//! # Workflow Body Registry
//!
//! The orchestrator never contains business logic. Each workflow type maps
//! to an implementation of [`WorkflowBody`], the uniform execution contract:
//! the body receives a [`WorkflowContext`] (parameters, run id, cancellation
//! token) and returns a [`WorkflowOutcome`] (item counts, optional financial
//! magnitude, raised business exceptions) or an error.
//!
//! New workflow types register an implementation in the [`BodyRegistry`];
//! the orchestrator resolves the body by the definition's
//! [`WorkflowType`](crate::models::WorkflowType) tag and stays agnostic to
//! what the body computes. A definition whose type has no registered body is
//! a configuration error fatal to that dispatch only.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::{ExceptionSeverity, WorkflowType};
use crate::Result;

/// Everything a workflow body receives for one run.
#[derive(Debug, Clone)]
pub struct WorkflowContext {
    pub run_id: Uuid,
    pub workflow_id: String,
    /// Opaque parameters from the workflow definition
    pub parameters: serde_json::Value,
    /// Cancelled on orchestrator shutdown; long-running bodies should
    /// check it cooperatively
    pub cancel: CancellationToken,
}

/// A business exception reported by a body alongside its outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaisedException {
    pub exception_type: String,
    pub severity: Option<ExceptionSeverity>,
    pub description: String,
    pub financial_impact: Option<f64>,
}

/// What a workflow body produced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowOutcome {
    pub items_succeeded: u64,
    pub items_failed: u64,
    /// Monetary magnitude of the run's effect; input to the approval gate
    pub financial_amount: Option<f64>,
    /// Business anomalies to track, independent of run success
    pub exceptions: Vec<RaisedException>,
}

/// The uniform execution contract for workflow bodies.
#[async_trait::async_trait]
pub trait WorkflowBody: Send + Sync {
    async fn execute(&self, context: WorkflowContext) -> Result<WorkflowOutcome>;
}

/// Maps workflow types to their registered bodies.
#[derive(Default)]
pub struct BodyRegistry {
    bodies: DashMap<WorkflowType, Arc<dyn WorkflowBody>>,
}

impl BodyRegistry {
    pub fn new() -> Self {
        BodyRegistry {
            bodies: DashMap::new(),
        }
    }

    pub fn register(&self, workflow_type: WorkflowType, body: Arc<dyn WorkflowBody>) {
        self.bodies.insert(workflow_type, body);
    }

    pub fn resolve(&self, workflow_type: &WorkflowType) -> Option<Arc<dyn WorkflowBody>> {
        self.bodies.get(workflow_type).map(|b| b.value().clone())
    }

    pub fn registered_types(&self) -> Vec<WorkflowType> {
        self.bodies.iter().map(|e| e.key().clone()).collect()
    }
}

/// Body that succeeds immediately without doing anything.
///
/// Registered by `initialize_defaults` for workflow types that have no real
/// implementation wired yet, and used throughout the tests.
pub struct NoopBody;

#[async_trait::async_trait]
impl WorkflowBody for NoopBody {
    async fn execute(&self, _context: WorkflowContext) -> Result<WorkflowOutcome> {
        Ok(WorkflowOutcome::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_registry_resolves_registered_body() {
        let registry = BodyRegistry::new();
        registry.register(WorkflowType::Procurement, Arc::new(NoopBody));

        assert!(registry.resolve(&WorkflowType::Procurement).is_some());
        assert!(registry.resolve(&WorkflowType::FreightBooking).is_none());
        assert_eq!(registry.registered_types().len(), 1);
    }

    #[tokio::test]
    async fn test_noop_body_reports_empty_outcome() {
        let body = NoopBody;
        let outcome = body
            .execute(WorkflowContext {
                run_id: Uuid::new_v4(),
                workflow_id: "procure".to_string(),
                parameters: serde_json::Value::Null,
                cancel: CancellationToken::new(),
            })
            .await
            .unwrap();
        assert_eq!(outcome.items_succeeded, 0);
        assert!(outcome.financial_amount.is_none());
        assert!(outcome.exceptions.is_empty());
    }

    #[tokio::test]
    async fn test_custom_types_key_independently() {
        let registry = BodyRegistry::new();
        registry.register(
            WorkflowType::Custom("crm_sync".to_string()),
            Arc::new(NoopBody),
        );
        assert!(registry
            .resolve(&WorkflowType::Custom("crm_sync".to_string()))
            .is_some());
        assert!(registry
            .resolve(&WorkflowType::Custom("other".to_string()))
            .is_none());
    }
}
