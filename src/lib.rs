// OpsFlow - autonomous workflow orchestration for recurring business operations

//! # OpsFlow
//!
//! OpsFlow runs named business workflows (demand forecasting, procurement,
//! inventory reorder, freight booking, ...) on schedules, events, or
//! thresholds, chains them into dependency-ordered pipelines, gates risky
//! actions behind monetary approval thresholds, and surfaces unrecoverable
//! failures for human review.
//!
//! ## Core Components
//!
//! - [`Orchestrator`]: the scheduler/state-machine. Polls triggers, consults
//!   the circuit breaker, dispatches workflow bodies concurrently, tracks run
//!   lifecycle, and owns retry, dead-letter, and approval handling.
//! - [`PipelineEngine`]: executes stage graphs in dependency waves on top of
//!   the orchestrator, short-circuiting dependents of failed stages.
//! - [`CircuitBreaker`]: one shared health gate. When recent failures cross
//!   the threshold, dispatch is suppressed fleet-wide until a probe succeeds.
//! - [`RetryPolicy`]: exponential backoff with jitter; exhausted retry chains
//!   land in the dead-letter queue for explicit human retry.
//! - [`ApprovalGate`]: evaluates a run's financial magnitude against leveled
//!   thresholds; pending approvals auto-escalate on timeout.
//! - [`ExceptionManager`]: raises and tracks business anomalies reported by
//!   workflow bodies, independent of run success.
//!
//! Workflow bodies are external collaborators behind the [`WorkflowBody`]
//! trait; the orchestrator never inspects their business logic.
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use opsflow::{BodyRegistry, InMemoryStorage, Orchestrator, OrchestratorConfig};
//!
//! # async fn run() -> opsflow::Result<()> {
//! let storage = Arc::new(InMemoryStorage::default());
//! let registry = Arc::new(BodyRegistry::new());
//! let orchestrator = Orchestrator::new(OrchestratorConfig::default(), storage, registry);
//! orchestrator.initialize_defaults().await?;
//! orchestrator.start();
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod config;
pub mod engine;
pub mod models;
pub mod server;

// Re-export core domain types for easy access
pub use models::{
    ApprovalDecision,
    ApprovalOutcome,
    ApprovalThreshold,
    BusinessException,
    CronExpr,
    ExceptionFilter,
    ExceptionRule,
    ExceptionSeverity,
    ExceptionStatus,
    PendingApproval,
    PipelineDefinition,
    PipelineExecution,
    PipelineStage,
    Run,
    RunFilter,
    RunStats,
    RunStatus,
    StageResult,
    StageStatus,
    TriggerType,
    TriggeredBy,
    WorkflowDefinition,
    WorkflowType,
};

// Re-export engine types for convenience
pub use engine::{
    approvals::ApprovalGate,
    breaker::{BreakerSnapshot, BreakerState, CircuitBreaker, CircuitBreakerConfig},
    events::{EventBus, OrchestratorEvent},
    exceptions::ExceptionManager,
    file_storage::FileStorage,
    orchestrator::{Orchestrator, OrchestratorStatus},
    pipeline::PipelineEngine,
    registry::{
        BodyRegistry, NoopBody, RaisedException, WorkflowBody, WorkflowContext, WorkflowOutcome,
    },
    retry::{RetryDecision, RetryPolicy},
    storage::{InMemoryStorage, OrchestratorStorage},
};

pub use config::OrchestratorConfig;
pub use server::ControlServerBuilder;

use thiserror::Error;

/// Error taxonomy for orchestrator operations.
///
/// Failures inside a single workflow body never crash the orchestrator; they
/// are caught at the dispatch boundary and converted into run state
/// transitions. Only the orchestrator's own bookkeeping failures (storage)
/// surface as process-level errors, and those open the circuit breaker
/// defensively.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Bad workflow or pipeline definition; fatal to that dispatch only
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The workflow body returned an error; retried per policy
    #[error("execution error: {0}")]
    Execution(String),

    /// The workflow body exceeded its deadline; treated as an execution
    /// error for retry purposes
    #[error("workflow body timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// Pipeline stage skipped because an upstream dependency failed;
    /// propagated as a skip, not a failure
    #[error("stage {stage} blocked by failed dependency")]
    DependencyBlocked { stage: usize },

    /// A human rejected the run at the approval gate; terminal
    #[error("approval rejected: {0}")]
    ApprovalRejected(String),

    /// Dispatch refused while the circuit breaker is open; no run created
    #[error("circuit breaker is open; dispatch refused")]
    CircuitOpen,

    /// A run for this workflow is already active
    #[error("workflow '{id}' already has a running run")]
    AlreadyRunning { id: String },

    #[error("workflow not found: {id}")]
    WorkflowNotFound { id: String },

    #[error("run not found: {id}")]
    RunNotFound { id: uuid::Uuid },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Storage-related errors; anyhow keeps backend flexibility
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for OrchestratorError {
    fn from(err: std::io::Error) -> Self {
        OrchestratorError::Internal(err.to_string())
    }
}

/// Type alias for Results that use our error type.
pub type Result<T> = std::result::Result<T, OrchestratorError>;
