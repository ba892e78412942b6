// Execution engines: scheduling, dispatch, and failure handling

//! # Engine Layer
//!
//! Everything that coordinates: the orchestrator's scheduler loop, the
//! pipeline wave executor, the circuit breaker, retry/dead-letter policy,
//! the approval gate, the exception manager, the event bus, and the storage
//! abstraction the rest of it runs against. Domain types live in
//! [`crate::models`]; this layer owns all locks, tasks, and I/O.

pub mod approvals;
pub mod breaker;
pub mod events;
pub mod exceptions;
pub mod file_storage;
pub mod orchestrator;
pub mod pipeline;
pub mod registry;
pub mod retry;
pub mod storage;

pub use approvals::ApprovalGate;
pub use breaker::{BreakerSnapshot, BreakerState, CircuitBreaker, CircuitBreakerConfig};
pub use events::{EventBus, OrchestratorEvent};
pub use exceptions::ExceptionManager;
pub use file_storage::FileStorage;
pub use orchestrator::{Orchestrator, OrchestratorStatus};
pub use pipeline::PipelineEngine;
pub use registry::{
    BodyRegistry, NoopBody, RaisedException, WorkflowBody, WorkflowContext, WorkflowOutcome,
};
pub use retry::{RetryDecision, RetryPolicy};
pub use storage::{InMemoryStorage, OrchestratorStorage};
