// Domain models for the orchestration engine

//! # Domain Models
//!
//! Pure, serializable domain types shared by the engines and the control
//! API. Nothing in this module performs I/O or holds locks; the engine layer
//! owns all coordination.
//!
//! - [`workflow`]: workflow definitions, types, and triggers
//! - [`run`]: per-attempt run records and run statistics
//! - [`schedule`]: cron expression parsing and matching
//! - [`pipeline`]: pipeline stage graphs and execution reports
//! - [`approval`]: approval thresholds and pending approvals
//! - [`exception`]: business exceptions and classification rules

pub mod approval;
pub mod exception;
pub mod pipeline;
pub mod run;
pub mod schedule;
pub mod workflow;

pub use approval::{ApprovalDecision, ApprovalOutcome, ApprovalThreshold, PendingApproval};
pub use exception::{
    BusinessException, ExceptionFilter, ExceptionRule, ExceptionSeverity, ExceptionStatus,
};
pub use pipeline::{
    PipelineDefinition, PipelineExecution, PipelineStage, StageResult, StageStatus,
};
pub use run::{Run, RunFilter, RunStats, RunStatus, TriggeredBy, DLQ_TAG};
pub use schedule::{minute_of, CronExpr};
pub use workflow::{TriggerType, WorkflowDefinition, WorkflowType};
