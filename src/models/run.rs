// Run records - one execution attempt of a workflow

//! # Runs
//!
//! A [`Run`] records a single execution attempt of a workflow: its lifecycle
//! status, which attempt in a retry chain it is, timing, item-level outcome
//! counts, and error detail. Runs are the orchestrator's audit trail; they
//! are created at dispatch time and only ever move forward through their
//! status transitions.
//!
//! Two invariants the orchestrator enforces around runs:
//! - at most one run per workflow is `Running` at any time;
//! - `attempt_number` strictly increases along a retry chain and is capped
//!   by the retry policy, after which the final run is tagged for the
//!   dead-letter queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::workflow::WorkflowType;

/// Error-message prefix marking a run as dead-lettered.
pub const DLQ_TAG: &str = "[DLQ] ";

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
    AwaitingApproval,
    Cancelled,
}

impl RunStatus {
    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

/// What caused this run to be dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggeredBy {
    Scheduled,
    Event,
    Manual,
    Retry,
}

/// One execution attempt of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    /// Human-readable monotonic sequence number, e.g. run #142
    pub run_number: u64,
    /// Back-reference to the owning workflow definition
    pub workflow_id: String,
    pub workflow_type: WorkflowType,
    pub status: RunStatus,
    pub triggered_by: TriggeredBy,
    /// 1 for a fresh dispatch; incremented along a retry chain
    pub attempt_number: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub items_succeeded: u64,
    pub items_failed: u64,
    /// Monetary magnitude of the run's effect, if the body reported one.
    /// Input to the approval gate.
    pub financial_amount: Option<f64>,
    pub error_message: Option<String>,
    /// Approval level the run is paused at, while `AwaitingApproval`
    pub approval_level: Option<u8>,
}

impl Run {
    /// Create a run in `Running` status at the current instant.
    pub fn dispatched(
        run_number: u64,
        workflow_id: &str,
        workflow_type: WorkflowType,
        triggered_by: TriggeredBy,
        attempt_number: u32,
    ) -> Self {
        Run {
            id: Uuid::new_v4(),
            run_number,
            workflow_id: workflow_id.to_string(),
            workflow_type,
            status: RunStatus::Running,
            triggered_by,
            attempt_number,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            items_succeeded: 0,
            items_failed: 0,
            financial_amount: None,
            error_message: None,
            approval_level: None,
        }
    }

    /// Close the run with the given terminal-ish status, stamping timing.
    pub fn finish(&mut self, status: RunStatus) {
        let now = Utc::now();
        self.duration_ms = Some((now - self.started_at).num_milliseconds());
        self.completed_at = Some(now);
        self.status = status;
    }

    /// Mark the run failed with an error message.
    pub fn fail<S: Into<String>>(&mut self, message: S) {
        self.error_message = Some(message.into());
        self.finish(RunStatus::Failed);
    }

    /// Tag the run's error message for the dead-letter queue.
    ///
    /// Idempotent: a run is never tagged twice.
    pub fn dead_letter(&mut self) {
        let message = self.error_message.take().unwrap_or_default();
        if message.starts_with(DLQ_TAG) {
            self.error_message = Some(message);
        } else {
            self.error_message = Some(format!("{}{}", DLQ_TAG, message));
        }
    }

    /// Whether this run sits in the dead-letter queue.
    pub fn is_dead_lettered(&self) -> bool {
        self.status == RunStatus::Failed
            && self
                .error_message
                .as_deref()
                .map(|m| m.starts_with(DLQ_TAG))
                .unwrap_or(false)
    }
}

/// Filter for run listings in the control API.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunFilter {
    pub workflow_id: Option<String>,
    pub status: Option<RunStatus>,
    pub limit: Option<usize>,
}

/// 7-day aggregate over run history. Read-only observability surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStats {
    pub total_runs: u64,
    pub successful_runs: u64,
    pub failed_runs: u64,
    pub items_processed: u64,
    pub value_processed: f64,
}

impl RunStats {
    /// Aggregate runs that started within the window ending now.
    pub fn over_window(runs: &[Run], window: chrono::Duration) -> Self {
        let cutoff = Utc::now() - window;
        let mut stats = RunStats::default();
        for run in runs.iter().filter(|r| r.started_at >= cutoff) {
            stats.total_runs += 1;
            match run.status {
                RunStatus::Completed => stats.successful_runs += 1,
                RunStatus::Failed => stats.failed_runs += 1,
                _ => {}
            }
            stats.items_processed += run.items_succeeded + run.items_failed;
            stats.value_processed += run.financial_amount.unwrap_or(0.0);
        }
        stats
    }
}
