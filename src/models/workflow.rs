// Workflow definitions - what the orchestrator knows about each automation

//! # Workflow Definitions
//!
//! A [`WorkflowDefinition`] describes one recurring business automation:
//! what kind of work it performs (its [`WorkflowType`]), what makes it run
//! (its [`TriggerType`] and optional cron schedule), whether its output must
//! pass the approval gate, and the health counters the orchestrator maintains
//! after every run.
//!
//! The definition is completely agnostic to the business logic itself. The
//! orchestrator dispatches to an external workflow body registered for the
//! definition's type and never inspects what that body computes.
//!
//! Definitions are never deleted while runs reference them. Operators archive
//! a definition instead, which removes it from trigger evaluation while
//! keeping the run history intact.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The kind of business automation a workflow performs.
///
/// The orchestrator uses this only as a dispatch key into the body registry.
/// `Custom` covers workflow types registered by deployments without touching
/// this crate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowType {
    DemandForecasting,
    Procurement,
    InventoryReorder,
    FreightBooking,
    InvoiceReconciliation,
    VendorScorecard,
    Custom(String),
}

impl WorkflowType {
    /// Stable string tag, used in logs and the control API.
    pub fn as_str(&self) -> &str {
        match self {
            WorkflowType::DemandForecasting => "demand_forecasting",
            WorkflowType::Procurement => "procurement",
            WorkflowType::InventoryReorder => "inventory_reorder",
            WorkflowType::FreightBooking => "freight_booking",
            WorkflowType::InvoiceReconciliation => "invoice_reconciliation",
            WorkflowType::VendorScorecard => "vendor_scorecard",
            WorkflowType::Custom(tag) => tag,
        }
    }
}

impl std::fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What causes a workflow to be dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    /// Fires when the cron schedule matches the current minute.
    Scheduled,
    /// Fires when an external system signals a named event.
    Event,
    /// Fires when an external monitor reports a threshold breach.
    /// Delivered through the same signal path as `Event`.
    Threshold,
    /// Fires only on an explicit operator request.
    Manual,
    /// Fires on every scheduler tick where no run is already active.
    Continuous,
}

/// A registered workflow and its orchestration policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Unique identifier, e.g. "procurement-replenishment"
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Dispatch key into the workflow body registry
    pub workflow_type: WorkflowType,
    /// What causes this workflow to run
    pub trigger: TriggerType,
    /// 5-field cron expression; required when trigger is `Scheduled`
    pub schedule: Option<String>,
    /// Event name this workflow listens for; used by `Event` and
    /// `Threshold` triggers
    pub event_name: Option<String>,
    /// Whether run outcomes with a financial amount pass the approval gate
    pub requires_approval: bool,
    /// Workflow-level auto-approve cap, consulted when no entity-level
    /// threshold matches
    pub auto_approve_threshold: Option<f64>,
    /// Inactive workflows are skipped by trigger evaluation
    pub is_active: bool,
    /// Archived workflows are invisible to the scheduler but keep their
    /// run history
    pub archived: bool,
    /// Per-workflow retry cap; falls back to the global default when unset
    pub max_attempts: Option<u32>,
    /// Opaque parameters handed to the workflow body on every run
    pub parameters: serde_json::Value,
    /// Runs that completed successfully
    pub success_count: u64,
    /// Runs that ended failed (including dead-lettered runs)
    pub failure_count: u64,
    /// When the last run was dispatched
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    /// Create a new workflow definition with zeroed counters.
    pub fn new<S: Into<String>, N: Into<String>>(
        id: S,
        name: N,
        workflow_type: WorkflowType,
        trigger: TriggerType,
    ) -> Self {
        WorkflowDefinition {
            id: id.into(),
            name: name.into(),
            workflow_type,
            trigger,
            schedule: None,
            event_name: None,
            requires_approval: false,
            auto_approve_threshold: None,
            is_active: true,
            archived: false,
            max_attempts: None,
            parameters: serde_json::Value::Null,
            success_count: 0,
            failure_count: 0,
            last_run_at: None,
            created_at: Utc::now(),
        }
    }

    /// Builder-style: attach a cron schedule.
    pub fn with_schedule<S: Into<String>>(mut self, cron: S) -> Self {
        self.schedule = Some(cron.into());
        self
    }

    /// Builder-style: listen for a named external signal.
    pub fn with_event<S: Into<String>>(mut self, event_name: S) -> Self {
        self.event_name = Some(event_name.into());
        self
    }

    /// Builder-style: require approval above the given amount.
    pub fn with_approval(mut self, auto_approve_threshold: Option<f64>) -> Self {
        self.requires_approval = true;
        self.auto_approve_threshold = auto_approve_threshold;
        self
    }

    /// Builder-style: set body parameters.
    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }

    /// Whether the scheduler should consider this workflow at all.
    pub fn is_dispatchable(&self) -> bool {
        self.is_active && !self.archived
    }

    /// Validate the definition against its trigger type.
    ///
    /// Scheduled workflows must carry a parseable cron expression; event and
    /// threshold workflows must name the signal they listen for.
    pub fn validate(&self) -> Result<(), String> {
        match self.trigger {
            TriggerType::Scheduled => match &self.schedule {
                None => Err(format!(
                    "workflow '{}' is scheduled but has no cron expression",
                    self.id
                )),
                Some(expr) => super::schedule::CronExpr::parse(expr)
                    .map(|_| ())
                    .map_err(|e| format!("workflow '{}' has invalid schedule: {}", self.id, e)),
            },
            TriggerType::Event | TriggerType::Threshold => {
                if self.event_name.is_none() {
                    Err(format!(
                        "workflow '{}' is signal-triggered but names no event",
                        self.id
                    ))
                } else {
                    Ok(())
                }
            }
            TriggerType::Manual | TriggerType::Continuous => Ok(()),
        }
    }

    /// Record a run outcome in the health counters.
    pub fn record_outcome(&mut self, succeeded: bool, at: DateTime<Utc>) {
        if succeeded {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }
        self.last_run_at = Some(at);
    }
}
