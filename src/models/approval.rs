// Approval thresholds and pending approval records

//! # Approval Thresholds
//!
//! An [`ApprovalThreshold`] configures the monetary boundaries the approval
//! gate evaluates a run's financial magnitude against: an auto-approve cap
//! and up to three leveled human-approval caps, strictly increasing when
//! present. A [`PendingApproval`] records one run paused at a level, with the
//! deadline after which the gate auto-escalates to the next level.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Monetary approval boundaries for one entity type
/// (e.g. "purchase_order", "freight_booking").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalThreshold {
    pub entity_type: String,
    /// Amounts at or under this cap auto-approve
    pub auto_approve_max: Option<f64>,
    pub level1_max: Option<f64>,
    pub level2_max: Option<f64>,
    pub level3_max: Option<f64>,
    /// Minutes a pending approval waits before auto-escalating
    pub escalation_timeout_minutes: i64,
    pub is_active: bool,
}

impl ApprovalThreshold {
    /// Validate that present caps are strictly increasing.
    pub fn validate(&self) -> Result<(), String> {
        let caps = [
            self.auto_approve_max,
            self.level1_max,
            self.level2_max,
            self.level3_max,
        ];
        let present: Vec<f64> = caps.iter().filter_map(|c| *c).collect();
        for pair in present.windows(2) {
            if pair[1] <= pair[0] {
                return Err(format!(
                    "threshold '{}' caps must be strictly increasing",
                    self.entity_type
                ));
            }
        }
        if self.escalation_timeout_minutes <= 0 {
            return Err(format!(
                "threshold '{}' escalation timeout must be positive",
                self.entity_type
            ));
        }
        Ok(())
    }

    /// The cap for a given approval level, if configured.
    pub fn level_max(&self, level: u8) -> Option<f64> {
        match level {
            1 => self.level1_max,
            2 => self.level2_max,
            3 => self.level3_max,
            _ => None,
        }
    }

    /// Highest configured approval level.
    pub fn top_level(&self) -> u8 {
        if self.level3_max.is_some() {
            3
        } else if self.level2_max.is_some() {
            2
        } else if self.level1_max.is_some() {
            1
        } else {
            0
        }
    }
}

/// Outcome of evaluating a run against a threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ApprovalOutcome {
    /// Under the auto-approve cap; no human involvement
    AutoApproved,
    /// Paused, awaiting a human decision at the given level
    Pending { level: u8 },
    /// Above every configured cap; requires senior approval
    Escalated,
}

/// One run paused for human approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingApproval {
    pub run_id: Uuid,
    pub workflow_id: String,
    pub entity_type: String,
    pub amount: f64,
    pub level: u8,
    pub requested_at: DateTime<Utc>,
    /// After this instant the gate bumps the level (or flags escalated at
    /// the top level)
    pub escalation_deadline: DateTime<Utc>,
    pub escalation_count: u32,
    /// Set when the approval sat at the top level past its deadline
    pub escalated: bool,
}

impl PendingApproval {
    pub fn new(
        run_id: Uuid,
        workflow_id: &str,
        entity_type: &str,
        amount: f64,
        level: u8,
        timeout_minutes: i64,
    ) -> Self {
        let now = Utc::now();
        PendingApproval {
            run_id,
            workflow_id: workflow_id.to_string(),
            entity_type: entity_type.to_string(),
            amount,
            level,
            requested_at: now,
            escalation_deadline: now + Duration::minutes(timeout_minutes),
            escalation_count: 0,
            escalated: false,
        }
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        now >= self.escalation_deadline
    }
}

/// A human approve/reject decision arriving from the control API.
#[derive(Debug, Clone, Deserialize)]
pub struct ApprovalDecision {
    pub approve: bool,
    pub decided_by: String,
    pub reason: Option<String>,
}
