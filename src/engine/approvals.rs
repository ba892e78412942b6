// Approval gate - monetary thresholds and timed escalation

//! # Approval Gate
//!
//! Evaluates a run's financial magnitude against configured
//! [`ApprovalThreshold`]s and decides whether the run proceeds on its own,
//! pauses for a leveled human approval, or escalates straight to senior
//! approval.
//!
//! Evaluation order:
//! 1. amount <= `auto_approve_max` (or the workflow's own
//!    `auto_approve_threshold` when no entity threshold exists): auto-approve.
//! 2. otherwise the lowest level (1..=3) whose cap covers the amount:
//!    pending at that level.
//! 3. above every configured cap: escalated (senior approval).
//!
//! Escalation is time-driven but polled: the orchestrator's scheduler tick
//! calls [`ApprovalGate::sweep_escalations`], which bumps any pending
//! approval past its deadline to the next level (and flags it `escalated`
//! at the top level). There is no dedicated timer thread and no push
//! notification dependency.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{
    ApprovalOutcome, ApprovalThreshold, PendingApproval, Run, WorkflowDefinition,
};
use crate::Result;

use super::storage::OrchestratorStorage;

/// Fallback escalation timeout when a pending approval's entity type no
/// longer has an active threshold.
const DEFAULT_ESCALATION_TIMEOUT_MINUTES: i64 = 240;

pub struct ApprovalGate {
    storage: Arc<dyn OrchestratorStorage>,
}

impl ApprovalGate {
    pub fn new(storage: Arc<dyn OrchestratorStorage>) -> Self {
        ApprovalGate { storage }
    }

    /// Pure threshold evaluation. `threshold` is the entity-level
    /// configuration when one exists; the workflow's own auto-approve cap is
    /// the fallback.
    pub fn evaluate(
        threshold: Option<&ApprovalThreshold>,
        workflow: &WorkflowDefinition,
        amount: f64,
    ) -> ApprovalOutcome {
        let auto_cap = threshold
            .and_then(|t| t.auto_approve_max)
            .or(workflow.auto_approve_threshold);
        if let Some(cap) = auto_cap {
            if amount <= cap {
                return ApprovalOutcome::AutoApproved;
            }
        }

        if let Some(threshold) = threshold {
            for level in 1u8..=3 {
                if let Some(cap) = threshold.level_max(level) {
                    if amount <= cap {
                        return ApprovalOutcome::Pending { level };
                    }
                }
            }
        }

        ApprovalOutcome::Escalated
    }

    /// Look up the active threshold for an entity type.
    pub async fn threshold_for(&self, entity_type: &str) -> Result<Option<ApprovalThreshold>> {
        Ok(self
            .storage
            .get_threshold(entity_type)
            .await?
            .filter(|t| t.is_active))
    }

    /// Record a run paused for approval at `level`.
    pub async fn request(
        &self,
        run: &Run,
        entity_type: &str,
        amount: f64,
        level: u8,
        escalated: bool,
    ) -> Result<PendingApproval> {
        let timeout = self
            .threshold_for(entity_type)
            .await?
            .map(|t| t.escalation_timeout_minutes)
            .unwrap_or(DEFAULT_ESCALATION_TIMEOUT_MINUTES);
        let mut pending =
            PendingApproval::new(run.id, &run.workflow_id, entity_type, amount, level, timeout);
        pending.escalated = escalated;
        info!(
            run_id = %run.id,
            workflow = %run.workflow_id,
            amount,
            level,
            "run paused awaiting approval"
        );
        self.storage.upsert_pending_approval(pending.clone()).await?;
        Ok(pending)
    }

    /// Remove and return the pending record for a decided run.
    pub async fn take(&self, run_id: &Uuid) -> Result<Option<PendingApproval>> {
        let pending = self.storage.get_pending_approval(run_id).await?;
        if pending.is_some() {
            self.storage.remove_pending_approval(run_id).await?;
        }
        Ok(pending)
    }

    /// Bump every pending approval past its escalation deadline.
    ///
    /// Below the top configured level the approval moves up one level and
    /// the deadline re-arms; at the top level it is flagged `escalated` and
    /// stays pending for senior action. Returns the records that changed.
    pub async fn sweep_escalations(&self, now: DateTime<Utc>) -> Result<Vec<PendingApproval>> {
        let mut changed = Vec::new();
        for mut pending in self.storage.list_pending_approvals().await? {
            if !pending.is_overdue(now) || pending.escalated {
                continue;
            }

            let threshold = self.threshold_for(&pending.entity_type).await?;
            let top_level = threshold.as_ref().map(|t| t.top_level()).unwrap_or(3);
            let timeout = threshold
                .as_ref()
                .map(|t| t.escalation_timeout_minutes)
                .unwrap_or(DEFAULT_ESCALATION_TIMEOUT_MINUTES);

            pending.escalation_count += 1;
            if pending.level < top_level {
                pending.level += 1;
                pending.escalation_deadline = now + Duration::minutes(timeout);
                info!(
                    run_id = %pending.run_id,
                    level = pending.level,
                    "approval timed out; escalated to next level"
                );
            } else {
                pending.escalated = true;
                warn!(
                    run_id = %pending.run_id,
                    level = pending.level,
                    "approval timed out at top level; requires senior approval"
                );
            }
            self.storage.upsert_pending_approval(pending.clone()).await?;
            changed.push(pending);
        }
        Ok(changed)
    }
}
