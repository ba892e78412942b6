// Exception manager - raise, classify, and track business anomalies

//! # Exception Manager
//!
//! Tracking and audit for business-level anomalies surfaced by workflow
//! bodies. Raising an exception never fails the originating run: a
//! procurement run can complete successfully *and* report a quantity
//! variance worth human review.
//!
//! Severity comes from the caller. The manager's only classification input
//! is the configured [`ExceptionRule`] table: an active rule for the
//! exception type supplies a default severity and may bump the raised
//! severity one level when the financial impact crosses its configured
//! amount.
//!
//! Status lifecycle: `Open` -> (`InProgress`) -> `Resolved` | `Escalated` |
//! `Ignored`. Exceptions are never deleted.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{
    BusinessException, ExceptionFilter, ExceptionRule, ExceptionSeverity, ExceptionStatus,
};
use crate::{OrchestratorError, Result};

use super::storage::OrchestratorStorage;

pub struct ExceptionManager {
    storage: Arc<dyn OrchestratorStorage>,
}

impl ExceptionManager {
    pub fn new(storage: Arc<dyn OrchestratorStorage>) -> Self {
        ExceptionManager { storage }
    }

    /// Raise a new exception. Returns its id.
    ///
    /// `severity` is the caller's assessment; `None` falls back to the rule's
    /// default (or `Medium` without a rule). An active rule with
    /// `auto_escalate_above` exceeded bumps the severity one level.
    pub async fn raise(
        &self,
        exception_type: &str,
        severity: Option<ExceptionSeverity>,
        description: &str,
        run_id: Option<Uuid>,
        financial_impact: Option<f64>,
    ) -> Result<Uuid> {
        let rule = self
            .storage
            .get_exception_rule(exception_type)
            .await?
            .filter(|r| r.is_active);

        let mut severity = severity
            .or_else(|| rule.as_ref().map(|r| r.default_severity))
            .unwrap_or(ExceptionSeverity::Medium);

        if let (Some(rule), Some(impact)) = (&rule, financial_impact) {
            if rule.auto_escalate_above.map_or(false, |cap| impact > cap) {
                severity = severity.bumped();
            }
        }

        let exception = BusinessException::new(
            exception_type,
            severity,
            description,
            run_id,
            financial_impact,
        );
        let id = exception.id;
        info!(
            exception_id = %id,
            exception_type,
            severity = ?severity,
            "business exception raised"
        );
        self.storage.upsert_exception(exception).await?;
        Ok(id)
    }

    /// Move an open exception to `InProgress`.
    pub async fn start_progress(&self, id: &Uuid) -> Result<BusinessException> {
        self.transition(id, |e| {
            if e.status != ExceptionStatus::Open {
                return Err(OrchestratorError::InvalidInput(format!(
                    "exception {} is not open",
                    e.id
                )));
            }
            e.status = ExceptionStatus::InProgress;
            Ok(())
        })
        .await
    }

    /// Resolve an exception with the action taken.
    pub async fn resolve(&self, id: &Uuid, action: &str, notes: Option<&str>) -> Result<BusinessException> {
        self.transition(id, |e| {
            if e.status.is_closed() {
                return Err(OrchestratorError::InvalidInput(format!(
                    "exception {} is already closed",
                    e.id
                )));
            }
            e.status = ExceptionStatus::Resolved;
            e.resolved_at = Some(Utc::now());
            e.resolution_action = Some(action.to_string());
            e.resolution_notes = notes.map(|n| n.to_string());
            Ok(())
        })
        .await
    }

    /// Escalate an exception: bumps severity visibility, keeps everything
    /// else intact.
    pub async fn escalate(&self, id: &Uuid) -> Result<BusinessException> {
        let escalated = self
            .transition(id, |e| {
                if e.status.is_closed() {
                    return Err(OrchestratorError::InvalidInput(format!(
                        "exception {} is already closed",
                        e.id
                    )));
                }
                e.status = ExceptionStatus::Escalated;
                e.severity = e.severity.bumped();
                Ok(())
            })
            .await?;
        warn!(exception_id = %id, severity = ?escalated.severity, "exception escalated");
        Ok(escalated)
    }

    /// Close an exception without action.
    pub async fn ignore(&self, id: &Uuid, notes: Option<&str>) -> Result<BusinessException> {
        self.transition(id, |e| {
            if e.status.is_closed() {
                return Err(OrchestratorError::InvalidInput(format!(
                    "exception {} is already closed",
                    e.id
                )));
            }
            e.status = ExceptionStatus::Ignored;
            e.resolved_at = Some(Utc::now());
            e.resolution_notes = notes.map(|n| n.to_string());
            Ok(())
        })
        .await
    }

    pub async fn list(&self, filter: &ExceptionFilter) -> Result<Vec<BusinessException>> {
        self.storage.list_exceptions(filter).await
    }

    pub async fn list_rules(&self) -> Result<Vec<ExceptionRule>> {
        self.storage.list_exception_rules().await
    }

    /// Exceptions still requiring attention.
    pub async fn open_count(&self) -> Result<usize> {
        let all = self.storage.list_exceptions(&ExceptionFilter::default()).await?;
        Ok(all.iter().filter(|e| !e.status.is_closed()).count())
    }

    async fn transition<F>(&self, id: &Uuid, apply: F) -> Result<BusinessException>
    where
        F: FnOnce(&mut BusinessException) -> Result<()>,
    {
        let mut exception = self
            .storage
            .get_exception(id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("exception {}", id)))?;
        apply(&mut exception)?;
        self.storage.upsert_exception(exception.clone()).await?;
        Ok(exception)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::storage::InMemoryStorage;

    fn manager() -> (ExceptionManager, Arc<InMemoryStorage>) {
        let storage = Arc::new(InMemoryStorage::default());
        (ExceptionManager::new(storage.clone()), storage)
    }

    #[tokio::test]
    async fn test_raise_uses_caller_severity() {
        let (manager, storage) = manager();
        let id = manager
            .raise(
                "quantity_variance",
                Some(ExceptionSeverity::High),
                "received 480 of 500 units",
                None,
                Some(1_200.0),
            )
            .await
            .unwrap();
        let exception = storage.get_exception(&id).await.unwrap().unwrap();
        assert_eq!(exception.severity, ExceptionSeverity::High);
        assert_eq!(exception.status, ExceptionStatus::Open);
    }

    #[tokio::test]
    async fn test_rule_bumps_severity_on_large_impact() {
        let (manager, storage) = manager();
        storage
            .upsert_exception_rule(ExceptionRule {
                exception_type: "price_variance".to_string(),
                default_severity: ExceptionSeverity::Low,
                auto_escalate_above: Some(10_000.0),
                is_active: true,
            })
            .await
            .unwrap();

        let id = manager
            .raise("price_variance", None, "unit cost up 30%", None, Some(25_000.0))
            .await
            .unwrap();
        let exception = storage.get_exception(&id).await.unwrap().unwrap();
        // Rule default Low, bumped once for the impact
        assert_eq!(exception.severity, ExceptionSeverity::Medium);

        let small = manager
            .raise("price_variance", None, "unit cost up 2%", None, Some(50.0))
            .await
            .unwrap();
        let exception = storage.get_exception(&small).await.unwrap().unwrap();
        assert_eq!(exception.severity, ExceptionSeverity::Low);
    }

    #[tokio::test]
    async fn test_resolution_lifecycle() {
        let (manager, _storage) = manager();
        let id = manager
            .raise("shipment_delay", Some(ExceptionSeverity::Medium), "ETA slipped 6 days", None, None)
            .await
            .unwrap();

        manager.start_progress(&id).await.unwrap();
        let resolved = manager
            .resolve(&id, "rebooked_carrier", Some("moved to air freight"))
            .await
            .unwrap();
        assert_eq!(resolved.status, ExceptionStatus::Resolved);
        assert!(resolved.resolved_at.is_some());

        // Closed exceptions reject further transitions
        assert!(manager.escalate(&id).await.is_err());
        assert!(manager.resolve(&id, "again", None).await.is_err());
    }

    #[tokio::test]
    async fn test_escalate_bumps_severity() {
        let (manager, _storage) = manager();
        let id = manager
            .raise("margin_erosion", Some(ExceptionSeverity::Medium), "margin under 5%", None, None)
            .await
            .unwrap();
        let escalated = manager.escalate(&id).await.unwrap();
        assert_eq!(escalated.status, ExceptionStatus::Escalated);
        assert_eq!(escalated.severity, ExceptionSeverity::High);
    }

    #[tokio::test]
    async fn test_open_count_excludes_closed() {
        let (manager, _storage) = manager();
        let a = manager
            .raise("a", Some(ExceptionSeverity::Low), "", None, None)
            .await
            .unwrap();
        manager
            .raise("b", Some(ExceptionSeverity::Low), "", None, None)
            .await
            .unwrap();
        assert_eq!(manager.open_count().await.unwrap(), 2);

        manager.ignore(&a, None).await.unwrap();
        assert_eq!(manager.open_count().await.unwrap(), 1);
    }
}
