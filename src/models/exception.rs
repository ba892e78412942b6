// Business exceptions - tracked anomalies raised during workflow execution

//! # Business Exceptions
//!
//! A [`BusinessException`] is an anomaly surfaced by a workflow body (for
//! example "quantity variance detected"), independent of whether the run
//! itself succeeded. Exceptions carry a caller-assigned severity, move
//! through a small resolution lifecycle, and are never deleted - together
//! with the dead-letter queue they form the two durable, human-reviewable
//! failure surfaces of the system.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ExceptionSeverity {
    /// The next severity up; saturates at `Critical`.
    pub fn bumped(self) -> Self {
        match self {
            ExceptionSeverity::Low => ExceptionSeverity::Medium,
            ExceptionSeverity::Medium => ExceptionSeverity::High,
            ExceptionSeverity::High | ExceptionSeverity::Critical => ExceptionSeverity::Critical,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionStatus {
    Open,
    InProgress,
    Escalated,
    Resolved,
    Ignored,
}

impl ExceptionStatus {
    pub fn is_closed(&self) -> bool {
        matches!(self, ExceptionStatus::Resolved | ExceptionStatus::Ignored)
    }
}

/// A tracked business anomaly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessException {
    pub id: Uuid,
    /// The run that surfaced this exception, when raised inside one
    pub run_id: Option<Uuid>,
    pub exception_type: String,
    pub severity: ExceptionSeverity,
    pub status: ExceptionStatus,
    pub description: String,
    pub financial_impact: Option<f64>,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_action: Option<String>,
    pub resolution_notes: Option<String>,
}

impl BusinessException {
    pub fn new(
        exception_type: &str,
        severity: ExceptionSeverity,
        description: &str,
        run_id: Option<Uuid>,
        financial_impact: Option<f64>,
    ) -> Self {
        BusinessException {
            id: Uuid::new_v4(),
            run_id,
            exception_type: exception_type.to_string(),
            severity,
            status: ExceptionStatus::Open,
            description: description.to_string(),
            financial_impact,
            detected_at: Utc::now(),
            resolved_at: None,
            resolution_action: None,
            resolution_notes: None,
        }
    }
}

/// Classification rule consulted at raise time.
///
/// Rules let operators set a default severity per exception type and bump
/// severity when the financial impact crosses a configured amount.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExceptionRule {
    pub exception_type: String,
    pub default_severity: ExceptionSeverity,
    /// Financial impact above which the raised severity is bumped one level
    pub auto_escalate_above: Option<f64>,
    pub is_active: bool,
}

/// Filter for exception listings in the control API.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExceptionFilter {
    pub status: Option<ExceptionStatus>,
    pub severity: Option<ExceptionSeverity>,
    pub exception_type: Option<String>,
    pub limit: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_bump_saturates() {
        assert_eq!(ExceptionSeverity::Low.bumped(), ExceptionSeverity::Medium);
        assert_eq!(ExceptionSeverity::High.bumped(), ExceptionSeverity::Critical);
        assert_eq!(
            ExceptionSeverity::Critical.bumped(),
            ExceptionSeverity::Critical
        );
    }

    #[test]
    fn test_severity_ordering() {
        assert!(ExceptionSeverity::Critical > ExceptionSeverity::Low);
        assert!(ExceptionSeverity::High > ExceptionSeverity::Medium);
    }

    #[test]
    fn test_new_exception_is_open() {
        let exception = BusinessException::new(
            "quantity_variance",
            ExceptionSeverity::Medium,
            "received 480 of 500 ordered units",
            None,
            Some(1_200.0),
        );
        assert_eq!(exception.status, ExceptionStatus::Open);
        assert!(exception.resolved_at.is_none());
        assert!(!exception.status.is_closed());
    }
}
