// Storage abstraction for the orchestration engine

//! # Storage Abstraction Layer
//!
//! [`OrchestratorStorage`] is the persistence interface the engines operate
//! against: workflow definitions, runs, pipelines and their executions,
//! approval thresholds, pending approvals, exception rules, and exceptions.
//! All operations are async and return our crate `Result`.
//!
//! [`InMemoryStorage`] is the default implementation for development and
//! tests; [`super::file_storage::FileStorage`] adds JSON snapshot
//! persistence for single-node deployments. In-memory orchestrator state
//! (circuit breaker window, active-run lock table) is deliberately *not*
//! stored here - it is rebuilt from run history on startup.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{
    ApprovalThreshold, BusinessException, ExceptionFilter, ExceptionRule, ExceptionStatus,
    PendingApproval, PipelineDefinition, PipelineExecution, Run, RunFilter, RunStatus,
    WorkflowDefinition,
};
use crate::Result;

/// Persistence interface for everything the orchestrator tracks.
#[async_trait::async_trait]
pub trait OrchestratorStorage: Send + Sync {
    // Workflow definitions
    async fn upsert_workflow(&self, definition: WorkflowDefinition) -> Result<WorkflowDefinition>;
    async fn get_workflow(&self, id: &str) -> Result<Option<WorkflowDefinition>>;
    async fn list_workflows(&self) -> Result<Vec<WorkflowDefinition>>;

    // Runs
    async fn upsert_run(&self, run: Run) -> Result<Run>;
    async fn get_run(&self, id: &Uuid) -> Result<Option<Run>>;
    /// List runs matching the filter, newest first.
    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>>;
    /// Runs whose error message carries the DLQ tag, newest first.
    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<Run>>;
    /// Failed runs that started at or after the cutoff. Used to re-seed the
    /// circuit breaker window on startup.
    async fn recent_failures(&self, since: DateTime<Utc>) -> Result<Vec<Run>>;
    /// Allocate the next human-readable run number.
    async fn next_run_number(&self) -> Result<u64>;

    // Pipelines
    async fn upsert_pipeline(&self, pipeline: PipelineDefinition) -> Result<PipelineDefinition>;
    async fn get_pipeline(&self, id: &str) -> Result<Option<PipelineDefinition>>;
    async fn list_pipelines(&self) -> Result<Vec<PipelineDefinition>>;
    async fn store_pipeline_execution(&self, execution: PipelineExecution) -> Result<()>;
    async fn list_pipeline_executions(&self, pipeline_id: &str) -> Result<Vec<PipelineExecution>>;

    // Approval thresholds and pending approvals
    async fn upsert_threshold(&self, threshold: ApprovalThreshold) -> Result<ApprovalThreshold>;
    async fn get_threshold(&self, entity_type: &str) -> Result<Option<ApprovalThreshold>>;
    async fn list_thresholds(&self) -> Result<Vec<ApprovalThreshold>>;
    async fn upsert_pending_approval(&self, pending: PendingApproval) -> Result<()>;
    async fn get_pending_approval(&self, run_id: &Uuid) -> Result<Option<PendingApproval>>;
    async fn remove_pending_approval(&self, run_id: &Uuid) -> Result<()>;
    async fn list_pending_approvals(&self) -> Result<Vec<PendingApproval>>;

    // Exceptions
    async fn upsert_exception(&self, exception: BusinessException) -> Result<BusinessException>;
    async fn get_exception(&self, id: &Uuid) -> Result<Option<BusinessException>>;
    async fn list_exceptions(&self, filter: &ExceptionFilter) -> Result<Vec<BusinessException>>;
    async fn upsert_exception_rule(&self, rule: ExceptionRule) -> Result<ExceptionRule>;
    async fn get_exception_rule(&self, exception_type: &str) -> Result<Option<ExceptionRule>>;
    async fn list_exception_rules(&self) -> Result<Vec<ExceptionRule>>;
}

/// In-memory storage for development and testing.
///
/// Thread-safe via `tokio::sync::RwLock`; data is lost on restart.
#[derive(Default)]
pub struct InMemoryStorage {
    workflows: RwLock<HashMap<String, WorkflowDefinition>>,
    runs: RwLock<HashMap<Uuid, Run>>,
    run_counter: RwLock<u64>,
    pipelines: RwLock<HashMap<String, PipelineDefinition>>,
    pipeline_executions: RwLock<Vec<PipelineExecution>>,
    thresholds: RwLock<HashMap<String, ApprovalThreshold>>,
    pending_approvals: RwLock<HashMap<Uuid, PendingApproval>>,
    exceptions: RwLock<HashMap<Uuid, BusinessException>>,
    exception_rules: RwLock<HashMap<String, ExceptionRule>>,
}

fn sort_newest_first(runs: &mut [Run]) {
    runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
}

#[async_trait::async_trait]
impl OrchestratorStorage for InMemoryStorage {
    async fn upsert_workflow(&self, definition: WorkflowDefinition) -> Result<WorkflowDefinition> {
        let mut workflows = self.workflows.write().await;
        workflows.insert(definition.id.clone(), definition.clone());
        Ok(definition)
    }

    async fn get_workflow(&self, id: &str) -> Result<Option<WorkflowDefinition>> {
        let workflows = self.workflows.read().await;
        Ok(workflows.get(id).cloned())
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowDefinition>> {
        let workflows = self.workflows.read().await;
        let mut list: Vec<_> = workflows.values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(list)
    }

    async fn upsert_run(&self, run: Run) -> Result<Run> {
        let mut runs = self.runs.write().await;
        runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn get_run(&self, id: &Uuid) -> Result<Option<Run>> {
        let runs = self.runs.read().await;
        Ok(runs.get(id).cloned())
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>> {
        let runs = self.runs.read().await;
        let mut matched: Vec<Run> = runs
            .values()
            .filter(|run| {
                filter
                    .workflow_id
                    .as_deref()
                    .map_or(true, |wid| run.workflow_id == wid)
                    && filter.status.map_or(true, |s| run.status == s)
            })
            .cloned()
            .collect();
        sort_newest_first(&mut matched);
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<Run>> {
        let runs = self.runs.read().await;
        let mut matched: Vec<Run> = runs
            .values()
            .filter(|run| run.is_dead_lettered())
            .cloned()
            .collect();
        sort_newest_first(&mut matched);
        matched.truncate(limit);
        Ok(matched)
    }

    async fn recent_failures(&self, since: DateTime<Utc>) -> Result<Vec<Run>> {
        let runs = self.runs.read().await;
        Ok(runs
            .values()
            .filter(|run| run.status == RunStatus::Failed && run.started_at >= since)
            .cloned()
            .collect())
    }

    async fn next_run_number(&self) -> Result<u64> {
        let mut counter = self.run_counter.write().await;
        *counter += 1;
        Ok(*counter)
    }

    async fn upsert_pipeline(&self, pipeline: PipelineDefinition) -> Result<PipelineDefinition> {
        let mut pipelines = self.pipelines.write().await;
        pipelines.insert(pipeline.id.clone(), pipeline.clone());
        Ok(pipeline)
    }

    async fn get_pipeline(&self, id: &str) -> Result<Option<PipelineDefinition>> {
        let pipelines = self.pipelines.read().await;
        Ok(pipelines.get(id).cloned())
    }

    async fn list_pipelines(&self) -> Result<Vec<PipelineDefinition>> {
        let pipelines = self.pipelines.read().await;
        let mut list: Vec<_> = pipelines.values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(list)
    }

    async fn store_pipeline_execution(&self, execution: PipelineExecution) -> Result<()> {
        let mut executions = self.pipeline_executions.write().await;
        executions.push(execution);
        Ok(())
    }

    async fn list_pipeline_executions(&self, pipeline_id: &str) -> Result<Vec<PipelineExecution>> {
        let executions = self.pipeline_executions.read().await;
        Ok(executions
            .iter()
            .filter(|e| e.pipeline_id == pipeline_id)
            .cloned()
            .collect())
    }

    async fn upsert_threshold(&self, threshold: ApprovalThreshold) -> Result<ApprovalThreshold> {
        let mut thresholds = self.thresholds.write().await;
        thresholds.insert(threshold.entity_type.clone(), threshold.clone());
        Ok(threshold)
    }

    async fn get_threshold(&self, entity_type: &str) -> Result<Option<ApprovalThreshold>> {
        let thresholds = self.thresholds.read().await;
        Ok(thresholds.get(entity_type).cloned())
    }

    async fn list_thresholds(&self) -> Result<Vec<ApprovalThreshold>> {
        let thresholds = self.thresholds.read().await;
        Ok(thresholds.values().cloned().collect())
    }

    async fn upsert_pending_approval(&self, pending: PendingApproval) -> Result<()> {
        let mut approvals = self.pending_approvals.write().await;
        approvals.insert(pending.run_id, pending);
        Ok(())
    }

    async fn get_pending_approval(&self, run_id: &Uuid) -> Result<Option<PendingApproval>> {
        let approvals = self.pending_approvals.read().await;
        Ok(approvals.get(run_id).cloned())
    }

    async fn remove_pending_approval(&self, run_id: &Uuid) -> Result<()> {
        let mut approvals = self.pending_approvals.write().await;
        approvals.remove(run_id);
        Ok(())
    }

    async fn list_pending_approvals(&self) -> Result<Vec<PendingApproval>> {
        let approvals = self.pending_approvals.read().await;
        Ok(approvals.values().cloned().collect())
    }

    async fn upsert_exception(&self, exception: BusinessException) -> Result<BusinessException> {
        let mut exceptions = self.exceptions.write().await;
        exceptions.insert(exception.id, exception.clone());
        Ok(exception)
    }

    async fn get_exception(&self, id: &Uuid) -> Result<Option<BusinessException>> {
        let exceptions = self.exceptions.read().await;
        Ok(exceptions.get(id).cloned())
    }

    async fn list_exceptions(&self, filter: &ExceptionFilter) -> Result<Vec<BusinessException>> {
        let exceptions = self.exceptions.read().await;
        let mut matched: Vec<BusinessException> = exceptions
            .values()
            .filter(|e| {
                filter.status.map_or(true, |s| e.status == s)
                    && filter.severity.map_or(true, |s| e.severity == s)
                    && filter
                        .exception_type
                        .as_deref()
                        .map_or(true, |t| e.exception_type == t)
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.detected_at.cmp(&a.detected_at));
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn upsert_exception_rule(&self, rule: ExceptionRule) -> Result<ExceptionRule> {
        let mut rules = self.exception_rules.write().await;
        rules.insert(rule.exception_type.clone(), rule.clone());
        Ok(rule)
    }

    async fn get_exception_rule(&self, exception_type: &str) -> Result<Option<ExceptionRule>> {
        let rules = self.exception_rules.read().await;
        Ok(rules.get(exception_type).cloned())
    }

    async fn list_exception_rules(&self) -> Result<Vec<ExceptionRule>> {
        let rules = self.exception_rules.read().await;
        Ok(rules.values().cloned().collect())
    }
}

/// Count exceptions currently requiring attention (open, in progress, or
/// escalated).
pub async fn open_exception_count(storage: &dyn OrchestratorStorage) -> Result<usize> {
    let all = storage.list_exceptions(&ExceptionFilter::default()).await?;
    Ok(all
        .iter()
        .filter(|e| !matches!(e.status, ExceptionStatus::Resolved | ExceptionStatus::Ignored))
        .count())
}
