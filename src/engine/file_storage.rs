// JSON snapshot storage for single-node deployments

//! # File Storage
//!
//! [`FileStorage`] persists the orchestrator's durable state as one JSON
//! snapshot on local disk. Every mutation rewrites the snapshot through a
//! temp-file-and-rename so a crash mid-write never corrupts the previous
//! snapshot. On startup the snapshot is reloaded, which is what lets the
//! orchestrator survive a process restart: workflow definitions, run
//! history (including the DLQ), pipelines, thresholds, pending approvals,
//! and exceptions all come back; the circuit breaker window is re-seeded
//! from the reloaded run history.
//!
//! This backend targets single-process deployments. Multi-node deployments
//! would implement [`OrchestratorStorage`] against a shared database
//! instead; the engines never know the difference.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{
    ApprovalThreshold, BusinessException, ExceptionFilter, ExceptionRule, PendingApproval,
    PipelineDefinition, PipelineExecution, Run, RunFilter, RunStatus, WorkflowDefinition,
};
use crate::Result;

use super::storage::OrchestratorStorage;

/// Everything that goes into the snapshot file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    workflows: HashMap<String, WorkflowDefinition>,
    runs: HashMap<Uuid, Run>,
    run_counter: u64,
    pipelines: HashMap<String, PipelineDefinition>,
    pipeline_executions: Vec<PipelineExecution>,
    thresholds: HashMap<String, ApprovalThreshold>,
    pending_approvals: HashMap<Uuid, PendingApproval>,
    exceptions: HashMap<Uuid, BusinessException>,
    exception_rules: HashMap<String, ExceptionRule>,
}

/// Snapshot-per-mutation storage backend over a local JSON file.
pub struct FileStorage {
    path: PathBuf,
    state: RwLock<Snapshot>,
}

impl FileStorage {
    /// Open (or create) a snapshot at `path`.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = if tokio::fs::try_exists(&path)
            .await
            .with_context(|| format!("checking snapshot at {}", path.display()))?
        {
            let raw = tokio::fs::read(&path)
                .await
                .with_context(|| format!("reading snapshot at {}", path.display()))?;
            serde_json::from_slice(&raw)?
        } else {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            Snapshot::default()
        };
        Ok(FileStorage {
            path,
            state: RwLock::new(state),
        })
    }

    /// Write the snapshot atomically: temp file in the same directory, then
    /// rename over the old snapshot.
    async fn persist(&self, state: &Snapshot) -> Result<()> {
        let raw = serde_json::to_vec_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &raw)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }

    /// Run a mutation under the write lock and persist the result.
    async fn mutate<T, F>(&self, mutation: F) -> Result<T>
    where
        F: FnOnce(&mut Snapshot) -> T,
    {
        let mut state = self.state.write().await;
        let value = mutation(&mut state);
        self.persist(&state).await?;
        Ok(value)
    }
}

#[async_trait::async_trait]
impl OrchestratorStorage for FileStorage {
    async fn upsert_workflow(&self, definition: WorkflowDefinition) -> Result<WorkflowDefinition> {
        self.mutate(|s| {
            s.workflows.insert(definition.id.clone(), definition.clone());
            definition
        })
        .await
    }

    async fn get_workflow(&self, id: &str) -> Result<Option<WorkflowDefinition>> {
        Ok(self.state.read().await.workflows.get(id).cloned())
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowDefinition>> {
        let state = self.state.read().await;
        let mut list: Vec<_> = state.workflows.values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(list)
    }

    async fn upsert_run(&self, run: Run) -> Result<Run> {
        self.mutate(|s| {
            s.runs.insert(run.id, run.clone());
            run
        })
        .await
    }

    async fn get_run(&self, id: &Uuid) -> Result<Option<Run>> {
        Ok(self.state.read().await.runs.get(id).cloned())
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>> {
        let state = self.state.read().await;
        let mut matched: Vec<Run> = state
            .runs
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
        matched.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<Run>> {
        let state = self.state.read().await;
        let mut matched: Vec<Run> = state
            .runs
            .values()
            .filter(|run| run.is_dead_lettered())
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        matched.truncate(limit);
        Ok(matched)
    }

    async fn recent_failures(&self, since: DateTime<Utc>) -> Result<Vec<Run>> {
        let state = self.state.read().await;
        Ok(state
            .runs
            .values()
            .filter(|run| run.status == RunStatus::Failed && run.started_at >= since)
            .cloned()
            .collect())
    }

    async fn next_run_number(&self) -> Result<u64> {
        self.mutate(|s| {
            s.run_counter += 1;
            s.run_counter
        })
        .await
    }

    async fn upsert_pipeline(&self, pipeline: PipelineDefinition) -> Result<PipelineDefinition> {
        self.mutate(|s| {
            s.pipelines.insert(pipeline.id.clone(), pipeline.clone());
            pipeline
        })
        .await
    }

    async fn get_pipeline(&self, id: &str) -> Result<Option<PipelineDefinition>> {
        Ok(self.state.read().await.pipelines.get(id).cloned())
    }

    async fn list_pipelines(&self) -> Result<Vec<PipelineDefinition>> {
        let state = self.state.read().await;
        let mut list: Vec<_> = state.pipelines.values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(list)
    }

    async fn store_pipeline_execution(&self, execution: PipelineExecution) -> Result<()> {
        self.mutate(|s| s.pipeline_executions.push(execution)).await
    }

    async fn list_pipeline_executions(&self, pipeline_id: &str) -> Result<Vec<PipelineExecution>> {
        let state = self.state.read().await;
        Ok(state
            .pipeline_executions
            .iter()
            .filter(|e| e.pipeline_id == pipeline_id)
            .cloned()
            .collect())
    }

    async fn upsert_threshold(&self, threshold: ApprovalThreshold) -> Result<ApprovalThreshold> {
        self.mutate(|s| {
            s.thresholds
                .insert(threshold.entity_type.clone(), threshold.clone());
            threshold
        })
        .await
    }

    async fn get_threshold(&self, entity_type: &str) -> Result<Option<ApprovalThreshold>> {
        Ok(self.state.read().await.thresholds.get(entity_type).cloned())
    }

    async fn list_thresholds(&self) -> Result<Vec<ApprovalThreshold>> {
        Ok(self.state.read().await.thresholds.values().cloned().collect())
    }

    async fn upsert_pending_approval(&self, pending: PendingApproval) -> Result<()> {
        self.mutate(|s| {
            s.pending_approvals.insert(pending.run_id, pending);
        })
        .await
    }

    async fn get_pending_approval(&self, run_id: &Uuid) -> Result<Option<PendingApproval>> {
        Ok(self
            .state
            .read()
            .await
            .pending_approvals
            .get(run_id)
            .cloned())
    }

    async fn remove_pending_approval(&self, run_id: &Uuid) -> Result<()> {
        self.mutate(|s| {
            s.pending_approvals.remove(run_id);
        })
        .await
    }

    async fn list_pending_approvals(&self) -> Result<Vec<PendingApproval>> {
        Ok(self
            .state
            .read()
            .await
            .pending_approvals
            .values()
            .cloned()
            .collect())
    }

    async fn upsert_exception(&self, exception: BusinessException) -> Result<BusinessException> {
        self.mutate(|s| {
            s.exceptions.insert(exception.id, exception.clone());
            exception
        })
        .await
    }

    async fn get_exception(&self, id: &Uuid) -> Result<Option<BusinessException>> {
        Ok(self.state.read().await.exceptions.get(id).cloned())
    }

    async fn list_exceptions(&self, filter: &ExceptionFilter) -> Result<Vec<BusinessException>> {
        let state = self.state.read().await;
        let mut matched: Vec<BusinessException> = state
            .exceptions
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
        self.mutate(|s| {
            s.exception_rules
                .insert(rule.exception_type.clone(), rule.clone());
            rule
        })
        .await
    }

    async fn get_exception_rule(&self, exception_type: &str) -> Result<Option<ExceptionRule>> {
        Ok(self
            .state
            .read()
            .await
            .exception_rules
            .get(exception_type)
            .cloned())
    }

    async fn list_exception_rules(&self) -> Result<Vec<ExceptionRule>> {
        Ok(self
            .state
            .read()
            .await
            .exception_rules
            .values()
            .cloned()
            .collect())
    }
}
