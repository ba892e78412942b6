// Pipeline engine - dependency-wave execution of stage graphs

//! # Pipeline Engine
//!
//! Executes a [`PipelineDefinition`] as waves of stages. A wave is the set of
//! unresolved stages whose dependencies have all reached `Completed`; the
//! stages of a wave dispatch concurrently through the orchestrator, bounded
//! by a semaphore, with a join barrier before the next wave is computed.
//!
//! Failure propagation is asymmetric on purpose:
//! - a `Failed` (or undispatchable) stage marks every transitive dependent
//!   `Skipped`;
//! - a stage paused `AwaitingApproval` marks its dependents `Blocked` - not
//!   failed - and only that branch stops; independent branches keep running.
//!
//! `stages_completed` in the resulting [`PipelineExecution`] counts only
//! stages whose run reached `Completed`.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{
    PipelineDefinition, PipelineExecution, Run, RunFilter, RunStatus, StageResult, StageStatus,
    TriggeredBy, WorkflowType,
};
use crate::{OrchestratorError, Result};

use super::orchestrator::Orchestrator;

pub struct PipelineEngine {
    orchestrator: Arc<Orchestrator>,
    stage_permits: Arc<Semaphore>,
}

impl PipelineEngine {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        let parallel = orchestrator.config().max_parallel_stages.max(1);
        PipelineEngine {
            orchestrator,
            stage_permits: Arc::new(Semaphore::new(parallel)),
        }
    }

    pub async fn list_pipelines(&self) -> Result<Vec<PipelineDefinition>> {
        self.orchestrator.storage().list_pipelines().await
    }

    /// Execute a pipeline to quiescence and store the execution report.
    pub async fn execute_pipeline(&self, pipeline_id: &str) -> Result<PipelineExecution> {
        let pipeline = self
            .orchestrator
            .storage()
            .get_pipeline(pipeline_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("pipeline {}", pipeline_id)))?;
        pipeline
            .validate()
            .map_err(OrchestratorError::Configuration)?;

        let started_at = Utc::now();
        let n = pipeline.stages.len();
        let mut statuses: Vec<Option<StageStatus>> = vec![None; n];
        let mut run_ids: Vec<Option<Uuid>> = vec![None; n];

        info!(pipeline = %pipeline_id, stages = n, "pipeline execution started");

        loop {
            // Propagate terminal dependency outcomes before computing the
            // next wave; skips and blocks can cascade several levels.
            let mut propagated = true;
            while propagated {
                propagated = false;
                for i in 0..n {
                    if statuses[i].is_some() {
                        continue;
                    }
                    let deps = &pipeline.stages[i].depends_on;
                    if deps.iter().any(|&d| statuses[d].is_none()) {
                        continue;
                    }
                    if deps.iter().all(|&d| statuses[d] == Some(StageStatus::Completed)) {
                        continue; // runnable; handled by the wave below
                    }
                    let blocked_only = deps.iter().all(|&d| {
                        matches!(
                            statuses[d],
                            Some(StageStatus::Completed)
                                | Some(StageStatus::AwaitingApproval)
                                | Some(StageStatus::Blocked)
                        )
                    });
                    statuses[i] = Some(if blocked_only {
                        StageStatus::Blocked
                    } else {
                        StageStatus::Skipped
                    });
                    propagated = true;
                }
            }

            let wave: Vec<usize> = (0..n)
                .filter(|&i| {
                    statuses[i].is_none()
                        && pipeline.stages[i]
                            .depends_on
                            .iter()
                            .all(|&d| statuses[d] == Some(StageStatus::Completed))
                })
                .collect();
            if wave.is_empty() {
                break;
            }

            let futures = wave.iter().map(|&i| {
                let workflow_type = pipeline.stages[i].workflow_type.clone();
                let permits = self.stage_permits.clone();
                async move {
                    let _permit = permits.acquire().await;
                    (i, self.run_stage(&workflow_type).await)
                }
            });
            for (i, (status, run_id)) in join_all(futures).await {
                statuses[i] = Some(status);
                run_ids[i] = run_id;
            }
        }

        let finished_at = Utc::now();
        let stage_results: Vec<StageResult> = (0..n)
            .map(|i| StageResult {
                stage_index: i,
                workflow_type: pipeline.stages[i].workflow_type.clone(),
                status: statuses[i].unwrap_or(StageStatus::Skipped),
                run_id: run_ids[i],
            })
            .collect();
        let stages_completed = stage_results
            .iter()
            .filter(|s| s.status == StageStatus::Completed)
            .count();
        let awaiting_approval: Vec<Uuid> = stage_results
            .iter()
            .filter(|s| s.status == StageStatus::AwaitingApproval)
            .filter_map(|s| s.run_id)
            .collect();

        let execution = PipelineExecution {
            id: Uuid::new_v4(),
            pipeline_id: pipeline.id.clone(),
            stages_completed,
            stages_total: n,
            duration_ms: (finished_at - started_at).num_milliseconds(),
            awaiting_approval,
            stage_results,
            started_at,
            finished_at,
        };
        info!(
            pipeline = %pipeline_id,
            stages_completed,
            stages_total = n,
            awaiting = execution.awaiting_approval.len(),
            "pipeline execution finished"
        );
        self.orchestrator
            .storage()
            .store_pipeline_execution(execution.clone())
            .await?;
        Ok(execution)
    }

    /// Dispatch one stage and wait for its run (and any retry chain) to
    /// settle. Dispatch refusals become `NotDispatched`, never an error.
    async fn run_stage(&self, workflow_type: &WorkflowType) -> (StageStatus, Option<Uuid>) {
        let workflow = match self.workflow_for(workflow_type).await {
            Ok(Some(w)) => w,
            Ok(None) => {
                warn!(workflow_type = %workflow_type, "no dispatchable workflow for stage");
                return (StageStatus::NotDispatched, None);
            }
            Err(e) => {
                warn!(workflow_type = %workflow_type, error = %e, "stage workflow lookup failed");
                return (StageStatus::NotDispatched, None);
            }
        };
        let workflow_id = workflow.id.clone();
        let run_id = match self
            .orchestrator
            .dispatch(workflow, TriggeredBy::Manual, 1)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!(workflow = %workflow_id, error = %e, "stage dispatch refused");
                return (StageStatus::NotDispatched, None);
            }
        };
        match self.wait_for_settlement(&workflow_id, run_id).await {
            Ok(run) => {
                let status = match run.status {
                    RunStatus::Completed => StageStatus::Completed,
                    RunStatus::AwaitingApproval => StageStatus::AwaitingApproval,
                    _ => StageStatus::Failed,
                };
                (status, Some(run.id))
            }
            Err(e) => {
                warn!(workflow = %workflow_id, error = %e, "stage settlement wait failed");
                (StageStatus::Failed, Some(run_id))
            }
        }
    }

    /// First active workflow definition for a stage's type.
    async fn workflow_for(
        &self,
        workflow_type: &WorkflowType,
    ) -> Result<Option<crate::models::WorkflowDefinition>> {
        let workflows = self.orchestrator.storage().list_workflows().await?;
        Ok(workflows
            .into_iter()
            .find(|w| w.workflow_type == *workflow_type && w.is_dispatchable()))
    }

    /// Wait until the stage's run - following the retry chain if the
    /// orchestrator schedules one - reaches a settled status.
    async fn wait_for_settlement(&self, workflow_id: &str, run_id: Uuid) -> Result<Run> {
        let mut current = run_id;
        loop {
            let run = self
                .orchestrator
                .storage()
                .get_run(&current)
                .await?
                .ok_or(OrchestratorError::RunNotFound { id: current })?;
            match run.status {
                RunStatus::Running | RunStatus::Queued => {}
                RunStatus::Failed if !run.is_dead_lettered() => {
                    // A retry may supersede this run; follow the newest
                    // attempt once it exists.
                    let latest = self
                        .orchestrator
                        .storage()
                        .list_runs(&RunFilter {
                            workflow_id: Some(workflow_id.to_string()),
                            status: None,
                            limit: Some(1),
                        })
                        .await?;
                    if let Some(newest) = latest.first() {
                        if newest.id != current && newest.attempt_number > run.attempt_number {
                            current = newest.id;
                            continue;
                        }
                    }
                    if !self.orchestrator.has_active_run(workflow_id)
                        && (!self.orchestrator.has_pending_retry(workflow_id)
                            || !self.orchestrator.is_running())
                    {
                        // A parked retry only fires while the scheduler loop
                        // is running; with the loop stopped the failure is
                        // final as far as this stage is concerned.
                        return Ok(run);
                    }
                }
                _ => return Ok(run),
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::engine::registry::{BodyRegistry, NoopBody, WorkflowBody, WorkflowContext, WorkflowOutcome};
    use crate::engine::storage::{InMemoryStorage, OrchestratorStorage};
    use crate::models::{ApprovalThreshold, PipelineStage, TriggerType, WorkflowDefinition};

    struct FailingBody;

    #[async_trait::async_trait]
    impl WorkflowBody for FailingBody {
        async fn execute(&self, _context: WorkflowContext) -> Result<WorkflowOutcome> {
            Err(OrchestratorError::Execution("forecast source offline".to_string()))
        }
    }

    struct ExpensiveBody;

    #[async_trait::async_trait]
    impl WorkflowBody for ExpensiveBody {
        async fn execute(&self, _context: WorkflowContext) -> Result<WorkflowOutcome> {
            Ok(WorkflowOutcome {
                items_succeeded: 1,
                items_failed: 0,
                financial_amount: Some(50_000.0),
                exceptions: vec![],
            })
        }
    }

    fn stage(workflow_type: WorkflowType, depends_on: Vec<usize>) -> PipelineStage {
        PipelineStage {
            workflow_type,
            depends_on,
        }
    }

    fn single_attempt(id: &str, workflow_type: WorkflowType) -> WorkflowDefinition {
        let mut workflow = WorkflowDefinition::new(id, id, workflow_type, TriggerType::Manual);
        workflow.max_attempts = Some(1);
        workflow
    }

    async fn engine_with(
        workflows: Vec<WorkflowDefinition>,
        pipeline: PipelineDefinition,
    ) -> (PipelineEngine, Arc<InMemoryStorage>, Arc<BodyRegistry>) {
        let storage = Arc::new(InMemoryStorage::default());
        let registry = Arc::new(BodyRegistry::new());
        for workflow in workflows {
            storage.upsert_workflow(workflow).await.unwrap();
        }
        storage.upsert_pipeline(pipeline).await.unwrap();
        let orchestrator =
            Orchestrator::new(OrchestratorConfig::default(), storage.clone(), registry.clone());
        (PipelineEngine::new(orchestrator), storage, registry)
    }

    #[tokio::test]
    async fn test_linear_pipeline_completes_in_order() {
        let pipeline = PipelineDefinition::new(
            "replenishment",
            "Replenishment",
            vec![
                stage(WorkflowType::DemandForecasting, vec![]),
                stage(WorkflowType::Procurement, vec![0]),
                stage(WorkflowType::FreightBooking, vec![1]),
            ],
        );
        let (engine, _storage, registry) = engine_with(
            vec![
                single_attempt("forecast", WorkflowType::DemandForecasting),
                single_attempt("procure", WorkflowType::Procurement),
                single_attempt("freight", WorkflowType::FreightBooking),
            ],
            pipeline,
        )
        .await;
        registry.register(WorkflowType::DemandForecasting, Arc::new(NoopBody));
        registry.register(WorkflowType::Procurement, Arc::new(NoopBody));
        registry.register(WorkflowType::FreightBooking, Arc::new(NoopBody));

        let execution = engine.execute_pipeline("replenishment").await.unwrap();
        assert_eq!(execution.stages_completed, 3);
        assert!(execution.is_fully_complete());
        assert!(execution.awaiting_approval.is_empty());
    }

    #[tokio::test]
    async fn test_first_stage_failure_skips_all_dependents() {
        let pipeline = PipelineDefinition::new(
            "replenishment",
            "Replenishment",
            vec![
                stage(WorkflowType::DemandForecasting, vec![]),
                stage(WorkflowType::Procurement, vec![0]),
                stage(WorkflowType::FreightBooking, vec![1]),
            ],
        );
        let (engine, _storage, registry) = engine_with(
            vec![
                single_attempt("forecast", WorkflowType::DemandForecasting),
                single_attempt("procure", WorkflowType::Procurement),
                single_attempt("freight", WorkflowType::FreightBooking),
            ],
            pipeline,
        )
        .await;
        registry.register(WorkflowType::DemandForecasting, Arc::new(FailingBody));
        registry.register(WorkflowType::Procurement, Arc::new(NoopBody));
        registry.register(WorkflowType::FreightBooking, Arc::new(NoopBody));

        let execution = engine.execute_pipeline("replenishment").await.unwrap();
        // No stage completed: a failed stage never counts, and its
        // dependents are skipped.
        assert_eq!(execution.stages_completed, 0);
        assert_eq!(execution.stage_results[0].status, StageStatus::Failed);
        assert_eq!(execution.stage_results[1].status, StageStatus::Skipped);
        assert_eq!(execution.stage_results[2].status, StageStatus::Skipped);
    }

    #[tokio::test]
    async fn test_awaiting_approval_blocks_only_its_branch() {
        // Diamond: forecast -> {procure (expensive), reorder} -> freight
        let pipeline = PipelineDefinition::new(
            "diamond",
            "Diamond",
            vec![
                stage(WorkflowType::DemandForecasting, vec![]),
                stage(WorkflowType::Procurement, vec![0]),
                stage(WorkflowType::InventoryReorder, vec![0]),
                stage(WorkflowType::FreightBooking, vec![1]),
            ],
        );
        let mut procure = single_attempt("procure", WorkflowType::Procurement);
        procure.requires_approval = true;
        procure.auto_approve_threshold = Some(5_000.0);
        let (engine, storage, registry) = engine_with(
            vec![
                single_attempt("forecast", WorkflowType::DemandForecasting),
                procure,
                single_attempt("reorder", WorkflowType::InventoryReorder),
                single_attempt("freight", WorkflowType::FreightBooking),
            ],
            pipeline,
        )
        .await;
        storage
            .upsert_threshold(ApprovalThreshold {
                entity_type: "purchase_order".to_string(),
                auto_approve_max: Some(10_000.0),
                level1_max: Some(75_000.0),
                level2_max: None,
                level3_max: None,
                escalation_timeout_minutes: 240,
                is_active: true,
            })
            .await
            .unwrap();
        registry.register(WorkflowType::DemandForecasting, Arc::new(NoopBody));
        registry.register(WorkflowType::Procurement, Arc::new(ExpensiveBody));
        registry.register(WorkflowType::InventoryReorder, Arc::new(NoopBody));
        registry.register(WorkflowType::FreightBooking, Arc::new(NoopBody));

        let execution = engine.execute_pipeline("diamond").await.unwrap();
        assert_eq!(execution.stage_results[0].status, StageStatus::Completed);
        assert_eq!(
            execution.stage_results[1].status,
            StageStatus::AwaitingApproval
        );
        // The independent branch still ran.
        assert_eq!(execution.stage_results[2].status, StageStatus::Completed);
        // The dependent of the paused branch is blocked, not failed.
        assert_eq!(execution.stage_results[3].status, StageStatus::Blocked);
        assert_eq!(execution.stages_completed, 2);
        assert_eq!(execution.awaiting_approval.len(), 1);
    }

    #[tokio::test]
    async fn test_stage_failure_with_retries_left_settles_when_scheduler_stopped() {
        let pipeline = PipelineDefinition::new(
            "solo",
            "Solo",
            vec![stage(WorkflowType::DemandForecasting, vec![])],
        );
        let mut forecast = WorkflowDefinition::new(
            "forecast",
            "forecast",
            WorkflowType::DemandForecasting,
            TriggerType::Manual,
        );
        forecast.max_attempts = Some(3);
        let (engine, _storage, registry) = engine_with(vec![forecast], pipeline).await;
        registry.register(WorkflowType::DemandForecasting, Arc::new(FailingBody));

        // The scheduler loop is not running, so the retry the failure parks
        // has nothing to dispatch it. The stage must still settle as Failed
        // instead of waiting on the retry forever.
        let execution = engine.execute_pipeline("solo").await.unwrap();
        assert_eq!(execution.stage_results[0].status, StageStatus::Failed);
        assert_eq!(execution.stages_completed, 0);
        assert!(engine.orchestrator.has_pending_retry("forecast"));
    }

    #[tokio::test]
    async fn test_missing_workflow_marks_stage_not_dispatched() {
        let pipeline = PipelineDefinition::new(
            "partial",
            "Partial",
            vec![
                stage(WorkflowType::VendorScorecard, vec![]),
                stage(WorkflowType::Procurement, vec![0]),
            ],
        );
        // No VendorScorecard workflow registered at all.
        let (engine, _storage, registry) = engine_with(
            vec![single_attempt("procure", WorkflowType::Procurement)],
            pipeline,
        )
        .await;
        registry.register(WorkflowType::Procurement, Arc::new(NoopBody));

        let execution = engine.execute_pipeline("partial").await.unwrap();
        assert_eq!(execution.stage_results[0].status, StageStatus::NotDispatched);
        assert_eq!(execution.stage_results[1].status, StageStatus::Skipped);
        assert_eq!(execution.stages_completed, 0);
    }

    #[tokio::test]
    async fn test_unknown_pipeline_is_not_found() {
        let (engine, _storage, _registry) = engine_with(
            vec![],
            PipelineDefinition::new(
                "real",
                "Real",
                vec![stage(WorkflowType::Procurement, vec![])],
            ),
        )
        .await;
        assert!(matches!(
            engine.execute_pipeline("ghost").await,
            Err(OrchestratorError::NotFound(_))
        ));
    }
}
