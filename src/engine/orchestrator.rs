// Orchestrator - scheduler loop, dispatch, and run lifecycle

//! # Orchestrator
//!
//! The heart of the engine: a single scheduler loop that evaluates triggers
//! on a fixed poll interval, dispatches workflow bodies as concurrent tasks,
//! and owns every run lifecycle transition.
//!
//! Each tick does three things:
//! 1. re-dispatch scheduled retries that have come due;
//! 2. evaluate triggers (cron match for `Scheduled`, idle check for
//!    `Continuous`) against every dispatchable workflow;
//! 3. sweep approval escalation deadlines.
//!
//! Dispatch preconditions, checked in order: the workflow is active and not
//! archived, no run for it is already active (check-and-set on the lock
//! table), and the circuit breaker grants a permit. A refusal is a skip, not
//! a queue entry - the trigger simply fires again on a later tick.
//!
//! Workflow bodies run under `tokio::time::timeout` with a child cancellation
//! token; a body error or timeout becomes a run failure and never crashes the
//! loop. `stop()` cancels the loop and in-flight bodies cooperatively and
//! waits a bounded interval for the loop task to drain.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::models::{
    minute_of, ApprovalDecision, ApprovalOutcome, CronExpr, Run, RunFilter, RunStats, RunStatus,
    TriggerType, TriggeredBy, WorkflowDefinition, WorkflowType,
};
use crate::{OrchestratorError, Result};

use super::approvals::ApprovalGate;
use super::breaker::{BreakerSnapshot, CircuitBreaker};
use super::events::{EventBus, OrchestratorEvent};
use super::exceptions::ExceptionManager;
use super::registry::{BodyRegistry, NoopBody, WorkflowContext, WorkflowOutcome};
use super::retry::{RetryDecision, RetryPolicy};
use super::storage::{open_exception_count, OrchestratorStorage};

/// A retry waiting for its backoff to elapse.
#[derive(Debug, Clone)]
struct ScheduledRetry {
    workflow_id: String,
    attempt_number: u32,
    due_at: DateTime<Utc>,
}

/// Status surface for the control API.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub running: bool,
    pub workflows_total: usize,
    pub workflows_active: usize,
    pub active_runs: usize,
    pub pending_retries: usize,
    pub pending_approvals: usize,
    pub open_exceptions: usize,
    pub dead_letters: usize,
    pub breaker: BreakerSnapshot,
}

/// The scheduler and run-lifecycle state machine.
pub struct Orchestrator {
    config: OrchestratorConfig,
    storage: Arc<dyn OrchestratorStorage>,
    registry: Arc<BodyRegistry>,
    breaker: Arc<CircuitBreaker>,
    retry_policy: RetryPolicy,
    approvals: ApprovalGate,
    exceptions: ExceptionManager,
    events: EventBus,
    /// workflow_id -> active run id; at most one entry per workflow
    active_runs: DashMap<String, Uuid>,
    pending_retries: DashMap<Uuid, ScheduledRetry>,
    running: AtomicBool,
    shutdown: Mutex<CancellationToken>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    /// Self-handle for spawning tasks that outlive the caller's borrow
    weak: Weak<Orchestrator>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        storage: Arc<dyn OrchestratorStorage>,
        registry: Arc<BodyRegistry>,
    ) -> Arc<Self> {
        let breaker = Arc::new(CircuitBreaker::new(config.breaker_config()));
        let retry_policy = config.retry_policy();
        Arc::new_cyclic(|weak| Orchestrator {
            config,
            storage: storage.clone(),
            registry,
            breaker,
            retry_policy,
            approvals: ApprovalGate::new(storage.clone()),
            exceptions: ExceptionManager::new(storage),
            events: EventBus::new(),
            active_runs: DashMap::new(),
            pending_retries: DashMap::new(),
            running: AtomicBool::new(false),
            shutdown: Mutex::new(CancellationToken::new()),
            loop_handle: Mutex::new(None),
            weak: weak.clone(),
        })
    }

    /// Owned handle to self for spawned tasks. Fails only if every strong
    /// reference is gone, which cannot happen under an active `&self`.
    fn strong(&self) -> Result<Arc<Self>> {
        self.weak
            .upgrade()
            .ok_or_else(|| OrchestratorError::Internal("orchestrator dropped".to_string()))
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn OrchestratorStorage> {
        &self.storage
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn exceptions(&self) -> &ExceptionManager {
        &self.exceptions
    }

    pub fn approvals(&self) -> &ApprovalGate {
        &self.approvals
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Whether a run for this workflow is currently in flight.
    pub fn has_active_run(&self, workflow_id: &str) -> bool {
        self.active_runs.contains_key(workflow_id)
    }

    /// Whether a retry for this workflow is waiting for its backoff.
    pub fn has_pending_retry(&self, workflow_id: &str) -> bool {
        self.pending_retries
            .iter()
            .any(|entry| entry.value().workflow_id == workflow_id)
    }

    /// Start the scheduler loop and the external-signal listener.
    /// Idempotent: a second start while running is a no-op.
    pub fn start(&self) {
        let Ok(orchestrator) = self.strong() else {
            return;
        };
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let token = CancellationToken::new();
        let loop_token = token.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = orchestrator.recover_interrupted_runs().await {
                warn!(error = %e, "could not repair interrupted runs");
            }
            if let Err(e) = orchestrator.seed_breaker_from_history().await {
                warn!(error = %e, "could not seed breaker from run history");
            }
            orchestrator.spawn_signal_listener(loop_token.clone());
            let mut interval = tokio::time::interval(orchestrator.config.poll_interval());
            info!(
                poll_interval = ?orchestrator.config.poll_interval(),
                "orchestrator started"
            );
            loop {
                tokio::select! {
                    _ = interval.tick() => orchestrator.tick(Utc::now()).await,
                    _ = loop_token.cancelled() => break,
                }
            }
            info!("orchestrator scheduler loop stopped");
        });

        // Stash the token and handle for stop(). try_lock never contends
        // here: start/stop are control-plane calls.
        if let Ok(mut shutdown) = self.shutdown.try_lock() {
            *shutdown = token;
        }
        if let Ok(mut slot) = self.loop_handle.try_lock() {
            *slot = Some(handle);
        }
    }

    /// Stop the scheduler loop and cancel in-flight bodies. Bounded: waits at
    /// most five seconds for the loop task to drain.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.lock().await.cancel();
        let handle = self.loop_handle.lock().await.take();
        if let Some(handle) = handle {
            if tokio::time::timeout(std::time::Duration::from_secs(5), handle)
                .await
                .is_err()
            {
                warn!("scheduler loop did not drain within the stop deadline");
            }
        }
        info!("orchestrator stopped");
    }

    /// Cancel runs a previous process left `Running`. Without this, a crash
    /// mid-run leaves a phantom active run in storage forever, and the next
    /// dispatch of that workflow would put a second `Running` run beside it.
    /// Runs tracked in this process's own lock table are left alone. Returns
    /// how many runs were repaired.
    pub async fn recover_interrupted_runs(&self) -> Result<usize> {
        let stale = self
            .storage
            .list_runs(&RunFilter {
                status: Some(RunStatus::Running),
                ..Default::default()
            })
            .await?;
        let mut repaired = 0;
        for mut run in stale {
            let tracked = self
                .active_runs
                .get(&run.workflow_id)
                .map(|id| *id == run.id)
                .unwrap_or(false);
            if tracked {
                continue;
            }
            warn!(
                run_id = %run.id,
                workflow = %run.workflow_id,
                "cancelling run interrupted by restart"
            );
            run.error_message = Some("interrupted by orchestrator restart".to_string());
            run.finish(RunStatus::Cancelled);
            self.storage.upsert_run(run).await?;
            repaired += 1;
        }
        Ok(repaired)
    }

    /// Rebuild the circuit breaker's failure window from persisted run
    /// history. Called on startup so a crash during a failure storm does not
    /// reopen the floodgates.
    pub async fn seed_breaker_from_history(&self) -> Result<()> {
        let window = chrono::Duration::from_std(self.config.breaker_config().window)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let failures = self.storage.recent_failures(Utc::now() - window).await?;
        if !failures.is_empty() {
            info!(
                count = failures.len(),
                "seeding breaker window from persisted failures"
            );
            self.breaker.seed(failures.into_iter().map(|r| r.started_at));
        }
        Ok(())
    }

    /// Aggregate status for the control API.
    pub async fn status(&self) -> Result<OrchestratorStatus> {
        let workflows = self.storage.list_workflows().await?;
        let pending_approvals = self.storage.list_pending_approvals().await?.len();
        let dead_letters = self.storage.list_dead_letters(usize::MAX).await?.len();
        let open_exceptions = open_exception_count(self.storage.as_ref()).await?;
        Ok(OrchestratorStatus {
            running: self.is_running(),
            workflows_total: workflows.len(),
            workflows_active: workflows.iter().filter(|w| w.is_dispatchable()).count(),
            active_runs: self.active_runs.len(),
            pending_retries: self.pending_retries.len(),
            pending_approvals,
            open_exceptions,
            dead_letters,
            breaker: self.breaker.snapshot(),
        })
    }

    /// 7-day aggregate over run history.
    pub async fn run_stats(&self) -> Result<RunStats> {
        let runs = self.storage.list_runs(&RunFilter::default()).await?;
        Ok(RunStats::over_window(&runs, Duration::days(7)))
    }

    /// Operator-requested dispatch, bypassing the trigger but not the
    /// preconditions.
    pub async fn trigger_workflow(&self, id: &str) -> Result<Uuid> {
        let workflow = self
            .storage
            .get_workflow(id)
            .await?
            .ok_or_else(|| OrchestratorError::WorkflowNotFound { id: id.to_string() })?;
        self.dispatch(workflow, TriggeredBy::Manual, 1).await
    }

    /// Flip a workflow's active flag. Returns the new state.
    pub async fn toggle_workflow(&self, id: &str) -> Result<WorkflowDefinition> {
        let mut workflow = self
            .storage
            .get_workflow(id)
            .await?
            .ok_or_else(|| OrchestratorError::WorkflowNotFound { id: id.to_string() })?;
        workflow.is_active = !workflow.is_active;
        info!(workflow = %id, is_active = workflow.is_active, "workflow toggled");
        self.storage.upsert_workflow(workflow).await
    }

    /// Publish an external signal onto the event bus. The signal listener
    /// dispatches any matching event/threshold workflows.
    pub fn signal_event(&self, event_name: &str) {
        self.events.signal(event_name);
    }

    /// Dispatch every active event/threshold workflow listening for this
    /// signal name. Returns the run ids that actually started.
    pub async fn dispatch_signal(&self, event_name: &str) -> Result<Vec<Uuid>> {
        let mut started = Vec::new();
        for workflow in self.storage.list_workflows().await? {
            let listens = matches!(
                workflow.trigger,
                TriggerType::Event | TriggerType::Threshold
            ) && workflow.event_name.as_deref() == Some(event_name);
            if !listens || !workflow.is_dispatchable() {
                continue;
            }
            let id = workflow.id.clone();
            match self.dispatch(workflow, TriggeredBy::Event, 1).await {
                Ok(run_id) => started.push(run_id),
                Err(OrchestratorError::CircuitOpen)
                | Err(OrchestratorError::AlreadyRunning { .. }) => {
                    debug!(workflow = %id, event_name, "signal dispatch skipped");
                }
                Err(e) => warn!(workflow = %id, error = %e, "signal dispatch failed"),
            }
        }
        Ok(started)
    }

    /// Re-dispatch a dead-lettered run with a fresh attempt counter. The DLQ
    /// run itself stays in the queue as history.
    pub async fn retry_dlq(&self, run_id: &Uuid) -> Result<Uuid> {
        let run = self
            .storage
            .get_run(run_id)
            .await?
            .ok_or(OrchestratorError::RunNotFound { id: *run_id })?;
        if !run.is_dead_lettered() {
            return Err(OrchestratorError::InvalidInput(format!(
                "run {} is not in the dead-letter queue",
                run_id
            )));
        }
        let workflow = self
            .storage
            .get_workflow(&run.workflow_id)
            .await?
            .ok_or_else(|| OrchestratorError::WorkflowNotFound {
                id: run.workflow_id.clone(),
            })?;
        info!(run_id = %run_id, workflow = %workflow.id, "manual DLQ retry");
        self.dispatch(workflow, TriggeredBy::Retry, 1).await
    }

    /// Apply a human approve/reject decision to a run paused at the gate.
    ///
    /// The body already executed before the run paused, so approval is a
    /// deferred commit: approve releases the run's bookkeeping effects and
    /// completes it; reject cancels it with the reason on record.
    pub async fn decide_approval(&self, run_id: &Uuid, decision: &ApprovalDecision) -> Result<Run> {
        let pending = self
            .approvals
            .take(run_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("pending approval for run {}", run_id)))?;
        let mut run = self
            .storage
            .get_run(run_id)
            .await?
            .ok_or(OrchestratorError::RunNotFound { id: *run_id })?;
        if run.status != RunStatus::AwaitingApproval {
            return Err(OrchestratorError::InvalidInput(format!(
                "run {} is not awaiting approval",
                run_id
            )));
        }

        if decision.approve {
            run.finish(RunStatus::Completed);
            run.approval_level = None;
            if let Some(mut workflow) = self.storage.get_workflow(&run.workflow_id).await? {
                workflow.record_outcome(true, Utc::now());
                self.storage.upsert_workflow(workflow).await?;
            }
            info!(
                run_id = %run_id,
                decided_by = %decision.decided_by,
                amount = pending.amount,
                "run approved"
            );
            self.events.publish(OrchestratorEvent::RunCompleted {
                run_id: *run_id,
                workflow_id: run.workflow_id.clone(),
                items_succeeded: run.items_succeeded,
                items_failed: run.items_failed,
            });
        } else {
            let reason = decision
                .reason
                .clone()
                .unwrap_or_else(|| "rejected without reason".to_string());
            run.error_message = Some(format!("approval rejected by {}: {}", decision.decided_by, reason));
            run.finish(RunStatus::Cancelled);
            warn!(run_id = %run_id, decided_by = %decision.decided_by, "run rejected at approval gate");
        }
        self.storage.upsert_run(run.clone()).await?;
        Ok(run)
    }

    /// One scheduler tick. Never returns an error: everything inside is
    /// per-workflow and logged.
    pub async fn tick(&self, now: DateTime<Utc>) {
        self.dispatch_due_retries(now).await;
        self.evaluate_triggers(now).await;
        match self.approvals.sweep_escalations(now).await {
            Ok(changed) => {
                for pending in changed {
                    self.events.publish(OrchestratorEvent::ApprovalEscalated {
                        run_id: pending.run_id,
                        level: pending.level,
                    });
                }
            }
            Err(e) => warn!(error = %e, "approval escalation sweep failed"),
        }
    }

    async fn dispatch_due_retries(&self, now: DateTime<Utc>) {
        let due: Vec<(Uuid, ScheduledRetry)> = self
            .pending_retries
            .iter()
            .filter(|entry| entry.value().due_at <= now)
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        for (key, retry) in due {
            // The entry stays in the table until the dispatch resolves, so
            // anyone watching for settlement never sees a window with
            // neither a pending retry nor an active run.
            let workflow = match self.storage.get_workflow(&retry.workflow_id).await {
                Ok(Some(w)) if w.is_dispatchable() => w,
                Ok(_) => {
                    debug!(workflow = %retry.workflow_id, "dropping retry for missing or inactive workflow");
                    self.pending_retries.remove(&key);
                    continue;
                }
                Err(e) => {
                    warn!(workflow = %retry.workflow_id, error = %e, "retry lookup failed");
                    continue;
                }
            };
            match self
                .dispatch(workflow, TriggeredBy::Retry, retry.attempt_number)
                .await
            {
                Ok(run_id) => {
                    self.pending_retries.remove(&key);
                    info!(run_id = %run_id, workflow = %retry.workflow_id, attempt = retry.attempt_number, "retry dispatched");
                }
                Err(OrchestratorError::CircuitOpen)
                | Err(OrchestratorError::AlreadyRunning { .. }) => {
                    // Still armed; the next tick tries again.
                }
                Err(e) => {
                    warn!(workflow = %retry.workflow_id, error = %e, "retry dispatch failed; dropping");
                    self.pending_retries.remove(&key);
                }
            }
        }
    }

    async fn evaluate_triggers(&self, now: DateTime<Utc>) {
        let workflows = match self.storage.list_workflows().await {
            Ok(w) => w,
            Err(e) => {
                error!(error = %e, "trigger evaluation could not list workflows");
                return;
            }
        };

        for workflow in workflows {
            if !workflow.is_dispatchable() {
                continue;
            }
            let fire = match workflow.trigger {
                TriggerType::Scheduled => workflow
                    .schedule
                    .as_deref()
                    .and_then(|s| CronExpr::parse(s).ok())
                    .map(|cron| {
                        cron.matches(now)
                            && workflow.last_run_at.map(minute_of) != Some(minute_of(now))
                    })
                    .unwrap_or(false),
                TriggerType::Continuous => !self.active_runs.contains_key(&workflow.id),
                // Event/Threshold fire via signals, Manual via the API.
                _ => false,
            };
            if !fire {
                continue;
            }
            let id = workflow.id.clone();
            match self.dispatch(workflow, TriggeredBy::Scheduled, 1).await {
                Ok(run_id) => debug!(workflow = %id, run_id = %run_id, "trigger fired"),
                Err(OrchestratorError::CircuitOpen) => {
                    debug!(workflow = %id, "dispatch suppressed by circuit breaker");
                }
                Err(OrchestratorError::AlreadyRunning { .. }) => {
                    debug!(workflow = %id, "dispatch skipped; run already active");
                }
                Err(e) => warn!(workflow = %id, error = %e, "dispatch failed"),
            }
        }
    }

    /// Dispatch one run of a workflow: reserve the per-workflow slot, take a
    /// breaker permit, record the run, and spawn the body task. Returns the
    /// new run id; the run completes asynchronously.
    pub async fn dispatch(
        &self,
        mut workflow: WorkflowDefinition,
        triggered_by: TriggeredBy,
        attempt_number: u32,
    ) -> Result<Uuid> {
        if !workflow.is_dispatchable() {
            return Err(OrchestratorError::Configuration(format!(
                "workflow '{}' is inactive or archived",
                workflow.id
            )));
        }

        // Reserve the per-workflow slot before taking a breaker permit so a
        // refused overlap never consumes the half-open probe.
        let placeholder = Uuid::new_v4();
        match self.active_runs.entry(workflow.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(OrchestratorError::AlreadyRunning {
                    id: workflow.id.clone(),
                });
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(placeholder);
            }
        }

        // Resolve the body before the breaker for the same reason: a
        // configuration refusal must not consume the probe slot.
        let body = match self.registry.resolve(&workflow.workflow_type) {
            Some(body) => body,
            None => {
                self.active_runs.remove(&workflow.id);
                return Err(OrchestratorError::Configuration(format!(
                    "no body registered for workflow type '{}'",
                    workflow.workflow_type
                )));
            }
        };

        let is_probe = match self.breaker.try_acquire() {
            Ok(probe) => probe,
            Err(()) => {
                self.active_runs.remove(&workflow.id);
                return Err(OrchestratorError::CircuitOpen);
            }
        };

        // From here on a bookkeeping failure must release the slot and feed
        // the breaker a failure, so a storage outage trips it defensively.
        let bookkeeping = async {
            let run_number = self.storage.next_run_number().await?;
            let run = Run::dispatched(
                run_number,
                &workflow.id,
                workflow.workflow_type.clone(),
                triggered_by,
                attempt_number,
            );
            self.storage.upsert_run(run.clone()).await?;
            workflow.last_run_at = Some(run.started_at);
            self.storage.upsert_workflow(workflow.clone()).await?;
            Ok::<_, OrchestratorError>(run)
        };
        let run = match bookkeeping.await {
            Ok(run) => run,
            Err(e) => {
                self.active_runs.remove(&workflow.id);
                self.breaker.record_failure();
                error!(workflow = %workflow.id, error = %e, "dispatch bookkeeping failed");
                return Err(e);
            }
        };
        let run_id = run.id;
        let run_number = run.run_number;
        self.active_runs.insert(workflow.id.clone(), run_id);

        info!(
            run_id = %run_id,
            run_number,
            workflow = %workflow.id,
            triggered_by = ?triggered_by,
            attempt = attempt_number,
            probe = is_probe,
            "run dispatched"
        );
        self.events.publish(OrchestratorEvent::RunStarted {
            run_id,
            workflow_id: workflow.id.clone(),
        });

        let orchestrator = self.strong()?;
        let shutdown = self.shutdown.lock().await.child_token();
        tokio::spawn(async move {
            let context = WorkflowContext {
                run_id,
                workflow_id: workflow.id.clone(),
                parameters: workflow.parameters.clone(),
                cancel: shutdown,
            };
            let timeout = orchestrator.config.body_timeout();
            // The body runs in its own task so a panic inside it surfaces
            // as a JoinError here instead of killing this lifecycle task
            // with the slot still held and the breaker never fed.
            let mut body_task = tokio::spawn(async move { body.execute(context).await });
            let outcome = match tokio::time::timeout(timeout, &mut body_task).await {
                Ok(Ok(result)) => result,
                Ok(Err(join_error)) => Err(OrchestratorError::Execution(format!(
                    "workflow body panicked: {}",
                    join_error
                ))),
                Err(_) => {
                    body_task.abort();
                    Err(OrchestratorError::Timeout {
                        seconds: timeout.as_secs(),
                    })
                }
            };
            match outcome {
                Ok(outcome) => orchestrator.handle_success(workflow, run, outcome).await,
                Err(e) => orchestrator.handle_failure(workflow, run, e).await,
            }
        });

        Ok(run_id)
    }

    async fn handle_success(
        &self,
        workflow: WorkflowDefinition,
        mut run: Run,
        outcome: WorkflowOutcome,
    ) {
        self.breaker.record_success();
        run.items_succeeded = outcome.items_succeeded;
        run.items_failed = outcome.items_failed;
        run.financial_amount = outcome.financial_amount;

        // Business exceptions are tracked regardless of what happens to the
        // run below.
        for raised in &outcome.exceptions {
            if let Err(e) = self
                .exceptions
                .raise(
                    &raised.exception_type,
                    raised.severity,
                    &raised.description,
                    Some(run.id),
                    raised.financial_impact,
                )
                .await
            {
                warn!(run_id = %run.id, error = %e, "could not record raised exception");
            }
        }

        let gated = workflow.requires_approval && outcome.financial_amount.is_some();
        if gated {
            let amount = outcome.financial_amount.unwrap_or(0.0);
            let entity_type = entity_type_for(&workflow.workflow_type);
            let threshold = match self.approvals.threshold_for(entity_type).await {
                Ok(t) => t,
                Err(e) => {
                    warn!(run_id = %run.id, error = %e, "threshold lookup failed; holding for approval");
                    None
                }
            };
            match ApprovalGate::evaluate(threshold.as_ref(), &workflow, amount) {
                ApprovalOutcome::AutoApproved => {}
                ApprovalOutcome::Pending { level } => {
                    self.pause_for_approval(&workflow, run, entity_type, amount, level, false)
                        .await;
                    return;
                }
                ApprovalOutcome::Escalated => {
                    let level = threshold.as_ref().map(|t| t.top_level().max(1)).unwrap_or(3);
                    self.pause_for_approval(&workflow, run, entity_type, amount, level, true)
                        .await;
                    return;
                }
            }
        }

        run.finish(RunStatus::Completed);
        info!(
            run_id = %run.id,
            workflow = %workflow.id,
            items_succeeded = run.items_succeeded,
            items_failed = run.items_failed,
            duration_ms = run.duration_ms.unwrap_or(0),
            "run completed"
        );
        self.events.publish(OrchestratorEvent::RunCompleted {
            run_id: run.id,
            workflow_id: workflow.id.clone(),
            items_succeeded: run.items_succeeded,
            items_failed: run.items_failed,
        });
        self.settle(workflow, run, true).await;
    }

    async fn pause_for_approval(
        &self,
        workflow: &WorkflowDefinition,
        mut run: Run,
        entity_type: &str,
        amount: f64,
        level: u8,
        escalated: bool,
    ) {
        run.status = RunStatus::AwaitingApproval;
        run.approval_level = Some(level);
        if let Err(e) = self
            .approvals
            .request(&run, entity_type, amount, level, escalated)
            .await
        {
            // Without a pending record nobody could ever decide the run;
            // fall back to failing it.
            error!(run_id = %run.id, error = %e, "could not record pending approval");
            self.handle_failure(
                workflow.clone(),
                run,
                OrchestratorError::Internal("approval bookkeeping failed".to_string()),
            )
            .await;
            return;
        }
        self.events.publish(OrchestratorEvent::ApprovalRequested {
            run_id: run.id,
            workflow_id: workflow.id.clone(),
            level,
            amount,
        });
        // Counters are deferred until the human decision.
        self.active_runs.remove(&workflow.id);
        if let Err(e) = self.storage.upsert_run(run).await {
            error!(error = %e, "could not persist awaiting-approval run");
        }
    }

    async fn handle_failure(&self, workflow: WorkflowDefinition, mut run: Run, err: OrchestratorError) {
        self.breaker.record_failure();
        run.fail(err.to_string());
        warn!(
            run_id = %run.id,
            workflow = %workflow.id,
            attempt = run.attempt_number,
            error = %err,
            "run failed"
        );

        match self
            .retry_policy
            .on_failure(run.attempt_number, workflow.max_attempts)
        {
            RetryDecision::Retry {
                attempt_number,
                next_attempt_at,
            } => {
                self.pending_retries.insert(
                    Uuid::new_v4(),
                    ScheduledRetry {
                        workflow_id: workflow.id.clone(),
                        attempt_number,
                        due_at: next_attempt_at,
                    },
                );
                info!(
                    workflow = %workflow.id,
                    attempt = attempt_number,
                    due_at = %next_attempt_at,
                    "retry scheduled"
                );
                self.events.publish(OrchestratorEvent::RunFailed {
                    run_id: run.id,
                    workflow_id: workflow.id.clone(),
                    error: err.to_string(),
                    will_retry: true,
                });
            }
            RetryDecision::DeadLetter => {
                run.dead_letter();
                warn!(run_id = %run.id, workflow = %workflow.id, "run dead-lettered");
                self.events.publish(OrchestratorEvent::RunFailed {
                    run_id: run.id,
                    workflow_id: workflow.id.clone(),
                    error: err.to_string(),
                    will_retry: false,
                });
                self.events.publish(OrchestratorEvent::RunDeadLettered {
                    run_id: run.id,
                    workflow_id: workflow.id.clone(),
                });
            }
        }
        self.settle(workflow, run, false).await;
    }

    /// Persist the finished run, update workflow counters, and release the
    /// per-workflow slot.
    async fn settle(&self, workflow: WorkflowDefinition, run: Run, succeeded: bool) {
        self.active_runs.remove(&workflow.id);
        if let Err(e) = self.storage.upsert_run(run).await {
            error!(error = %e, "could not persist finished run");
        }
        // Re-fetch: the definition may have been toggled while the body ran.
        match self.storage.get_workflow(&workflow.id).await {
            Ok(Some(mut current)) => {
                current.record_outcome(succeeded, Utc::now());
                if let Err(e) = self.storage.upsert_workflow(current).await {
                    error!(error = %e, "could not persist workflow counters");
                }
            }
            Ok(None) => {}
            Err(e) => error!(error = %e, "could not reload workflow for counters"),
        }
    }

    fn spawn_signal_listener(&self, token: CancellationToken) {
        let Ok(orchestrator) = self.strong() else {
            return;
        };
        let mut receiver = self.events.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = receiver.recv() => match event {
                        Ok(OrchestratorEvent::ExternalSignal { event_name, .. }) => {
                            if let Err(e) = orchestrator.dispatch_signal(&event_name).await {
                                warn!(event_name, error = %e, "signal dispatch failed");
                            }
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "signal listener lagged behind the event bus");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
    }

    /// Seed the default workflow fleet, approval thresholds, exception rules,
    /// and a demo pipeline. Idempotent: existing entries are left untouched.
    pub async fn initialize_defaults(&self) -> Result<()> {
        use crate::models::{ApprovalThreshold, ExceptionRule, ExceptionSeverity, PipelineDefinition, PipelineStage};

        let workflows = vec![
            WorkflowDefinition::new(
                "demand-forecasting-daily",
                "Daily Demand Forecast",
                WorkflowType::DemandForecasting,
                TriggerType::Scheduled,
            )
            .with_schedule("0 6 * * *"),
            WorkflowDefinition::new(
                "procurement-replenishment",
                "Procurement Replenishment",
                WorkflowType::Procurement,
                TriggerType::Scheduled,
            )
            .with_schedule("0 7 * * *")
            .with_approval(Some(10_000.0)),
            WorkflowDefinition::new(
                "inventory-reorder",
                "Inventory Reorder",
                WorkflowType::InventoryReorder,
                TriggerType::Threshold,
            )
            .with_event("stock_below_minimum"),
            WorkflowDefinition::new(
                "freight-booking",
                "Freight Booking",
                WorkflowType::FreightBooking,
                TriggerType::Event,
            )
            .with_event("shipment_ready")
            .with_approval(Some(25_000.0)),
            WorkflowDefinition::new(
                "invoice-reconciliation",
                "Invoice Reconciliation",
                WorkflowType::InvoiceReconciliation,
                TriggerType::Scheduled,
            )
            .with_schedule("0 2 * * *"),
            WorkflowDefinition::new(
                "vendor-scorecard-weekly",
                "Weekly Vendor Scorecard",
                WorkflowType::VendorScorecard,
                TriggerType::Scheduled,
            )
            .with_schedule("0 8 * * 1"),
        ];
        for workflow in workflows {
            workflow
                .validate()
                .map_err(OrchestratorError::Configuration)?;
            if self.registry.resolve(&workflow.workflow_type).is_none() {
                self.registry
                    .register(workflow.workflow_type.clone(), Arc::new(NoopBody));
            }
            if self.storage.get_workflow(&workflow.id).await?.is_none() {
                self.storage.upsert_workflow(workflow).await?;
            }
        }

        let thresholds = vec![
            ApprovalThreshold {
                entity_type: "purchase_order".to_string(),
                auto_approve_max: Some(10_000.0),
                level1_max: Some(75_000.0),
                level2_max: Some(250_000.0),
                level3_max: Some(1_000_000.0),
                escalation_timeout_minutes: 240,
                is_active: true,
            },
            ApprovalThreshold {
                entity_type: "freight_booking".to_string(),
                auto_approve_max: Some(25_000.0),
                level1_max: Some(100_000.0),
                level2_max: Some(250_000.0),
                level3_max: Some(500_000.0),
                escalation_timeout_minutes: 240,
                is_active: true,
            },
        ];
        for threshold in thresholds {
            threshold
                .validate()
                .map_err(OrchestratorError::Configuration)?;
            if self
                .storage
                .get_threshold(&threshold.entity_type)
                .await?
                .is_none()
            {
                self.storage.upsert_threshold(threshold).await?;
            }
        }

        let rules = vec![
            ExceptionRule {
                exception_type: "quantity_variance".to_string(),
                default_severity: ExceptionSeverity::Medium,
                auto_escalate_above: Some(10_000.0),
                is_active: true,
            },
            ExceptionRule {
                exception_type: "price_variance".to_string(),
                default_severity: ExceptionSeverity::Low,
                auto_escalate_above: Some(5_000.0),
                is_active: true,
            },
            ExceptionRule {
                exception_type: "shipment_delay".to_string(),
                default_severity: ExceptionSeverity::Medium,
                auto_escalate_above: None,
                is_active: true,
            },
            ExceptionRule {
                exception_type: "invoice_mismatch".to_string(),
                default_severity: ExceptionSeverity::High,
                auto_escalate_above: Some(25_000.0),
                is_active: true,
            },
        ];
        for rule in rules {
            if self
                .storage
                .get_exception_rule(&rule.exception_type)
                .await?
                .is_none()
            {
                self.storage.upsert_exception_rule(rule).await?;
            }
        }

        let pipeline = PipelineDefinition::new(
            "replenishment",
            "Forecast to Freight",
            vec![
                PipelineStage {
                    workflow_type: WorkflowType::DemandForecasting,
                    depends_on: vec![],
                },
                PipelineStage {
                    workflow_type: WorkflowType::Procurement,
                    depends_on: vec![0],
                },
                PipelineStage {
                    workflow_type: WorkflowType::FreightBooking,
                    depends_on: vec![1],
                },
            ],
        );
        pipeline
            .validate()
            .map_err(OrchestratorError::Configuration)?;
        if self.storage.get_pipeline(&pipeline.id).await?.is_none() {
            self.storage.upsert_pipeline(pipeline).await?;
        }

        info!("default workflows, thresholds, rules, and pipeline initialized");
        Ok(())
    }
}

/// Approval entity type a workflow's financial output maps to.
fn entity_type_for(workflow_type: &WorkflowType) -> &str {
    match workflow_type {
        WorkflowType::Procurement | WorkflowType::InventoryReorder => "purchase_order",
        WorkflowType::FreightBooking => "freight_booking",
        WorkflowType::InvoiceReconciliation => "invoice",
        other => other.as_str(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::registry::{RaisedException, WorkflowBody};
    use crate::engine::storage::InMemoryStorage;
    use crate::models::ExceptionSeverity;

    struct FixedBody {
        outcome: WorkflowOutcome,
    }

    #[async_trait::async_trait]
    impl WorkflowBody for FixedBody {
        async fn execute(&self, _context: WorkflowContext) -> Result<WorkflowOutcome> {
            Ok(self.outcome.clone())
        }
    }

    struct FailingBody;

    #[async_trait::async_trait]
    impl WorkflowBody for FailingBody {
        async fn execute(&self, _context: WorkflowContext) -> Result<WorkflowOutcome> {
            Err(OrchestratorError::Execution("vendor API unreachable".to_string()))
        }
    }

    struct PanickingBody;

    #[async_trait::async_trait]
    impl WorkflowBody for PanickingBody {
        async fn execute(&self, _context: WorkflowContext) -> Result<WorkflowOutcome> {
            panic!("purchase order parser blew up");
        }
    }

    fn test_orchestrator() -> (Arc<Orchestrator>, Arc<InMemoryStorage>, Arc<BodyRegistry>) {
        let storage = Arc::new(InMemoryStorage::default());
        let registry = Arc::new(BodyRegistry::new());
        let config = OrchestratorConfig {
            retry_base_delay_secs: 1,
            ..Default::default()
        };
        let orchestrator = Orchestrator::new(config, storage.clone(), registry.clone());
        (orchestrator, storage, registry)
    }

    async fn wait_terminal(storage: &InMemoryStorage, run_id: &Uuid) -> Run {
        for _ in 0..100 {
            if let Some(run) = storage.get_run(run_id).await.unwrap() {
                if run.status != RunStatus::Running {
                    return run;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("run {} never left Running", run_id);
    }

    fn manual_workflow(id: &str, workflow_type: WorkflowType) -> WorkflowDefinition {
        WorkflowDefinition::new(id, id, workflow_type, TriggerType::Manual)
    }

    #[tokio::test]
    async fn test_successful_run_updates_counters() {
        let (orchestrator, storage, registry) = test_orchestrator();
        registry.register(
            WorkflowType::Procurement,
            Arc::new(FixedBody {
                outcome: WorkflowOutcome {
                    items_succeeded: 12,
                    items_failed: 1,
                    financial_amount: None,
                    exceptions: vec![],
                },
            }),
        );
        storage
            .upsert_workflow(manual_workflow("procure", WorkflowType::Procurement))
            .await
            .unwrap();

        let run_id = orchestrator.trigger_workflow("procure").await.unwrap();
        let run = wait_terminal(&storage, &run_id).await;
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.items_succeeded, 12);

        let workflow = storage.get_workflow("procure").await.unwrap().unwrap();
        assert_eq!(workflow.success_count, 1);
        assert!(workflow.last_run_at.is_some());
    }

    #[tokio::test]
    async fn test_overlap_is_refused_without_queueing() {
        let (orchestrator, storage, registry) = test_orchestrator();
        registry.register(WorkflowType::Procurement, Arc::new(NoopBody));
        let workflow = manual_workflow("procure", WorkflowType::Procurement);
        storage.upsert_workflow(workflow.clone()).await.unwrap();

        // Simulate an in-flight run by occupying the slot directly.
        orchestrator
            .active_runs
            .insert("procure".to_string(), Uuid::new_v4());
        let err = orchestrator.trigger_workflow("procure").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::AlreadyRunning { .. }));
        orchestrator.active_runs.remove("procure");
    }

    #[tokio::test]
    async fn test_open_breaker_refuses_dispatch_without_a_run() {
        let (orchestrator, storage, registry) = test_orchestrator();
        registry.register(WorkflowType::Procurement, Arc::new(NoopBody));
        storage
            .upsert_workflow(manual_workflow("procure", WorkflowType::Procurement))
            .await
            .unwrap();

        for _ in 0..5 {
            orchestrator.breaker.record_failure();
        }
        let err = orchestrator.trigger_workflow("procure").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::CircuitOpen));
        // No run record was created.
        assert!(storage
            .list_runs(&RunFilter::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_failure_schedules_retry_then_dead_letters() {
        let (orchestrator, storage, registry) = test_orchestrator();
        registry.register(WorkflowType::FreightBooking, Arc::new(FailingBody));
        let mut workflow = manual_workflow("freight", WorkflowType::FreightBooking);
        workflow.max_attempts = Some(2);
        storage.upsert_workflow(workflow).await.unwrap();

        let run_id = orchestrator.trigger_workflow("freight").await.unwrap();
        let run = wait_terminal(&storage, &run_id).await;
        assert_eq!(run.status, RunStatus::Failed);
        assert!(!run.is_dead_lettered());
        assert_eq!(orchestrator.pending_retries.len(), 1);

        // Fast-forward past the backoff and let the tick re-dispatch.
        let future = Utc::now() + Duration::minutes(30);
        orchestrator.dispatch_due_retries(future).await;
        assert_eq!(orchestrator.pending_retries.len(), 0);

        // Attempt 2 is the cap; its failure dead-letters.
        for _ in 0..100 {
            if !storage.list_dead_letters(1).await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let dlq = storage.list_dead_letters(10).await.unwrap();
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].attempt_number, 2);
        assert!(orchestrator.pending_retries.is_empty());
    }

    #[tokio::test]
    async fn test_body_panic_fails_run_and_releases_slot() {
        let (orchestrator, storage, registry) = test_orchestrator();
        registry.register(WorkflowType::Procurement, Arc::new(PanickingBody));
        let mut workflow = manual_workflow("procure", WorkflowType::Procurement);
        workflow.max_attempts = Some(1);
        storage.upsert_workflow(workflow).await.unwrap();

        let run_id = orchestrator.trigger_workflow("procure").await.unwrap();
        let run = wait_terminal(&storage, &run_id).await;
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error_message.unwrap().contains("panicked"));
        // The slot is released and the breaker fed; the workflow is not
        // wedged by the panic.
        assert!(orchestrator.active_runs.get("procure").is_none());
        assert_eq!(orchestrator.breaker.snapshot().failure_count, 1);

        registry.register(WorkflowType::Procurement, Arc::new(NoopBody));
        let run_id = orchestrator.trigger_workflow("procure").await.unwrap();
        let run = wait_terminal(&storage, &run_id).await;
        assert_eq!(run.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_due_retry_stays_pending_while_dispatch_is_refused() {
        let (orchestrator, storage, registry) = test_orchestrator();
        registry.register(WorkflowType::FreightBooking, Arc::new(NoopBody));
        storage
            .upsert_workflow(manual_workflow("freight", WorkflowType::FreightBooking))
            .await
            .unwrap();

        orchestrator
            .active_runs
            .insert("freight".to_string(), Uuid::new_v4());
        orchestrator.pending_retries.insert(
            Uuid::new_v4(),
            ScheduledRetry {
                workflow_id: "freight".to_string(),
                attempt_number: 2,
                due_at: Utc::now() - Duration::seconds(1),
            },
        );

        // Refused by the occupied slot: the retry stays armed, so there is
        // never a moment with neither a pending retry nor an active run.
        orchestrator.dispatch_due_retries(Utc::now()).await;
        assert_eq!(orchestrator.pending_retries.len(), 1);
        assert!(orchestrator.has_pending_retry("freight"));

        orchestrator.active_runs.remove("freight");
        orchestrator.dispatch_due_retries(Utc::now()).await;
        assert!(orchestrator.pending_retries.is_empty());
        let runs = storage.list_runs(&RunFilter::default()).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].attempt_number, 2);
        wait_terminal(&storage, &runs[0].id).await;
    }

    #[tokio::test]
    async fn test_startup_cancels_runs_interrupted_by_a_crash() {
        let (orchestrator, storage, registry) = test_orchestrator();
        registry.register(WorkflowType::Procurement, Arc::new(NoopBody));
        storage
            .upsert_workflow(manual_workflow("procure", WorkflowType::Procurement))
            .await
            .unwrap();

        // A run a previous process left behind mid-flight.
        let orphan = Run::dispatched(1, "procure", WorkflowType::Procurement, TriggeredBy::Scheduled, 1);
        let orphan_id = orphan.id;
        storage.upsert_run(orphan).await.unwrap();

        // A run this process is tracking must be left alone.
        let live = Run::dispatched(2, "reorder", WorkflowType::InventoryReorder, TriggeredBy::Manual, 1);
        let live_id = live.id;
        orchestrator.active_runs.insert("reorder".to_string(), live_id);
        storage.upsert_run(live).await.unwrap();

        let repaired = orchestrator.recover_interrupted_runs().await.unwrap();
        assert_eq!(repaired, 1);
        let orphan = storage.get_run(&orphan_id).await.unwrap().unwrap();
        assert_eq!(orphan.status, RunStatus::Cancelled);
        assert!(orphan.error_message.unwrap().contains("restart"));
        assert_eq!(
            storage.get_run(&live_id).await.unwrap().unwrap().status,
            RunStatus::Running
        );
        orchestrator.active_runs.remove("reorder");

        // The repaired workflow dispatches cleanly afterwards.
        let run_id = orchestrator.trigger_workflow("procure").await.unwrap();
        let run = wait_terminal(&storage, &run_id).await;
        assert_eq!(run.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_dlq_retry_resets_attempt_counter() {
        let (orchestrator, storage, registry) = test_orchestrator();
        registry.register(WorkflowType::Procurement, Arc::new(NoopBody));
        storage
            .upsert_workflow(manual_workflow("procure", WorkflowType::Procurement))
            .await
            .unwrap();

        let mut dead = Run::dispatched(1, "procure", WorkflowType::Procurement, TriggeredBy::Scheduled, 3);
        dead.fail("vendor API unreachable");
        dead.dead_letter();
        let dead_id = dead.id;
        storage.upsert_run(dead).await.unwrap();

        let new_run_id = orchestrator.retry_dlq(&dead_id).await.unwrap();
        let new_run = wait_terminal(&storage, &new_run_id).await;
        assert_eq!(new_run.attempt_number, 1);
        assert_eq!(new_run.triggered_by, TriggeredBy::Retry);
        assert_eq!(new_run.status, RunStatus::Completed);

        // The original DLQ entry stays as history.
        assert!(storage.get_run(&dead_id).await.unwrap().unwrap().is_dead_lettered());
    }

    #[tokio::test]
    async fn test_retrying_a_non_dlq_run_is_rejected() {
        let (orchestrator, storage, _registry) = test_orchestrator();
        let mut failed = Run::dispatched(1, "procure", WorkflowType::Procurement, TriggeredBy::Scheduled, 1);
        failed.fail("transient");
        let id = failed.id;
        storage.upsert_run(failed).await.unwrap();

        let err = orchestrator.retry_dlq(&id).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_large_amount_pauses_for_approval_and_approve_commits() {
        let (orchestrator, storage, registry) = test_orchestrator();
        registry.register(
            WorkflowType::Procurement,
            Arc::new(FixedBody {
                outcome: WorkflowOutcome {
                    items_succeeded: 3,
                    items_failed: 0,
                    financial_amount: Some(50_000.0),
                    exceptions: vec![],
                },
            }),
        );
        storage
            .upsert_workflow(
                manual_workflow("procure", WorkflowType::Procurement).with_approval(Some(5_000.0)),
            )
            .await
            .unwrap();
        storage
            .upsert_threshold(crate::models::ApprovalThreshold {
                entity_type: "purchase_order".to_string(),
                auto_approve_max: Some(10_000.0),
                level1_max: Some(75_000.0),
                level2_max: Some(250_000.0),
                level3_max: Some(1_000_000.0),
                escalation_timeout_minutes: 240,
                is_active: true,
            })
            .await
            .unwrap();

        let run_id = orchestrator.trigger_workflow("procure").await.unwrap();
        let run = wait_terminal(&storage, &run_id).await;
        assert_eq!(run.status, RunStatus::AwaitingApproval);
        assert_eq!(run.approval_level, Some(1));
        // Slot released: the workflow is not blocked while paused.
        assert!(orchestrator.active_runs.get("procure").is_none());
        // Counters deferred until the decision.
        let workflow = storage.get_workflow("procure").await.unwrap().unwrap();
        assert_eq!(workflow.success_count, 0);

        let decided = orchestrator
            .decide_approval(
                &run_id,
                &ApprovalDecision {
                    approve: true,
                    decided_by: "ops-lead".to_string(),
                    reason: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(decided.status, RunStatus::Completed);
        let workflow = storage.get_workflow("procure").await.unwrap().unwrap();
        assert_eq!(workflow.success_count, 1);
    }

    #[tokio::test]
    async fn test_rejection_cancels_with_reason() {
        let (orchestrator, storage, registry) = test_orchestrator();
        registry.register(
            WorkflowType::FreightBooking,
            Arc::new(FixedBody {
                outcome: WorkflowOutcome {
                    items_succeeded: 1,
                    items_failed: 0,
                    financial_amount: Some(90_000.0),
                    exceptions: vec![],
                },
            }),
        );
        storage
            .upsert_workflow(
                manual_workflow("freight", WorkflowType::FreightBooking)
                    .with_approval(Some(25_000.0)),
            )
            .await
            .unwrap();

        let run_id = orchestrator.trigger_workflow("freight").await.unwrap();
        let run = wait_terminal(&storage, &run_id).await;
        assert_eq!(run.status, RunStatus::AwaitingApproval);

        let decided = orchestrator
            .decide_approval(
                &run_id,
                &ApprovalDecision {
                    approve: false,
                    decided_by: "cfo".to_string(),
                    reason: Some("rate is above contract".to_string()),
                },
            )
            .await
            .unwrap();
        assert_eq!(decided.status, RunStatus::Cancelled);
        assert!(decided.error_message.unwrap().contains("rate is above contract"));

        // Deciding twice fails: the pending record is gone.
        let again = orchestrator
            .decide_approval(
                &run_id,
                &ApprovalDecision {
                    approve: true,
                    decided_by: "cfo".to_string(),
                    reason: None,
                },
            )
            .await;
        assert!(again.is_err());
    }

    #[tokio::test]
    async fn test_body_exceptions_are_recorded_without_failing_the_run() {
        let (orchestrator, storage, registry) = test_orchestrator();
        registry.register(
            WorkflowType::Procurement,
            Arc::new(FixedBody {
                outcome: WorkflowOutcome {
                    items_succeeded: 480,
                    items_failed: 20,
                    financial_amount: None,
                    exceptions: vec![RaisedException {
                        exception_type: "quantity_variance".to_string(),
                        severity: Some(ExceptionSeverity::Medium),
                        description: "received 480 of 500 units".to_string(),
                        financial_impact: Some(1_200.0),
                    }],
                },
            }),
        );
        storage
            .upsert_workflow(manual_workflow("procure", WorkflowType::Procurement))
            .await
            .unwrap();

        let run_id = orchestrator.trigger_workflow("procure").await.unwrap();
        let run = wait_terminal(&storage, &run_id).await;
        assert_eq!(run.status, RunStatus::Completed);

        let exceptions = storage
            .list_exceptions(&crate::models::ExceptionFilter::default())
            .await
            .unwrap();
        assert_eq!(exceptions.len(), 1);
        assert_eq!(exceptions[0].run_id, Some(run_id));
    }

    #[tokio::test]
    async fn test_signals_dispatch_matching_event_workflows() {
        let (orchestrator, storage, registry) = test_orchestrator();
        registry.register(WorkflowType::InventoryReorder, Arc::new(NoopBody));
        registry.register(WorkflowType::FreightBooking, Arc::new(NoopBody));
        storage
            .upsert_workflow(
                WorkflowDefinition::new(
                    "reorder",
                    "Reorder",
                    WorkflowType::InventoryReorder,
                    TriggerType::Threshold,
                )
                .with_event("stock_below_minimum"),
            )
            .await
            .unwrap();
        storage
            .upsert_workflow(
                WorkflowDefinition::new(
                    "freight",
                    "Freight",
                    WorkflowType::FreightBooking,
                    TriggerType::Event,
                )
                .with_event("shipment_ready"),
            )
            .await
            .unwrap();

        let started = orchestrator
            .dispatch_signal("stock_below_minimum")
            .await
            .unwrap();
        assert_eq!(started.len(), 1);
        let run = wait_terminal(&storage, &started[0]).await;
        assert_eq!(run.workflow_id, "reorder");
        assert_eq!(run.triggered_by, TriggeredBy::Event);
    }

    #[tokio::test]
    async fn test_cron_trigger_fires_once_per_matching_minute() {
        let (orchestrator, storage, registry) = test_orchestrator();
        registry.register(WorkflowType::DemandForecasting, Arc::new(NoopBody));
        storage
            .upsert_workflow(
                WorkflowDefinition::new(
                    "forecast",
                    "Forecast",
                    WorkflowType::DemandForecasting,
                    TriggerType::Scheduled,
                )
                .with_schedule("* * * * *"),
            )
            .await
            .unwrap();

        // Already fired this minute: the guard suppresses the dispatch.
        let now = Utc::now();
        let mut fired = storage.get_workflow("forecast").await.unwrap().unwrap();
        fired.last_run_at = Some(now);
        storage.upsert_workflow(fired).await.unwrap();
        orchestrator.evaluate_triggers(now).await;
        assert!(storage.list_runs(&RunFilter::default()).await.unwrap().is_empty());

        // Last fired a minute ago: dispatches.
        let mut stale = storage.get_workflow("forecast").await.unwrap().unwrap();
        stale.last_run_at = Some(now - Duration::minutes(1));
        storage.upsert_workflow(stale).await.unwrap();
        orchestrator.evaluate_triggers(now).await;
        let runs = storage.list_runs(&RunFilter::default()).await.unwrap();
        assert_eq!(runs.len(), 1);
        wait_terminal(&storage, &runs[0].id).await;
    }

    #[tokio::test]
    async fn test_initialize_defaults_is_idempotent() {
        let (orchestrator, storage, _registry) = test_orchestrator();
        orchestrator.initialize_defaults().await.unwrap();
        let first = storage.list_workflows().await.unwrap();
        assert_eq!(first.len(), 6);
        assert_eq!(storage.list_thresholds().await.unwrap().len(), 2);
        assert_eq!(storage.list_exception_rules().await.unwrap().len(), 4);
        assert_eq!(storage.list_pipelines().await.unwrap().len(), 1);

        // A second call leaves operator edits alone.
        let mut edited = storage
            .get_workflow("procurement-replenishment")
            .await
            .unwrap()
            .unwrap();
        edited.is_active = false;
        storage.upsert_workflow(edited).await.unwrap();
        orchestrator.initialize_defaults().await.unwrap();
        assert!(!storage
            .get_workflow("procurement-replenishment")
            .await
            .unwrap()
            .unwrap()
            .is_active);
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let (orchestrator, _storage, _registry) = test_orchestrator();
        assert!(!orchestrator.is_running());
        orchestrator.start();
        assert!(orchestrator.is_running());
        orchestrator.stop().await;
        assert!(!orchestrator.is_running());
        // Stopping twice is harmless.
        orchestrator.stop().await;
    }

    #[tokio::test]
    async fn test_status_reflects_state() {
        let (orchestrator, _storage, _registry) = test_orchestrator();
        orchestrator.initialize_defaults().await.unwrap();
        let status = orchestrator.status().await.unwrap();
        assert!(!status.running);
        assert_eq!(status.workflows_total, 6);
        assert_eq!(status.active_runs, 0);
        assert_eq!(status.breaker.state, crate::engine::breaker::BreakerState::Closed);
    }
}
