// Pipeline definitions - ordered/parallel graphs of workflow stages

//! # Pipelines
//!
//! A [`PipelineDefinition`] chains workflows into a dependency graph. Each
//! stage names a workflow type and the set of stage indices it depends on;
//! stages with no transitive dependency relation may run in parallel. The
//! pipeline engine validates the graph (indices in range, no cycles) before
//! any stage executes.
//!
//! A [`PipelineExecution`] reports one execution of a pipeline: per-stage run
//! ids and statuses, how many stages reached `Completed`, and which stage
//! runs are paused awaiting approval. Only stages that actually completed
//! count toward `stages_completed` - failed, skipped, blocked, and awaiting
//! stages do not.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::workflow::WorkflowType;

/// One stage inside a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStage {
    /// Which workflow body runs at this stage
    pub workflow_type: WorkflowType,
    /// Indices of stages that must reach `Completed` first
    pub depends_on: Vec<usize>,
}

/// An ordered/parallel graph of workflow stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub id: String,
    pub name: String,
    pub stages: Vec<PipelineStage>,
}

impl PipelineDefinition {
    pub fn new<S: Into<String>, N: Into<String>>(
        id: S,
        name: N,
        stages: Vec<PipelineStage>,
    ) -> Self {
        PipelineDefinition {
            id: id.into(),
            name: name.into(),
            stages,
        }
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Validate the dependency graph: every index in range, no self-edges,
    /// no cycles. Runs before any stage executes.
    pub fn validate(&self) -> Result<(), String> {
        let n = self.stages.len();
        if n == 0 {
            return Err(format!("pipeline '{}' has no stages", self.id));
        }
        for (i, stage) in self.stages.iter().enumerate() {
            for &dep in &stage.depends_on {
                if dep >= n {
                    return Err(format!(
                        "pipeline '{}' stage {} depends on out-of-range stage {}",
                        self.id, i, dep
                    ));
                }
                if dep == i {
                    return Err(format!(
                        "pipeline '{}' stage {} depends on itself",
                        self.id, i
                    ));
                }
            }
        }

        // Kahn's algorithm: if a topological order consumes every stage,
        // the graph is acyclic.
        let mut indegree: Vec<usize> = self.stages.iter().map(|s| s.depends_on.len()).collect();
        // dependents[d] lists the stages waiting on d
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, stage) in self.stages.iter().enumerate() {
            for &dep in &stage.depends_on {
                dependents[dep].push(i);
            }
        }
        let mut ready: Vec<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
        let mut visited = 0usize;
        while let Some(node) = ready.pop() {
            visited += 1;
            for &next in &dependents[node] {
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    ready.push(next);
                }
            }
        }
        if visited != n {
            return Err(format!(
                "pipeline '{}' has a dependency cycle",
                self.id
            ));
        }
        Ok(())
    }
}

/// Where a stage ended up after a pipeline execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Stage ran and its run completed
    Completed,
    /// Stage ran and its run failed (after the orchestrator's retry policy)
    Failed,
    /// Stage never ran because an upstream dependency failed
    Skipped,
    /// Stage never ran because an upstream dependency is awaiting approval
    Blocked,
    /// Stage ran and its run is paused awaiting approval
    AwaitingApproval,
    /// Stage could not be dispatched (circuit open, overlap refusal)
    NotDispatched,
}

/// Per-stage outcome inside a pipeline execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub stage_index: usize,
    pub workflow_type: WorkflowType,
    pub status: StageStatus,
    pub run_id: Option<Uuid>,
}

/// Report of one pipeline execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineExecution {
    pub id: Uuid,
    pub pipeline_id: String,
    /// Stages that reached `Completed`; never counts failed/awaiting stages
    pub stages_completed: usize,
    pub stages_total: usize,
    pub duration_ms: i64,
    /// Run ids paused for approval, reported as partially complete
    pub awaiting_approval: Vec<Uuid>,
    pub stage_results: Vec<StageResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl PipelineExecution {
    /// Whether every stage terminated in `Completed`.
    pub fn is_fully_complete(&self) -> bool {
        self.stages_completed == self.stages_total
    }
}
