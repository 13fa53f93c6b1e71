use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::engine::error::FlowError;
use crate::engine::scheduler::Scheduler;
use crate::engine::types::{Context, RunRecord};
use crate::engine::workflow::Workflow;
use crate::storage::StateStore;

pub const ENV_MAX_CONCURRENT_WORKFLOWS: &str = "MICROFLOW_MAX_CONCURRENT_WORKFLOWS";
pub const ENV_MAX_CONCURRENT_TASKS: &str = "MICROFLOW_MAX_CONCURRENT_TASKS";

const DEFAULT_MAX_CONCURRENT_WORKFLOWS: i64 = 8;
const DEFAULT_MAX_CONCURRENT_TASKS: i64 = 32;

fn cap_to_permits(cap: i64) -> usize {
    // Zero or negative disables the cap.
    if cap <= 0 {
        Semaphore::MAX_PERMITS
    } else {
        cap as usize
    }
}

fn cap_from_env(var: &str, default: i64) -> i64 {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(default)
}

pub(crate) fn task_cap_from_env() -> Arc<Semaphore> {
    Arc::new(Semaphore::new(cap_to_permits(cap_from_env(
        ENV_MAX_CONCURRENT_TASKS,
        DEFAULT_MAX_CONCURRENT_TASKS,
    ))))
}

/// Process-wide gate over workflow and task concurrency.
///
/// Owns two counting semaphores: one bounding concurrent runs, one bounding
/// concurrent task executions across all runs. The task semaphore is handed
/// to every scheduler this runner spawns, so the task cap is global.
pub struct WorkflowRunner {
    workflow_permits: Arc<Semaphore>,
    task_permits: Arc<Semaphore>,
}

impl WorkflowRunner {
    /// Explicit caps. Zero or negative disables that cap.
    pub fn new(max_concurrent_workflows: i64, max_concurrent_tasks: i64) -> Self {
        Self {
            workflow_permits: Arc::new(Semaphore::new(cap_to_permits(max_concurrent_workflows))),
            task_permits: Arc::new(Semaphore::new(cap_to_permits(max_concurrent_tasks))),
        }
    }

    /// Caps from `MICROFLOW_MAX_CONCURRENT_WORKFLOWS` (default 8) and
    /// `MICROFLOW_MAX_CONCURRENT_TASKS` (default 32).
    pub fn from_env() -> Self {
        Self::new(
            cap_from_env(ENV_MAX_CONCURRENT_WORKFLOWS, DEFAULT_MAX_CONCURRENT_WORKFLOWS),
            cap_from_env(ENV_MAX_CONCURRENT_TASKS, DEFAULT_MAX_CONCURRENT_TASKS),
        )
    }

    /// Run a workflow under the global concurrency guard.
    pub async fn run_workflow(
        &self,
        workflow: &Workflow,
        run_id: &str,
        store: Arc<dyn StateStore>,
        initial_ctx: Context,
        cancel: CancellationToken,
    ) -> Result<RunRecord, FlowError> {
        let _permit = self.workflow_permits.acquire().await.unwrap();
        info!(run_id = %run_id, workflow = %workflow.name, "Workflow permit acquired");

        let scheduler = Scheduler::with_task_permits(store, self.task_permits.clone());
        scheduler.run(workflow, run_id, initial_ctx, cancel).await
    }
}

impl Default for WorkflowRunner {
    fn default() -> Self {
        Self::from_env()
    }
}
