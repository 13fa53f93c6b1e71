use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::engine::error::StoreError;
use crate::engine::types::{Context, RunRecord, RunStatus, RunSummary, TaskRecord};
use crate::storage::{StateStore, apply_task_upsert, merge_ctx};

/// In-memory state store for tests and ephemeral runs.
/// Holds run state only for the lifetime of the store instance.
pub struct MemoryStateStore {
    runs: Mutex<HashMap<String, RunRecord>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self {
            runs: Mutex::new(HashMap::new()),
        }
    }

    fn with_run<T>(
        &self,
        run_id: &str,
        f: impl FnOnce(&mut RunRecord) -> T,
    ) -> Result<T, StoreError> {
        let mut runs = self.runs.lock().unwrap();
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| StoreError::NotFound(run_id.to_string()))?;
        Ok(f(run))
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load_run(&self, run_id: &str) -> Result<Option<RunRecord>, StoreError> {
        Ok(self.runs.lock().unwrap().get(run_id).cloned())
    }

    async fn save_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        self.runs
            .lock()
            .unwrap()
            .insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    async fn set_run_status(&self, run_id: &str, status: RunStatus) -> Result<(), StoreError> {
        self.with_run(run_id, |run| {
            run.status = status;
            run.updated_at = Utc::now();
        })
    }

    async fn update_ctx(&self, run_id: &str, delta: &Context) -> Result<(), StoreError> {
        self.with_run(run_id, |run| {
            merge_ctx(&mut run.ctx, delta);
            run.updated_at = Utc::now();
        })
    }

    async fn get_ctx(&self, run_id: &str) -> Result<Context, StoreError> {
        self.with_run(run_id, |run| run.ctx.clone())
    }

    async fn upsert_task(&self, run_id: &str, task: &TaskRecord) -> Result<(), StoreError> {
        self.with_run(run_id, |run| {
            apply_task_upsert(run, task);
            run.updated_at = Utc::now();
        })
    }

    async fn list_runs(&self, status: Option<RunStatus>) -> Result<Vec<RunSummary>, StoreError> {
        let runs = self.runs.lock().unwrap();
        let mut summaries: Vec<RunSummary> = runs
            .values()
            .filter(|run| status.is_none_or(|s| run.status == s))
            .map(RunSummary::from)
            .collect();
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(summaries)
    }

    async fn delete_run(&self, run_id: &str) -> Result<(), StoreError> {
        self.runs.lock().unwrap().remove(run_id);
        Ok(())
    }
}
