pub mod json_store;
pub mod memory_store;
pub mod redis_store;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::engine::error::StoreError;
use crate::engine::types::{Context, RunRecord, RunStatus, RunSummary, TaskRecord};

pub use json_store::JsonStateStore;
pub use memory_store::MemoryStateStore;
pub use redis_store::RedisStateStore;

/// Durable persistence of run state.
///
/// `update_ctx` and `upsert_task` are read-modify-write primitives and MUST
/// be atomic with respect to concurrent calls on the same `run_id`: two
/// parallel tasks completing at the same time must not lose updates.
/// Implementations serialise load → merge → save behind a per-`run_id` lock.
///
/// The context merge rule is shallow, last-writer-wins at the top level.
/// A task returning `{"items": [1]}` overwrites any prior `items` wholesale;
/// deltas are never deep-merged.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Fetch a run record, or `None` if the run does not exist.
    async fn load_run(&self, run_id: &str) -> Result<Option<RunRecord>, StoreError>;

    /// Full replace of a run record.
    async fn save_run(&self, run: &RunRecord) -> Result<(), StoreError>;

    /// Update the overall run status.
    async fn set_run_status(&self, run_id: &str, status: RunStatus) -> Result<(), StoreError>;

    /// Atomically merge `delta` into the run's context.
    async fn update_ctx(&self, run_id: &str, delta: &Context) -> Result<(), StoreError>;

    /// Get the current context for a run.
    async fn get_ctx(&self, run_id: &str) -> Result<Context, StoreError>;

    /// Atomically create or replace one task entry within a run.
    async fn upsert_task(&self, run_id: &str, task: &TaskRecord) -> Result<(), StoreError>;

    /// List runs, optionally filtered by status. Newest first.
    async fn list_runs(&self, status: Option<RunStatus>) -> Result<Vec<RunSummary>, StoreError>;

    /// Delete a run record. Deleting a missing run is not an error.
    async fn delete_run(&self, run_id: &str) -> Result<(), StoreError>;
}

/// Shallow last-writer-wins merge of a delta into a context.
pub(crate) fn merge_ctx(ctx: &mut Context, delta: &Context) {
    for (k, v) in delta {
        ctx.insert(k.clone(), v.clone());
    }
}

/// Apply a task upsert to a run record, preserving task order.
pub(crate) fn apply_task_upsert(run: &mut RunRecord, task: &TaskRecord) {
    match run.task_mut(&task.name) {
        Some(existing) => *existing = task.clone(),
        None => run.tasks.push(task.clone()),
    }
}

/// One async mutex per `run_id`, serialising RMW critical sections.
#[derive(Default)]
pub(crate) struct RunLocks {
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RunLocks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get(&self, run_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(run_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Evict a lock entry once the run is gone, but only while nobody else
    /// holds it. Dropping an entry another caller still references would
    /// hand out a second mutex for the same `run_id`, and two RMW sections
    /// could then interleave. Callers must drop their own `get` handle
    /// before releasing.
    pub(crate) fn release(&self, run_id: &str) {
        let mut locks = self.locks.lock().unwrap();
        if let Some(entry) = locks.get(run_id)
            && Arc::strong_count(entry) == 1
        {
            locks.remove(run_id);
        }
    }
}
