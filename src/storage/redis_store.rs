use async_trait::async_trait;
use chrono::{Duration, Utc};
use redis::AsyncCommands;

use crate::engine::error::StoreError;
use crate::engine::types::{Context, RunRecord, RunStatus, RunSummary, TaskRecord};
use crate::storage::{RunLocks, StateStore, apply_task_upsert, merge_ctx};

const DEFAULT_KEY_PREFIX: &str = "microflow:run";

/// Redis-backed state store. Each run is one JSON string at
/// `microflow:run:<run_id>`.
///
/// Read-modify-write operations are serialised by a per-`run_id` lock held
/// across load → merge → save. The lock is process-local: the scheduler is
/// the sole mutator of a run while it executes, and cross-process leasing is
/// explicitly out of scope.
pub struct RedisStateStore {
    client: redis::Client,
    key_prefix: String,
    locks: RunLocks,
}

impl RedisStateStore {
    pub fn new(redis_url: &str) -> Result<Self, StoreError> {
        Self::with_key_prefix(redis_url, DEFAULT_KEY_PREFIX)
    }

    pub fn with_key_prefix(redis_url: &str, key_prefix: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            key_prefix: key_prefix.trim_end_matches(':').to_string(),
            locks: RunLocks::new(),
        })
    }

    fn run_key(&self, run_id: &str) -> String {
        format!("{}:{}", self.key_prefix, run_id)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, StoreError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))
    }

    async fn read_run(&self, run_id: &str) -> Result<Option<RunRecord>, StoreError> {
        let mut conn = self.connection().await?;
        let payload: Option<String> = conn
            .get(self.run_key(run_id))
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        payload
            .map(|s| {
                serde_json::from_str(&s).map_err(|e| {
                    StoreError::Serialization(format!("corrupt run entry {}: {}", run_id, e))
                })
            })
            .transpose()
    }

    async fn write_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        let payload = serde_json::to_string(run)?;
        let mut conn = self.connection().await?;
        conn.set::<_, _, ()>(self.run_key(&run.run_id), payload)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn read_existing(&self, run_id: &str) -> Result<RunRecord, StoreError> {
        self.read_run(run_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(run_id.to_string()))
    }

    async fn run_keys(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection().await?;
        let pattern = format!("{}:*", self.key_prefix);
        let mut iter = conn
            .scan_match::<_, String>(pattern)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let mut keys = Vec::new();
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }

    /// Delete run entries older than `days`, returning how many were removed.
    pub async fn cleanup_old_runs(&self, days: i64) -> Result<usize, StoreError> {
        let cutoff = Utc::now() - Duration::days(days);
        let mut deleted = 0;

        for key in self.run_keys().await? {
            let mut conn = self.connection().await?;
            let payload: Option<String> = conn
                .get(&key)
                .await
                .map_err(|e| StoreError::Connection(e.to_string()))?;
            if let Some(payload) = payload
                && let Ok(run) = serde_json::from_str::<RunRecord>(&payload)
                && run.created_at < cutoff
            {
                conn.del::<_, ()>(&key)
                    .await
                    .map_err(|e| StoreError::Connection(e.to_string()))?;
                self.locks.release(&run.run_id);
                deleted += 1;
            }
        }

        Ok(deleted)
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn load_run(&self, run_id: &str) -> Result<Option<RunRecord>, StoreError> {
        let lock = self.locks.get(run_id);
        let _guard = lock.lock().await;
        self.read_run(run_id).await
    }

    async fn save_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        let lock = self.locks.get(&run.run_id);
        let _guard = lock.lock().await;
        self.write_run(run).await
    }

    async fn set_run_status(&self, run_id: &str, status: RunStatus) -> Result<(), StoreError> {
        let lock = self.locks.get(run_id);
        let _guard = lock.lock().await;
        let mut run = self.read_existing(run_id).await?;
        run.status = status;
        run.updated_at = Utc::now();
        self.write_run(&run).await
    }

    async fn update_ctx(&self, run_id: &str, delta: &Context) -> Result<(), StoreError> {
        let lock = self.locks.get(run_id);
        let _guard = lock.lock().await;
        let mut run = self.read_existing(run_id).await?;
        merge_ctx(&mut run.ctx, delta);
        run.updated_at = Utc::now();
        self.write_run(&run).await
    }

    async fn get_ctx(&self, run_id: &str) -> Result<Context, StoreError> {
        let lock = self.locks.get(run_id);
        let _guard = lock.lock().await;
        Ok(self.read_existing(run_id).await?.ctx)
    }

    async fn upsert_task(&self, run_id: &str, task: &TaskRecord) -> Result<(), StoreError> {
        let lock = self.locks.get(run_id);
        let _guard = lock.lock().await;
        let mut run = self.read_existing(run_id).await?;
        apply_task_upsert(&mut run, task);
        run.updated_at = Utc::now();
        self.write_run(&run).await
    }

    async fn list_runs(&self, status: Option<RunStatus>) -> Result<Vec<RunSummary>, StoreError> {
        let keys = self.run_keys().await?;
        let mut conn = self.connection().await?;

        let mut summaries = Vec::new();
        for key in keys {
            let payload: Option<String> = conn
                .get(&key)
                .await
                .map_err(|e| StoreError::Connection(e.to_string()))?;
            if let Some(payload) = payload
                && let Ok(run) = serde_json::from_str::<RunRecord>(&payload)
            {
                if let Some(filter) = status
                    && run.status != filter
                {
                    continue;
                }
                summaries.push(RunSummary::from(&run));
            }
        }

        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(summaries)
    }

    async fn delete_run(&self, run_id: &str) -> Result<(), StoreError> {
        let lock = self.locks.get(run_id);
        let guard = lock.lock().await;
        let mut conn = self.connection().await?;
        conn.del::<_, ()>(self.run_key(run_id))
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        drop(guard);
        drop(lock);
        self.locks.release(run_id);
        Ok(())
    }
}
