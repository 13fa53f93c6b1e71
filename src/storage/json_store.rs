use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{Duration, Utc};

use crate::engine::error::StoreError;
use crate::engine::types::{Context, RunRecord, RunStatus, RunSummary, TaskRecord};
use crate::storage::{RunLocks, StateStore, apply_task_upsert, merge_ctx};

/// File-backed state store. Each run is one JSON document at
/// `<data>/runs/<run_id>.json`, rewritten atomically (write-temp + rename).
///
/// Read-modify-write operations hold a per-`run_id` lock across
/// load → merge → save, so concurrent merges from parallel tasks cannot
/// lose updates.
pub struct JsonStateStore {
    runs_dir: PathBuf,
    locks: RunLocks,
}

impl JsonStateStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            runs_dir: data_dir.as_ref().join("runs"),
            locks: RunLocks::new(),
        }
    }

    fn run_path(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(format!("{}.json", run_id))
    }

    async fn read_run(&self, run_id: &str) -> Result<Option<RunRecord>, StoreError> {
        let path = self.run_path(run_id);
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let run: RunRecord = serde_json::from_str(&data).map_err(|e| {
            StoreError::Serialization(format!("corrupt run document {}: {}", path.display(), e))
        })?;
        Ok(Some(run))
    }

    async fn write_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.runs_dir).await?;

        let path = self.run_path(&run.run_id);
        let tmp_path = path.with_extension("json.tmp");

        let data = serde_json::to_string_pretty(run)?;
        tokio::fs::write(&tmp_path, &data).await?;
        tokio::fs::rename(&tmp_path, &path).await?;

        Ok(())
    }

    /// Load a run inside a critical section, failing if it is missing.
    async fn read_existing(&self, run_id: &str) -> Result<RunRecord, StoreError> {
        self.read_run(run_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(run_id.to_string()))
    }

    /// Delete run files older than `days`, returning how many were removed.
    pub async fn cleanup_old_runs(&self, days: i64) -> Result<usize, StoreError> {
        let cutoff = Utc::now() - Duration::days(days);
        let mut deleted = 0;

        if !self.runs_dir.exists() {
            return Ok(0);
        }

        let mut entries = tokio::fs::read_dir(&self.runs_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Ok(data) = tokio::fs::read_to_string(&path).await
                && let Ok(run) = serde_json::from_str::<RunRecord>(&data)
                && run.created_at < cutoff
            {
                tokio::fs::remove_file(&path).await?;
                self.locks.release(&run.run_id);
                deleted += 1;
            }
        }

        Ok(deleted)
    }
}

#[async_trait]
impl StateStore for JsonStateStore {
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
        if !self.runs_dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.runs_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Ok(data) = tokio::fs::read_to_string(&path).await
                && let Ok(run) = serde_json::from_str::<RunRecord>(&data)
            {
                if let Some(filter) = status
                    && run.status != filter
                {
                    continue;
                }
                runs.push(RunSummary::from(&run));
            }
        }

        // Newest first.
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(runs)
    }

    async fn delete_run(&self, run_id: &str) -> Result<(), StoreError> {
        let lock = self.locks.get(run_id);
        let guard = lock.lock().await;
        let path = self.run_path(run_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        drop(guard);
        drop(lock);
        self.locks.release(run_id);
        Ok(())
    }
}
