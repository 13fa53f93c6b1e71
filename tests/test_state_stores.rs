//! Tests for StateStore implementations: MemoryStateStore and JsonStateStore.
//! Redis tests are `#[ignore]`d and need a reachable server.

use std::sync::Arc;

use chrono::{Duration, Utc};
use microflow::{
    Context, JsonStateStore, MemoryStateStore, RedisStateStore, RunRecord, RunStatus, StateStore,
    StoreError, TaskRecord, TaskStatus,
};
use serde_json::json;

fn test_ctx() -> Context {
    let mut ctx = Context::new();
    ctx.insert("key".to_string(), json!("value"));
    ctx
}

fn fresh_run(run_id: &str) -> RunRecord {
    RunRecord::new(run_id, test_ctx(), &["step1".to_string(), "step2".to_string()])
}

// ===== MemoryStateStore =====

#[tokio::test]
async fn memory_store_save_and_load() {
    let store = MemoryStateStore::new();
    store.save_run(&fresh_run("r1")).await.unwrap();

    let run = store.load_run("r1").await.unwrap().unwrap();
    assert_eq!(run.run_id, "r1");
    assert_eq!(run.status, RunStatus::Pending);
    assert_eq!(run.ctx.get("key").unwrap(), &json!("value"));
    assert_eq!(run.tasks.len(), 2);
    assert_eq!(run.task("step1").unwrap().status, TaskStatus::Pending);
}

#[tokio::test]
async fn memory_store_missing_run_is_none() {
    let store = MemoryStateStore::new();
    assert!(store.load_run("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn memory_store_set_status() {
    let store = MemoryStateStore::new();
    store.save_run(&fresh_run("r1")).await.unwrap();
    store
        .set_run_status("r1", RunStatus::Running)
        .await
        .unwrap();

    let run = store.load_run("r1").await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Running);
    assert!(run.updated_at >= run.created_at);
}

#[tokio::test]
async fn memory_store_set_status_missing_run_errors() {
    let store = MemoryStateStore::new();
    let err = store
        .set_run_status("ghost", RunStatus::Running)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
}

#[tokio::test]
async fn memory_store_upsert_task() {
    let store = MemoryStateStore::new();
    store.save_run(&fresh_run("r1")).await.unwrap();

    let mut task = TaskRecord::new("step1");
    task.status = TaskStatus::Running;
    task.attempts = 1;
    store.upsert_task("r1", &task).await.unwrap();

    let run = store.load_run("r1").await.unwrap().unwrap();
    assert_eq!(run.task("step1").unwrap().status, TaskStatus::Running);
    assert_eq!(run.task("step1").unwrap().attempts, 1);

    // Update the same task; order of entries is preserved.
    task.status = TaskStatus::Succeeded;
    store.upsert_task("r1", &task).await.unwrap();

    let run = store.load_run("r1").await.unwrap().unwrap();
    assert_eq!(run.task("step1").unwrap().status, TaskStatus::Succeeded);
    let names: Vec<&str> = run.tasks.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["step1", "step2"]);
}

#[tokio::test]
async fn memory_store_update_ctx_merges() {
    let store = MemoryStateStore::new();
    store.save_run(&fresh_run("r1")).await.unwrap();

    let mut delta = Context::new();
    delta.insert("key".to_string(), json!("replaced"));
    delta.insert("new_key".to_string(), json!(42));
    store.update_ctx("r1", &delta).await.unwrap();

    let ctx = store.get_ctx("r1").await.unwrap();
    assert_eq!(ctx.get("key").unwrap(), &json!("replaced"));
    assert_eq!(ctx.get("new_key").unwrap(), &json!(42));
}

#[tokio::test]
async fn memory_store_delete_run() {
    let store = MemoryStateStore::new();
    store.save_run(&fresh_run("r1")).await.unwrap();
    store.delete_run("r1").await.unwrap();
    assert!(store.load_run("r1").await.unwrap().is_none());

    // Deleting again is not an error.
    store.delete_run("r1").await.unwrap();
}

#[tokio::test]
async fn memory_store_list_filters_by_status() {
    let store = MemoryStateStore::new();
    store.save_run(&fresh_run("r1")).await.unwrap();
    store
        .set_run_status("r1", RunStatus::Completed)
        .await
        .unwrap();
    store.save_run(&fresh_run("r2")).await.unwrap();
    store.set_run_status("r2", RunStatus::Failed).await.unwrap();

    assert_eq!(store.list_runs(None).await.unwrap().len(), 2);

    let completed = store.list_runs(Some(RunStatus::Completed)).await.unwrap();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].run_id, "r1");
}

// ===== JsonStateStore =====

#[tokio::test]
async fn json_store_save_and_load() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonStateStore::new(dir.path());

    store.save_run(&fresh_run("r1")).await.unwrap();

    // One document per run under runs/.
    assert!(dir.path().join("runs").join("r1.json").exists());

    let run = store.load_run("r1").await.unwrap().unwrap();
    assert_eq!(run.run_id, "r1");
    assert_eq!(run.status, RunStatus::Pending);
    assert_eq!(run.ctx.get("key").unwrap(), &json!("value"));
}

#[tokio::test]
async fn json_store_missing_run_is_none() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonStateStore::new(dir.path());
    assert!(store.load_run("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn json_store_corrupt_document_is_serialization_error() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonStateStore::new(dir.path());

    tokio::fs::create_dir_all(dir.path().join("runs")).await.unwrap();
    tokio::fs::write(dir.path().join("runs").join("bad.json"), b"not json")
        .await
        .unwrap();

    let err = store.load_run("bad").await.unwrap_err();
    assert!(matches!(err, StoreError::Serialization(_)));
}

#[tokio::test]
async fn json_store_update_ctx_merges() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonStateStore::new(dir.path());

    let mut run = fresh_run("r1");
    run.ctx.insert("a".to_string(), json!(1));
    run.ctx.insert("b".to_string(), json!(2));
    store.save_run(&run).await.unwrap();

    let mut delta = Context::new();
    delta.insert("b".to_string(), json!(99));
    delta.insert("c".to_string(), json!(3));
    store.update_ctx("r1", &delta).await.unwrap();

    let ctx = store.get_ctx("r1").await.unwrap();
    assert_eq!(ctx.get("a").unwrap(), &json!(1)); // preserved
    assert_eq!(ctx.get("b").unwrap(), &json!(99)); // updated
    assert_eq!(ctx.get("c").unwrap(), &json!(3)); // new
}

#[tokio::test]
async fn json_store_shallow_merge_replaces_nested_values() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonStateStore::new(dir.path());

    let mut run = fresh_run("r1");
    run.ctx.insert("items".to_string(), json!([1, 2, 3]));
    store.save_run(&run).await.unwrap();

    let mut delta = Context::new();
    delta.insert("items".to_string(), json!([9]));
    store.update_ctx("r1", &delta).await.unwrap();

    let ctx = store.get_ctx("r1").await.unwrap();
    assert_eq!(ctx.get("items").unwrap(), &json!([9]));
}

#[tokio::test]
async fn json_store_concurrent_merges_lose_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonStateStore::new(dir.path()));

    store
        .save_run(&RunRecord::new("r1", Context::new(), &[]))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..16 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let mut delta = Context::new();
            delta.insert(format!("k{}", i), json!(i));
            store.update_ctx("r1", &delta).await.unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let ctx = store.get_ctx("r1").await.unwrap();
    for i in 0..16 {
        assert_eq!(ctx.get(&format!("k{}", i)).unwrap(), &json!(i));
    }
}

#[tokio::test]
async fn json_store_upsert_task_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonStateStore::new(dir.path());
    store.save_run(&fresh_run("r1")).await.unwrap();

    let mut task = TaskRecord::new("step2");
    task.status = TaskStatus::Succeeded;
    task.attempts = 2;
    task.started_at = Some(Utc::now());
    task.ended_at = Some(Utc::now());
    store.upsert_task("r1", &task).await.unwrap();

    let run = store.load_run("r1").await.unwrap().unwrap();
    let stored = run.task("step2").unwrap();
    assert_eq!(stored.status, TaskStatus::Succeeded);
    assert_eq!(stored.attempts, 2);
    assert!(stored.started_at.is_some());
}

#[tokio::test]
async fn json_store_list_runs_newest_first() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonStateStore::new(dir.path());

    let mut older = fresh_run("older");
    older.created_at = Utc::now() - Duration::hours(1);
    store.save_run(&older).await.unwrap();
    store.save_run(&fresh_run("newer")).await.unwrap();

    let runs = store.list_runs(None).await.unwrap();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].run_id, "newer");
    assert_eq!(runs[1].run_id, "older");
}

#[tokio::test]
async fn json_store_delete_run() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonStateStore::new(dir.path());

    store.save_run(&fresh_run("r1")).await.unwrap();
    store.delete_run("r1").await.unwrap();

    assert!(store.load_run("r1").await.unwrap().is_none());
    assert!(!dir.path().join("runs").join("r1.json").exists());
}

#[tokio::test]
async fn json_store_cleanup_removes_only_old_runs() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonStateStore::new(dir.path());

    let mut ancient = fresh_run("ancient");
    ancient.created_at = Utc::now() - Duration::days(40);
    store.save_run(&ancient).await.unwrap();
    store.save_run(&fresh_run("recent")).await.unwrap();

    let deleted = store.cleanup_old_runs(30).await.unwrap();
    assert_eq!(deleted, 1);
    assert!(store.load_run("ancient").await.unwrap().is_none());
    assert!(store.load_run("recent").await.unwrap().is_some());
}

// ===== RedisStateStore (requires a running server) =====

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379/0".to_string())
}

#[tokio::test]
#[ignore = "requires a running redis server"]
async fn redis_store_round_trip() {
    let store = RedisStateStore::with_key_prefix(&redis_url(), "microflow:test:run").unwrap();

    store.delete_run("r1").await.unwrap();
    store.save_run(&fresh_run("r1")).await.unwrap();

    let run = store.load_run("r1").await.unwrap().unwrap();
    assert_eq!(run.run_id, "r1");
    assert_eq!(run.ctx.get("key").unwrap(), &json!("value"));

    let mut delta = Context::new();
    delta.insert("extra".to_string(), json!(7));
    store.update_ctx("r1", &delta).await.unwrap();
    assert_eq!(
        store.get_ctx("r1").await.unwrap().get("extra").unwrap(),
        &json!(7)
    );

    store.delete_run("r1").await.unwrap();
    assert!(store.load_run("r1").await.unwrap().is_none());
}
