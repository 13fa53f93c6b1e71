use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::engine::error::{FlowError, StoreError, TaskErrorInfo, TaskErrorKind};
use crate::engine::runner::task_cap_from_env;
use crate::engine::task::TaskSpec;
use crate::engine::types::{Context, RunRecord, RunStatus, TaskOutput, TaskRecord, TaskStatus};
use crate::engine::workflow::Workflow;
use crate::storage::StateStore;

/// Delays between internal store-write retries.
const STORE_RETRY_DELAYS_MS: [u64; 3] = [50, 200, 800];

/// Run a store operation, retrying transient failures with a short backoff.
/// After the retries are exhausted the error escalates as `Unavailable`.
pub(crate) async fn with_store_retry<T, F, Fut>(what: &str, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut last_err = match op().await {
        Ok(v) => return Ok(v),
        Err(err) => err,
    };

    for delay_ms in STORE_RETRY_DELAYS_MS {
        warn!(op = what, error = %last_err, delay_ms, "Store operation failed, retrying");
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        match op().await {
            Ok(v) => return Ok(v),
            Err(err) => last_err = err,
        }
    }

    Err(StoreError::Unavailable {
        attempts: STORE_RETRY_DELAYS_MS.len() as u32 + 1,
        message: last_err.to_string(),
    })
}

/// Result of one task attempt, reported back to the dispatch loop.
struct AttemptOutcome {
    name: String,
    attempts: u32,
    result: AttemptResult,
}

enum AttemptResult {
    Success(TaskOutput),
    Failure(TaskErrorInfo),
    StoreFailure(StoreError),
}

/// Executes a single run of a workflow against a state store.
///
/// The scheduler is the sole mutator of the run record while a run is in
/// progress. Ready tasks are dispatched concurrently under the task permit
/// cap; every task transition is persisted before any dependent action.
pub struct Scheduler {
    store: Arc<dyn StateStore>,
    task_permits: Arc<Semaphore>,
}

impl Scheduler {
    /// A standalone scheduler with its own task cap from
    /// `MICROFLOW_MAX_CONCURRENT_TASKS` (default 32, ≤0 disables).
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            task_permits: task_cap_from_env(),
        }
    }

    /// A scheduler sharing a task semaphore, normally the runner's.
    pub fn with_task_permits(store: Arc<dyn StateStore>, task_permits: Arc<Semaphore>) -> Self {
        Self {
            store,
            task_permits,
        }
    }

    /// Execute `workflow` as run `run_id`, returning the final run record.
    ///
    /// Re-running a `run_id` whose stored record is already `completed` is a
    /// no-op: the stored record is returned and nothing executes. Any other
    /// pre-existing record is overwritten by a fresh run.
    pub async fn run(
        &self,
        workflow: &Workflow,
        run_id: &str,
        initial_ctx: Context,
        cancel: CancellationToken,
    ) -> Result<RunRecord, FlowError> {
        let store = &self.store;

        if let Some(existing) = with_store_retry("load_run", || store.load_run(run_id)).await?
            && existing.status == RunStatus::Completed
        {
            info!(run_id = %run_id, "Run already completed, skipping replay");
            return Ok(existing);
        }

        let record = RunRecord::new(run_id, initial_ctx, &workflow.task_names());
        with_store_retry("save_run", || store.save_run(&record)).await?;
        with_store_retry("set_run_status", || {
            store.set_run_status(run_id, RunStatus::Running)
        })
        .await?;

        info!(run_id = %run_id, workflow = %workflow.name, "Starting workflow run");

        match self.dispatch_loop(workflow, run_id, &cancel).await {
            Ok(final_status) => {
                with_store_retry("set_run_status", || {
                    store.set_run_status(run_id, final_status)
                })
                .await?;
                info!(run_id = %run_id, status = %final_status, "Workflow run finished");

                let final_record = with_store_retry("load_run", || store.load_run(run_id))
                    .await?
                    .ok_or_else(|| StoreError::NotFound(run_id.to_string()))?;
                Ok(final_record)
            }
            Err(store_err) => {
                error!(run_id = %run_id, error = %store_err, "Run aborted: store unavailable");
                // Best effort: the store just failed, this write may too.
                let _ = store.set_run_status(run_id, RunStatus::Failed).await;
                Err(store_err.into())
            }
        }
    }

    /// Dispatch ready tasks until the DAG is drained or the run is cancelled.
    /// Returns the final run status; store failures bubble up for escalation.
    async fn dispatch_loop(
        &self,
        workflow: &Workflow,
        run_id: &str,
        cancel: &CancellationToken,
    ) -> Result<RunStatus, StoreError> {
        let specs: HashMap<String, TaskSpec> = workflow
            .tasks()
            .iter()
            .map(|s| (s.name.clone(), s.clone()))
            .collect();
        let dependents = workflow.dependents();
        let mut indegree = workflow.indegrees();

        let mut status: HashMap<String, TaskStatus> = workflow
            .task_names()
            .into_iter()
            .map(|n| (n, TaskStatus::Pending))
            .collect();

        let mut ready: VecDeque<String> = workflow
            .tasks()
            .iter()
            .filter(|s| s.deps.is_empty())
            .map(|s| s.name.clone())
            .collect();
        let mut in_flight: JoinSet<AttemptOutcome> = JoinSet::new();

        loop {
            // Launch everything ready, unless the run is being cancelled.
            while !cancel.is_cancelled() {
                let Some(name) = ready.pop_front() else { break };
                if status[&name] != TaskStatus::Pending {
                    continue;
                }
                status.insert(name.clone(), TaskStatus::Running);
                self.spawn_attempt(&mut in_flight, &specs[&name], run_id, 1, None, cancel);
            }

            if in_flight.is_empty() {
                if cancel.is_cancelled() || ready.is_empty() {
                    break;
                }
                continue;
            }

            let outcome = tokio::select! {
                joined = in_flight.join_next() => match joined {
                    // Unit bodies don't panic; user panics are caught inside.
                    Some(Ok(outcome)) => outcome,
                    Some(Err(join_err)) => {
                        error!(run_id = %run_id, error = %join_err, "Task unit aborted");
                        continue;
                    }
                    None => continue,
                },
                _ = cancel.cancelled(), if !cancel.is_cancelled() => {
                    info!(run_id = %run_id, "Cancellation requested, draining in-flight tasks");
                    continue;
                }
            };

            let name = outcome.name.clone();

            match outcome.result {
                AttemptResult::Success(_) => {
                    status.insert(name.clone(), TaskStatus::Succeeded);
                    for down in dependents.get(&name).into_iter().flatten() {
                        if let Some(deg) = indegree.get_mut(down) {
                            *deg -= 1;
                            if *deg == 0 && status[down] == TaskStatus::Pending {
                                ready.push_back(down.clone());
                            }
                        }
                    }
                }
                AttemptResult::Failure(info) => {
                    let spec = &specs[&name];
                    let can_retry = info.kind.is_retriable()
                        && outcome.attempts < spec.max_retries + 1
                        && !cancel.is_cancelled();

                    if can_retry {
                        let delay = spec.retry_delay(outcome.attempts);
                        info!(
                            task = %name,
                            attempt = outcome.attempts,
                            delay_s = delay.as_secs_f64(),
                            "Task attempt failed, retry scheduled"
                        );
                        self.spawn_attempt(
                            &mut in_flight,
                            spec,
                            run_id,
                            outcome.attempts + 1,
                            Some(delay),
                            cancel,
                        );
                    } else if info.kind == TaskErrorKind::Cancelled {
                        status.insert(name.clone(), TaskStatus::Cancelled);
                    } else {
                        error!(task = %name, attempts = outcome.attempts, error = %info.message, "Task failed terminally");
                        status.insert(name.clone(), TaskStatus::Failed);
                        self.skip_downstream(run_id, &name, &dependents, &mut status)
                            .await?;
                    }
                }
                AttemptResult::StoreFailure(err) => return Err(err),
            }
        }

        self.finalize(run_id, &specs, &status, cancel).await
    }

    fn spawn_attempt(
        &self,
        in_flight: &mut JoinSet<AttemptOutcome>,
        spec: &TaskSpec,
        run_id: &str,
        attempt: u32,
        backoff: Option<Duration>,
        cancel: &CancellationToken,
    ) {
        in_flight.spawn(run_attempt(
            self.store.clone(),
            self.task_permits.clone(),
            spec.clone(),
            run_id.to_string(),
            attempt,
            backoff,
            cancel.clone(),
        ));
    }

    /// Mark the transitive downstream closure of a terminally-failed task as
    /// skipped. Skipped tasks are never dispatched and carry no timestamps.
    async fn skip_downstream(
        &self,
        run_id: &str,
        failed: &str,
        dependents: &HashMap<String, Vec<String>>,
        status: &mut HashMap<String, TaskStatus>,
    ) -> Result<(), StoreError> {
        let mut queue: VecDeque<&str> = VecDeque::from([failed]);
        let mut seen: HashSet<&str> = HashSet::new();

        while let Some(name) = queue.pop_front() {
            for down in dependents.get(name).into_iter().flatten() {
                if !seen.insert(down.as_str()) {
                    continue;
                }
                queue.push_back(down.as_str());
                if status[down.as_str()] == TaskStatus::Pending {
                    status.insert(down.clone(), TaskStatus::Skipped);
                    warn!(task = %down, upstream = %name, "Skipping task, upstream failed");
                    let mut rec = TaskRecord::new(down);
                    rec.status = TaskStatus::Skipped;
                    with_store_retry("upsert_task", || self.store.upsert_task(run_id, &rec))
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Settle non-terminal tasks after the loop drains and classify the run.
    ///
    /// On cancellation: interrupted tasks become cancelled; pending tasks
    /// whose upstreams all succeeded become cancelled; pending tasks still
    /// blocked behind an unfinished upstream become skipped.
    async fn finalize(
        &self,
        run_id: &str,
        specs: &HashMap<String, TaskSpec>,
        status: &HashMap<String, TaskStatus>,
        cancel: &CancellationToken,
    ) -> Result<RunStatus, StoreError> {
        if status.values().all(|s| *s == TaskStatus::Succeeded) {
            return Ok(RunStatus::Completed);
        }
        if !cancel.is_cancelled() {
            return Ok(RunStatus::Failed);
        }

        let mut record = with_store_retry("load_run", || self.store.load_run(run_id))
            .await?
            .ok_or_else(|| StoreError::NotFound(run_id.to_string()))?;

        for rec in &mut record.tasks {
            let settled = match status.get(&rec.name) {
                Some(TaskStatus::Running) | Some(TaskStatus::Cancelled) => TaskStatus::Cancelled,
                Some(TaskStatus::Pending) => {
                    let unblocked = specs[&rec.name]
                        .deps
                        .iter()
                        .all(|d| status.get(d) == Some(&TaskStatus::Succeeded));
                    if unblocked {
                        TaskStatus::Cancelled
                    } else {
                        TaskStatus::Skipped
                    }
                }
                _ => continue,
            };
            rec.status = settled;
            if settled == TaskStatus::Cancelled {
                if rec.started_at.is_some() {
                    rec.ended_at = Some(Utc::now());
                }
                rec.error = Some(TaskErrorInfo::new(TaskErrorKind::Cancelled, "run cancelled"));
            }
        }
        record.status = RunStatus::Cancelled;
        record.updated_at = Utc::now();
        with_store_retry("save_run", || self.store.save_run(&record)).await?;

        Ok(RunStatus::Cancelled)
    }
}

/// One task attempt, run as an independent unit of concurrent execution.
///
/// The task permit is held only around the invocation of the task function:
/// not during retry backoff, not during store I/O.
async fn run_attempt(
    store: Arc<dyn StateStore>,
    permits: Arc<Semaphore>,
    spec: TaskSpec,
    run_id: String,
    attempt: u32,
    backoff: Option<Duration>,
    cancel: CancellationToken,
) -> AttemptOutcome {
    let name = spec.name.clone();
    let outcome = |result| AttemptOutcome {
        name: name.clone(),
        attempts: attempt,
        result,
    };

    if let Some(delay) = backoff {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => {
                return outcome(AttemptResult::Failure(TaskErrorInfo::new(
                    TaskErrorKind::Cancelled,
                    "run cancelled during retry backoff",
                )));
            }
        }
    }

    let mut rec = TaskRecord::new(&spec.name);
    rec.status = TaskStatus::Running;
    rec.attempts = attempt;
    rec.started_at = Some(Utc::now());
    if let Err(err) = with_store_retry("upsert_task", || store.upsert_task(&run_id, &rec)).await {
        return outcome(AttemptResult::StoreFailure(err));
    }

    let snapshot = match with_store_retry("get_ctx", || store.get_ctx(&run_id)).await {
        Ok(ctx) => ctx,
        Err(err) => return outcome(AttemptResult::StoreFailure(err)),
    };

    info!(task = %spec.name, attempt, max = spec.max_retries + 1, "Running task");

    let result = invoke_with_policy(&spec, snapshot, &permits, &cancel).await;

    match result {
        Ok(output) => {
            if let Err(err) =
                with_store_retry("update_ctx", || store.update_ctx(&run_id, &output)).await
            {
                return outcome(AttemptResult::StoreFailure(err));
            }
            rec.status = TaskStatus::Succeeded;
            rec.output = Some(output.clone());
            rec.ended_at = Some(Utc::now());
            if let Err(err) =
                with_store_retry("upsert_task", || store.upsert_task(&run_id, &rec)).await
            {
                return outcome(AttemptResult::StoreFailure(err));
            }
            info!(task = %spec.name, "Task succeeded");
            outcome(AttemptResult::Success(output))
        }
        Err(info) => {
            if info.kind == TaskErrorKind::Cancelled {
                // The finalize pass settles cancelled tasks in the store.
                return outcome(AttemptResult::Failure(info));
            }
            warn!(task = %spec.name, attempt, kind = %info.kind, error = %info.message, "Task attempt failed");
            rec.status = TaskStatus::Failed;
            rec.error = Some(info.clone());
            rec.ended_at = Some(Utc::now());
            if let Err(err) =
                with_store_retry("upsert_task", || store.upsert_task(&run_id, &rec)).await
            {
                return outcome(AttemptResult::StoreFailure(err));
            }
            outcome(AttemptResult::Failure(info))
        }
    }
}

/// Invoke the task function under the concurrency permit, enforcing the
/// per-attempt timeout and the run's cancellation signal.
///
/// On timeout or cancellation the attempt is aborted; because execution is
/// cooperative, an aborted function stops at its next suspension point and
/// its eventual result is discarded.
async fn invoke_with_policy(
    spec: &TaskSpec,
    snapshot: Context,
    permits: &Semaphore,
    cancel: &CancellationToken,
) -> Result<TaskOutput, TaskErrorInfo> {
    if cancel.is_cancelled() {
        return Err(TaskErrorInfo::new(TaskErrorKind::Cancelled, "run cancelled"));
    }

    let _permit = permits.acquire().await.unwrap();

    if cancel.is_cancelled() {
        return Err(TaskErrorInfo::new(TaskErrorKind::Cancelled, "run cancelled"));
    }

    // A child token lets a timeout cancel this attempt without touching the
    // run token; run cancellation still propagates down to it.
    let attempt_cancel = cancel.child_token();
    let mut handle = tokio::spawn(spec.invoke(snapshot, attempt_cancel.clone()));

    tokio::select! {
        joined = &mut handle => match joined {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(err)) => Err(TaskErrorInfo::new(TaskErrorKind::User, format!("{err:#}"))),
            Err(join_err) => Err(TaskErrorInfo::new(
                TaskErrorKind::User,
                format!("task panicked: {join_err}"),
            )),
        },
        _ = attempt_deadline(spec.timeout_s) => {
            attempt_cancel.cancel();
            handle.abort();
            Err(TaskErrorInfo::new(
                TaskErrorKind::Timeout,
                format!("attempt timed out after {}s", spec.timeout_s.unwrap_or_default()),
            ))
        }
        _ = cancel.cancelled() => {
            handle.abort();
            Err(TaskErrorInfo::new(TaskErrorKind::Cancelled, "run cancelled"))
        }
    }
}

async fn attempt_deadline(timeout_s: Option<f64>) {
    match timeout_s {
        Some(t) => tokio::time::sleep(Duration::from_secs_f64(t)).await,
        None => std::future::pending().await,
    }
}
