use std::collections::HashSet;
use std::future::Future;
use std::ops::Shr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::engine::types::{Context, TaskOutput};

/// Per-attempt retry backoff is capped at this many seconds.
pub const MAX_BACKOFF_S: f64 = 60.0;

/// What a task function receives on each attempt.
///
/// `ctx` is a defensive snapshot; mutating it is never observable by other
/// tasks. The only supported way to change the run context is to return a
/// delta for the scheduler to merge.
pub struct TaskInput {
    pub ctx: Context,
    pub cancel: CancellationToken,
}

pub type TaskFuture = Pin<Box<dyn Future<Output = Result<TaskOutput>> + Send>>;
pub type TaskFn = dyn Fn(TaskInput) -> TaskFuture + Send + Sync;

/// Immutable declaration of one task: identity, callable, retry/backoff and
/// timeout policy, advisory tags, and upstream dependency names.
///
/// Dependency edges are intrinsic to the spec: a spec carries its edges into
/// every workflow it appears in.
#[derive(Clone)]
pub struct TaskSpec {
    pub name: String,
    pub(crate) func: Arc<TaskFn>,
    /// Total attempts = max_retries + 1.
    pub max_retries: u32,
    /// Base delay for exponential backoff, in seconds.
    pub backoff_s: f64,
    /// Optional per-attempt wall-clock cap, in seconds.
    pub timeout_s: Option<f64>,
    pub tags: HashSet<String>,
    pub description: String,
    pub deps: HashSet<String>,
}

impl std::fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSpec")
            .field("name", &self.name)
            .field("max_retries", &self.max_retries)
            .field("backoff_s", &self.backoff_s)
            .field("timeout_s", &self.timeout_s)
            .field("deps", &self.deps)
            .finish()
    }
}

/// Declare a task from an async function.
///
/// The function receives a [`TaskInput`] and returns a mapping to merge into
/// the run context (return an empty map for "nothing").
///
/// ```no_run
/// use microflow::{task, TaskOutput};
///
/// let fetch = task("fetch", |input| async move {
///     let mut out = TaskOutput::new();
///     out.insert("count".into(), serde_json::json!(input.ctx.len()));
///     Ok(out)
/// })
/// .with_retries(2)
/// .with_backoff(0.5);
/// ```
pub fn task<F, Fut>(name: &str, f: F) -> TaskSpec
where
    F: Fn(TaskInput) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<TaskOutput>> + Send + 'static,
{
    TaskSpec {
        name: name.to_string(),
        func: Arc::new(move |input| Box::pin(f(input))),
        max_retries: 0,
        backoff_s: 1.0,
        timeout_s: None,
        tags: HashSet::new(),
        description: String::new(),
        deps: HashSet::new(),
    }
}

impl TaskSpec {
    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff(mut self, backoff_s: f64) -> Self {
        self.backoff_s = backoff_s;
        self
    }

    pub fn with_timeout(mut self, timeout_s: f64) -> Self {
        self.timeout_s = Some(timeout_s);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    /// Add upstream dependencies by name.
    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.deps.extend(deps.into_iter().map(Into::into));
        self
    }

    /// Add `upstream` as a dependency of this task.
    pub fn after(mut self, upstream: &TaskSpec) -> Self {
        self.deps.insert(upstream.name.clone());
        self
    }

    /// Invoke the task function with a context snapshot.
    pub(crate) fn invoke(&self, ctx: Context, cancel: CancellationToken) -> TaskFuture {
        (self.func)(TaskInput { ctx, cancel })
    }

    /// Delay before re-dispatching after `attempts` completed attempts:
    /// `backoff_s * 2^(attempts - 1)`, capped at [`MAX_BACKOFF_S`].
    pub fn retry_delay(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(31);
        let delay = self.backoff_s * 2.0_f64.powi(exp as i32);
        Duration::from_secs_f64(delay.clamp(0.0, MAX_BACKOFF_S))
    }
}

/// The DAG edge operator: `&upstream >> downstream` adds the upstream's name
/// to the downstream's deps and returns the downstream, so chains compose:
///
/// ```no_run
/// # use microflow::{task, TaskOutput};
/// # let (a, b, c) = (
/// #     task("a", |_| async { Ok(TaskOutput::new()) }),
/// #     task("b", |_| async { Ok(TaskOutput::new()) }),
/// #     task("c", |_| async { Ok(TaskOutput::new()) }),
/// # );
/// let b = &a >> b;
/// let c = &b >> c;
/// ```
impl Shr<TaskSpec> for &TaskSpec {
    type Output = TaskSpec;

    fn shr(self, downstream: TaskSpec) -> TaskSpec {
        downstream.after(self)
    }
}
