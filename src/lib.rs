//! Microflow: a deterministic DAG workflow engine.
//!
//! Tasks declare dependencies; the scheduler dispatches ready tasks in
//! parallel under a global concurrency cap, merges their outputs into a
//! shared context, persists state after every transition, and applies
//! retry, timeout, and cancellation policy.

pub mod cli;
pub mod engine;
pub mod queue;
pub mod storage;

pub use engine::error::{
    ConfigError, FlowError, QueueError, StoreError, TaskErrorInfo, TaskErrorKind,
};
pub use engine::runner::WorkflowRunner;
pub use engine::scheduler::Scheduler;
pub use engine::task::{TaskInput, TaskSpec, task};
pub use engine::types::{
    Context, RunRecord, RunStatus, RunSummary, TaskOutput, TaskRecord, TaskStatus,
};
pub use engine::workflow::Workflow;
pub use queue::{
    MemoryQueue, QueueMessage, RedisQueue, WorkflowQueue, consume_task, publish_task,
    queue_from_env,
};
pub use storage::{JsonStateStore, MemoryStateStore, RedisStateStore, StateStore};
