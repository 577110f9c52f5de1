//! Task contract and the guarded composition wrapper.
//!
//! A concrete task does not inherit guard behaviour. It hands its body to
//! [`GuardedTask::new`], which owns the single-flight gate and metrics and
//! exposes the result through the [`Task`] trait the scheduler consumes.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::TaskError;
use crate::scheduler::guard::{ExecutionGuard, GuardOutcome, MetricsSnapshot};

/// Per-fire invocation context.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Name of the task being fired.
    pub task_name: String,
    /// Unique id of this invocation (for log correlation).
    pub run_id: Uuid,
    /// Wall-clock time the timer fired.
    pub fired_at: DateTime<Local>,
    /// Cancelled when the host shuts down.
    pub cancel: CancellationToken,
}

impl TaskContext {
    pub fn new(task_name: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            task_name: task_name.into(),
            run_id: Uuid::new_v4(),
            fired_at: Local::now(),
            cancel,
        }
    }

    /// Context for a manual, out-of-schedule invocation.
    pub fn manual(task_name: impl Into<String>) -> Self {
        Self::new(task_name, CancellationToken::new())
    }

    pub fn with_fired_at(mut self, fired_at: DateTime<Local>) -> Self {
        self.fired_at = fired_at;
        self
    }
}

/// A named unit of recurring work.
#[async_trait]
pub trait Task: Send + Sync {
    /// Unique task name.
    fn name(&self) -> &str;

    /// Default six-field cron schedule.
    fn schedule(&self) -> &str;

    /// Run one invocation.
    async fn execute(&self, ctx: TaskContext) -> Result<(), TaskError>;

    /// Whether an invocation is currently in flight.
    fn is_running(&self) -> bool {
        false
    }

    /// Rolling metrics, if the task keeps them.
    async fn metrics(&self) -> Option<MetricsSnapshot> {
        None
    }
}

/// Body signature accepted by [`GuardedTask`].
pub type TaskBody =
    Arc<dyn Fn(TaskContext) -> BoxFuture<'static, Result<(), TaskError>> + Send + Sync>;

/// Wraps a body with the single-flight guard and rolling metrics.
pub struct GuardedTask {
    name: String,
    schedule: String,
    guard: ExecutionGuard,
    body: TaskBody,
}

impl GuardedTask {
    pub fn new<F, Fut>(name: impl Into<String>, schedule: impl Into<String>, body: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            schedule: schedule.into(),
            guard: ExecutionGuard::new(),
            body: Arc::new(move |ctx| body(ctx).boxed()),
        }
    }

    /// Replace the guard (e.g. a different metrics window).
    pub fn with_guard(mut self, guard: ExecutionGuard) -> Self {
        self.guard = guard;
        self
    }

    pub fn guard(&self) -> &ExecutionGuard {
        &self.guard
    }

    /// Run through the guard, reporting whether the body actually ran.
    pub async fn run(&self, ctx: TaskContext) -> Result<GuardOutcome, TaskError> {
        let body = Arc::clone(&self.body);
        let outcome = self.guard.run(move || body(ctx)).await?;
        if outcome == GuardOutcome::Skipped {
            tracing::debug!(task = %self.name, "Skipped: previous run still in flight");
        }
        Ok(outcome)
    }
}

#[async_trait]
impl Task for GuardedTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn schedule(&self) -> &str {
        &self.schedule
    }

    async fn execute(&self, ctx: TaskContext) -> Result<(), TaskError> {
        self.run(ctx).await.map(|_| ())
    }

    fn is_running(&self) -> bool {
        self.guard.is_running()
    }

    async fn metrics(&self) -> Option<MetricsSnapshot> {
        self.guard.snapshot().await
    }
}
