//! Cron-driven task scheduler.
//!
//! Each registration owns one timer loop. When the timer fires, the job is
//! spawned as an independent invocation so different tasks run in parallel;
//! overlap of a task with itself is prevented by its execution guard, not
//! here.
//!
//! The registration table is guarded by a single `RwLock`. A catalog of
//! every task object ever passed to [`Scheduler::add_task`] is kept
//! separately so a removed task can be re-enabled later.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Local};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::ScheduleError;
use crate::scheduler::guard::{MetricsSnapshot, panic_message};
use crate::scheduler::task::{Task, TaskContext};

/// A raw job fired by the timer engine.
pub type Job = Arc<dyn Fn(TaskContext) -> BoxFuture<'static, ()> + Send + Sync>;

/// Live timer registration.
struct Registration {
    schedule: String,
    cron: cron::Schedule,
    job: Job,
    task: Option<Arc<dyn Task>>,
    timer: JoinHandle<()>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.timer.abort();
    }
}

/// Copy of one registration, safe to hold without the scheduler lock.
#[derive(Debug, Clone, Serialize)]
pub struct TaskDescriptor {
    pub name: String,
    pub schedule: String,
    pub next_fire: Option<DateTime<Local>>,
    pub running: bool,
    pub metrics: Option<MetricsSnapshot>,
}

/// Runs named tasks on independent cron schedules.
pub struct Scheduler {
    registrations: RwLock<HashMap<String, Registration>>,
    catalog: RwLock<HashMap<String, Arc<dyn Task>>>,
    shutdown: CancellationToken,
}

/// Parse a six-field (seconds-first) cron expression.
pub fn parse_schedule(name: &str, expression: &str) -> Result<cron::Schedule, ScheduleError> {
    let fields = expression.split_whitespace().count();
    if fields != 6 {
        return Err(ScheduleError::InvalidExpression {
            name: name.to_string(),
            expression: expression.to_string(),
            reason: format!("expected 6 fields, found {fields}"),
        });
    }
    cron::Schedule::from_str(expression).map_err(|e| ScheduleError::InvalidExpression {
        name: name.to_string(),
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            registrations: RwLock::new(HashMap::new()),
            catalog: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Register `job` under `name`, replacing any existing registration.
    ///
    /// An invalid schedule is rejected before anything is touched, so a
    /// prior registration for the same name stays live.
    pub async fn add<F>(&self, name: &str, schedule: &str, job: F) -> Result<(), ScheduleError>
    where
        F: Fn(TaskContext) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        self.register(name, schedule, Arc::new(job), None).await
    }

    /// Register a task object, isolating faults raised inside its body.
    ///
    /// The task is also remembered in the catalog so [`Scheduler::enable`]
    /// can bring it back after a removal.
    pub async fn add_task(&self, task: Arc<dyn Task>) -> Result<(), ScheduleError> {
        let schedule = task.schedule().to_string();
        self.add_task_with_schedule(task, &schedule).await
    }

    /// Like [`Scheduler::add_task`] with an overriding schedule.
    pub async fn add_task_with_schedule(
        &self,
        task: Arc<dyn Task>,
        schedule: &str,
    ) -> Result<(), ScheduleError> {
        let name = task.name().to_string();
        let job = isolated_job(Arc::clone(&task));
        self.register(&name, schedule, job, Some(Arc::clone(&task)))
            .await?;
        self.catalog.write().await.insert(name, task);
        Ok(())
    }

    /// Remember a task without scheduling it. Config projection decides
    /// later whether (and on which schedule) it is enabled.
    pub async fn catalog_task(&self, task: Arc<dyn Task>) {
        let name = task.name().to_string();
        debug!(task = %name, "Task catalogued");
        self.catalog.write().await.insert(name, task);
    }

    /// Cancel and forget a registration. Unknown names are a no-op.
    pub async fn remove(&self, name: &str) -> bool {
        let removed = self.registrations.write().await.remove(name);
        match removed {
            Some(_registration) => {
                info!(task = %name, "Task unregistered");
                true
            }
            None => false,
        }
    }

    /// Move a registered task onto a new schedule.
    ///
    /// The old timer is replaced only once the new expression parses.
    pub async fn update_schedule(&self, name: &str, schedule: &str) -> Result<(), ScheduleError> {
        let (job, task) = {
            let registrations = self.registrations.read().await;
            let existing =
                registrations
                    .get(name)
                    .ok_or_else(|| ScheduleError::NotRegistered {
                        name: name.to_string(),
                    })?;
            (Arc::clone(&existing.job), existing.task.clone())
        };
        self.register(name, schedule, job, task).await?;
        info!(task = %name, schedule = %schedule, "Task rescheduled");
        Ok(())
    }

    /// Re-register a catalogued task, optionally on a different schedule.
    pub async fn enable(&self, name: &str, schedule: Option<&str>) -> Result<(), ScheduleError> {
        let task = self
            .catalog
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ScheduleError::UnknownTask {
                name: name.to_string(),
            })?;
        let schedule = schedule.unwrap_or(task.schedule()).to_string();
        self.add_task_with_schedule(task, &schedule).await
    }

    pub async fn is_registered(&self, name: &str) -> bool {
        self.registrations.read().await.contains_key(name)
    }

    /// Whether `name` was ever added as a task object.
    pub async fn is_known(&self, name: &str) -> bool {
        self.catalog.read().await.contains_key(name)
    }

    /// Live schedule of a registered task.
    pub async fn schedule_of(&self, name: &str) -> Option<String> {
        self.registrations
            .read()
            .await
            .get(name)
            .map(|r| r.schedule.clone())
    }

    pub async fn next_fire(&self, name: &str) -> Option<DateTime<Local>> {
        self.registrations
            .read()
            .await
            .get(name)
            .and_then(|r| r.cron.upcoming(Local).next())
    }

    /// Live schedules of every registration.
    pub async fn live_schedules(&self) -> HashMap<String, String> {
        self.registrations
            .read()
            .await
            .iter()
            .map(|(name, r)| (name.clone(), r.schedule.clone()))
            .collect()
    }

    /// Snapshot of the registration table, sorted by name.
    pub async fn list_tasks(&self) -> Vec<TaskDescriptor> {
        let entries: Vec<(String, String, Option<DateTime<Local>>, Option<Arc<dyn Task>>)> = {
            let registrations = self.registrations.read().await;
            registrations
                .iter()
                .map(|(name, r)| {
                    (
                        name.clone(),
                        r.schedule.clone(),
                        r.cron.upcoming(Local).next(),
                        r.task.clone(),
                    )
                })
                .collect()
        };

        let mut descriptors = Vec::with_capacity(entries.len());
        for (name, schedule, next_fire, task) in entries {
            let (running, metrics) = match task {
                Some(task) => (task.is_running(), task.metrics().await),
                None => (false, None),
            };
            descriptors.push(TaskDescriptor {
                name,
                schedule,
                next_fire,
                running,
                metrics,
            });
        }
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    /// Number of live registrations.
    pub async fn len(&self) -> usize {
        self.registrations.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.registrations.read().await.is_empty()
    }

    /// Token handed (as a child) to every fired invocation.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop every timer and signal cancellation to running bodies.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let drained: Vec<(String, Registration)> =
            self.registrations.write().await.drain().collect();
        info!(count = drained.len(), "Scheduler shut down");
    }

    async fn register(
        &self,
        name: &str,
        schedule: &str,
        job: Job,
        task: Option<Arc<dyn Task>>,
    ) -> Result<(), ScheduleError> {
        let cron = parse_schedule(name, schedule)?;

        let mut registrations = self.registrations.write().await;
        if let Some(previous) = registrations.remove(name) {
            debug!(task = %name, old = %previous.schedule, new = %schedule, "Replacing registration");
            drop(previous);
        }

        let timer = tokio::spawn(run_timer(
            name.to_string(),
            cron.clone(),
            Arc::clone(&job),
            self.shutdown.clone(),
        ));
        registrations.insert(
            name.to_string(),
            Registration {
                schedule: schedule.to_string(),
                cron,
                job,
                task,
                timer,
            },
        );
        info!(task = %name, schedule = %schedule, "Task registered");
        Ok(())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Wrap a task so a panic or error in one fire is logged, never propagated.
fn isolated_job(task: Arc<dyn Task>) -> Job {
    Arc::new(move |ctx: TaskContext| {
        let task = Arc::clone(&task);
        async move {
            let name = ctx.task_name.clone();
            let run_id = ctx.run_id;
            match AssertUnwindSafe(task.execute(ctx)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(task = %name, run_id = %run_id, error = %e, "Task run failed");
                }
                Err(payload) => {
                    let backtrace = std::backtrace::Backtrace::force_capture();
                    error!(
                        task = %name,
                        run_id = %run_id,
                        panic = %panic_message(payload.as_ref()),
                        backtrace = %backtrace,
                        "Task panicked"
                    );
                }
            }
        }
        .boxed()
    })
}

/// Timer loop for one registration. Aborted when the registration drops.
async fn run_timer(name: String, cron: cron::Schedule, job: Job, shutdown: CancellationToken) {
    let mut cursor = Local::now();
    loop {
        let Some(next) = upcoming(&cron, cursor, Local::now()) else {
            debug!(task = %name, "Schedule has no further fire times");
            return;
        };
        let wait = (next - Local::now()).to_std().unwrap_or_default();

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }
        cursor = next;

        let ctx = TaskContext::new(name.clone(), shutdown.child_token()).with_fired_at(next);
        debug!(task = %name, run_id = %ctx.run_id, "Firing");
        let job = Arc::clone(&job);
        tokio::spawn(async move { job(ctx).await });
    }
}

/// First fire time after the last one, skipping slots missed while the
/// process was stalled or suspended.
fn upcoming(
    cron: &cron::Schedule,
    last_fired: DateTime<Local>,
    now: DateTime<Local>,
) -> Option<DateTime<Local>> {
    cron.after(&last_fired.max(now)).next()
}
