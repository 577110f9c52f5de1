//! Lease-based command worker.
//!
//! Each poll claims a bounded batch from the remote queue and spawns one
//! worker per command it does not already own. A worker validates the
//! command, keeps its lease alive with heartbeats, runs it through the
//! [`WorkflowExecutor`] and always writes a terminal status back. The
//! command id leaves the [`InFlightSet`] when the worker ends, whichever
//! way it ends.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::commands::executor::{ExecutionOptions, ProgressReporter, WorkflowExecutor};
use crate::commands::model::{Command, CommandProgress, CommandReport};
use crate::commands::queue::CommandQueue;
use crate::config::ConfigManager;
use crate::config::defaults::{
    COMMAND_POLL_SCHEDULE, COMMAND_POLL_TASK, DEFAULT_CLAIM_LIMIT, DEFAULT_HEARTBEAT_INTERVAL_SECS,
    DEFAULT_PAGE_SIZE,
};
use crate::error::{CommandError, RemoteError, TaskError};
use crate::remote::Credentials;
use crate::scheduler::guard::panic_message;
use crate::scheduler::{GuardedTask, TaskContext};

/// Command ids owned by a local worker.
#[derive(Debug, Default)]
pub struct InFlightSet {
    ids: Mutex<HashSet<String>>,
}

impl InFlightSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id` locally. `None` if a worker already owns it.
    pub fn acquire(self: &Arc<Self>, id: &str) -> Option<InFlightLease> {
        let inserted = self.lock().insert(id.to_string());
        inserted.then(|| InFlightLease {
            set: Arc::clone(self),
            id: id.to_string(),
        })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Sorted copy of the current ids.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().iter().cloned().collect();
        ids.sort();
        ids
    }

    fn remove(&self, id: &str) {
        self.lock().remove(id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Ownership of one in-flight id; releases it on drop.
#[derive(Debug)]
pub struct InFlightLease {
    set: Arc<InFlightSet>,
    id: String,
}

impl InFlightLease {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for InFlightLease {
    fn drop(&mut self) {
        self.set.remove(&self.id);
    }
}

/// Worker tunables that are not remotely configurable.
#[derive(Debug, Clone)]
pub struct LeaseWorkerOptions {
    /// Lower bound on the heartbeat interval.
    pub heartbeat_floor: Duration,
    /// Upper bound on the heartbeat interval.
    pub heartbeat_ceiling: Duration,
    /// Attempts at writing the terminal status.
    pub report_attempts: u32,
    /// Linear backoff step between status attempts.
    pub report_backoff: Duration,
}

impl Default for LeaseWorkerOptions {
    fn default() -> Self {
        Self {
            heartbeat_floor: Duration::from_secs(30),
            heartbeat_ceiling: Duration::from_secs(60),
            report_attempts: 3,
            report_backoff: Duration::from_millis(500),
        }
    }
}

pub struct LeaseWorker {
    agent_id: String,
    queue: Arc<dyn CommandQueue>,
    executor: Arc<dyn WorkflowExecutor>,
    config: Arc<ConfigManager>,
    credentials: Arc<Credentials>,
    in_flight: Arc<InFlightSet>,
    tracker: TaskTracker,
    options: LeaseWorkerOptions,
}

impl LeaseWorker {
    pub fn new(
        agent_id: impl Into<String>,
        queue: Arc<dyn CommandQueue>,
        executor: Arc<dyn WorkflowExecutor>,
        config: Arc<ConfigManager>,
        credentials: Arc<Credentials>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            queue,
            executor,
            config,
            credentials,
            in_flight: Arc::new(InFlightSet::new()),
            tracker: TaskTracker::new(),
            options: LeaseWorkerOptions::default(),
        }
    }

    pub fn with_options(mut self, options: LeaseWorkerOptions) -> Self {
        self.options = options;
        self
    }

    /// Ids currently owned by a local worker.
    pub fn in_flight(&self) -> Vec<String> {
        self.in_flight.ids()
    }

    /// The scheduler-facing `command_poll` task.
    pub fn into_task(self: &Arc<Self>) -> GuardedTask {
        let worker = Arc::clone(self);
        GuardedTask::new(COMMAND_POLL_TASK, COMMAND_POLL_SCHEDULE, move |ctx: TaskContext| {
            let worker = Arc::clone(&worker);
            async move { worker.poll_once(&ctx.cancel).await.map(|_| ()) }
        })
    }

    /// One polling cycle. Returns how many workers were spawned.
    ///
    /// A missing token or an unreachable queue means zero commands this
    /// cycle, not a failure.
    pub async fn poll_once(self: &Arc<Self>, cancel: &CancellationToken) -> Result<usize, TaskError> {
        if !self.credentials.is_authenticated().await {
            debug!("No authentication token yet, skipping command poll");
            return Ok(0);
        }

        let limit = self
            .config
            .get_config_int(COMMAND_POLL_TASK, "claim_limit", DEFAULT_CLAIM_LIMIT)
            .await
            .max(1) as usize;

        let commands = match self.queue.claim_pending(&self.agent_id, limit).await {
            Ok(commands) => commands,
            Err(RemoteError::NotAuthenticated) => {
                debug!("Queue rejected credentials, skipping command poll");
                return Ok(0);
            }
            Err(e) => {
                warn!(error = %e, "Failed to claim commands");
                return Ok(0);
            }
        };

        let mut spawned = 0;
        for command in commands {
            let Some(lease) = self.in_flight.acquire(&command.id) else {
                debug!(command_id = %command.id, "Command already in flight, skipping");
                continue;
            };
            let worker = Arc::clone(self);
            let cancel = cancel.child_token();
            self.tracker
                .spawn(async move { worker.run_command(command, lease, cancel).await });
            spawned += 1;
        }

        if spawned > 0 {
            info!(count = spawned, limit, "Dispatched commands");
        }
        Ok(spawned)
    }

    /// Stop accepting work and wait for every worker to finish.
    pub async fn shutdown(&self) {
        self.tracker.close();
        let pending = self.tracker.len();
        if pending > 0 {
            info!(pending, "Waiting for command workers");
        }
        self.tracker.wait().await;
    }

    async fn run_command(self: Arc<Self>, command: Command, lease: InFlightLease, cancel: CancellationToken) {
        let _lease = lease;
        let command_id = command.id.clone();

        let kind = match command.validate() {
            Ok(kind) => kind,
            Err(e) => {
                warn!(command_id = %command_id, error = %e, "Rejected command");
                self.report(&command_id, &CommandReport::failed(e.to_string()))
                    .await;
                return;
            }
        };
        info!(command_id = %command_id, kind = %kind, "Command started");

        let interval = self.heartbeat_interval().await;
        let page_size = self
            .config
            .get_config_int(COMMAND_POLL_TASK, "page_size", DEFAULT_PAGE_SIZE)
            .await;

        let (reporter, mut progress_rx) = ProgressReporter::new();
        reporter.report(10, "started");
        let opening = progress_rx.borrow_and_update().clone();
        self.send_heartbeat(&command_id, &opening).await;

        let heartbeat_cancel = cancel.child_token();
        let _stop_heartbeat = heartbeat_cancel.clone().drop_guard();
        let heartbeat = tokio::spawn(heartbeat_loop(
            Arc::clone(&self.queue),
            self.agent_id.clone(),
            command_id.clone(),
            progress_rx,
            interval,
            heartbeat_cancel.clone(),
        ));

        let options = ExecutionOptions {
            page_size,
            cancel: cancel.clone(),
        };
        let execution = AssertUnwindSafe(self.executor.execute(&command, kind, &reporter, &options))
            .catch_unwind();
        let outcome: Result<Value, CommandError> = tokio::select! {
            result = execution => match result {
                Ok(outcome) => outcome,
                Err(payload) => Err(CommandError::Panicked(panic_message(payload.as_ref()))),
            },
            _ = cancel.cancelled() => Err(CommandError::Execution("agent shutting down".to_string())),
        };

        heartbeat_cancel.cancel();
        if let Err(e) = heartbeat.await {
            warn!(command_id = %command_id, error = %e, "Heartbeat loop ended abnormally");
        }

        let report = match outcome {
            Ok(result) => {
                reporter.report(100, "completed");
                self.send_heartbeat(&command_id, &reporter.current()).await;
                CommandReport::completed(result)
            }
            Err(e) => {
                warn!(command_id = %command_id, error = %e, "Command failed");
                CommandReport::failed(e.to_string())
            }
        };
        self.report(&command_id, &report).await;
    }

    async fn heartbeat_interval(&self) -> Duration {
        let secs = self
            .config
            .get_agent_int("heartbeat_interval_secs", DEFAULT_HEARTBEAT_INTERVAL_SECS)
            .await
            .max(0) as u64;
        let floor = self.options.heartbeat_floor;
        let ceiling = self.options.heartbeat_ceiling.max(floor);
        Duration::from_secs(secs).clamp(floor, ceiling)
    }

    async fn send_heartbeat(&self, command_id: &str, progress: &CommandProgress) {
        if let Err(e) = self
            .queue
            .update_heartbeat(&self.agent_id, command_id, progress)
            .await
        {
            warn!(command_id = %command_id, error = %e, "Heartbeat failed");
        }
    }

    /// Write the terminal status, retrying with linear backoff.
    async fn report(&self, command_id: &str, report: &CommandReport) {
        let attempts = self.options.report_attempts.max(1);
        for attempt in 1..=attempts {
            match self.queue.update_command_status(command_id, report).await {
                Ok(()) => {
                    info!(command_id = %command_id, status = %report.status, "Command resolved");
                    return;
                }
                Err(e) if attempt < attempts => {
                    warn!(command_id = %command_id, attempt, error = %e, "Status update failed, retrying");
                    tokio::time::sleep(self.options.report_backoff * attempt).await;
                }
                Err(e) => {
                    error!(
                        command_id = %command_id,
                        status = %report.status,
                        attempts,
                        error = %e,
                        "Giving up on status update"
                    );
                }
            }
        }
    }
}

/// Posts progress on every tick and whenever it changes, until cancelled.
/// The first post is one interval out; the caller sends the opening beat.
async fn heartbeat_loop(
    queue: Arc<dyn CommandQueue>,
    agent_id: String,
    command_id: String,
    mut progress: watch::Receiver<CommandProgress>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let interval = interval.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut watching = true;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
            changed = progress.changed(), if watching => {
                if changed.is_err() {
                    watching = false;
                    continue;
                }
            }
        }
        let current = progress.borrow_and_update().clone();
        if let Err(e) = queue.update_heartbeat(&agent_id, &command_id, &current).await {
            warn!(command_id = %command_id, error = %e, "Heartbeat failed");
        }
    }
    debug!(command_id = %command_id, "Heartbeat loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_releases_on_drop() {
        let set = Arc::new(InFlightSet::new());
        let lease = set.acquire("a").unwrap();
        assert_eq!(lease.id(), "a");
        assert!(set.acquire("a").is_none());
        assert!(set.contains("a"));

        drop(lease);
        assert!(set.is_empty());
        assert!(set.acquire("a").is_some());
    }

    #[test]
    fn lease_released_when_holder_panics() {
        let set = Arc::new(InFlightSet::new());
        let held = Arc::clone(&set);
        let result = std::thread::spawn(move || {
            let _lease = held.acquire("boom").unwrap();
            panic!("worker died");
        })
        .join();
        assert!(result.is_err());
        assert!(!set.contains("boom"));
    }

    #[test]
    fn ids_are_sorted() {
        let set = Arc::new(InFlightSet::new());
        let _b = set.acquire("b").unwrap();
        let _a = set.acquire("a").unwrap();
        assert_eq!(set.ids(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(set.len(), 2);
    }
}
