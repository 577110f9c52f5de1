//! End-to-end tests of the control plane against in-memory fakes:
//! config projection onto the scheduler, and the lease worker's
//! claim / heartbeat / resolve contract.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use sync_agent::commands::{
    Command, CommandProgress, CommandQueue, CommandReport, CommandStatus, CommandType,
    ExecutionOptions, LeaseWorker, LeaseWorkerOptions, ProgressReporter, WorkflowExecutor,
};
use sync_agent::config::defaults::COMMAND_POLL_TASK;
use sync_agent::config::{
    ConfigAuthority, ConfigDefaults, ConfigDiff, ConfigManager, ConfigStore, RemoteConfig,
    SubmitResponse,
};
use sync_agent::error::{CommandError, RemoteError};
use sync_agent::remote::Credentials;
use sync_agent::scheduler::{Scheduler, Task, TaskContext};
use sync_agent::tasks::config_sync_task;

/// Upper bound on any single wait in these tests.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

// ── Fakes ──────────────────────────────────────────────────────────

/// Remembers the last accepted submission and serves it back.
#[derive(Default)]
struct FakeAuthority {
    submissions: AtomicUsize,
    stored: Mutex<RemoteConfig>,
}

#[async_trait]
impl ConfigAuthority for FakeAuthority {
    async fn submit_config(&self, _: &str, config: &Value, hash: &str) -> Result<SubmitResponse, RemoteError> {
        let n = self.submissions.fetch_add(1, Ordering::SeqCst) + 1;
        *self.stored.lock().unwrap() = RemoteConfig {
            version: n as i64,
            config_hash: hash.to_string(),
            config_data: config.clone(),
        };
        Ok(SubmitResponse {
            version: n as i64,
            config_hash: hash.to_string(),
        })
    }

    async fn get_current_config(&self, _: &str) -> Result<RemoteConfig, RemoteError> {
        Ok(self.stored.lock().unwrap().clone())
    }
}

#[derive(Default)]
struct FakeQueue {
    pending: Mutex<Vec<Command>>,
    /// Hand out the same batch on every claim (simulates a re-claim race).
    repeat: bool,
    claim_error: AtomicBool,
    claims: Mutex<Vec<usize>>,
    heartbeats: Mutex<Vec<(String, CommandProgress)>>,
    statuses: Mutex<Vec<(String, CommandReport)>>,
    status_attempts: AtomicUsize,
    failing_status_calls: AtomicUsize,
}

impl FakeQueue {
    fn with(commands: Vec<Command>) -> Self {
        Self {
            pending: Mutex::new(commands),
            ..Default::default()
        }
    }

    fn statuses(&self) -> HashMap<String, Vec<CommandReport>> {
        let mut by_id: HashMap<String, Vec<CommandReport>> = HashMap::new();
        for (id, report) in self.statuses.lock().unwrap().iter() {
            by_id.entry(id.clone()).or_default().push(report.clone());
        }
        by_id
    }

    fn heartbeats_for(&self, id: &str) -> Vec<CommandProgress> {
        self.heartbeats
            .lock()
            .unwrap()
            .iter()
            .filter(|(cid, _)| cid == id)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

#[async_trait]
impl CommandQueue for FakeQueue {
    async fn claim_pending(&self, _: &str, limit: usize) -> Result<Vec<Command>, RemoteError> {
        self.claims.lock().unwrap().push(limit);
        if self.claim_error.load(Ordering::SeqCst) {
            return Err(RemoteError::Unreachable("connection reset".into()));
        }
        let mut pending = self.pending.lock().unwrap();
        let take = limit.min(pending.len());
        if self.repeat {
            Ok(pending[..take].to_vec())
        } else {
            Ok(pending.drain(..take).collect())
        }
    }

    async fn update_heartbeat(&self, _: &str, id: &str, progress: &CommandProgress) -> Result<(), RemoteError> {
        self.heartbeats
            .lock()
            .unwrap()
            .push((id.to_string(), progress.clone()));
        Ok(())
    }

    async fn update_command_status(&self, id: &str, report: &CommandReport) -> Result<(), RemoteError> {
        self.status_attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failing_status_calls.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_status_calls.store(remaining - 1, Ordering::SeqCst);
            return Err(RemoteError::Status {
                code: 503,
                body: "busy".into(),
            });
        }
        self.statuses
            .lock()
            .unwrap()
            .push((id.to_string(), report.clone()));
        Ok(())
    }
}

/// Behaves according to `params.mode`.
#[derive(Default)]
struct ScriptedExecutor {
    gate: Notify,
}

#[async_trait]
impl WorkflowExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        command: &Command,
        _kind: CommandType,
        progress: &ProgressReporter,
        _options: &ExecutionOptions,
    ) -> Result<Value, CommandError> {
        match command.params["mode"].as_str().unwrap_or("ok") {
            "fail" => Err(CommandError::Execution("upstream rejected".into())),
            "panic" => panic!("executor exploded"),
            "sleep" => {
                progress.report(50, "halfway");
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(json!({"slept": true}))
            }
            "block" => {
                self.gate.notified().await;
                Ok(json!({"released": true}))
            }
            _ => Ok(json!({"id": command.id})),
        }
    }
}

fn command(id: &str, kind: &str, mode: &str) -> Command {
    Command {
        id: id.to_string(),
        command_type: kind.to_string(),
        workflow_id: Some("wf-1".into()),
        step_id: Some("step-1".into()),
        root_workflow_id: None,
        params: json!({"mode": mode}),
        status: CommandStatus::Claimed,
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    scheduler: Arc<Scheduler>,
    config: Arc<ConfigManager>,
    queue: Arc<FakeQueue>,
    executor: Arc<ScriptedExecutor>,
    worker: Arc<LeaseWorker>,
}

async fn harness(queue: FakeQueue, token: bool) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = Arc::new(Scheduler::new());
    let config = Arc::new(ConfigManager::new(
        "agent-1",
        ConfigStore::new(dir.path().join("config.json")),
        Arc::new(FakeAuthority::default()),
        Arc::clone(&scheduler),
        ConfigDefaults::builtin(),
    ));
    config.load().await.unwrap();

    let queue = Arc::new(queue);
    let executor = Arc::new(ScriptedExecutor::default());
    let credentials = Arc::new(Credentials::new(
        token.then(|| secrecy::SecretString::from("tok")),
    ));
    let worker = Arc::new(
        LeaseWorker::new(
            "agent-1",
            queue.clone(),
            executor.clone(),
            Arc::clone(&config),
            credentials,
        )
        .with_options(LeaseWorkerOptions {
            heartbeat_floor: Duration::from_millis(20),
            heartbeat_ceiling: Duration::from_millis(20),
            report_attempts: 3,
            report_backoff: Duration::from_millis(5),
        }),
    );
    Harness {
        _dir: dir,
        scheduler,
        config,
        queue,
        executor,
        worker,
    }
}

async fn drain(worker: &LeaseWorker) {
    tokio::time::timeout(TEST_TIMEOUT, worker.shutdown())
        .await
        .expect("workers did not finish");
}

// ── Lease worker ───────────────────────────────────────────────────

#[tokio::test]
async fn every_claimed_command_is_released_and_resolved_once() {
    let h = harness(
        FakeQueue::with(vec![
            command("ok", "start_workflow", "ok"),
            command("unknown", "reboot", "ok"),
            Command {
                step_id: None,
                ..command("no-step", "execute_step", "ok")
            },
            command("fails", "execute_step", "fail"),
            command("panics", "execute_step", "panic"),
        ]),
        true,
    )
    .await;

    let spawned = h.worker.poll_once(&CancellationToken::new()).await.unwrap();
    assert_eq!(spawned, 5);
    drain(&h.worker).await;

    assert!(h.worker.in_flight().is_empty());
    let statuses = h.queue.statuses();
    assert_eq!(statuses.len(), 5);
    for (id, reports) in &statuses {
        assert_eq!(reports.len(), 1, "{id} resolved {} times", reports.len());
    }
    assert_eq!(statuses["ok"][0].status, CommandStatus::Completed);
    assert_eq!(statuses["ok"][0].result, Some(json!({"id": "ok"})));
    for id in ["unknown", "no-step", "fails", "panics"] {
        assert_eq!(statuses[id][0].status, CommandStatus::Failed, "{id}");
        assert!(statuses[id][0].error.is_some(), "{id} has no error payload");
    }
    assert!(statuses["panics"][0].error.as_deref().unwrap().contains("executor exploded"));
    assert!(statuses["no-step"][0].error.as_deref().unwrap().contains("stepId"));

    // Rejected commands never start a heartbeat loop.
    assert!(h.queue.heartbeats_for("unknown").is_empty());
    let ok_beats = h.queue.heartbeats_for("ok");
    assert_eq!(ok_beats.first().map(|p| p.percent), Some(10));
    assert_eq!(ok_beats.last().map(|p| p.percent), Some(100));
}

#[tokio::test]
async fn heartbeats_continue_while_command_runs() {
    let h = harness(FakeQueue::with(vec![command("slow", "execute_step", "sleep")]), true).await;
    h.worker.poll_once(&CancellationToken::new()).await.unwrap();
    drain(&h.worker).await;

    let beats = h.queue.heartbeats_for("slow");
    assert!(beats.len() >= 4, "expected periodic heartbeats, got {}", beats.len());
    assert!(beats.iter().any(|p| p.percent == 50));
    assert_eq!(h.queue.statuses()["slow"][0].status, CommandStatus::Completed);
}

#[tokio::test]
async fn in_flight_command_is_not_reclaimed() {
    let h = harness(
        FakeQueue {
            repeat: true,
            ..FakeQueue::with(vec![command("long", "start_workflow", "block")])
        },
        true,
    )
    .await;
    let cancel = CancellationToken::new();

    assert_eq!(h.worker.poll_once(&cancel).await.unwrap(), 1);
    assert_eq!(h.worker.in_flight(), vec!["long".to_string()]);
    assert_eq!(h.worker.poll_once(&cancel).await.unwrap(), 0);

    h.executor.gate.notify_one();
    drain(&h.worker).await;

    assert!(h.worker.in_flight().is_empty());
    assert_eq!(h.queue.statuses()["long"].len(), 1);
}

#[tokio::test]
async fn cancellation_resolves_running_commands() {
    let h = harness(FakeQueue::with(vec![command("stuck", "start_workflow", "block")]), true).await;
    let cancel = CancellationToken::new();
    h.worker.poll_once(&cancel).await.unwrap();

    cancel.cancel();
    drain(&h.worker).await;

    let report = &h.queue.statuses()["stuck"][0];
    assert_eq!(report.status, CommandStatus::Failed);
    assert!(report.error.as_deref().unwrap().contains("shutting down"));
    assert!(h.worker.in_flight().is_empty());
}

#[tokio::test]
async fn missing_token_skips_the_cycle() {
    let h = harness(FakeQueue::with(vec![command("c", "start_workflow", "ok")]), false).await;
    assert_eq!(h.worker.poll_once(&CancellationToken::new()).await.unwrap(), 0);
    assert!(h.queue.claims.lock().unwrap().is_empty());
}

#[tokio::test]
async fn claim_failure_means_zero_commands() {
    let h = harness(FakeQueue::default(), true).await;
    h.queue.claim_error.store(true, Ordering::SeqCst);
    assert_eq!(h.worker.poll_once(&CancellationToken::new()).await.unwrap(), 0);
}

#[tokio::test]
async fn claim_limit_follows_config() {
    let h = harness(
        FakeQueue::with(vec![
            command("a", "start_workflow", "ok"),
            command("b", "start_workflow", "ok"),
            command("c", "start_workflow", "ok"),
        ]),
        true,
    )
    .await;
    h.config
        .apply_diff(&ConfigDiff {
            tasks: Some(json!({COMMAND_POLL_TASK: {"claim_limit": 2}})),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(h.worker.poll_once(&CancellationToken::new()).await.unwrap(), 2);
    assert_eq!(*h.queue.claims.lock().unwrap(), vec![2]);
    drain(&h.worker).await;
}

#[tokio::test]
async fn status_update_is_retried() {
    let h = harness(FakeQueue::with(vec![command("r", "start_workflow", "ok")]), true).await;
    h.queue.failing_status_calls.store(2, Ordering::SeqCst);

    h.worker.poll_once(&CancellationToken::new()).await.unwrap();
    drain(&h.worker).await;

    assert_eq!(h.queue.status_attempts.load(Ordering::SeqCst), 3);
    assert_eq!(h.queue.statuses()["r"].len(), 1);
}

// ── Config ↔ scheduler ─────────────────────────────────────────────

#[tokio::test]
async fn worker_task_is_projected_from_config() {
    let h = harness(FakeQueue::default(), true).await;
    h.scheduler.catalog_task(Arc::new(h.worker.into_task())).await;
    h.config.project().await;
    assert!(h.scheduler.is_registered(COMMAND_POLL_TASK).await);

    h.config
        .apply_diff(&ConfigDiff {
            tasks: Some(json!({COMMAND_POLL_TASK: {"enabled": false}})),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(!h.scheduler.is_registered(COMMAND_POLL_TASK).await);

    h.config
        .apply_diff(&ConfigDiff {
            tasks: Some(json!({COMMAND_POLL_TASK: {"enabled": true, "schedule": "0 0 0 1 1 *"}})),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(
        h.scheduler.schedule_of(COMMAND_POLL_TASK).await.as_deref(),
        Some("0 0 0 1 1 *")
    );
    h.scheduler.shutdown().await;
}

#[tokio::test]
async fn config_sync_task_submits_once_per_change() {
    let dir = tempfile::tempdir().unwrap();
    let authority = Arc::new(FakeAuthority::default());
    let config = Arc::new(ConfigManager::new(
        "agent-1",
        ConfigStore::new(dir.path().join("config.json")),
        authority.clone(),
        Arc::new(Scheduler::new()),
        ConfigDefaults::builtin(),
    ));
    config.load().await.unwrap();

    let task = config_sync_task(Arc::clone(&config));
    task.execute(TaskContext::manual("config_sync")).await.unwrap();
    task.execute(TaskContext::manual("config_sync")).await.unwrap();
    assert_eq!(authority.submissions.load(Ordering::SeqCst), 1);
    assert_eq!(config.version().await, 1);

    // The empty remote asked for a full resend, which the first run honoured.
    assert!(!config.resend_pending());
    let metrics = task.metrics().await.unwrap();
    assert_eq!(metrics.success_count, 2);
}

#[tokio::test]
async fn defaults_read_through_typed_accessors() {
    let h = harness(FakeQueue::default(), true).await;
    h.config
        .apply_diff(&ConfigDiff {
            tasks: Some(json!({
                COMMAND_POLL_TASK: {"page_size": {"value": 42, "name": "pageSize", "type": "number"}},
                "orders": {"page_size": 50}
            })),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(h.config.get_config_int(COMMAND_POLL_TASK, "page_size", 0).await, 42);
    assert_eq!(h.config.get_config_int("orders", "page_size", 0).await, 50);
}
