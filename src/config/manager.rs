//! Dynamic configuration manager.
//!
//! Owns the single authoritative [`ConfigDocument`], keeps it durable in the
//! local cache, exchanges it with the remote authority and projects it onto
//! the [`Scheduler`]. Task bodies read their tunables through the typed
//! accessors at run time, so non-schedule changes apply on the next fire.
//!
//! Reads go through an `RwLock`. Every write path (load, apply, submit) is
//! serialized by `write_lock`; `submitting` collapses concurrent submissions
//! into one attempt.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::authority::ConfigAuthority;
use crate::config::defaults::ConfigDefaults;
use crate::config::document::{ConfigData, ConfigDiff, ConfigDocument, ConfigStore, TaskConfig};
use crate::config::value::{coerce_bool, coerce_int, coerce_string, deep_merge, strip_local_only, unwrap_value};
use crate::error::ConfigError;
use crate::scheduler::Scheduler;

/// Where the startup document came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    Cache,
    Defaults,
}

/// Result of a submission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Sent and accepted; carries the server-issued version.
    Submitted { version: i64 },
    /// Nothing changed since the last accepted submission.
    Unchanged,
    /// Another submission was already running.
    InProgress,
    /// The authority could not be reached or refused the document.
    Failed,
}

/// Result of pulling the remote document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    /// A newer remote document replaced the local one.
    Adopted { version: i64 },
    /// Local document is already current.
    Current,
    /// The authority has nothing for us; a full resend was requested.
    Empty,
    /// The authority could not be reached.
    Unavailable,
    /// The remote document could not be applied.
    Rejected,
}

/// Clears an in-progress flag on every exit path.
struct FlagRelease<'a>(&'a AtomicBool);

impl Drop for FlagRelease<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct ConfigManager {
    agent_id: String,
    store: ConfigStore,
    authority: Arc<dyn ConfigAuthority>,
    scheduler: Arc<Scheduler>,
    defaults: ConfigDefaults,
    document: RwLock<ConfigDocument>,
    write_lock: Mutex<()>,
    submitting: AtomicBool,
    resend_full: AtomicBool,
}

impl ConfigManager {
    pub fn new(
        agent_id: impl Into<String>,
        store: ConfigStore,
        authority: Arc<dyn ConfigAuthority>,
        scheduler: Arc<Scheduler>,
        defaults: ConfigDefaults,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            store,
            authority,
            scheduler,
            defaults,
            document: RwLock::new(ConfigDocument::default()),
            write_lock: Mutex::new(()),
            submitting: AtomicBool::new(false),
            resend_full: AtomicBool::new(false),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Startup resolution: local cache if it holds data, otherwise the
    /// code-declared defaults (which are then persisted). Either way the
    /// result is projected onto the scheduler.
    pub async fn load(&self) -> Result<LoadSource, ConfigError> {
        let _write = self.write_lock.lock().await;
        let path = self.store.path().display().to_string();

        match self.store.load().await {
            Ok(Some(persisted)) => match ConfigData::from_value(&persisted.config_data) {
                Ok(data) if !data.is_empty() => {
                    let config_hash = if persisted.config_hash.is_empty() {
                        data.content_hash()
                    } else {
                        persisted.config_hash
                    };
                    let doc = ConfigDocument {
                        version: persisted.version,
                        config_hash,
                        data,
                    };
                    info!(
                        path = %path,
                        version = doc.version,
                        tasks = doc.data.tasks.len(),
                        "Loaded config from local cache"
                    );
                    *self.document.write().await = doc;
                    self.project().await;
                    return Ok(LoadSource::Cache);
                }
                Ok(_) => warn!(path = %path, error = %ConfigError::EmptyCache, "Using defaults"),
                Err(e) => warn!(path = %path, error = %e, "Local config cache unusable, using defaults"),
            },
            Ok(None) => info!(path = %path, "No local config cache, using defaults"),
            Err(e) => warn!(path = %path, error = %e, "Failed to read local config cache, using defaults"),
        }

        let doc = ConfigDocument::from_data(self.defaults.to_data());
        *self.document.write().await = doc.clone();
        let saved = self.store.save(&doc.to_persisted()).await;
        self.project().await;
        saved?;
        Ok(LoadSource::Defaults)
    }

    /// Deep-merge a partial update, rehash, persist and project.
    ///
    /// An empty or malformed diff is rejected and the in-memory document
    /// is left untouched.
    pub async fn apply_diff(&self, diff: &ConfigDiff) -> Result<(), ConfigError> {
        if diff.is_empty() {
            return Err(ConfigError::EmptyDiff);
        }
        let _write = self.write_lock.lock().await;

        let mut data = self.document.read().await.data.clone();
        let deleted = data.apply_diff(diff)?;
        let doc = {
            let mut doc = self.document.write().await;
            doc.config_hash = data.content_hash();
            doc.data = data;
            doc.clone()
        };

        for name in &deleted {
            self.scheduler.remove(name).await;
        }
        let saved = self.store.save(&doc.to_persisted()).await;
        self.project().await;
        info!(
            version = doc.version,
            hash = %doc.config_hash,
            deleted = deleted.len(),
            "Applied config diff"
        );
        saved
    }

    /// Replace the whole document with an externally versioned one.
    pub async fn apply_full_config(
        &self,
        config_data: &Value,
        version: i64,
        config_hash: &str,
    ) -> Result<(), ConfigError> {
        let data = ConfigData::from_value(config_data)?;
        let _write = self.write_lock.lock().await;

        let config_hash = if config_hash.is_empty() {
            data.content_hash()
        } else {
            config_hash.to_string()
        };
        let doc = ConfigDocument {
            version,
            config_hash,
            data,
        };
        *self.document.write().await = doc.clone();

        let saved = self.store.save(&doc.to_persisted()).await;
        self.project().await;
        info!(version, hash = %doc.config_hash, "Applied full config");
        saved
    }

    /// Send the effective config to the authority if it changed.
    ///
    /// Unreachable authorities are logged and reported as
    /// [`SubmitOutcome::Failed`]; the local document stays as it was.
    pub async fn submit(&self) -> SubmitOutcome {
        if self
            .submitting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Config submission already in progress");
            return SubmitOutcome::InProgress;
        }
        let _flag = FlagRelease(&self.submitting);
        let _write = self.write_lock.lock().await;

        let (data, version, known_hash) = {
            let doc = self.document.read().await;
            (doc.data.clone(), doc.version, doc.config_hash.clone())
        };
        let effective = self.effective_data(data).await;
        let hash = effective.content_hash();
        let resend = self.resend_full.load(Ordering::Acquire);

        if version != 0 && hash == known_hash && !resend {
            debug!(version, "Config unchanged, skipping submission");
            return SubmitOutcome::Unchanged;
        }

        let payload = strip_local_only(&effective.to_value());
        let response = match self
            .authority
            .submit_config(&self.agent_id, &payload, &hash)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Config submission failed, continuing on local config");
                return SubmitOutcome::Failed;
            }
        };

        self.resend_full.store(false, Ordering::Release);
        let doc = {
            let mut doc = self.document.write().await;
            doc.data = effective;
            doc.version = response.version;
            doc.config_hash = hash;
            doc.clone()
        };
        if let Err(e) = self.store.save(&doc.to_persisted()).await {
            warn!(error = %e, "Failed to persist submitted config");
        }
        info!(version = doc.version, hash = %doc.config_hash, "Config submitted");
        SubmitOutcome::Submitted {
            version: doc.version,
        }
    }

    /// Fetch the remote document; adopt it when newer than ours.
    pub async fn pull(&self) -> PullOutcome {
        let remote = match self.authority.get_current_config(&self.agent_id).await {
            Ok(remote) => remote,
            Err(e) => {
                warn!(error = %e, "Config pull failed, keeping local config");
                return PullOutcome::Unavailable;
            }
        };

        if remote.is_empty() {
            info!("Remote authority holds no config, requesting full resend");
            self.request_full_resend();
            return PullOutcome::Empty;
        }

        let local = self.version().await;
        if remote.version <= local {
            debug!(local, remote = remote.version, "Local config is current");
            return PullOutcome::Current;
        }

        match self
            .apply_full_config(&remote.config_data, remote.version, &remote.config_hash)
            .await
        {
            Ok(()) => {
                info!(from = local, to = remote.version, "Adopted remote config");
                PullOutcome::Adopted {
                    version: remote.version,
                }
            }
            Err(e) => {
                warn!(error = %e, version = remote.version, "Failed to apply remote config");
                PullOutcome::Rejected
            }
        }
    }

    /// Force the next [`submit`](Self::submit) to send regardless of hash.
    pub fn request_full_resend(&self) {
        self.resend_full.store(true, Ordering::Release);
    }

    pub fn resend_pending(&self) -> bool {
        self.resend_full.load(Ordering::Acquire)
    }

    /// Push the current document onto the scheduler.
    ///
    /// `enabled=false` unregisters; a differing `schedule` reschedules;
    /// everything else is read on demand by the task itself.
    pub async fn project(&self) {
        let tasks = self.document.read().await.data.tasks.clone();
        for task in &tasks {
            self.project_task(task).await;
        }
    }

    async fn project_task(&self, task: &TaskConfig) {
        let name = task.name.as_str();
        let registered = self.scheduler.is_registered(name).await;

        if task.enabled() == Some(false) {
            if registered {
                self.scheduler.remove(name).await;
                info!(task = %name, "Task disabled by config");
            }
            return;
        }

        let schedule = task.schedule();
        if !registered {
            if !self.scheduler.is_known(name).await {
                debug!(task = %name, "No task implementation for config entry");
                return;
            }
            if let Err(e) = self.scheduler.enable(name, schedule.as_deref()).await {
                warn!(task = %name, error = %e, "Configured schedule rejected, using task default");
                if let Err(e) = self.scheduler.enable(name, None).await {
                    warn!(task = %name, error = %e, "Failed to enable task");
                }
            }
            return;
        }

        if let Some(schedule) = schedule {
            let live = self.scheduler.schedule_of(name).await;
            if live.as_deref() != Some(schedule.as_str()) {
                if let Err(e) = self.scheduler.update_schedule(name, &schedule).await {
                    warn!(task = %name, error = %e, "Configured schedule rejected, keeping live schedule");
                }
            }
        }
    }

    /// Stored data with live scheduler state laid over it.
    async fn effective_data(&self, mut data: ConfigData) -> ConfigData {
        let live = self.scheduler.live_schedules().await;
        for task in &mut data.tasks {
            let Some(schedule) = live.get(&task.name) else {
                continue;
            };
            if task.schedule().as_deref() == Some(schedule.as_str()) {
                continue;
            }
            let schedule = Value::String(schedule.clone());
            match task.fields.get_mut("schedule") {
                Some(existing) => deep_merge(existing, &schedule),
                None => {
                    task.fields.insert("schedule".to_string(), schedule);
                }
            }
        }
        data
    }

    // --- accessors ---

    pub async fn snapshot(&self) -> ConfigDocument {
        self.document.read().await.clone()
    }

    pub async fn version(&self) -> i64 {
        self.document.read().await.version
    }

    pub async fn config_hash(&self) -> String {
        self.document.read().await.config_hash.clone()
    }

    /// Effective value of a task field.
    pub async fn task_field(&self, task: &str, field: &str) -> Option<Value> {
        self.document
            .read()
            .await
            .data
            .task(task)
            .and_then(|t| t.field(field))
    }

    /// Effective value of an agent-level key.
    pub async fn agent_field(&self, key: &str) -> Option<Value> {
        self.document.read().await.data.agent.get(key).map(unwrap_value)
    }

    pub async fn get_config_int(&self, task: &str, field: &str, default: i64) -> i64 {
        self.task_field(task, field)
            .await
            .as_ref()
            .and_then(coerce_int)
            .unwrap_or(default)
    }

    pub async fn get_config_bool(&self, task: &str, field: &str, default: bool) -> bool {
        self.task_field(task, field)
            .await
            .as_ref()
            .and_then(coerce_bool)
            .unwrap_or(default)
    }

    pub async fn get_config_string(&self, task: &str, field: &str, default: &str) -> String {
        self.task_field(task, field)
            .await
            .as_ref()
            .and_then(coerce_string)
            .unwrap_or_else(|| default.to_string())
    }

    pub async fn get_agent_int(&self, key: &str, default: i64) -> i64 {
        self.agent_field(key)
            .await
            .as_ref()
            .and_then(coerce_int)
            .unwrap_or(default)
    }

    pub async fn get_agent_bool(&self, key: &str, default: bool) -> bool {
        self.agent_field(key)
            .await
            .as_ref()
            .and_then(coerce_bool)
            .unwrap_or(default)
    }

    pub async fn get_agent_string(&self, key: &str, default: &str) -> String {
        self.agent_field(key)
            .await
            .as_ref()
            .and_then(coerce_string)
            .unwrap_or_else(|| default.to_string())
    }
}
