//! Single-flight execution guard with rolling run metrics.
//!
//! A guard wraps one task's body. A second call that arrives while the
//! first is still running is skipped (not queued), and every finished run,
//! including one that panicked, is folded into [`RollingMetrics`].

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::TaskError;

/// Default number of recent durations kept per task.
pub const DEFAULT_METRICS_WINDOW: usize = 50;

/// Outcome of the most recent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Success => write!(f, "success"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Per-task run counters plus a bounded window of recent durations.
#[derive(Debug, Clone)]
pub struct RollingMetrics {
    pub run_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_duration: Option<Duration>,
    pub last_status: Option<RunStatus>,
    pub last_error: Option<String>,
    window: VecDeque<Duration>,
    capacity: usize,
}

impl RollingMetrics {
    /// Create metrics with a window of `capacity` durations (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            run_count: 0,
            success_count: 0,
            error_count: 0,
            last_run_at: None,
            last_duration: None,
            last_status: None,
            last_error: None,
            window: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record a finished run. Evicts the oldest duration once full.
    pub fn record(&mut self, started_at: DateTime<Utc>, duration: Duration, error: Option<String>) {
        self.run_count += 1;
        match error {
            Some(e) => {
                self.error_count += 1;
                self.last_status = Some(RunStatus::Failed);
                self.last_error = Some(e);
            }
            None => {
                self.success_count += 1;
                self.last_status = Some(RunStatus::Success);
                self.last_error = None;
            }
        }
        self.last_run_at = Some(started_at);
        self.last_duration = Some(duration);

        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(duration);
    }

    /// Mean duration over the window, zero when empty.
    pub fn average_duration(&self) -> Duration {
        if self.window.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.window.iter().sum();
        total / self.window.len() as u32
    }

    /// Longest duration in the window, zero when empty.
    pub fn max_duration(&self) -> Duration {
        self.window.iter().max().copied().unwrap_or(Duration::ZERO)
    }

    /// Durations currently held, oldest first.
    pub fn recent_durations(&self) -> Vec<Duration> {
        self.window.iter().copied().collect()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Point-in-time copy for status reporting.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            run_count: self.run_count,
            success_count: self.success_count,
            error_count: self.error_count,
            last_run_at: self.last_run_at,
            last_duration_ms: self.last_duration.map(|d| d.as_millis() as u64),
            last_status: self.last_status,
            last_error: self.last_error.clone(),
            avg_duration_ms: self.average_duration().as_millis() as u64,
            max_duration_ms: self.max_duration().as_millis() as u64,
            window_len: self.window.len(),
        }
    }
}

impl Default for RollingMetrics {
    fn default() -> Self {
        Self::new(DEFAULT_METRICS_WINDOW)
    }
}

/// Serializable view of [`RollingMetrics`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub run_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_duration_ms: Option<u64>,
    pub last_status: Option<RunStatus>,
    pub last_error: Option<String>,
    pub avg_duration_ms: u64,
    pub max_duration_ms: u64,
    pub window_len: usize,
}

/// Whether a guarded call actually ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardOutcome {
    Ran,
    Skipped,
}

/// Non-reentrant gate around a task body.
pub struct ExecutionGuard {
    running: AtomicBool,
    metrics: Option<Arc<RwLock<RollingMetrics>>>,
}

/// Clears the running flag on every exit path.
struct RunningRelease<'a>(&'a AtomicBool);

impl Drop for RunningRelease<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ExecutionGuard {
    /// Guard with the default metrics window.
    pub fn new() -> Self {
        Self::with_metrics_window(DEFAULT_METRICS_WINDOW)
    }

    pub fn with_metrics_window(capacity: usize) -> Self {
        Self {
            running: AtomicBool::new(false),
            metrics: Some(Arc::new(RwLock::new(RollingMetrics::new(capacity)))),
        }
    }

    /// Guard that only enforces single-flight.
    pub fn without_metrics() -> Self {
        Self {
            running: AtomicBool::new(false),
            metrics: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Shared handle to the metrics, if enabled.
    pub fn metrics(&self) -> Option<Arc<RwLock<RollingMetrics>>> {
        self.metrics.clone()
    }

    pub async fn snapshot(&self) -> Option<MetricsSnapshot> {
        match &self.metrics {
            Some(m) => Some(m.read().await.snapshot()),
            None => None,
        }
    }

    /// Run `body` unless a previous run is still in flight.
    ///
    /// A skipped call returns `Ok(GuardOutcome::Skipped)` with no side
    /// effects. A panic inside `body`, including one raised before it
    /// returns its future, is caught and reported as [`TaskError::Panicked`].
    pub async fn run<F, Fut>(&self, body: F) -> Result<GuardOutcome, TaskError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), TaskError>>,
    {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(GuardOutcome::Skipped);
        }
        let _release = RunningRelease(&self.running);

        let started_at = Utc::now();
        let start = Instant::now();
        let result = match AssertUnwindSafe(async move { body().await }).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => Err(TaskError::Panicked(panic_message(payload.as_ref()))),
        };
        let elapsed = start.elapsed();

        if let Some(metrics) = &self.metrics {
            let error = result.as_ref().err().map(|e| e.to_string());
            metrics.write().await.record(started_at, elapsed, error);
        }

        result.map(|()| GuardOutcome::Ran)
    }
}

impl Default for ExecutionGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Best-effort text from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_window_reports_zero() {
        let m = RollingMetrics::new(4);
        assert_eq!(m.average_duration(), Duration::ZERO);
        assert_eq!(m.max_duration(), Duration::ZERO);
    }

    #[test]
    fn window_keeps_most_recent() {
        let mut m = RollingMetrics::new(3);
        for ms in [100, 5, 10, 20, 30] {
            m.record(Utc::now(), Duration::from_millis(ms), None);
        }
        assert_eq!(m.run_count, 5);
        assert_eq!(
            m.recent_durations(),
            vec![
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(30)
            ]
        );
        // The evicted 100ms run no longer counts toward max/avg.
        assert_eq!(m.max_duration(), Duration::from_millis(30));
        assert_eq!(m.average_duration(), Duration::from_millis(20));
    }

    #[test]
    fn record_tracks_status_and_error() {
        let mut m = RollingMetrics::default();
        m.record(Utc::now(), Duration::from_millis(1), Some("boom".into()));
        assert_eq!(m.error_count, 1);
        assert_eq!(m.last_status, Some(RunStatus::Failed));
        assert_eq!(m.last_error.as_deref(), Some("boom"));

        m.record(Utc::now(), Duration::from_millis(1), None);
        assert_eq!(m.success_count, 1);
        assert_eq!(m.last_status, Some(RunStatus::Success));
        assert!(m.last_error.is_none());
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let mut m = RollingMetrics::new(0);
        m.record(Utc::now(), Duration::from_millis(7), None);
        assert_eq!(m.capacity(), 1);
        assert_eq!(m.recent_durations().len(), 1);
    }

    #[tokio::test]
    async fn overlapping_run_is_skipped() {
        let guard = Arc::new(ExecutionGuard::new());
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let first = {
            let guard = Arc::clone(&guard);
            tokio::spawn(async move {
                guard
                    .run(|| async move {
                        let _ = started_tx.send(());
                        let _ = release_rx.await;
                        Ok(())
                    })
                    .await
            })
        };

        started_rx.await.unwrap();
        assert!(guard.is_running());

        let second = guard
            .run(|| async { Err(TaskError::failed("second run must not start")) })
            .await
            .unwrap();
        assert_eq!(second, GuardOutcome::Skipped);

        release_tx.send(()).unwrap();
        assert_eq!(first.await.unwrap().unwrap(), GuardOutcome::Ran);
        assert!(!guard.is_running());

        let snap = guard.snapshot().await.unwrap();
        assert_eq!(snap.run_count, 1);
    }

    async fn explode() -> Result<(), TaskError> {
        panic!("kaboom")
    }

    #[tokio::test]
    async fn panic_is_recorded_and_flag_released() {
        let guard = ExecutionGuard::new();
        let result = guard.run(explode).await;
        assert!(matches!(result, Err(TaskError::Panicked(ref m)) if m.contains("kaboom")));
        assert!(!guard.is_running());

        let snap = guard.snapshot().await.unwrap();
        assert_eq!(snap.error_count, 1);
        assert_eq!(snap.last_status, Some(RunStatus::Failed));

        let again = guard.run(|| async { Ok(()) }).await.unwrap();
        assert_eq!(again, GuardOutcome::Ran);
    }

    #[tokio::test]
    async fn panic_before_future_is_returned_is_recorded() {
        let guard = ExecutionGuard::new();
        let result = guard
            .run(|| {
                let rows: Vec<u8> = Vec::new();
                let first = rows[3];
                async move {
                    let _ = first;
                    Ok(())
                }
            })
            .await;
        assert!(matches!(result, Err(TaskError::Panicked(ref m)) if m.contains("index out of bounds")));
        assert!(!guard.is_running());

        let snap = guard.snapshot().await.unwrap();
        assert_eq!(snap.run_count, 1);
        assert_eq!(snap.error_count, 1);
    }

    #[tokio::test]
    async fn guard_without_metrics_still_single_flight() {
        let guard = ExecutionGuard::without_metrics();
        assert!(guard.metrics().is_none());
        assert_eq!(
            guard.run(|| async { Ok(()) }).await.unwrap(),
            GuardOutcome::Ran
        );
        assert!(guard.snapshot().await.is_none());
    }
}
