//! Logs scheduler and lease worker state from the rolling metrics.

use std::sync::Arc;

use crate::commands::LeaseWorker;
use crate::config::defaults::{STATUS_REPORT_SCHEDULE, STATUS_REPORT_TASK};
use crate::scheduler::{GuardedTask, Scheduler, TaskContext};

pub fn status_report_task(scheduler: Arc<Scheduler>, worker: Option<Arc<LeaseWorker>>) -> GuardedTask {
    GuardedTask::new(STATUS_REPORT_TASK, STATUS_REPORT_SCHEDULE, move |_ctx: TaskContext| {
        let scheduler = Arc::clone(&scheduler);
        let worker = worker.clone();
        async move {
            for task in scheduler.list_tasks().await {
                match &task.metrics {
                    Some(m) => tracing::info!(
                        task = %task.name,
                        schedule = %task.schedule,
                        running = task.running,
                        runs = m.run_count,
                        ok = m.success_count,
                        errors = m.error_count,
                        avg_ms = m.avg_duration_ms,
                        max_ms = m.max_duration_ms,
                        last_error = m.last_error.as_deref().unwrap_or(""),
                        "Task status"
                    ),
                    None => tracing::info!(
                        task = %task.name,
                        schedule = %task.schedule,
                        running = task.running,
                        "Task status"
                    ),
                }
            }
            if let Some(worker) = worker {
                let in_flight = worker.in_flight();
                tracing::info!(count = in_flight.len(), ids = ?in_flight, "Commands in flight");
            }
            Ok(())
        }
    })
}
