//! Periodic config exchange with the remote authority.

use std::sync::Arc;

use crate::config::ConfigManager;
use crate::config::defaults::{CONFIG_SYNC_SCHEDULE, CONFIG_SYNC_TASK};
use crate::config::manager::{PullOutcome, SubmitOutcome};
use crate::scheduler::{GuardedTask, TaskContext};

/// Pull (remote wins once live), then submit local changes.
pub fn config_sync_task(config: Arc<ConfigManager>) -> GuardedTask {
    GuardedTask::new(CONFIG_SYNC_TASK, CONFIG_SYNC_SCHEDULE, move |ctx: TaskContext| {
        let config = Arc::clone(&config);
        async move {
            let pulled = config.pull().await;
            if ctx.cancel.is_cancelled() {
                return Ok(());
            }
            let submitted = config.submit().await;
            if matches!(pulled, PullOutcome::Adopted { .. })
                || matches!(submitted, SubmitOutcome::Submitted { .. })
            {
                tracing::info!(run_id = %ctx.run_id, pull = ?pulled, submit = ?submitted, "Config synced");
            } else {
                tracing::debug!(run_id = %ctx.run_id, pull = ?pulled, submit = ?submitted, "Config sync cycle");
            }
            Ok(())
        }
    })
}
