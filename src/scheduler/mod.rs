//! Task scheduling: timers, the single-flight guard and the task contract.
//!
//! Core components:
//! - `guard`: ExecutionGuard + RollingMetrics (skip-if-running, run stats)
//! - `task`: Task trait, TaskContext, GuardedTask composition wrapper
//! - `scheduler`: cron timer engine with add/remove/reschedule at runtime

pub mod guard;
pub mod scheduler;
pub mod task;

pub use guard::{ExecutionGuard, GuardOutcome, MetricsSnapshot, RollingMetrics, RunStatus};
pub use scheduler::{Scheduler, TaskDescriptor, parse_schedule};
pub use task::{GuardedTask, Task, TaskContext};
