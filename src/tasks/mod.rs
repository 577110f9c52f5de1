//! Built-in scheduled tasks.

pub mod config_sync;
pub mod status_report;

pub use config_sync::config_sync_task;
pub use status_report::status_report_task;
