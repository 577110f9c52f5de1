//! Code-declared config defaults.
//!
//! Used when no local cache exists. Every default carries its own name,
//! description and type so the remote authority can render it.

use serde_json::{Map, Value, json};

use crate::config::document::{ConfigData, TaskConfig};
use crate::config::value::ConfigField;

pub const COMMAND_POLL_TASK: &str = "command_poll";
pub const CONFIG_SYNC_TASK: &str = "config_sync";
pub const STATUS_REPORT_TASK: &str = "status_report";

pub const COMMAND_POLL_SCHEDULE: &str = "*/15 * * * * *";
pub const CONFIG_SYNC_SCHEDULE: &str = "0 */5 * * * *";
pub const STATUS_REPORT_SCHEDULE: &str = "0 */10 * * * *";

pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: i64 = 30;
pub const DEFAULT_CLAIM_LIMIT: i64 = 5;
pub const DEFAULT_PAGE_SIZE: i64 = 50;

/// Default fields for one task.
#[derive(Debug, Clone)]
pub struct TaskDefaults {
    pub name: String,
    pub fields: Vec<ConfigField>,
}

/// The full set of code-declared defaults.
#[derive(Debug, Clone, Default)]
pub struct ConfigDefaults {
    agent: Vec<ConfigField>,
    tasks: Vec<TaskDefaults>,
}

impl ConfigDefaults {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults for the built-in agent settings and tasks.
    pub fn builtin() -> Self {
        Self::new()
            .agent_field(ConfigField::new(
                "heartbeat_interval_secs",
                "Seconds between command heartbeats (clamped to 30-60)",
                json!(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            ))
            .task(
                COMMAND_POLL_TASK,
                COMMAND_POLL_SCHEDULE,
                vec![
                    ConfigField::new("claim_limit", "Commands claimed per poll", json!(DEFAULT_CLAIM_LIMIT)),
                    ConfigField::new("page_size", "Page size passed to the workflow executor", json!(DEFAULT_PAGE_SIZE)),
                ],
            )
            .task(CONFIG_SYNC_TASK, CONFIG_SYNC_SCHEDULE, Vec::new())
            .task(STATUS_REPORT_TASK, STATUS_REPORT_SCHEDULE, Vec::new())
    }

    pub fn agent_field(mut self, field: ConfigField) -> Self {
        self.agent.push(field);
        self
    }

    /// Declare a task with its default schedule, enabled, plus extra fields.
    pub fn task(mut self, name: &str, schedule: &str, fields: Vec<ConfigField>) -> Self {
        let mut all = vec![
            ConfigField::new("enabled", "Whether the task is scheduled", json!(true)),
            ConfigField::new("schedule", "Six-field cron expression (sec min hour day month weekday)", json!(schedule)),
        ];
        all.extend(fields);
        self.tasks.push(TaskDefaults {
            name: name.to_string(),
            fields: all,
        });
        self
    }

    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.tasks.iter().map(|t| t.name.as_str())
    }

    /// Render as document data with every field wrapped.
    pub fn to_data(&self) -> ConfigData {
        let agent: Map<String, Value> = self
            .agent
            .iter()
            .map(|f| (f.name.clone(), f.to_value()))
            .collect();
        let tasks = self
            .tasks
            .iter()
            .map(|t| TaskConfig {
                name: t.name.clone(),
                fields: t.fields.iter().map(|f| (f.name.clone(), f.to_value())).collect(),
            })
            .collect();
        ConfigData { agent, tasks }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_defaults_are_wrapped_and_enabled() {
        let data = ConfigDefaults::builtin().to_data();
        let poll = data.task(COMMAND_POLL_TASK).unwrap();
        assert_eq!(poll.enabled(), Some(true));
        assert_eq!(poll.schedule().as_deref(), Some(COMMAND_POLL_SCHEDULE));
        assert_eq!(poll.field("claim_limit"), Some(json!(DEFAULT_CLAIM_LIMIT)));
        assert_eq!(poll.fields["page_size"]["type"], json!("number"));
        assert_eq!(data.agent["heartbeat_interval_secs"]["value"], json!(30));
    }

    #[test]
    fn custom_defaults_keep_declaration_order() {
        let defaults = ConfigDefaults::new()
            .task("b", "0 * * * * *", vec![])
            .task("a", "0 * * * * *", vec![]);
        let names: Vec<&str> = defaults.task_names().collect();
        assert_eq!(names, vec!["b", "a"]);
        assert_eq!(defaults.to_data().tasks[0].name, "b");
    }
}
