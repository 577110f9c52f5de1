//! Command wire types.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CommandError;

/// Kind of work a command asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    StartWorkflow,
    ExecuteStep,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::StartWorkflow => "start_workflow",
            CommandType::ExecuteStep => "execute_step",
        }
    }
}

impl std::fmt::Display for CommandType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandType {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start_workflow" | "startWorkflow" => Ok(CommandType::StartWorkflow),
            "execute_step" | "executeStep" => Ok(CommandType::ExecuteStep),
            other => Err(CommandError::UnsupportedType(other.to_string())),
        }
    }
}

/// Remote lifecycle state of a command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandStatus {
    #[default]
    Claimed,
    InProgress,
    Completed,
    Failed,
}

impl CommandStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CommandStatus::Completed | CommandStatus::Failed)
    }
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandStatus::Claimed => write!(f, "claimed"),
            CommandStatus::InProgress => write!(f, "inProgress"),
            CommandStatus::Completed => write!(f, "completed"),
            CommandStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A unit of work leased from the remote queue.
///
/// `command_type` stays a raw string so an unknown kind still deserializes
/// and can be resolved to `failed` instead of being dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub id: String,
    #[serde(alias = "type")]
    pub command_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_workflow_id: Option<String>,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub status: CommandStatus,
}

impl Command {
    /// Check the type is supported and its required references are present.
    pub fn validate(&self) -> Result<CommandType, CommandError> {
        let kind: CommandType = self.command_type.parse()?;
        let missing = |field: &str| CommandError::MissingField {
            command_type: kind.to_string(),
            field: field.to_string(),
        };
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());

        if !present(&self.workflow_id) {
            return Err(missing("workflowId"));
        }
        if kind == CommandType::ExecuteStep && !present(&self.step_id) {
            return Err(missing("stepId"));
        }
        Ok(kind)
    }
}

/// Heartbeat payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandProgress {
    pub status: CommandStatus,
    pub percent: u8,
    pub message: String,
    pub updated_at: DateTime<Utc>,
}

impl CommandProgress {
    pub fn new(percent: u8, message: impl Into<String>) -> Self {
        Self {
            status: CommandStatus::InProgress,
            percent: percent.min(100),
            message: message.into(),
            updated_at: Utc::now(),
        }
    }
}

/// Terminal status written back to the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandReport {
    pub status: CommandStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandReport {
    pub fn completed(result: Value) -> Self {
        Self {
            status: CommandStatus::Completed,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: CommandStatus::Failed,
            result: None,
            error: Some(error.into()),
        }
    }
}
