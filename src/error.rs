//! Error types for the sync agent control plane.

use std::time::Duration;

/// Top-level error type for the agent.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Command error: {0}")]
    Command(#[from] CommandError),
}

/// Scheduler registration errors.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("Invalid schedule '{expression}' for task {name}: {reason}")]
    InvalidExpression {
        name: String,
        expression: String,
        reason: String,
    },

    #[error("Task {name} is not registered")]
    NotRegistered { name: String },

    #[error("Task {name} is unknown to the scheduler")]
    UnknownTask { name: String },
}

/// Failures surfaced by a task body.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("{0}")]
    Failed(String),

    #[error("Task panicked: {0}")]
    Panicked(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),
}

impl TaskError {
    /// Build a plain failure from any displayable value.
    pub fn failed(message: impl std::fmt::Display) -> Self {
        Self::Failed(message.to_string())
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Local config cache has no data")]
    EmptyCache,

    #[error("Config diff contains no changes")]
    EmptyDiff,

    #[error("Expected {expected} at {path}")]
    InvalidShape { path: String, expected: String },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors talking to the remote authority.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("No authentication token available")]
    NotAuthenticated,

    #[error("Remote authority unreachable: {0}")]
    Unreachable(String),

    #[error("Remote authority timed out after {0:?}")]
    Timeout(Duration),

    #[error("Remote authority returned {code}: {body}")]
    Status { code: u16, body: String },

    #[error("Failed to decode remote response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Unreachable(e.to_string())
        }
    }
}

/// Errors resolving a leased command.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("Unsupported command type: {0}")]
    UnsupportedType(String),

    #[error("Command {command_type} is missing required field {field}")]
    MissingField { command_type: String, field: String },

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Executor panicked: {0}")]
    Panicked(String),
}

/// Result type alias for the agent.
pub type Result<T> = std::result::Result<T, Error>;
