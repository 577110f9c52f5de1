//! Workflow executor contract and progress reporting.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::commands::model::{Command, CommandProgress, CommandType};
use crate::error::CommandError;

/// Per-command tunables handed to the executor.
#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    pub page_size: i64,
    /// Fires when the agent shuts down.
    pub cancel: CancellationToken,
}

/// Publishes the latest progress of one command to its heartbeat loop.
#[derive(Debug)]
pub struct ProgressReporter {
    tx: watch::Sender<CommandProgress>,
}

impl ProgressReporter {
    pub fn new() -> (Self, watch::Receiver<CommandProgress>) {
        let (tx, rx) = watch::channel(CommandProgress::new(0, "claimed"));
        (Self { tx }, rx)
    }

    pub fn report(&self, percent: u8, message: impl Into<String>) {
        self.tx.send_replace(CommandProgress::new(percent, message));
    }

    pub fn current(&self) -> CommandProgress {
        self.tx.borrow().clone()
    }
}

/// Performs the actual work behind a command.
#[async_trait]
pub trait WorkflowExecutor: Send + Sync {
    async fn execute(
        &self,
        command: &Command,
        kind: CommandType,
        progress: &ProgressReporter,
        options: &ExecutionOptions,
    ) -> Result<Value, CommandError>;
}
