//! Remote command queue contract.

use async_trait::async_trait;

use crate::commands::model::{Command, CommandProgress, CommandReport};
use crate::error::RemoteError;

#[async_trait]
pub trait CommandQueue: Send + Sync {
    /// Lease up to `limit` pending commands for this agent.
    async fn claim_pending(&self, agent_id: &str, limit: usize) -> Result<Vec<Command>, RemoteError>;

    /// Extend the lease on a command and publish its progress.
    async fn update_heartbeat(
        &self,
        agent_id: &str,
        command_id: &str,
        progress: &CommandProgress,
    ) -> Result<(), RemoteError>;

    /// Write the terminal status of a command.
    async fn update_command_status(
        &self,
        command_id: &str,
        report: &CommandReport,
    ) -> Result<(), RemoteError>;
}
