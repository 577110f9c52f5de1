//! Workflow executors backed by an HTTP endpoint, or by nothing at all.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde_json::{Value, json};

use crate::commands::{Command, CommandType, ExecutionOptions, ProgressReporter, WorkflowExecutor};
use crate::error::CommandError;
use crate::remote::Credentials;

/// Forwards commands to a workflow service.
pub struct HttpWorkflowExecutor {
    base_url: String,
    credentials: Arc<Credentials>,
    client: reqwest::Client,
}

impl HttpWorkflowExecutor {
    pub fn new(
        base_url: impl Into<String>,
        credentials: Arc<Credentials>,
        timeout: Duration,
    ) -> Result<Self, CommandError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CommandError::Execution(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
            client,
        })
    }

    fn endpoint(&self, command: &Command, kind: CommandType) -> String {
        let workflow = command.workflow_id.as_deref().unwrap_or_default();
        match kind {
            CommandType::StartWorkflow => format!("{}/workflows/{workflow}/start", self.base_url),
            CommandType::ExecuteStep => format!(
                "{}/workflows/{workflow}/steps/{}/execute",
                self.base_url,
                command.step_id.as_deref().unwrap_or_default()
            ),
        }
    }
}

#[async_trait]
impl WorkflowExecutor for HttpWorkflowExecutor {
    async fn execute(
        &self,
        command: &Command,
        kind: CommandType,
        progress: &ProgressReporter,
        options: &ExecutionOptions,
    ) -> Result<Value, CommandError> {
        let url = self.endpoint(command, kind);
        let body = json!({
            "commandId": command.id,
            "rootWorkflowId": command.root_workflow_id,
            "params": command.params,
            "pageSize": options.page_size,
        });

        let mut request = self.client.post(&url).json(&body);
        if let Some(token) = self.credentials.token().await {
            request = request.bearer_auth(token.expose_secret());
        }

        progress.report(50, format!("dispatched {kind}"));
        let resp = request
            .send()
            .await
            .map_err(|e| CommandError::Execution(format!("workflow service unreachable: {e}")))?;

        let status = resp.status();
        let text = match resp.text().await {
            Ok(text) => text,
            Err(e) if status.is_success() => {
                return Err(CommandError::Execution(format!(
                    "failed to read workflow response: {e}"
                )));
            }
            Err(_) => String::new(),
        };
        if !status.is_success() {
            return Err(CommandError::Execution(format!(
                "workflow service returned {}: {text}",
                status.as_u16()
            )));
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| CommandError::Execution(format!("invalid workflow response: {e}")))
    }
}

/// Used when no workflow endpoint is configured. Every command fails with
/// a readable error, which still resolves it remotely.
#[derive(Debug, Default)]
pub struct UnconfiguredExecutor;

#[async_trait]
impl WorkflowExecutor for UnconfiguredExecutor {
    async fn execute(
        &self,
        _command: &Command,
        kind: CommandType,
        _progress: &ProgressReporter,
        _options: &ExecutionOptions,
    ) -> Result<Value, CommandError> {
        Err(CommandError::Execution(format!(
            "no workflow executor configured for {kind} (set SYNC_AGENT_WORKFLOW_URL)"
        )))
    }
}
