//! HTTP client for the remote authority.
//!
//! One client serves both the config authority and the command queue
//! endpoints, authenticated with the bearer token in [`Credentials`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::commands::{Command, CommandProgress, CommandQueue, CommandReport};
use crate::config::{ConfigAuthority, RemoteConfig, SubmitResponse};
use crate::error::RemoteError;
use crate::remote::Credentials;

pub struct ServerClient {
    base_url: String,
    credentials: Arc<Credentials>,
    client: reqwest::Client,
    timeout: Duration,
}

impl ServerClient {
    pub fn new(
        base_url: impl Into<String>,
        credentials: Arc<Credentials>,
        timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Unreachable(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
            client,
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, RemoteError> {
        let token = self
            .credentials
            .token()
            .await
            .ok_or(RemoteError::NotAuthenticated)?;
        Ok(self
            .client
            .request(method, self.url(path))
            .bearer_auth(token.expose_secret()))
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, RemoteError> {
        let resp = builder.send().await.map_err(|e| self.transport_error(e))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            tracing::warn!(body = %body, "Remote authority rejected token");
            return Err(RemoteError::NotAuthenticated);
        }
        Err(RemoteError::Status {
            code: status.as_u16(),
            body,
        })
    }

    async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, RemoteError> {
        let resp = self.send(builder).await?;
        resp.json::<T>()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))
    }

    fn transport_error(&self, e: reqwest::Error) -> RemoteError {
        if e.is_timeout() {
            RemoteError::Timeout(self.timeout)
        } else {
            e.into()
        }
    }
}

#[async_trait]
impl ConfigAuthority for ServerClient {
    async fn submit_config(
        &self,
        agent_id: &str,
        config: &Value,
        config_hash: &str,
    ) -> Result<SubmitResponse, RemoteError> {
        let builder = self
            .request(Method::POST, &format!("/agents/{agent_id}/config"))
            .await?
            .json(&json!({ "config": config, "configHash": config_hash }));
        self.send_json(builder).await
    }

    async fn get_current_config(&self, agent_id: &str) -> Result<RemoteConfig, RemoteError> {
        let builder = self
            .request(Method::GET, &format!("/agents/{agent_id}/config"))
            .await?;
        match self.send_json(builder).await {
            Err(RemoteError::Status { code: 404, .. }) => Ok(RemoteConfig::default()),
            other => other,
        }
    }
}

#[async_trait]
impl CommandQueue for ServerClient {
    async fn claim_pending(&self, agent_id: &str, limit: usize) -> Result<Vec<Command>, RemoteError> {
        let builder = self
            .request(Method::POST, &format!("/agents/{agent_id}/commands/claim"))
            .await?
            .json(&json!({ "limit": limit }));
        self.send_json(builder).await
    }

    async fn update_heartbeat(
        &self,
        agent_id: &str,
        command_id: &str,
        progress: &CommandProgress,
    ) -> Result<(), RemoteError> {
        let builder = self
            .request(
                Method::POST,
                &format!("/agents/{agent_id}/commands/{command_id}/heartbeat"),
            )
            .await?
            .json(progress);
        self.send(builder).await.map(|_| ())
    }

    async fn update_command_status(
        &self,
        command_id: &str,
        report: &CommandReport,
    ) -> Result<(), RemoteError> {
        let builder = self
            .request(Method::PUT, &format!("/commands/{command_id}/status"))
            .await?
            .json(report);
        self.send(builder).await.map(|_| ())
    }
}
