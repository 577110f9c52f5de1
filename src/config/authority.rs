//! Remote configuration authority contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RemoteError;

/// Reply to a config submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub version: i64,
    #[serde(default)]
    pub config_hash: String,
}

/// Current config held by the remote authority.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConfig {
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub config_hash: String,
    #[serde(default)]
    pub config_data: Value,
}

impl RemoteConfig {
    /// True when the authority holds nothing usable for this agent.
    pub fn is_empty(&self) -> bool {
        self.version == 0
            || match &self.config_data {
                Value::Null => true,
                Value::Object(map) => map.is_empty(),
                _ => false,
            }
    }
}

#[async_trait]
pub trait ConfigAuthority: Send + Sync {
    /// Submit the full effective config (with field metadata).
    async fn submit_config(
        &self,
        agent_id: &str,
        config: &Value,
        config_hash: &str,
    ) -> Result<SubmitResponse, RemoteError>;

    /// Fetch the authority's current config for this agent.
    async fn get_current_config(&self, agent_id: &str) -> Result<RemoteConfig, RemoteError>;
}
