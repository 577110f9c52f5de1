//! Configuration: process bootstrap settings and the dynamic, remotely
//! managed config document.
//!
//! - `value`: field wrappers, unwrap/coerce helpers, deep merge
//! - `document`: the versioned document, content hashing, cache file
//! - `defaults`: code-declared field definitions
//! - `authority`: remote config authority contract
//! - `manager`: ConfigManager (load, apply, submit, pull, projection)

pub mod authority;
pub mod defaults;
pub mod document;
pub mod manager;
pub mod value;

pub use authority::{ConfigAuthority, RemoteConfig, SubmitResponse};
pub use defaults::ConfigDefaults;
pub use document::{ConfigData, ConfigDiff, ConfigDocument, ConfigStore, PersistedConfig, TaskConfig};
pub use manager::{ConfigManager, LoadSource, PullOutcome, SubmitOutcome};
pub use value::{ConfigField, FieldType};

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Process bootstrap configuration, read once from the environment.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Identity used in every remote call.
    pub agent_id: String,
    /// Base URL of the remote authority.
    pub server_url: String,
    /// Bearer token. The lease worker idles until one is present.
    pub token: Option<SecretString>,
    /// Local config cache file.
    pub cache_path: PathBuf,
    /// Optional workflow executor endpoint.
    pub workflow_url: Option<String>,
    /// Directory for the rolling log file.
    pub log_dir: Option<PathBuf>,
    /// Fallback log filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Timeout for outbound HTTP calls.
    pub http_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_id: "sync-agent".to_string(),
            server_url: "http://localhost:8080".to_string(),
            token: None,
            cache_path: default_cache_path(),
            workflow_url: None,
            log_dir: None,
            log_level: "info".to_string(),
            http_timeout: Duration::from_secs(30),
        }
    }
}

impl AgentConfig {
    /// Read bootstrap settings from `SYNC_AGENT_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required =
            |key: &str| non_empty(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()));

        let defaults = Self::default();
        let http_timeout = match non_empty("SYNC_AGENT_HTTP_TIMEOUT_SECS") {
            Some(raw) => {
                let secs: u64 = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                    key: "SYNC_AGENT_HTTP_TIMEOUT_SECS".to_string(),
                    message: format!("expected whole seconds, got '{raw}'"),
                })?;
                Duration::from_secs(secs)
            }
            None => defaults.http_timeout,
        };

        Ok(Self {
            agent_id: required("SYNC_AGENT_ID")?,
            server_url: required("SYNC_AGENT_SERVER_URL")?
                .trim_end_matches('/')
                .to_string(),
            token: non_empty("SYNC_AGENT_TOKEN").map(SecretString::from),
            cache_path: non_empty("SYNC_AGENT_CACHE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_path),
            workflow_url: non_empty("SYNC_AGENT_WORKFLOW_URL")
                .map(|u| u.trim_end_matches('/').to_string()),
            log_dir: non_empty("SYNC_AGENT_LOG_DIR").map(PathBuf::from),
            log_level: non_empty("SYNC_AGENT_LOG_LEVEL").unwrap_or(defaults.log_level),
            http_timeout,
        })
    }
}

fn default_cache_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".sync-agent").join("config.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn from_lookup_requires_identity() {
        let err = AgentConfig::from_lookup(lookup(&[("SYNC_AGENT_SERVER_URL", "http://x")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref k) if k == "SYNC_AGENT_ID"));
    }

    #[test]
    fn from_lookup_applies_defaults() {
        let config = AgentConfig::from_lookup(lookup(&[
            ("SYNC_AGENT_ID", "agent-7"),
            ("SYNC_AGENT_SERVER_URL", "https://api.example.com/"),
        ]))
        .unwrap();
        assert_eq!(config.agent_id, "agent-7");
        assert_eq!(config.server_url, "https://api.example.com");
        assert!(config.token.is_none());
        assert_eq!(config.http_timeout, Duration::from_secs(30));
        assert_eq!(config.log_level, "info");
        assert!(config.cache_path.ends_with(".sync-agent/config.json"));
    }

    #[test]
    fn from_lookup_reads_optional_values() {
        let config = AgentConfig::from_lookup(lookup(&[
            ("SYNC_AGENT_ID", "a"),
            ("SYNC_AGENT_SERVER_URL", "http://s"),
            ("SYNC_AGENT_TOKEN", "tok"),
            ("SYNC_AGENT_CACHE_PATH", "/tmp/agent.json"),
            ("SYNC_AGENT_HTTP_TIMEOUT_SECS", "5"),
            ("SYNC_AGENT_LOG_LEVEL", "debug"),
        ]))
        .unwrap();
        assert_eq!(config.token.as_ref().map(|t| t.expose_secret().to_string()).as_deref(), Some("tok"));
        assert_eq!(config.cache_path, PathBuf::from("/tmp/agent.json"));
        assert_eq!(config.http_timeout, Duration::from_secs(5));
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn malformed_timeout_is_rejected() {
        let err = AgentConfig::from_lookup(lookup(&[
            ("SYNC_AGENT_ID", "a"),
            ("SYNC_AGENT_SERVER_URL", "http://s"),
            ("SYNC_AGENT_HTTP_TIMEOUT_SECS", "soon"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
