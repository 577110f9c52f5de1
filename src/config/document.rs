//! The versioned config document, its content hash and the local cache file.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::config::value::{coerce_bool, coerce_string, merge_maps, strip_local_only, unwrap_value};
use crate::error::ConfigError;

/// Per-task config entry: a name plus arbitrary (possibly wrapped) fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub name: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl TaskConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Map::new(),
        }
    }

    /// Effective (unwrapped) value of `field`.
    pub fn field(&self, field: &str) -> Option<Value> {
        self.fields.get(field).map(unwrap_value)
    }

    /// `enabled` flag, if the entry sets one.
    pub fn enabled(&self) -> Option<bool> {
        self.field("enabled").as_ref().and_then(coerce_bool)
    }

    /// Configured cron expression, if any.
    pub fn schedule(&self) -> Option<String> {
        self.field("schedule")
            .as_ref()
            .and_then(coerce_string)
            .filter(|s| !s.trim().is_empty())
    }
}

/// Data portion of the document: everything that is hashed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigData {
    #[serde(default)]
    pub agent: Map<String, Value>,
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
}

impl ConfigData {
    /// Parse a `configData` object.
    pub fn from_value(value: &Value) -> Result<Self, ConfigError> {
        if !value.is_object() {
            return Err(ConfigError::InvalidShape {
                path: "configData".to_string(),
                expected: "object".to_string(),
            });
        }
        Ok(serde_json::from_value(value.clone())?)
    }

    pub fn to_value(&self) -> Value {
        let tasks = self
            .tasks
            .iter()
            .map(|t| {
                let mut entry = t.fields.clone();
                entry.insert("name".to_string(), Value::String(t.name.clone()));
                Value::Object(entry)
            })
            .collect();
        let mut root = Map::new();
        root.insert("agent".to_string(), Value::Object(self.agent.clone()));
        root.insert("tasks".to_string(), Value::Array(tasks));
        Value::Object(root)
    }

    pub fn is_empty(&self) -> bool {
        self.agent.is_empty() && self.tasks.is_empty()
    }

    pub fn task(&self, name: &str) -> Option<&TaskConfig> {
        self.tasks.iter().find(|t| t.name == name)
    }

    pub fn task_mut(&mut self, name: &str) -> Option<&mut TaskConfig> {
        self.tasks.iter_mut().find(|t| t.name == name)
    }

    /// Remove a task entry. Returns whether it existed.
    pub fn remove_task(&mut self, name: &str) -> bool {
        let before = self.tasks.len();
        self.tasks.retain(|t| t.name != name);
        self.tasks.len() != before
    }

    /// SHA-256 over the canonical form, local-only keys excluded.
    pub fn content_hash(&self) -> String {
        content_hash(&self.to_value())
    }

    /// Merge a partial update into this data.
    ///
    /// Shapes are validated before anything is touched, so an invalid diff
    /// leaves the data unchanged. Returns the names in `deletedTasks`.
    pub fn apply_diff(&mut self, diff: &ConfigDiff) -> Result<Vec<String>, ConfigError> {
        let agent = match &diff.agent {
            Some(Value::Object(map)) => Some(map),
            Some(Value::Null) | None => None,
            Some(_) => return Err(shape("agent", "object")),
        };
        let mut task_updates: Vec<(&String, &Map<String, Value>)> = Vec::new();
        match &diff.tasks {
            Some(Value::Object(map)) => {
                for (name, partial) in map {
                    match partial {
                        Value::Object(fields) => task_updates.push((name, fields)),
                        _ => return Err(shape(&format!("tasks.{name}"), "object")),
                    }
                }
            }
            Some(Value::Null) | None => {}
            Some(_) => return Err(shape("tasks", "object keyed by task name")),
        }

        if let Some(agent) = agent {
            merge_maps(&mut self.agent, agent);
        }
        for (name, fields) in task_updates {
            let mut fields = fields.clone();
            fields.remove("name");
            match self.task_mut(name) {
                Some(existing) => merge_maps(&mut existing.fields, &fields),
                None => self.tasks.push(TaskConfig {
                    name: name.clone(),
                    fields,
                }),
            }
        }

        let deleted = diff.deleted_tasks.clone().unwrap_or_default();
        for name in &deleted {
            self.remove_task(name);
        }
        Ok(deleted)
    }
}

fn shape(path: &str, expected: &str) -> ConfigError {
    ConfigError::InvalidShape {
        path: path.to_string(),
        expected: expected.to_string(),
    }
}

/// Partial update pushed by the remote authority.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigDiff {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_tasks: Option<Vec<String>>,
}

impl ConfigDiff {
    pub fn is_empty(&self) -> bool {
        let empty_value = |v: &Option<Value>| match v {
            None | Some(Value::Null) => true,
            Some(Value::Object(m)) => m.is_empty(),
            Some(_) => false,
        };
        empty_value(&self.agent)
            && empty_value(&self.tasks)
            && self.deleted_tasks.as_ref().is_none_or(|d| d.is_empty())
    }
}

/// The in-memory authoritative document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigDocument {
    /// Server-issued version; 0 until the first accepted submission.
    pub version: i64,
    /// Last known content hash.
    pub config_hash: String,
    pub data: ConfigData,
}

impl ConfigDocument {
    /// Unversioned document with a freshly computed hash.
    pub fn from_data(data: ConfigData) -> Self {
        Self {
            version: 0,
            config_hash: data.content_hash(),
            data,
        }
    }

    pub fn to_persisted(&self) -> PersistedConfig {
        PersistedConfig {
            version: self.version,
            config_hash: self.config_hash.clone(),
            last_updated_at: Utc::now().timestamp_millis(),
            config_data: self.data.to_value(),
        }
    }
}

/// On-disk cache file layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedConfig {
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub config_hash: String,
    #[serde(default)]
    pub last_updated_at: i64,
    #[serde(default)]
    pub config_data: Value,
}

/// JSON with object keys sorted at every depth.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, value)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(value, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Hex SHA-256 of the canonical form of `value` minus local-only keys.
pub fn content_hash(value: &Value) -> String {
    let canonical = canonical_json(&strip_local_only(value));
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// Reads and writes the local cache file.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the cache file. `Ok(None)` when it does not exist.
    pub async fn load(&self) -> Result<Option<PersistedConfig>, ConfigError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    /// Write the cache file, creating its directory if needed.
    pub async fn save(&self, persisted: &PersistedConfig) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_string_pretty(persisted)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        tracing::debug!(path = %self.path.display(), version = persisted.version, "Persisted config cache");
        Ok(())
    }
}
