use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capabilities::http::{ValidatedUrl, MAX_TIMEOUT_MS};
use crate::model::TaskId;
use crate::outbox::DEFAULT_MAX_PENDING_OPERATIONS;

pub const DEFAULT_API_BASE: &str = "https://amazing-task-backend.onrender.com/api";
pub const DEFAULT_APP_ORIGIN: &str = "http://localhost:5173";
pub const DEFAULT_CACHE_NAME: &str = "todo-cache-v1";
pub const DEFAULT_APP_SHELL: &[&str] = &["/", "/index.html", "/manifest.webmanifest"];
pub const DEFAULT_TASK_COLLECTION_PATH: &str = "/api/todos";
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Validation(String),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Remote store root; the collection lives at `{api_base}/todos`.
    pub api_base: String,
    /// Origin the app shell is served from. Relative locators resolve
    /// against it and same-origin GETs are cached network-first.
    pub app_origin: String,
    /// Current cache generation.
    pub cache_name: String,
    pub app_shell: Vec<String>,
    pub task_collection_path: String,
    pub request_timeout_ms: u64,
    pub max_pending_operations: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            app_origin: DEFAULT_APP_ORIGIN.to_string(),
            cache_name: DEFAULT_CACHE_NAME.to_string(),
            app_shell: DEFAULT_APP_SHELL.iter().map(|s| (*s).to_string()).collect(),
            task_collection_path: DEFAULT_TASK_COLLECTION_PATH.to_string(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            max_pending_operations: DEFAULT_MAX_PENDING_OPERATIONS,
        }
    }
}

impl SyncConfig {
    /// Parses a JSON document; absent fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        ValidatedUrl::new(self.tasks_url())
            .map_err(|e| ConfigError::Validation(format!("api_base: {e}")))?;
        let origin = ValidatedUrl::new(self.app_origin.as_str())
            .map_err(|e| ConfigError::Validation(format!("app_origin: {e}")))?;

        if self.cache_name.trim().is_empty() {
            return Err(ConfigError::Validation("cache_name cannot be empty".into()));
        }
        for locator in &self.app_shell {
            ValidatedUrl::resolve(origin.as_str(), locator).map_err(|e| {
                ConfigError::Validation(format!("app_shell entry '{locator}': {e}"))
            })?;
        }
        if !self.task_collection_path.starts_with('/') {
            return Err(ConfigError::Validation(
                "task_collection_path must start with '/'".into(),
            ));
        }
        if self.request_timeout_ms == 0 || self.request_timeout_ms > MAX_TIMEOUT_MS {
            return Err(ConfigError::Validation(format!(
                "request_timeout_ms must be in 1..={MAX_TIMEOUT_MS}"
            )));
        }
        if self.max_pending_operations == 0 {
            return Err(ConfigError::Validation(
                "max_pending_operations must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn tasks_url(&self) -> String {
        format!("{}/todos", self.api_base.trim_end_matches('/'))
    }

    pub fn task_url(&self, id: &TaskId) -> String {
        format!("{}/{}", self.tasks_url(), id)
    }
}
