//! Worker configuration.
//!
//! Loaded in three layers, later ones winning:
//! 1. Built-in defaults
//! 2. An optional JSON file
//! 3. Environment variables prefixed with `DS_WORKER_`, nested with `__`
//!    (e.g. `DS_WORKER_SEARCH__DEFAULT_PAGE_SIZE=50`)

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PipelineError, Result};
use crate::logging::LoggingConfig;

/// Prefix of environment variables read by [`WorkerConfig::load`].
pub const ENV_PREFIX: &str = "DS_WORKER_";

/// Separator between nested keys in environment variable names.
pub const ENV_NESTED_DELIMITER: &str = "__";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub url: String,
    pub api_key: Option<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            url: "http://datashare:8080".to_string(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub address: String,
    pub default_page_size: usize,
    /// Scroll context lifetime, in the index's duration syntax.
    pub keep_alive: String,
    pub max_concurrency: usize,
    pub max_retries: u32,
    pub max_retry_wait_s: u64,
    pub timeout_s: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            address: "http://localhost:9200".to_string(),
            default_page_size: crate::search::DEFAULT_PAGE_SIZE,
            keep_alive: "10m".to_string(),
            max_concurrency: 5,
            max_retries: 0,
            max_retry_wait_s: 60,
            timeout_s: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubstrateConfig {
    pub host: String,
    pub namespace: String,
}

impl Default for SubstrateConfig {
    fn default() -> Self {
        Self {
            host: "temporal:7233".to_string(),
            namespace: "datashare-default".to_string(),
        }
    }
}

/// A named queue and how many units it runs at once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    pub max_concurrency: usize,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>, max_concurrency: usize) -> Self {
        Self {
            name: name.into(),
            max_concurrency,
        }
    }
}

fn default_queues() -> Vec<QueueConfig> {
    vec![
        QueueConfig::new("cpu", 4),
        QueueConfig::new("translate-gpu", 1),
        QueueConfig::new("classify-gpu", 1),
        QueueConfig::new("asr", 1),
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub log_level: String,
    pub log_in_json: bool,
    pub worker_id: Option<String>,
    pub registry: RegistryConfig,
    pub search: SearchConfig,
    pub substrate: SubstrateConfig,
    pub queues: Vec<QueueConfig>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            log_level: "INFO".to_string(),
            log_in_json: false,
            worker_id: None,
            registry: RegistryConfig::default(),
            search: SearchConfig::default(),
            substrate: SubstrateConfig::default(),
            queues: default_queues(),
        }
    }
}

impl WorkerConfig {
    /// Load defaults, then `path` if given, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.with_env(std::env::vars())
    }

    /// Read a JSON file on top of the defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&contents).map_err(|e| {
            PipelineError::Config(format!("invalid config file {}: {}", path.display(), e))
        })?;
        tracing::info!("Loaded worker config from {}", path.display());
        Ok(config)
    }

    /// Overlay `DS_WORKER_*` variables from `vars`.
    ///
    /// Values are parsed as JSON when the target isn't a string, so
    /// `DS_WORKER_LOG_IN_JSON=true` sets a boolean and
    /// `DS_WORKER_QUEUES='[{"name": "cpu", "max_concurrency": 2}]'` a list.
    pub fn with_env<I>(self, vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut tree = serde_json::to_value(&self)?;
        let mut applied = 0;
        for (key, raw) in vars {
            let Some(path) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let path: Vec<String> = path
                .split(ENV_NESTED_DELIMITER)
                .map(str::to_lowercase)
                .collect();
            set_path(&mut tree, &path, &raw)
                .map_err(|e| PipelineError::Config(format!("{}: {}", key, e)))?;
            applied += 1;
        }
        if applied == 0 {
            return Ok(self);
        }
        tracing::debug!(applied, "Applied environment overrides");
        serde_json::from_value(tree)
            .map_err(|e| PipelineError::Config(format!("invalid environment override: {}", e)))
    }

    /// Reject settings no worker can run with.
    pub fn validate(&self) -> Result<()> {
        if self.queues.is_empty() {
            return Err(PipelineError::Config("no queue configured".to_string()));
        }
        let mut seen = HashSet::new();
        for queue in &self.queues {
            if queue.max_concurrency == 0 {
                return Err(PipelineError::Config(format!(
                    "queue {} needs a concurrency of at least one",
                    queue.name
                )));
            }
            if !seen.insert(queue.name.as_str()) {
                return Err(PipelineError::Config(format!(
                    "queue {} configured twice",
                    queue.name
                )));
            }
        }
        if self.search.default_page_size == 0 {
            return Err(PipelineError::Config(
                "search page size must be at least one".to_string(),
            ));
        }
        Ok(())
    }

    pub fn logging(&self) -> LoggingConfig {
        LoggingConfig {
            level: self.log_level.clone(),
            json: self.log_in_json,
            worker_id: self.worker_id.clone(),
        }
    }

    pub fn queue(&self, name: &str) -> Option<&QueueConfig> {
        self.queues.iter().find(|q| q.name == name)
    }
}

fn set_path(node: &mut Value, path: &[String], raw: &str) -> std::result::Result<(), String> {
    let Value::Object(map) = node else {
        return Err("not a section".to_string());
    };
    match path {
        [] => Err("empty key".to_string()),
        [last] => {
            // Strings and unset options take the raw text, the rest is parsed
            let value = match map.get(last) {
                Some(Value::String(_)) | Some(Value::Null) => Value::String(raw.to_string()),
                _ => serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())),
            };
            map.insert(last.clone(), value);
            Ok(())
        }
        [key, rest @ ..] => set_path(
            map.entry(key.clone())
                .or_insert_with(|| Value::Object(Default::default())),
            rest,
            raw,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.log_level, "INFO");
        assert_eq!(config.registry.url, "http://datashare:8080");
        assert_eq!(config.search.address, "http://localhost:9200");
        assert_eq!(config.search.default_page_size, 1000);
        assert_eq!(config.search.keep_alive, "10m");
        assert_eq!(config.substrate.namespace, "datashare-default");
        assert_eq!(config.queue("cpu").unwrap().max_concurrency, 4);
        assert_eq!(config.queue("translate-gpu").unwrap().max_concurrency, 1);
        tokio_test::assert_ok!(config.validate());
    }

    #[test]
    fn test_file_layer_keeps_missing_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"log_level": "DEBUG", "search": {{"default_page_size": 10}}}}"#
        )
        .unwrap();
        let config = WorkerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.log_level, "DEBUG");
        assert_eq!(config.search.default_page_size, 10);
        assert_eq!(config.search.timeout_s, 300);
        assert_eq!(config.queues.len(), 4);
    }

    #[test]
    fn test_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            WorkerConfig::from_file(file.path()),
            Err(PipelineError::Config(_))
        ));
        let dir = tempfile::tempdir().unwrap();
        assert!(WorkerConfig::from_file(&dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let config = WorkerConfig::default()
            .with_env(env(&[
                ("DS_WORKER_SEARCH__DEFAULT_PAGE_SIZE", "50"),
                ("DS_WORKER_LOG_IN_JSON", "true"),
                ("DS_WORKER_WORKER_ID", "worker-7"),
                ("DS_WORKER_REGISTRY__API_KEY", "1234"),
                ("DS_WORKER_SUBSTRATE__HOST", "localhost:7233"),
                ("OTHER_VAR", "ignored"),
            ]))
            .unwrap();
        assert_eq!(config.search.default_page_size, 50);
        assert!(config.log_in_json);
        assert_eq!(config.worker_id.as_deref(), Some("worker-7"));
        assert_eq!(config.registry.api_key.as_deref(), Some("1234"));
        assert_eq!(config.substrate.host, "localhost:7233");

        let logging = config.logging();
        assert!(logging.json);
        assert_eq!(logging.worker_id.as_deref(), Some("worker-7"));
    }

    #[test]
    fn test_env_queue_list() {
        let config = WorkerConfig::default()
            .with_env(env(&[(
                "DS_WORKER_QUEUES",
                r#"[{"name": "cpu", "max_concurrency": 2}]"#,
            )]))
            .unwrap();
        assert_eq!(config.queues, vec![QueueConfig::new("cpu", 2)]);
    }

    #[test]
    fn test_env_type_errors() {
        let err = WorkerConfig::default()
            .with_env(env(&[("DS_WORKER_SEARCH__DEFAULT_PAGE_SIZE", "many")]))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
        assert!(WorkerConfig::default()
            .with_env(env(&[("DS_WORKER_LOG_LEVEL__NESTED", "x")]))
            .is_err());
    }

    #[test]
    fn test_validate() {
        let mut config = WorkerConfig::default();
        config.queues.push(QueueConfig::new("cpu", 1));
        assert!(config.validate().is_err());

        config.queues = vec![QueueConfig::new("cpu", 0)];
        assert!(config.validate().is_err());

        config.queues.clear();
        assert!(config.validate().is_err());
    }
}
