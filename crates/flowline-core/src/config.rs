use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};

/// Top-level Flowline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub conditions: ConditionSettings,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Execution-context and orchestrator limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Loop-backs allowed per (path, node) before LoopLimitExceeded.
    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: u32,
    /// How long an agent task may run before it is failed.
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    /// Retries an operator may request for one failed node.
    #[serde(default = "default_max_node_retries")]
    pub max_node_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_loop_iterations: default_max_loop_iterations(),
            task_timeout_secs: default_task_timeout_secs(),
            max_node_retries: default_max_node_retries(),
        }
    }
}

fn default_max_loop_iterations() -> u32 { 10 }
fn default_task_timeout_secs() -> u64 { 300 }
fn default_max_node_retries() -> u32 { 3 }

/// Context cache, persistence and health-check settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_max_contexts")]
    pub max_contexts: usize,
    /// Idle contexts older than this are persisted and dropped.
    #[serde(default = "default_context_ttl_secs")]
    pub context_ttl_secs: u64,
    #[serde(default = "default_persist_interval_secs")]
    pub persist_interval_secs: u64,
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    /// Recently recovered contexts are not judged by the health check.
    #[serde(default = "default_recovery_grace_secs")]
    pub recovery_grace_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_contexts: default_max_contexts(),
            context_ttl_secs: default_context_ttl_secs(),
            persist_interval_secs: default_persist_interval_secs(),
            health_check_interval_secs: default_health_check_interval_secs(),
            recovery_grace_secs: default_recovery_grace_secs(),
        }
    }
}

fn default_max_contexts() -> usize { 1000 }
fn default_context_ttl_secs() -> u64 { 3600 }
fn default_persist_interval_secs() -> u64 { 30 }
fn default_health_check_interval_secs() -> u64 { 300 }
fn default_recovery_grace_secs() -> u64 { 180 }

/// Sandbox limits for `expression` and `script` conditions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionSettings {
    #[serde(default = "default_script_timeout_ms")]
    pub script_timeout_ms: u64,
    #[serde(default = "default_max_operations")]
    pub max_operations: u64,
}

impl Default for ConditionSettings {
    fn default() -> Self {
        Self {
            script_timeout_ms: default_script_timeout_ms(),
            max_operations: default_max_operations(),
        }
    }
}

fn default_script_timeout_ms() -> u64 { 1000 }
fn default_max_operations() -> u64 { 100_000 }

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    #[default]
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            database_path: default_database_path(),
        }
    }
}

fn default_database_path() -> String { "~/.flowline/flowline.db".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `tracing_subscriber` filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String { "flowline=info,warn".to_string() }

impl AppConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| FlowError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| FlowError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall or disable the engine.
    pub fn validate(&self) -> Result<()> {
        if self.registry.max_contexts == 0 {
            return Err(FlowError::Config("registry.max_contexts must be > 0".into()));
        }
        if self.registry.persist_interval_secs == 0 {
            return Err(FlowError::Config(
                "registry.persist_interval_secs must be > 0".into(),
            ));
        }
        if self.registry.health_check_interval_secs == 0 {
            return Err(FlowError::Config(
                "registry.health_check_interval_secs must be > 0".into(),
            ));
        }
        if self.engine.task_timeout_secs == 0 {
            return Err(FlowError::Config("engine.task_timeout_secs must be > 0".into()));
        }
        Ok(())
    }

    /// Resolve the SQLite database path (expand ~).
    pub fn database_path(&self) -> PathBuf {
        let path = &self.storage.database_path;
        if let Some(rest) = path.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(path)
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
