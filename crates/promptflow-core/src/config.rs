use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};

/// Top-level promptflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    /// Retry policy around provider calls. Absent = no retries.
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    #[serde(default)]
    pub history: Option<HistoryConfig>,
    #[serde(default)]
    pub provider: ProviderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Fail prompt nodes whose templates reference unbound variables,
    /// instead of rendering `[name]` placeholders.
    #[serde(default)]
    pub strict_variables: bool,
    /// Default concurrency for parallel ForEach loops.
    #[serde(default = "default_foreach_parallelism")]
    pub foreach_parallelism: usize,
    /// Longest list a ForEach node will iterate.
    #[serde(default = "default_max_foreach_items")]
    pub max_foreach_items: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            strict_variables: false,
            foreach_parallelism: default_foreach_parallelism(),
            max_foreach_items: default_max_foreach_items(),
        }
    }
}

fn default_foreach_parallelism() -> usize { 4 }
fn default_max_foreach_items() -> usize { 10_000 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Used when a batch is started without a positive concurrency.
    #[serde(default = "default_concurrency")]
    pub default_concurrency: usize,
    /// Capacity of the progress channel.
    #[serde(default = "default_progress_buffer")]
    pub progress_buffer: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            default_concurrency: default_concurrency(),
            progress_buffer: default_progress_buffer(),
        }
    }
}

fn default_concurrency() -> usize { 4 }
fn default_progress_buffer() -> usize { 64 }

/// Retry configuration for provider requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 500 }
fn default_max_backoff() -> u64 { 10_000 }

/// Where finished results are appended as JSONL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    pub dir: String,
}

impl HistoryConfig {
    /// Resolve the history directory (expand ~).
    pub fn dir_path(&self) -> PathBuf {
        if let Some(rest) = self.dir.strip_prefix("~/") {
            if let Some(home) = std::env::var_os("HOME") {
                return PathBuf::from(home).join(rest);
            }
        }
        PathBuf::from(&self.dir)
    }
}

/// Settings for the built-in dry-run provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Artificial delay per call, to exercise concurrency.
    #[serde(default)]
    pub echo_latency_ms: u64,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| FlowError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| FlowError::Config(e.to_string()))
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert!(!config.engine.strict_variables);
        assert_eq!(config.engine.foreach_parallelism, 4);
        assert_eq!(config.batch.default_concurrency, 4);
        assert_eq!(config.batch.progress_buffer, 64);
        assert!(config.retry.is_none());
        assert!(config.history.is_none());
    }

    #[test]
    fn unset_env_var_is_kept() {
        let out = expand_env_vars("dir = \"${PROMPTFLOW_SURELY_UNSET_VAR}\"");
        assert_eq!(out, "dir = \"${PROMPTFLOW_SURELY_UNSET_VAR}\"");
    }
}
