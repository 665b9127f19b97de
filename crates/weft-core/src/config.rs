use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WeftError};

/// Top-level configuration, usually loaded from `weft.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WeftConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Hard cap on supersteps per run. Exceeding it fails the run.
    #[serde(default = "default_max_supersteps")]
    pub max_supersteps: u64,
    /// Invoke the executors of one superstep concurrently.
    #[serde(default = "default_concurrent_dispatch")]
    pub concurrent_dispatch: bool,
    /// Bound invocations by the envelope's `timeout_ms`.
    #[serde(default = "default_enforce_message_timeouts")]
    pub enforce_message_timeouts: bool,
    /// Retry budget given to messages created by the runtime.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    /// Capacity of the streaming event channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_supersteps: default_max_supersteps(),
            concurrent_dispatch: default_concurrent_dispatch(),
            enforce_message_timeouts: default_enforce_message_timeouts(),
            default_max_retries: default_max_retries(),
            event_buffer: default_event_buffer(),
        }
    }
}

fn default_max_supersteps() -> u64 { 100 }
fn default_concurrent_dispatch() -> bool { true }
fn default_enforce_message_timeouts() -> bool { true }
fn default_max_retries() -> u32 { 3 }
fn default_event_buffer() -> usize { 256 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 0,
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_max_backoff_ms() -> u64 { 30_000 }

impl RetryConfig {
    /// Exponential backoff for the given attempt (0-based), with 0.8x to 1.2x jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let ms = self
            .initial_backoff_ms
            .saturating_mul(2u64.saturating_pow(attempt))
            .min(self.max_backoff_ms);
        if ms == 0 {
            return Duration::ZERO;
        }
        let jitter = 0.8 + rand::random::<f64>() * 0.4;
        Duration::from_millis((ms as f64 * jitter) as u64)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointStoreKind {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Capture a checkpoint after every superstep.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub store: CheckpointStoreKind,
    /// Database file for the sqlite store.
    #[serde(default)]
    pub path: Option<String>,
}

/// Telemetry settings handed to each run. There is no global switch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_span_name")]
    pub span_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            span_name: default_span_name(),
        }
    }
}

fn default_span_name() -> String { "weft.workflow".to_string() }

impl WeftConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| WeftError::ConfigNotFound(path.display().to_string()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self =
            toml::from_str(&expanded).map_err(|e| WeftError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.runtime.max_supersteps == 0 {
            return Err(WeftError::Config(
                "runtime.max_supersteps must be at least 1".into(),
            ));
        }
        if self.runtime.event_buffer == 0 {
            return Err(WeftError::Config(
                "runtime.event_buffer must be at least 1".into(),
            ));
        }
        if self.checkpoint.store == CheckpointStoreKind::Sqlite && self.checkpoint.path.is_none() {
            return Err(WeftError::Config(
                "checkpoint.path is required for the sqlite store".into(),
            ));
        }
        Ok(())
    }

    /// Resolve the sqlite checkpoint path (expand ~).
    pub fn checkpoint_path(&self) -> Option<PathBuf> {
        let path = self.checkpoint.path.as_deref()?;
        if let Some(rest) = path.strip_prefix("~/") {
            if let Ok(home) = std::env::var("HOME") {
                return Some(PathBuf::from(home).join(rest));
            }
        }
        Some(PathBuf::from(path))
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Unset variables stay literal
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
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
    fn test_expand_env_vars() {
        std::env::set_var("TEST_WEFT_VAR", "/tmp/cp.db");
        let result = expand_env_vars("path = \"${TEST_WEFT_VAR}\"");
        assert_eq!(result, "path = \"/tmp/cp.db\"");
        std::env::remove_var("TEST_WEFT_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_WEFT_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_WEFT_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config = WeftConfig::parse("").unwrap();
        assert_eq!(config.runtime.max_supersteps, 100);
        assert!(config.runtime.concurrent_dispatch);
        assert!(config.runtime.enforce_message_timeouts);
        assert_eq!(config.runtime.default_max_retries, 3);
        assert_eq!(config.runtime.event_buffer, 256);
        assert_eq!(config.retry.max_backoff_ms, 30_000);
        assert!(!config.checkpoint.enabled);
        assert_eq!(config.checkpoint.store, CheckpointStoreKind::Memory);
        assert!(!config.telemetry.enabled);
        assert_eq!(config.telemetry.span_name, "weft.workflow");
    }

    #[test]
    fn test_partial_sections() {
        let config = WeftConfig::parse(
            r#"
[runtime]
max_supersteps = 12
concurrent_dispatch = false

[checkpoint]
enabled = true
store = "sqlite"
path = "~/weft/checkpoints.db"
"#,
        )
        .unwrap();
        assert_eq!(config.runtime.max_supersteps, 12);
        assert!(!config.runtime.concurrent_dispatch);
        assert_eq!(config.runtime.default_max_retries, 3);
        assert_eq!(config.checkpoint.store, CheckpointStoreKind::Sqlite);
        assert!(config.checkpoint_path().is_some());
    }

    #[test]
    fn test_validate_rejects_zero_supersteps() {
        let err = WeftConfig::parse("[runtime]\nmax_supersteps = 0\n").unwrap_err();
        assert!(matches!(err, WeftError::Config(_)));
    }

    #[test]
    fn test_validate_requires_sqlite_path() {
        let err = WeftConfig::parse("[checkpoint]\nstore = \"sqlite\"\n").unwrap_err();
        assert!(err.to_string().contains("checkpoint.path"));
    }

    #[test]
    fn test_backoff_bounds() {
        let retry = RetryConfig {
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
        };
        let d = retry.backoff(0).as_millis() as u64;
        assert!((80..=120).contains(&d));
        let capped = retry.backoff(10).as_millis() as u64;
        assert!((800..=1_200).contains(&capped));
        assert_eq!(RetryConfig::default().backoff(3), Duration::ZERO);
    }

    #[test]
    fn test_load_missing_file() {
        let err = WeftConfig::load(Path::new("/nonexistent/weft.toml")).unwrap_err();
        assert!(matches!(err, WeftError::ConfigNotFound(_)));
    }
}
