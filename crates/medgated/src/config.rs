//! Configuration management for medgated.
//!
//! Loads settings from /etc/medgate/config.toml (or the path in
//! `MEDGATE_CONFIG`) and falls back to built-in defaults. Every field has a
//! default, so a partial file only overrides what it names.

use medgate_shared::audit::AUDIT_RETENTION_DAYS;
use medgate_shared::policy::{ModelPolicy, MODEL_CLAUDE, MODEL_GEMINI, MODEL_GPT4O, MODEL_LOCAL};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Config file path
pub const CONFIG_PATH: &str = "/etc/medgate/config.toml";

/// Environment variable overriding the config path
pub const CONFIG_ENV: &str = "MEDGATE_CONFIG";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid policy: {0}")]
    Policy(String),

    #[error("Invalid setting: {0}")]
    Invalid(String),
}

// ============================================================================
// Server
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address; localhost by default
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Largest batch accepted over HTTP
    #[serde(default = "default_max_batch")]
    pub max_batch_size: usize,
}

fn default_bind_addr() -> String {
    "127.0.0.1:7870".to_string()
}

fn default_max_batch() -> usize {
    100
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            max_batch_size: default_max_batch(),
        }
    }
}

// ============================================================================
// Execution
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Per-attempt timeout when the request sets none
    #[serde(default = "default_attempt_timeout")]
    pub default_timeout_ms: u64,

    /// Simultaneous in-flight calls for batch processing
    #[serde(default = "default_batch_concurrency")]
    pub batch_concurrency: usize,
}

fn default_attempt_timeout() -> u64 {
    30_000
}

fn default_batch_concurrency() -> usize {
    3
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_attempt_timeout(),
            batch_concurrency: default_batch_concurrency(),
        }
    }
}

impl ExecutionConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

// ============================================================================
// Sessions
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_idle_ttl")]
    pub idle_ttl_secs: u64,

    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Prior turns injected into the next prompt
    #[serde(default = "default_context_turns")]
    pub context_turns: usize,

    /// Characters kept per side of a turn excerpt
    #[serde(default = "default_excerpt_chars")]
    pub excerpt_chars: usize,
}

fn default_idle_ttl() -> u64 {
    1800
}

fn default_max_sessions() -> usize {
    10_000
}

fn default_context_turns() -> usize {
    3
}

fn default_excerpt_chars() -> usize {
    200
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_ttl_secs: default_idle_ttl(),
            max_sessions: default_max_sessions(),
            context_turns: default_context_turns(),
            excerpt_chars: default_excerpt_chars(),
        }
    }
}

// ============================================================================
// Audit
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_retention_days")]
    pub retention_days: i64,

    /// JSONL file receiving records the store could not accept
    #[serde(default = "default_journal_path")]
    pub journal_path: PathBuf,

    #[serde(default = "default_write_retries")]
    pub write_retries: u32,

    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,

    /// Upper bound on one store write; a slower write counts as failed
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,

    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/medgate/audit.db")
}

fn default_retention_days() -> i64 {
    AUDIT_RETENTION_DAYS
}

fn default_journal_path() -> PathBuf {
    PathBuf::from("/var/lib/medgate/audit-nearmiss.jsonl")
}

fn default_write_retries() -> u32 {
    3
}

fn default_retry_backoff() -> u64 {
    100
}

fn default_write_timeout() -> u64 {
    2000
}

fn default_maintenance_interval() -> u64 {
    3600
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            retention_days: default_retention_days(),
            journal_path: default_journal_path(),
            write_retries: default_write_retries(),
            retry_backoff_ms: default_retry_backoff(),
            write_timeout_ms: default_write_timeout(),
            maintenance_interval_secs: default_maintenance_interval(),
        }
    }
}

// ============================================================================
// Providers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Ollama native `/api/generate`
    Ollama,
    /// `/chat/completions` under the configured base URL
    OpenaiCompatible,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub kind: BackendKind,
    pub endpoint: String,
    /// Model name understood by the backend
    pub model: String,
    /// Environment variable holding the API key, if the backend needs one
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

fn default_providers() -> BTreeMap<String, ProviderConfig> {
    let mut providers = BTreeMap::new();
    providers.insert(
        MODEL_GPT4O.to_string(),
        ProviderConfig {
            kind: BackendKind::OpenaiCompatible,
            endpoint: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o".to_string(),
            api_key_env: Some("OPENAI_API_KEY".to_string()),
            temperature: Some(0.2),
        },
    );
    providers.insert(
        MODEL_CLAUDE.to_string(),
        ProviderConfig {
            kind: BackendKind::OpenaiCompatible,
            endpoint: "https://api.anthropic.com/v1".to_string(),
            model: "claude-3-5-sonnet-latest".to_string(),
            api_key_env: Some("ANTHROPIC_API_KEY".to_string()),
            temperature: Some(0.2),
        },
    );
    providers.insert(
        MODEL_GEMINI.to_string(),
        ProviderConfig {
            kind: BackendKind::OpenaiCompatible,
            endpoint: "https://generativelanguage.googleapis.com/v1beta/openai".to_string(),
            model: "gemini-1.5-pro".to_string(),
            api_key_env: Some("GEMINI_API_KEY".to_string()),
            temperature: Some(0.2),
        },
    );
    providers.insert(
        MODEL_LOCAL.to_string(),
        ProviderConfig {
            kind: BackendKind::Ollama,
            endpoint: "http://127.0.0.1:11434".to_string(),
            model: "llama3:8b-instruct".to_string(),
            api_key_env: None,
            temperature: Some(0.2),
        },
    );
    providers
}

// ============================================================================
// Full config
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub audit: AuditConfig,

    /// Model family -> backend
    #[serde(default = "default_providers")]
    pub providers: BTreeMap<String, ProviderConfig>,

    #[serde(default)]
    pub policy: ModelPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            execution: ExecutionConfig::default(),
            session: SessionConfig::default(),
            audit: AuditConfig::default(),
            providers: default_providers(),
            policy: ModelPolicy::default(),
        }
    }
}

impl Config {
    /// Path to load from: `MEDGATE_CONFIG` if set, else the system path
    pub fn path() -> PathBuf {
        std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(CONFIG_PATH))
    }

    /// Load config from file, or return defaults
    pub fn load() -> Self {
        let path = Self::path();
        Self::load_from_path(&path).unwrap_or_else(|e| {
            warn!("Config not loaded ({}), using defaults", e);
            Config::default()
        })
    }

    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&content)?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Startup checks; the daemon refuses to start on failure
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.policy.validate().map_err(ConfigError::Policy)?;
        if self.execution.batch_concurrency == 0 {
            return Err(ConfigError::Invalid("execution.batch_concurrency must be positive".into()));
        }
        if self.execution.default_timeout_ms == 0 {
            return Err(ConfigError::Invalid("execution.default_timeout_ms must be positive".into()));
        }
        if self.session.max_sessions == 0 {
            return Err(ConfigError::Invalid("session.max_sessions must be positive".into()));
        }
        if self.audit.retention_days <= 0 {
            return Err(ConfigError::Invalid("audit.retention_days must be positive".into()));
        }
        for model in self.policy.models.keys() {
            if !self.providers.contains_key(model) {
                warn!("Model '{}' has no provider configured; attempts on it will fail", model);
            }
        }
        Ok(())
    }
}
