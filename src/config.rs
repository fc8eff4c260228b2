//! Configuration management for the analyst service.
//!
//! Settings are resolved in three layers: built-in defaults, an optional TOML
//! file, then environment variables (after `.env` has been loaded).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::LlmConfig;

/// Template written by `analyst env-example`.
pub const ENV_EXAMPLE: &str = r#"# Environment variables for the data analyst agent

# LLM configuration ('openai' or 'gemini')
LLM_PROVIDER=openai
OPENAI_API_KEY=sk-your-openai-api-key-here
GOOGLE_API_KEY=your-gemini-api-key-here
# LLM_MODEL=gpt-4o
# LLM_ENDPOINT=https://api.openai.com

# Knowledge store
RAG_PERSIST_DIRECTORY=./rag_data

# Context retrieval
CONTEXT_TOP_K=3
SIMILAR_INTERACTIONS_TOP_K=2

# Learning
SUCCESS_THRESHOLD=0.7
MIN_SUCCESS_SCORE=0.0
MAX_SUCCESS_SCORE=1.0

# Plan execution
EXECUTION_TIMEOUT=120
MAX_TOKENS=1500
TEMPERATURE=0.2

# Server
HOST=0.0.0.0
PORT=8000
MAX_UPLOAD_BYTES=10485760

# Logging
LOG_LEVEL=info
"#;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid configuration:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
}

/// Environment variable reader that records unparsable values instead of
/// silently dropping them.
pub struct EnvSource<'a> {
    lookup: Box<dyn Fn(&str) -> Option<String> + 'a>,
    errors: Vec<String>,
}

impl<'a> EnvSource<'a> {
    /// Read from the process environment.
    pub fn process() -> EnvSource<'static> {
        EnvSource {
            lookup: Box::new(|key: &str| std::env::var(key).ok()),
            errors: Vec::new(),
        }
    }

    /// Read from a map (used by tests and embedding callers).
    pub fn from_map(vars: &'a HashMap<String, String>) -> Self {
        Self {
            lookup: Box::new(move |key: &str| vars.get(key).cloned()),
            errors: Vec::new(),
        }
    }

    /// Non-empty string value of `key`.
    pub fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    /// Parsed value of `key`; parse failures are recorded.
    pub fn parse<T: FromStr>(&mut self, key: &str) -> Option<T> {
        let raw = self.string(key)?;
        match raw.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                self.reject(key, &raw, "not a valid number");
                None
            }
        }
    }

    pub fn reject(&mut self, key: &str, value: &str, reason: &str) {
        self.errors
            .push(format!("{}: invalid value '{}' ({})", key, value, reason));
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    fn into_errors(self) -> Vec<String> {
        self.errors
    }
}

/// Retrieval and learning settings for the knowledge store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RagSettings {
    /// Directory holding the knowledge store database.
    pub persist_directory: PathBuf,
    /// Number of knowledge-base entries injected into each prompt.
    pub context_top_k: usize,
    /// Number of past interactions considered for each prompt.
    pub similar_interactions_top_k: usize,
    /// Scores above this count as successful.
    pub success_threshold: f64,
    pub min_success_score: f64,
    pub max_success_score: f64,
}

impl Default for RagSettings {
    fn default() -> Self {
        Self {
            persist_directory: PathBuf::from("./rag_data"),
            context_top_k: 3,
            similar_interactions_top_k: 2,
            success_threshold: 0.7,
            min_success_score: 0.0,
            max_success_score: 1.0,
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Maximum accepted request body, in bytes.
    pub max_upload_bytes: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            max_upload_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub llm: LlmConfig,
    pub rag: RagSettings,
    pub server: ServerSettings,
    /// Upper bound on plan execution, in seconds.
    pub execution_timeout_secs: u64,
    /// Default log level when RUST_LOG is unset.
    pub log_level: String,
    /// Environment values that failed to parse; surfaced by `validate`.
    #[serde(skip)]
    env_errors: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            rag: RagSettings::default(),
            server: ServerSettings::default(),
            execution_timeout_secs: 120,
            log_level: "info".to_string(),
            env_errors: Vec::new(),
        }
    }
}

impl Settings {
    /// Load settings from an optional TOML file and the process environment.
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let base = match config_path {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };
        Ok(base.with_env_overrides(EnvSource::process()))
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Apply environment variable overrides on top of the current values.
    pub fn with_env_overrides(mut self, mut env: EnvSource<'_>) -> Self {
        self.llm = self.llm.with_env_overrides(&mut env);

        if let Some(dir) = env.string("RAG_PERSIST_DIRECTORY") {
            self.rag.persist_directory = PathBuf::from(dir);
        }
        if let Some(k) = env.parse("CONTEXT_TOP_K") {
            self.rag.context_top_k = k;
        }
        if let Some(k) = env.parse("SIMILAR_INTERACTIONS_TOP_K") {
            self.rag.similar_interactions_top_k = k;
        }
        if let Some(v) = env.parse("SUCCESS_THRESHOLD") {
            self.rag.success_threshold = v;
        }
        if let Some(v) = env.parse("MIN_SUCCESS_SCORE") {
            self.rag.min_success_score = v;
        }
        if let Some(v) = env.parse("MAX_SUCCESS_SCORE") {
            self.rag.max_success_score = v;
        }
        if let Some(secs) = env.parse("EXECUTION_TIMEOUT") {
            self.execution_timeout_secs = secs;
        }
        if let Some(host) = env.string("HOST") {
            self.server.host = host;
        }
        if let Some(port) = env.parse("PORT") {
            self.server.port = port;
        }
        if let Some(bytes) = env.parse("MAX_UPLOAD_BYTES") {
            self.server.max_upload_bytes = bytes;
        }
        if let Some(level) = env.string("LOG_LEVEL") {
            self.log_level = level.to_lowercase();
        }

        self.env_errors.extend(env.into_errors());
        self
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    /// Check every setting and report all problems at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = self.env_errors.clone();

        if !self.llm.has_api_key() {
            errors.push(format!(
                "{} is required for the {} provider",
                self.llm.provider.api_key_vars()[0],
                self.llm.provider
            ));
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            errors.push("TEMPERATURE must be between 0 and 2".to_string());
        }
        if self.rag.context_top_k < 1 {
            errors.push("CONTEXT_TOP_K must be >= 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.rag.success_threshold) {
            errors.push("SUCCESS_THRESHOLD must be between 0 and 1".to_string());
        }
        if self.rag.min_success_score > self.rag.max_success_score {
            errors.push("MIN_SUCCESS_SCORE must not exceed MAX_SUCCESS_SCORE".to_string());
        }
        if self.execution_timeout_secs < 10 {
            errors.push("EXECUTION_TIMEOUT must be >= 10 seconds".to_string());
        }
        if !matches!(
            self.log_level.as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            errors.push(format!("LOG_LEVEL: unknown level '{}'", self.log_level));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    /// Human-readable configuration summary. API keys are never printed.
    pub fn summary(&self) -> Vec<(&'static str, String)> {
        vec![
            ("LLM provider", self.llm.provider.to_string()),
            ("LLM model", self.llm.model().to_string()),
            (
                "API key",
                if self.llm.has_api_key() {
                    "configured".to_string()
                } else {
                    "missing".to_string()
                },
            ),
            (
                "Persist directory",
                self.rag.persist_directory.display().to_string(),
            ),
            ("Context top-k", self.rag.context_top_k.to_string()),
            (
                "Similar interactions top-k",
                self.rag.similar_interactions_top_k.to_string(),
            ),
            ("Success threshold", self.rag.success_threshold.to_string()),
            (
                "Execution timeout",
                format!("{}s", self.execution_timeout_secs),
            ),
            (
                "Server",
                format!("{}:{}", self.server.host, self.server.port),
            ),
            ("Log level", self.log_level.clone()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmProvider;

    fn settings_from(pairs: &[(&str, &str)]) -> Settings {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::default().with_env_overrides(EnvSource::from_map(&vars))
    }

    #[test]
    fn test_defaults_need_only_a_key() {
        let settings = settings_from(&[("OPENAI_API_KEY", "sk-test")]);
        assert!(settings.validate().is_ok());
        assert_eq!(settings.server.port, 8000);
        assert_eq!(settings.rag.context_top_k, 3);
        assert_eq!(settings.execution_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let settings = settings_from(&[
            ("CONTEXT_TOP_K", "0"),
            ("SUCCESS_THRESHOLD", "1.5"),
            ("EXECUTION_TIMEOUT", "5"),
            ("PORT", "eighty"),
        ]);
        match settings.validate() {
            Err(ConfigError::Invalid(errors)) => {
                assert_eq!(errors.len(), 5, "{errors:?}");
                assert!(errors.iter().any(|e| e.starts_with("PORT")));
                assert!(errors.iter().any(|e| e.contains("OPENAI_API_KEY")));
            }
            other => panic!("expected invalid config, got {other:?}"),
        }
    }

    #[test]
    fn test_env_overrides_toml() {
        let base = Settings::from_toml_str(
            r#"
            execution_timeout_secs = 60

            [llm]
            provider = "gemini"
            api_key = "from-file"

            [rag]
            context_top_k = 5

            [server]
            port = 9000
            "#,
        )
        .unwrap();
        assert_eq!(base.llm.provider, LlmProvider::Gemini);
        assert_eq!(base.rag.context_top_k, 5);
        assert_eq!(base.rag.similar_interactions_top_k, 2);

        let vars: HashMap<String, String> = [("PORT", "9100"), ("GOOGLE_API_KEY", "from-env")]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let settings = base.with_env_overrides(EnvSource::from_map(&vars));
        assert_eq!(settings.server.port, 9100);
        assert_eq!(settings.execution_timeout_secs, 60);
        assert_eq!(settings.llm.api_key.as_deref(), Some("from-env"));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_summary_hides_key() {
        let settings = settings_from(&[("OPENAI_API_KEY", "sk-secret")]);
        let rendered: String = settings
            .summary()
            .iter()
            .map(|(k, v)| format!("{k}: {v}\n"))
            .collect();
        assert!(rendered.contains("configured"));
        assert!(!rendered.contains("sk-secret"));
    }
}
