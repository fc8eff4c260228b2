//! LLM client configuration.

use serde::{Deserialize, Serialize};

use crate::config::EnvSource;

/// LLM provider type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    /// OpenAI chat completions API (default)
    #[default]
    OpenAI,
    /// Google Gemini generateContent API
    Gemini,
}

impl LlmProvider {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Some(Self::OpenAI),
            "gemini" | "google" => Some(Self::Gemini),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAI => "openai",
            Self::Gemini => "gemini",
        }
    }

    /// Environment variables holding this provider's API key, in lookup order.
    pub fn api_key_vars(&self) -> &'static [&'static str] {
        match self {
            Self::OpenAI => &["OPENAI_API_KEY"],
            Self::Gemini => &["GOOGLE_API_KEY", "GEMINI_API_KEY"],
        }
    }

    fn default_endpoint(&self) -> &'static str {
        match self {
            Self::OpenAI => "https://api.openai.com",
            Self::Gemini => "https://generativelanguage.googleapis.com",
        }
    }

    fn default_model(&self) -> &'static str {
        match self {
            Self::OpenAI => "gpt-4o",
            Self::Gemini => "gemini-1.5-pro",
        }
    }
}

impl std::fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for LLM client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    /// LLM provider (openai or gemini)
    #[serde(default)]
    pub provider: LlmProvider,
    /// API endpoint (provider-specific default when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// API key for the selected provider
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    /// Model name (provider-specific default when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Maximum tokens in response
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Temperature for generation
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// HTTP timeout for a single completion request, in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_max_tokens() -> u32 {
    1500
}

fn default_temperature() -> f32 {
    0.2
}

fn default_request_timeout() -> u64 {
    300
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::default(),
            endpoint: None,
            api_key: None,
            model: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl LlmConfig {
    /// Apply environment variable overrides.
    ///
    /// Supported env vars:
    /// - `LLM_PROVIDER`: "openai" (default) or "gemini"
    /// - `LLM_ENDPOINT`: API base URL
    /// - `LLM_MODEL`: Model name
    /// - `LLM_API_KEY`: API key for whichever provider is selected
    /// - `OPENAI_API_KEY` / `GOOGLE_API_KEY` / `GEMINI_API_KEY`: provider keys
    /// - `MAX_TOKENS`: Maximum tokens in response
    /// - `TEMPERATURE`: Generation temperature
    /// - `LLM_TIMEOUT`: Request timeout in seconds
    ///
    /// The provider is resolved first so the matching key variable is read.
    pub fn with_env_overrides(mut self, env: &mut EnvSource<'_>) -> Self {
        if let Some(val) = env.string("LLM_PROVIDER") {
            match LlmProvider::from_str(&val) {
                Some(provider) => self.provider = provider,
                None => env.reject("LLM_PROVIDER", &val, "expected 'openai' or 'gemini'"),
            }
        }

        if let Some(endpoint) = env.string("LLM_ENDPOINT") {
            self.endpoint = Some(endpoint);
        }
        if let Some(model) = env.string("LLM_MODEL") {
            self.model = Some(model);
        }

        let provider_key = self
            .provider
            .api_key_vars()
            .iter()
            .find_map(|var| env.string(var));
        if let Some(key) = env.string("LLM_API_KEY").or(provider_key) {
            self.api_key = Some(key);
        }

        if let Some(n) = env.parse("MAX_TOKENS") {
            self.max_tokens = n;
        }
        if let Some(t) = env.parse("TEMPERATURE") {
            self.temperature = t;
        }
        if let Some(secs) = env.parse("LLM_TIMEOUT") {
            self.request_timeout_secs = secs;
        }
        self
    }

    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = Some(endpoint.to_string());
        self
    }

    pub fn with_api_key(mut self, key: &str) -> Self {
        self.api_key = Some(key.to_string());
        self
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = Some(model.to_string());
        self
    }

    /// Endpoint base URL without a trailing slash.
    pub fn endpoint(&self) -> &str {
        self.endpoint
            .as_deref()
            .unwrap_or_else(|| self.provider.default_endpoint())
            .trim_end_matches('/')
    }

    /// Model name, using the provider default when unset.
    pub fn model(&self) -> &str {
        self.model
            .as_deref()
            .unwrap_or_else(|| self.provider.default_model())
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_provider_defaults() {
        let config = LlmConfig::default();
        assert_eq!(config.provider, LlmProvider::OpenAI);
        assert_eq!(config.model(), "gpt-4o");
        assert_eq!(config.endpoint(), "https://api.openai.com");

        let gemini = LlmConfig {
            provider: LlmProvider::Gemini,
            ..LlmConfig::default()
        };
        assert_eq!(gemini.model(), "gemini-1.5-pro");
    }

    #[test]
    fn test_gemini_reads_google_key() {
        let vars = env_from(&[
            ("LLM_PROVIDER", "Gemini"),
            ("OPENAI_API_KEY", "sk-wrong"),
            ("GOOGLE_API_KEY", "g-key"),
        ]);
        let mut env = EnvSource::from_map(&vars);
        let config = LlmConfig::default().with_env_overrides(&mut env);
        assert_eq!(config.provider, LlmProvider::Gemini);
        assert_eq!(config.api_key.as_deref(), Some("g-key"));
        assert!(env.errors().is_empty());
    }

    #[test]
    fn test_invalid_values_are_reported() {
        let vars = env_from(&[("LLM_PROVIDER", "ollama"), ("TEMPERATURE", "warm")]);
        let mut env = EnvSource::from_map(&vars);
        let config = LlmConfig::default().with_env_overrides(&mut env);
        assert_eq!(config.provider, LlmProvider::OpenAI);
        assert_eq!(config.temperature, 0.2);
        assert_eq!(env.errors().len(), 2);
    }

    #[test]
    fn test_endpoint_trailing_slash() {
        let config = LlmConfig::default().with_endpoint("http://localhost:9000/");
        assert_eq!(config.endpoint(), "http://localhost:9000");
    }
}
