//! Process configuration: TOML file, then environment overrides.

use crate::cache::CachePolicy;
use crate::classifier::{DEFAULT_RADIUS_KM, MAX_RADIUS_KM};
use crate::retriever::RetrievalConfig;
use crate::session::DEFAULT_MAX_TURNS;
use crate::types::ResourceBudget;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub classifier: ClassifierConfig,
    pub retrieval: RetrievalConfig,
    pub budget: ResourceBudget,
    pub cache: CachePolicy,
    pub session: SessionConfig,
    pub generation: GenerationConfig,
    pub fallback: FallbackConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Interval of the maintenance purge
    pub maintenance_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8081,
            maintenance_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Radius for coordinate queries that name none
    pub default_radius_km: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            default_radius_km: DEFAULT_RADIUS_KM,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub max_turns: usize,
    pub idle_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_turns: DEFAULT_MAX_TURNS,
            idle_timeout_secs: 1800,
        }
    }
}

/// One hosted OpenAI-compatible model in the chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub api_url: String,
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_model_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_model_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub segment_timeout_ms: u64,
    pub generation_timeout_ms: u64,
    /// Unclaimed streams are cancelled after this long
    pub stream_claim_timeout_secs: u64,
    /// Hosted models, tried in order before the extractive model
    pub models: Vec<ModelConfig>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            segment_timeout_ms: 15_000,
            generation_timeout_ms: 90_000,
            stream_claim_timeout_secs: 60,
            models: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackSourceKind {
    /// Built-in regional climatology documents
    KnowledgeBase,
    /// Unfiltered semantic search over the whole corpus
    Corpus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    pub source: FallbackSourceKind,
    pub escalation_timeout_ms: u64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            source: FallbackSourceKind::KnowledgeBase,
            escalation_timeout_ms: 3_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Remote index service; takes precedence over `corpus_path`
    pub service_url: Option<String>,
    /// JSON array of measurement records for the in-memory store
    pub corpus_path: Option<PathBuf>,
}

impl Config {
    /// Load from `path` (if given and present), then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load_from(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Environment overrides (highest priority)
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(port) = var("FLOATQUERY_PORT").and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
        if let Some(url) = var("CONTEXT_STORE_URL") {
            self.store.service_url = Some(url);
        }
        if let Some(path) = var("FLOATQUERY_CORPUS") {
            self.store.corpus_path = Some(PathBuf::from(path));
        }

        let api_key = var("LLM_API_KEY");
        if let Some(api_url) = var("LLM_API_URL") {
            let model = var("LLM_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string());
            self.generation.models.insert(
                0,
                ModelConfig {
                    api_url,
                    model,
                    api_key: api_key.clone(),
                    timeout_ms: default_model_timeout_ms(),
                },
            );
        }
        if let Some(key) = api_key {
            for model in self.generation.models.iter_mut().filter(|m| m.api_key.is_none()) {
                model.api_key = Some(key.clone());
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.budget.max_fragments == 0 || self.budget.max_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "budget.max_fragments and budget.max_bytes must be > 0".into(),
            ));
        }
        if self.retrieval.top_k == 0 {
            return Err(ConfigError::ValidationError("retrieval.top_k must be > 0".into()));
        }
        if self.retrieval.widen_multiplier <= 1.0 {
            return Err(ConfigError::ValidationError(
                "retrieval.widen_multiplier must be > 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retrieval.min_relevance) {
            return Err(ConfigError::ValidationError(
                "retrieval.min_relevance must be between 0.0 and 1.0".into(),
            ));
        }
        let weights = self.retrieval.weights;
        if weights.similarity < 0.0 || weights.exactness < 0.0 || weights.similarity + weights.exactness <= 0.0 {
            return Err(ConfigError::ValidationError(
                "retrieval.weights must be non-negative with a positive sum".into(),
            ));
        }
        if self.retrieval.store_timeout.is_zero() {
            return Err(ConfigError::ValidationError("retrieval.store_timeout_ms must be > 0".into()));
        }
        let cache = &self.cache;
        if cache.static_ttl.is_zero() || cache.volatile_ttl.is_zero() || cache.max_pending.is_zero() {
            return Err(ConfigError::ValidationError("cache TTLs must be > 0".into()));
        }
        if cache.volatile_ttl > cache.static_ttl {
            return Err(ConfigError::ValidationError(
                "cache.volatile_ttl_secs must not exceed cache.static_ttl_secs".into(),
            ));
        }
        if self.session.max_turns == 0 || self.session.idle_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "session.max_turns and session.idle_timeout_secs must be > 0".into(),
            ));
        }
        if self.generation.segment_timeout_ms == 0 || self.generation.generation_timeout_ms == 0 {
            return Err(ConfigError::ValidationError("generation timeouts must be > 0".into()));
        }
        if self.fallback.escalation_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "fallback.escalation_timeout_ms must be > 0".into(),
            ));
        }
        let radius = self.classifier.default_radius_km;
        if radius <= 0.0 || radius > MAX_RADIUS_KM {
            return Err(ConfigError::ValidationError(format!(
                "classifier.default_radius_km must be in (0, {}]",
                MAX_RADIUS_KM
            )));
        }
        Ok(())
    }

    pub fn segment_timeout(&self) -> Duration {
        Duration::from_millis(self.generation.segment_timeout_ms)
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_millis(self.generation.generation_timeout_ms)
    }

    pub fn escalation_timeout(&self) -> Duration {
        Duration::from_millis(self.fallback.escalation_timeout_ms)
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session.idle_timeout_secs)
    }

    pub fn stream_claim_timeout(&self) -> Duration {
        Duration::from_secs(self.generation.stream_claim_timeout_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.server.maintenance_interval_secs.max(1))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.port, 8081);
        assert_eq!(config.retrieval.min_relevance, 0.35);
        assert_eq!(config.budget.max_fragments, 8);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [retrieval]
            top_k = 50
            store_timeout_ms = 500

            [cache]
            volatile_ttl_secs = 60

            [[generation.models]]
            api_url = "https://api.example.com/v1"
            model = "ocean-large"
            "#,
        )
        .unwrap();
        assert_eq!(config.retrieval.top_k, 50);
        assert_eq!(config.retrieval.store_timeout, Duration::from_millis(500));
        assert_eq!(config.retrieval.widen_multiplier, 3.0);
        assert_eq!(config.cache.volatile_ttl, Duration::from_secs(60));
        assert_eq!(config.cache.static_ttl, Duration::from_secs(3600));
        assert_eq!(config.generation.models[0].timeout_ms, 30_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.cache.max_pending, config.cache.max_pending);
        assert_eq!(parsed.fallback.source, FallbackSourceKind::KnowledgeBase);
    }

    #[test]
    fn invalid_values_rejected() {
        let mut config = Config::default();
        config.retrieval.widen_multiplier = 1.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.cache.volatile_ttl = Duration::from_secs(7200);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.retrieval.min_relevance = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.budget.max_bytes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("FLOATQUERY_PORT", "9090"),
            ("CONTEXT_STORE_URL", "http://index:8083"),
            ("LLM_API_URL", "https://llm.example.com/v1"),
            ("LLM_API_KEY", "secret"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.server.port, 9090);
        assert_eq!(config.store.service_url.as_deref(), Some("http://index:8083"));
        assert_eq!(config.generation.models.len(), 1);
        assert_eq!(config.generation.models[0].model, "gpt-4o-mini");
        assert_eq!(config.generation.models[0].api_key.as_deref(), Some("secret"));
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let config = Config::load_from(Path::new("/nonexistent/floatquery.toml")).unwrap();
        assert_eq!(config.session.max_turns, DEFAULT_MAX_TURNS);
    }
}
