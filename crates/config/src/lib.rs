//! Configuration loading, validation, and management for nestling.
//!
//! Loads configuration from `~/.nestling/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The root configuration structure.
///
/// Maps directly to `~/.nestling/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Language-model and embedding service settings
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Similarity search settings
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Context assembly budgets and windows
    #[serde(default)]
    pub context: ContextConfig,

    /// Generation deadline and retry policy
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Response cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Background detail indexing
    #[serde(default)]
    pub indexer: IndexerConfig,

    /// Answer post-processing
    #[serde(default)]
    pub safety: SafetyConfig,

    /// HTTP gateway
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Persistent storage
    #[serde(default)]
    pub storage: StorageConfig,

    /// Models advertised by `GET /v1/models`
    #[serde(default = "default_models")]
    pub models: Vec<ModelInfo>,
}

fn default_true() -> bool {
    true
}

/// Redact a secret for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

// --- provider ---

/// Which embedder backs indexing and query-time embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    /// The remote `/embeddings` endpoint of the configured provider.
    Remote,
    /// Local feature-hashing embedder; no network needed.
    Local,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Default chat model
    #[serde(default = "default_chat_model")]
    pub chat_model: String,

    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    #[serde(default = "default_embedding_backend")]
    pub embedding_backend: EmbeddingBackend,

    /// Dimension used by the local embedder
    #[serde(default = "default_local_dimensions")]
    pub local_dimensions: usize,

    /// Inputs per `/embeddings` call
    #[serde(default = "default_embedding_batch")]
    pub embedding_batch_size: usize,

    /// Sent as `HTTP-Referer` for OpenRouter attribution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_referer: Option<String>,

    /// Sent as `X-Title` for OpenRouter attribution
    #[serde(default = "default_app_title")]
    pub app_title: String,
}

fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".into()
}
fn default_chat_model() -> String {
    "google/gemini-flash-1.5-8b".into()
}
fn default_embedding_model() -> String {
    "openai/text-embedding-3-small".into()
}
fn default_embedding_backend() -> EmbeddingBackend {
    EmbeddingBackend::Remote
}
fn default_local_dimensions() -> usize {
    256
}
fn default_embedding_batch() -> usize {
    20
}
fn default_app_title() -> String {
    "Nestling".into()
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            chat_model: default_chat_model(),
            embedding_model: default_embedding_model(),
            embedding_backend: default_embedding_backend(),
            local_dimensions: default_local_dimensions(),
            embedding_batch_size: default_embedding_batch(),
            http_referer: None,
            app_title: default_app_title(),
        }
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &redact(&self.api_key))
            .field("chat_model", &self.chat_model)
            .field("embedding_model", &self.embedding_model)
            .field("embedding_backend", &self.embedding_backend)
            .field("local_dimensions", &self.local_dimensions)
            .field("embedding_batch_size", &self.embedding_batch_size)
            .field("http_referer", &self.http_referer)
            .field("app_title", &self.app_title)
            .finish()
    }
}

// --- retrieval ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Top-k child-detail facts per question
    #[serde(default = "default_k_details")]
    pub k_details: usize,

    /// Top-k shared knowledge segments per question
    #[serde(default = "default_k_knowledge")]
    pub k_knowledge: usize,

    /// Budget for embedding + vector search before degrading to empty
    #[serde(default = "default_retrieval_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_k_details() -> usize {
    5
}
fn default_k_knowledge() -> usize {
    4
}
fn default_retrieval_timeout_ms() -> u64 {
    3_000
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k_details: default_k_details(),
            k_knowledge: default_k_knowledge(),
            timeout_ms: default_retrieval_timeout_ms(),
        }
    }
}

impl RetrievalConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// --- context ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Token budget for the assembled context sections
    #[serde(default = "default_context_tokens")]
    pub max_context_tokens: usize,

    /// Token budget for the whole composed prompt
    #[serde(default = "default_prompt_tokens")]
    pub max_prompt_tokens: usize,

    /// Most recent growth records to include
    #[serde(default = "default_records_window")]
    pub records_window: usize,

    /// Growth records older than this are not considered
    #[serde(default = "default_records_lookback_days")]
    pub records_lookback_days: i64,

    /// Prior Q&A turns to include, selected by relevance
    #[serde(default = "default_prior_qa_window")]
    pub prior_qa_window: usize,

    /// Prior turns scanned for relevance
    #[serde(default = "default_prior_qa_scan")]
    pub prior_qa_scan: usize,

    /// Chat history turns per session fed to the prompt
    #[serde(default = "default_history_window")]
    pub history_window: usize,
}

fn default_context_tokens() -> usize {
    2_000
}
fn default_prompt_tokens() -> usize {
    3_500
}
fn default_records_window() -> usize {
    10
}
fn default_records_lookback_days() -> i64 {
    90
}
fn default_prior_qa_window() -> usize {
    3
}
fn default_prior_qa_scan() -> usize {
    50
}
fn default_history_window() -> usize {
    10
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: default_context_tokens(),
            max_prompt_tokens: default_prompt_tokens(),
            records_window: default_records_window(),
            records_lookback_days: default_records_lookback_days(),
            prior_qa_window: default_prior_qa_window(),
            prior_qa_scan: default_prior_qa_scan(),
            history_window: default_history_window(),
        }
    }
}

// --- generation ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Per-request deadline covering retrieval + generation
    #[serde(default = "default_request_deadline_ms")]
    pub request_deadline_ms: u64,

    /// Timeout of a single model call
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_request_deadline_ms() -> u64 {
    30_000
}
fn default_attempt_timeout_ms() -> u64 {
    20_000
}
fn default_max_retries() -> u32 {
    2
}
fn default_backoff_base_ms() -> u64 {
    250
}
fn default_backoff_max_ms() -> u64 {
    4_000
}
fn default_max_tokens() -> u32 {
    1_024
}
fn default_temperature() -> f32 {
    0.7
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            request_deadline_ms: default_request_deadline_ms(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

impl GenerationConfig {
    pub fn request_deadline(&self) -> Duration {
        Duration::from_millis(self.request_deadline_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

// --- cache ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_cache_ttl_secs() -> u64 {
    3_600
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

// --- indexer ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Attempts per job before leaving it to the reconcile sweep
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_indexer_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_indexer_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Interval of the stale/orphan reconcile sweep
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,

    /// Details examined per reconcile sweep
    #[serde(default = "default_reconcile_batch")]
    pub reconcile_batch: usize,
}

fn default_queue_capacity() -> usize {
    1_024
}
fn default_max_attempts() -> u32 {
    5
}
fn default_indexer_backoff_base_ms() -> u64 {
    500
}
fn default_indexer_backoff_max_ms() -> u64 {
    30_000
}
fn default_reconcile_interval_secs() -> u64 {
    60
}
fn default_reconcile_batch() -> usize {
    200
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_indexer_backoff_base_ms(),
            backoff_max_ms: default_indexer_backoff_max_ms(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            reconcile_batch: default_reconcile_batch(),
        }
    }
}

// --- safety ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Words that mark an answer as clinical and trigger the disclaimer
    #[serde(default = "default_clinical_terms")]
    pub clinical_terms: Vec<String>,

    /// Words replaced with `[redacted]`
    #[serde(default)]
    pub redacted_terms: Vec<String>,

    #[serde(default = "default_disclaimer")]
    pub disclaimer: String,

    #[serde(default = "default_footer")]
    pub footer: String,
}

fn default_clinical_terms() -> Vec<String> {
    [
        "diagnosis",
        "diagnose",
        "fever",
        "medication",
        "medicine",
        "dosage",
        "dose",
        "prescription",
        "antibiotic",
        "infection",
        "symptom",
        "symptoms",
        "rash",
        "vaccine",
        "allergy",
        "allergic",
        "seizure",
        "dehydration",
        "ibuprofen",
        "acetaminophen",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
fn default_disclaimer() -> String {
    "This is general information, not medical advice. Please consult your pediatrician or another healthcare professional about your child's health.".into()
}
fn default_footer() -> String {
    "Every child develops at their own pace. If something worries you, trust your instincts and reach out to a professional.".into()
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            clinical_terms: default_clinical_terms(),
            redacted_terms: Vec::new(),
            disclaimer: default_disclaimer(),
            footer: default_footer(),
        }
    }
}

// --- gateway ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,

    /// Maximum request body in bytes
    #[serde(default = "default_body_limit")]
    pub body_limit: usize,
}

fn default_port() -> u16 {
    8080
}
fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_body_limit() -> usize {
    256 * 1024
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            body_limit: default_body_limit(),
        }
    }
}

// --- storage ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database path, or `:memory:` for in-process stores
    #[serde(default = "default_database")]
    pub database: String,
}

fn default_database() -> String {
    ":memory:".into()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
        }
    }
}

impl StorageConfig {
    pub fn is_in_memory(&self) -> bool {
        self.database == ":memory:"
    }
}

// --- models ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub provider: String,
    #[serde(default)]
    pub description: String,
}

fn default_models() -> Vec<ModelInfo> {
    let model = |id: &str, name: &str, provider: &str, description: &str| ModelInfo {
        id: id.into(),
        name: name.into(),
        provider: provider.into(),
        description: description.into(),
    };
    vec![
        model(
            "google/gemini-flash-1.5-8b",
            "Gemini Flash 1.5 8B",
            "Google",
            "Fast, low-cost default for everyday questions",
        ),
        model(
            "openai/gpt-4o-mini",
            "GPT-4o Mini",
            "OpenAI",
            "Smaller, faster, and more affordable version of GPT-4o",
        ),
        model(
            "anthropic/claude-3-sonnet",
            "Claude 3 Sonnet",
            "Anthropic",
            "Balanced model for most tasks",
        ),
        model(
            "anthropic/claude-3-haiku",
            "Claude 3 Haiku",
            "Anthropic",
            "Fast and efficient model for simpler tasks",
        ),
    ]
}

impl AppConfig {
    /// Load configuration from the default location with env var overrides.
    ///
    /// Priority: env vars > config file > defaults
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
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

    /// Apply environment variable overrides (highest priority).
    pub fn apply_env(&mut self) {
        if self.provider.api_key.is_none() {
            self.provider.api_key = std::env::var("NESTLING_API_KEY")
                .ok()
                .or_else(|| std::env::var("OPENROUTER_API_KEY").ok());
        }

        if let Ok(model) = std::env::var("NESTLING_MODEL") {
            self.provider.chat_model = model;
        }

        if let Ok(database) = std::env::var("NESTLING_DATABASE") {
            self.storage.database = database;
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".nestling")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let g = &self.generation;
        if !(0.0..=2.0).contains(&g.temperature) {
            return Err(ConfigError::ValidationError(
                "generation.temperature must be between 0.0 and 2.0".into(),
            ));
        }
        if g.request_deadline_ms == 0 || g.attempt_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "generation deadlines must be > 0".into(),
            ));
        }
        if g.backoff_base_ms > g.backoff_max_ms {
            return Err(ConfigError::ValidationError(
                "generation.backoff_base_ms must not exceed backoff_max_ms".into(),
            ));
        }

        if self.retrieval.k_details == 0 && self.retrieval.k_knowledge == 0 {
            return Err(ConfigError::ValidationError(
                "retrieval needs k_details or k_knowledge > 0".into(),
            ));
        }

        if self.context.max_prompt_tokens < self.context.max_context_tokens {
            return Err(ConfigError::ValidationError(
                "context.max_prompt_tokens must be >= max_context_tokens".into(),
            ));
        }

        if self.indexer.queue_capacity == 0 || self.indexer.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "indexer.queue_capacity and max_attempts must be > 0".into(),
            ));
        }

        if self.provider.embedding_batch_size == 0 || self.provider.local_dimensions == 0 {
            return Err(ConfigError::ValidationError(
                "provider.embedding_batch_size and local_dimensions must be > 0".into(),
            ));
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.provider.api_key.is_some()
    }

    /// Generate a default config TOML string (for `init-config`).
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
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

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.provider.chat_model, "google/gemini-flash-1.5-8b");
        assert_eq!(config.provider.embedding_batch_size, 20);
        assert_eq!(config.generation.max_retries, 2);
        assert_eq!(config.cache.ttl(), Duration::from_secs(3600));
        assert_eq!(config.context.history_window, 10);
        assert!(config.storage.is_in_memory());
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.provider.chat_model, config.provider.chat_model);
        assert_eq!(parsed.gateway.port, config.gateway.port);
        assert_eq!(parsed.models, config.models);
    }

    #[test]
    fn invalid_temperature_rejected() {
        let mut config = AppConfig::default();
        config.generation.temperature = 5.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn inverted_backoff_rejected() {
        let mut config = AppConfig::default();
        config.generation.backoff_base_ms = 10_000;
        config.generation.backoff_max_ms = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let result = AppConfig::load_from(Path::new("/nonexistent/config.toml"));
        let config = result.unwrap();
        assert_eq!(config.provider.base_url, "https://openrouter.ai/api/v1");
    }

    #[test]
    fn partial_file_keeps_defaults_for_other_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[provider]
chat_model = "openai/gpt-4o-mini"
embedding_backend = "local"

[safety]
redacted_terms = ["secret-word"]
"#,
        )
        .unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.provider.chat_model, "openai/gpt-4o-mini");
        assert_eq!(config.provider.embedding_backend, EmbeddingBackend::Local);
        assert_eq!(config.safety.redacted_terms, vec!["secret-word"]);
        assert!(!config.safety.clinical_terms.is_empty());
        assert_eq!(config.retrieval.k_details, 5);
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[provider\nchat_model = ").unwrap();
        assert!(matches!(
            AppConfig::load_from(&path),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn api_key_is_redacted_in_debug() {
        let mut config = AppConfig::default();
        config.provider.api_key = Some("sk-or-very-secret".into());
        let debug = format!("{config:?}");
        assert!(!debug.contains("very-secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = AppConfig::default_toml();
        assert!(toml_str.contains("openrouter.ai"));
        assert!(toml_str.contains("[generation]"));
    }
}
