//! Global configuration for indexing, embedding, retrieval defaults and the
//! job worker.
//!
//! Every group has sensible defaults, can be overlaid from `KB_*` environment
//! variables, and is checked by `validate()` before use. Unparseable
//! environment values are ignored in favour of the default.

use crate::error::ConfigError;
use crate::rag_config::RagMode;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_CHUNK_SIZE: usize = 1_000;
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;
pub const DEFAULT_MAX_FILE_SIZE_BYTES: u64 = 10 * 1024 * 1024;
pub const DEFAULT_EMBEDDING_CONCURRENCY: usize = 4;

pub const DEFAULT_EMBEDDING_MODEL: &str = "nomic-embed-text";
pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 768;
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

pub const DEFAULT_TOP_K: usize = 5;
pub const DEFAULT_MAX_TOP_K: usize = 20;
pub const DEFAULT_MIN_SIMILARITY: f32 = 0.3;

pub const INDEX_FILE_QUEUE: &str = "index-file";
pub const DEFAULT_POLLING_INTERVAL_SECS: u64 = 2;
pub const DEFAULT_BATCH_SIZE: usize = 1;

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env_value(key).and_then(|value| value.parse::<T>().ok())
}

fn env_list(key: &str) -> Option<Vec<String>> {
    env_value(key).map(|value| value.split(',').map(|tag| tag.to_string()).collect())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub max_file_size_bytes: u64,
    /// Upper bound on embedding requests in flight for one file.
    pub embedding_concurrency: usize,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            max_file_size_bytes: DEFAULT_MAX_FILE_SIZE_BYTES,
            embedding_concurrency: DEFAULT_EMBEDDING_CONCURRENCY,
        }
    }
}

impl IndexingConfig {
    /// | Variable | Default |
    /// |----------|---------|
    /// | `KB_CHUNK_SIZE` | `1000` |
    /// | `KB_CHUNK_OVERLAP` | `200` |
    /// | `KB_MAX_FILE_SIZE_BYTES` | `10485760` |
    /// | `KB_EMBEDDING_CONCURRENCY` | `4` |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            chunk_size: env_parse("KB_CHUNK_SIZE").unwrap_or(defaults.chunk_size),
            chunk_overlap: env_parse("KB_CHUNK_OVERLAP").unwrap_or(defaults.chunk_overlap),
            max_file_size_bytes: env_parse("KB_MAX_FILE_SIZE_BYTES")
                .unwrap_or(defaults.max_file_size_bytes),
            embedding_concurrency: env_parse("KB_EMBEDDING_CONCURRENCY")
                .unwrap_or(defaults.embedding_concurrency),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid {
                field: "chunk_size",
                details: "must be greater than zero".to_string(),
            });
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(ConfigError::Invalid {
                field: "chunk_overlap",
                details: format!(
                    "overlap {} must be smaller than chunk size {}",
                    self.chunk_overlap, self.chunk_size
                ),
            });
        }
        if self.max_file_size_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "max_file_size_bytes",
                details: "must be greater than zero".to_string(),
            });
        }
        if self.embedding_concurrency == 0 {
            return Err(ConfigError::Invalid {
                field: "embedding_concurrency",
                details: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum EmbeddingProviderKind {
    Ollama,
    OpenaiCompatible,
    Local,
}

impl FromStr for EmbeddingProviderKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "openai" | "openai-compatible" => Ok(Self::OpenaiCompatible),
            "local" => Ok(Self::Local),
            other => Err(ConfigError::Invalid {
                field: "embedding_provider",
                details: format!("unknown provider {other}"),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProviderKind,
    pub base_url: String,
    pub model: String,
    pub dimensions: usize,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub probe_timeout_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderKind::Ollama,
            base_url: "http://localhost:11434".to_string(),
            model: DEFAULT_EMBEDDING_MODEL.to_string(),
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
            api_key: None,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT_MS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl EmbeddingConfig {
    /// | Variable | Default |
    /// |----------|---------|
    /// | `KB_EMBEDDING_PROVIDER` | `ollama` (`openai`, `local`) |
    /// | `KB_EMBEDDING_URL` | `http://localhost:11434` |
    /// | `KB_EMBEDDING_MODEL` | `nomic-embed-text` |
    /// | `KB_EMBEDDING_DIMENSIONS` | `768` |
    /// | `KB_EMBEDDING_API_KEY` | unset |
    /// | `KB_EMBEDDING_RETRY_ATTEMPTS` | `3` |
    /// | `KB_EMBEDDING_RETRY_DELAY_MS` | `1000` |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            provider: env_parse("KB_EMBEDDING_PROVIDER").unwrap_or(defaults.provider),
            base_url: env_value("KB_EMBEDDING_URL").unwrap_or(defaults.base_url),
            model: env_value("KB_EMBEDDING_MODEL").unwrap_or(defaults.model),
            dimensions: env_parse("KB_EMBEDDING_DIMENSIONS").unwrap_or(defaults.dimensions),
            api_key: env_value("KB_EMBEDDING_API_KEY"),
            retry_attempts: env_parse("KB_EMBEDDING_RETRY_ATTEMPTS")
                .unwrap_or(defaults.retry_attempts),
            retry_delay_ms: env_parse("KB_EMBEDDING_RETRY_DELAY_MS")
                .unwrap_or(defaults.retry_delay_ms),
            probe_timeout_ms: env_parse("KB_EMBEDDING_PROBE_TIMEOUT_MS")
                .unwrap_or(defaults.probe_timeout_ms),
            request_timeout_secs: env_parse("KB_EMBEDDING_TIMEOUT_SECS")
                .unwrap_or(defaults.request_timeout_secs),
        }
    }

    /// Same provider settings with retry backoff shortened for test runs.
    pub fn for_tests() -> Self {
        Self {
            provider: EmbeddingProviderKind::Local,
            dimensions: 32,
            retry_delay_ms: 1,
            probe_timeout_ms: 100,
            ..Self::default()
        }
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dimensions == 0 {
            return Err(ConfigError::Invalid {
                field: "embedding_dimensions",
                details: "must be greater than zero".to_string(),
            });
        }
        if self.retry_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "embedding_retry_attempts",
                details: "at least one attempt is required".to_string(),
            });
        }
        if self.provider != EmbeddingProviderKind::Local && self.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "embedding_url",
                details: "a base url is required for remote providers".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievalDefaults {
    pub rag_mode: RagMode,
    pub tag_filters: Vec<String>,
    pub default_top_k: usize,
    pub max_top_k: usize,
    pub min_similarity_score: f32,
}

impl Default for RetrievalDefaults {
    fn default() -> Self {
        Self {
            rag_mode: RagMode::Heavy,
            tag_filters: Vec::new(),
            default_top_k: DEFAULT_TOP_K,
            max_top_k: DEFAULT_MAX_TOP_K,
            min_similarity_score: DEFAULT_MIN_SIMILARITY,
        }
    }
}

impl RetrievalDefaults {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            rag_mode: env_value("KB_RAG_MODE")
                .and_then(|value| RagMode::parse(&value))
                .unwrap_or(defaults.rag_mode),
            tag_filters: env_list("KB_RAG_TAG_FILTERS").unwrap_or(defaults.tag_filters),
            default_top_k: env_parse("KB_RAG_DEFAULT_TOP_K").unwrap_or(defaults.default_top_k),
            max_top_k: env_parse("KB_RAG_MAX_TOP_K").unwrap_or(defaults.max_top_k),
            min_similarity_score: env_parse("KB_RAG_MIN_SIMILARITY")
                .unwrap_or(defaults.min_similarity_score),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_top_k == 0 || self.default_top_k == 0 {
            return Err(ConfigError::Invalid {
                field: "top_k",
                details: "top-k values must be at least 1".to_string(),
            });
        }
        if self.default_top_k > self.max_top_k {
            return Err(ConfigError::Invalid {
                field: "default_top_k",
                details: format!(
                    "default {} exceeds maximum {}",
                    self.default_top_k, self.max_top_k
                ),
            });
        }
        if !(-1.0..=1.0).contains(&self.min_similarity_score) {
            return Err(ConfigError::Invalid {
                field: "min_similarity_score",
                details: format!("{} is outside [-1, 1]", self.min_similarity_score),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobConfig {
    pub queue_name: String,
    pub polling_interval_secs: u64,
    pub batch_size: usize,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            queue_name: INDEX_FILE_QUEUE.to_string(),
            polling_interval_secs: DEFAULT_POLLING_INTERVAL_SECS,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl JobConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            queue_name: env_value("KB_JOB_QUEUE").unwrap_or(defaults.queue_name),
            polling_interval_secs: env_parse("KB_JOB_POLL_INTERVAL_SECS")
                .unwrap_or(defaults.polling_interval_secs),
            batch_size: defaults.batch_size,
        }
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GlobalConfig {
    pub indexing: IndexingConfig,
    pub embedding: EmbeddingConfig,
    pub retrieval: RetrievalDefaults,
    pub jobs: JobConfig,
}

impl GlobalConfig {
    pub fn from_env() -> Self {
        Self {
            indexing: IndexingConfig::from_env(),
            embedding: EmbeddingConfig::from_env(),
            retrieval: RetrievalDefaults::from_env(),
            jobs: JobConfig::from_env(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.indexing.validate()?;
        self.embedding.validate()?;
        self.retrieval.validate()?;
        Ok(())
    }
}
