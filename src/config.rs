use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    pub analysis: AnalysisConfig,
    pub chat: ChatConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Root directory for the local object store.
    pub root: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            size: default_chunk_size(),
            overlap: default_chunk_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    1000
}
fn default_chunk_overlap() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Inputs longer than this are truncated from the end before the call.
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            base_url: None,
            max_input_chars: default_max_input_chars(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_embedding_provider() -> String {
    "disabled".to_string()
}
fn default_max_input_chars() -> usize {
    8000
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnalysisConfig {
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Extracted content is capped at this many characters in the prompt.
    #[serde(default = "default_analysis_max_input_chars")]
    pub max_input_chars: usize,
    #[serde(default = "default_analysis_temperature")]
    pub temperature: f64,
    #[serde(default = "default_analysis_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_analysis_max_input_chars() -> usize {
    50_000
}
fn default_analysis_temperature() -> f64 {
    0.3
}
fn default_analysis_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_chat_temperature")]
    pub temperature: f64,
    #[serde(default = "default_chat_max_tokens")]
    pub max_tokens: u32,
    /// How many chunks to retrieve as grounding context per turn.
    #[serde(default = "default_context_limit")]
    pub context_limit: usize,
    #[serde(default = "default_threshold")]
    pub context_threshold: f64,
    #[serde(default = "default_analysis_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_chat_temperature() -> f64 {
    0.7
}
fn default_chat_max_tokens() -> u32 {
    2048
}
fn default_context_limit() -> usize {
    5
}
fn default_threshold() -> f64 {
    0.7
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_search_limit")]
    pub default_limit: usize,
    #[serde(default = "default_threshold")]
    pub default_threshold: f64,
    #[serde(default = "default_max_limit")]
    pub max_limit: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_limit: default_search_limit(),
            default_threshold: default_threshold(),
            max_limit: default_max_limit(),
        }
    }
}

fn default_search_limit() -> usize {
    10
}
fn default_max_limit() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    /// Maximum file-processing jobs in flight at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First retry delay; doubles on each subsequent attempt.
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    /// Age after which a `pending` file with no active job is re-enqueued.
    #[serde(default = "default_orphan_after_secs")]
    pub orphan_after_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            max_attempts: default_max_attempts(),
            backoff_base_secs: default_backoff_base_secs(),
            orphan_after_secs: default_orphan_after_secs(),
        }
    }
}

fn default_concurrency() -> usize {
    5
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_base_secs() -> u64 {
    2
}
fn default_orphan_after_secs() -> u64 {
    300
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Validate chunking
    if config.chunking.size == 0 {
        anyhow::bail!("chunking.size must be > 0");
    }
    if config.chunking.overlap >= config.chunking.size {
        anyhow::bail!("chunking.overlap must be < chunking.size");
    }

    // Validate retrieval
    if config.retrieval.default_limit == 0 || config.retrieval.max_limit == 0 {
        anyhow::bail!("retrieval limits must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.retrieval.default_threshold) {
        anyhow::bail!("retrieval.default_threshold must be in [0.0, 1.0]");
    }
    if !(0.0..=1.0).contains(&config.chat.context_threshold) {
        anyhow::bail!("chat.context_threshold must be in [0.0, 1.0]");
    }

    // Validate embedding
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    // Validate worker
    if config.worker.concurrency == 0 {
        anyhow::bail!("worker.concurrency must be >= 1");
    }
    if config.worker.max_attempts == 0 {
        anyhow::bail!("worker.max_attempts must be >= 1");
    }

    Ok(config)
}
