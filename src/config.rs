use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub server: ServerConfig,
    pub openai: OpenAiConfig,
    pub tabular: TabularConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub codegen: CodegenConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OpenAiConfig {
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    pub chat_model: String,
    pub embed_model: String,
    pub embed_dims: usize,
    /// Stored assistant persona the thread manager runs against.
    pub assistant_id: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TabularConfig {
    /// Base URL of the dataframe load/execute service.
    pub url: String,
    #[serde(default = "default_tabular_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Base URL of the object store's REST surface.
    pub url: String,
    pub bucket: String,
    #[serde(default = "default_signed_url_ttl")]
    pub signed_url_ttl_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_chars")]
    pub chunk_chars: usize,
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_chars: default_chunk_chars(),
            overlap_chars: default_overlap_chars(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_k")]
    pub k: i64,
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    /// Ceiling for verbatim full-text inclusion; larger bodies fall through
    /// to vector retrieval.
    #[serde(default = "default_fulltext_max_chars")]
    pub fulltext_max_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k: default_k(),
            threshold: default_threshold(),
            fulltext_max_chars: default_fulltext_max_chars(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RunConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_run_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            timeout_secs: default_run_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CodegenConfig {
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_seed")]
    pub seed: i64,
}

impl Default for CodegenConfig {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            seed: default_seed(),
        }
    }
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    5
}
fn default_tabular_timeout_secs() -> u64 {
    60
}
fn default_signed_url_ttl() -> u64 {
    3600
}
fn default_chunk_chars() -> usize {
    1000
}
fn default_overlap_chars() -> usize {
    200
}
fn default_k() -> i64 {
    5
}
fn default_threshold() -> f32 {
    0.1
}
fn default_fulltext_max_chars() -> usize {
    200_000
}
fn default_poll_interval_ms() -> u64 {
    750
}
fn default_run_timeout_secs() -> u64 {
    120
}
fn default_seed() -> i64 {
    42
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.chunking.chunk_chars == 0 {
        anyhow::bail!("chunking.chunk_chars must be > 0");
    }
    if config.chunking.overlap_chars >= config.chunking.chunk_chars {
        anyhow::bail!("chunking.overlap_chars must be < chunking.chunk_chars");
    }
    if config.retrieval.k < 1 {
        anyhow::bail!("retrieval.k must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.retrieval.threshold) {
        anyhow::bail!("retrieval.threshold must be in [0.0, 1.0]");
    }
    if config.openai.embed_dims == 0 {
        anyhow::bail!("openai.embed_dims must be > 0");
    }
    if config.openai.assistant_id.is_empty() {
        anyhow::bail!("openai.assistant_id must be set");
    }
    if config.run.poll_interval_ms == 0 {
        anyhow::bail!("run.poll_interval_ms must be > 0");
    }

    Ok(config)
}
