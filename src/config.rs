//! TOML configuration for the mail pipeline.
//!
//! Every section except `[db]` is optional and falls back to defaults, so a
//! minimal config only needs a database path:
//!
//! ```toml
//! [db]
//! path = "./data/mail.sqlite"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// Upper bound on messages fetched by one sync invocation.
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_folder")]
    pub default_folder: String,
    /// How long a per-user sync lease stays valid before another run may take it over.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    #[serde(default = "default_sync_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_max_rate_limit_wait_secs")]
    pub max_rate_limit_wait_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_batch: default_max_batch(),
            page_size: default_page_size(),
            default_folder: default_folder(),
            lease_secs: default_lease_secs(),
            timeout_secs: default_sync_timeout_secs(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            max_rate_limit_wait_secs: default_max_rate_limit_wait_secs(),
        }
    }
}

fn default_max_batch() -> usize {
    500
}
fn default_page_size() -> usize {
    50
}
fn default_folder() -> String {
    "inbox".to_string()
}
fn default_lease_secs() -> u64 {
    600
}
fn default_sync_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_ms() -> u64 {
    1000
}
fn default_max_rate_limit_wait_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_kind")]
    pub kind: String,
    #[serde(default)]
    pub graph: Option<GraphProviderConfig>,
    #[serde(default)]
    pub directory: Option<DirectoryProviderConfig>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: default_provider_kind(),
            graph: None,
            directory: None,
        }
    }
}

fn default_provider_kind() -> String {
    "graph".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct GraphProviderConfig {
    #[serde(default = "default_graph_base_url")]
    pub base_url: String,
    /// Environment variable holding the bearer token for the mailbox owner.
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

impl Default for GraphProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_graph_base_url(),
            token_env: default_token_env(),
        }
    }
}

fn default_graph_base_url() -> String {
    "https://graph.microsoft.com/v1.0".to_string()
}
fn default_token_env() -> String {
    "GRAPH_ACCESS_TOKEN".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct DirectoryProviderConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.json".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: default_llm_model(),
            url: None,
            timeout_secs: default_llm_timeout_secs(),
            temperature: default_temperature(),
        }
    }
}

impl LlmConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_llm_provider() -> String {
    "disabled".to_string()
}
fn default_llm_model() -> String {
    "llama3.1:8b".to_string()
}
fn default_llm_timeout_secs() -> u64 {
    120
}
fn default_temperature() -> f32 {
    0.3
}

#[derive(Debug, Deserialize, Clone)]
pub struct EnrichmentConfig {
    /// Maximum number of concurrent LLM enrichment calls.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_prompt_preview_chars")]
    pub prompt_preview_chars: usize,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            prompt_preview_chars: default_prompt_preview_chars(),
        }
    }
}

fn default_concurrency() -> usize {
    4
}
fn default_prompt_preview_chars() -> usize {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_embedding_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,
    /// Body characters included in the embedded document.
    #[serde(default = "default_body_chars")]
    pub body_chars: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_embedding_max_retries(),
            timeout_secs: default_embedding_timeout_secs(),
            body_chars: default_body_chars(),
        }
    }
}

fn default_embedding_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_embedding_max_retries() -> u32 {
    5
}
fn default_embedding_timeout_secs() -> u64 {
    30
}
fn default_body_chars() -> usize {
    2000
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Messages rendered into the assistant context.
    #[serde(default = "default_context_k")]
    pub context_k: usize,
    #[serde(default = "default_keyword_limit")]
    pub keyword_limit: usize,
    #[serde(default = "default_preview_chars")]
    pub preview_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            context_k: default_context_k(),
            keyword_limit: default_keyword_limit(),
            preview_chars: default_preview_chars(),
        }
    }
}

fn default_context_k() -> usize {
    5
}
fn default_keyword_limit() -> usize {
    5
}
fn default_preview_chars() -> usize {
    200
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.sync.max_batch == 0 {
        anyhow::bail!("sync.max_batch must be > 0");
    }
    if config.sync.page_size == 0 {
        anyhow::bail!("sync.page_size must be > 0");
    }
    if config.enrichment.concurrency == 0 {
        anyhow::bail!("enrichment.concurrency must be > 0");
    }
    if config.retrieval.context_k == 0 {
        anyhow::bail!("retrieval.context_k must be >= 1");
    }

    match config.provider.kind.as_str() {
        "graph" => {}
        "directory" => {
            if config.provider.directory.is_none() {
                anyhow::bail!("provider.kind = 'directory' requires a [provider.directory] section");
            }
        }
        other => anyhow::bail!(
            "Unknown mail provider: '{}'. Must be graph or directory.",
            other
        ),
    }

    match config.llm.provider.as_str() {
        "disabled" | "ollama" | "openai" => {}
        other => anyhow::bail!(
            "Unknown llm provider: '{}'. Must be disabled, ollama, or openai.",
            other
        ),
    }

    if config.embedding.is_enabled() && config.embedding.provider != "local" {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.provider != "hash" && config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "hash" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, hash, or local.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> Config {
        toml::from_str(toml_src).unwrap()
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let config = parse("[db]\npath = \"/tmp/mail.sqlite\"\n");
        assert_eq!(config.sync.max_batch, 500);
        assert_eq!(config.sync.default_folder, "inbox");
        assert_eq!(config.retrieval.context_k, 5);
        assert_eq!(config.embedding.body_chars, 2000);
        assert!(!config.llm.is_enabled());
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn directory_provider_requires_section() {
        let config = parse("[db]\npath = \"x\"\n[provider]\nkind = \"directory\"\n");
        assert!(validate(&config).is_err());
    }

    #[test]
    fn hash_embedding_needs_dims_only() {
        let config = parse("[db]\npath = \"x\"\n[embedding]\nprovider = \"hash\"\ndims = 64\n");
        assert!(validate(&config).is_ok());

        let config = parse("[db]\npath = \"x\"\n[embedding]\nprovider = \"hash\"\n");
        assert!(validate(&config).is_err());
    }

    #[test]
    fn rejects_unknown_llm_provider() {
        let config = parse("[db]\npath = \"x\"\n[llm]\nprovider = \"gpt-bridge\"\n");
        let err = validate(&config).unwrap_err().to_string();
        assert!(err.contains("gpt-bridge"));
    }

    #[test]
    fn rejects_zero_batch() {
        let config = parse("[db]\npath = \"x\"\n[sync]\nmax_batch = 0\n");
        assert!(validate(&config).is_err());
    }
}
