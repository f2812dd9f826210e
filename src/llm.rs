//! LLM inference collaborator.
//!
//! [`LlmClient::generate`] takes a prompt plus system instructions and
//! returns free text. Nothing guarantees the text is well-formed, so callers
//! validate it before use.
//!
//! Implementations:
//! - [`OllamaClient`]: `POST {url}/api/generate` with `stream = false`.
//! - [`OpenAIChatClient`]: `POST {url}/v1/chat/completions`, key from `OPENAI_API_KEY`.
//! - [`DisabledLlm`]: every call fails with [`LlmError::Disabled`].

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::LlmConfig;

/// Text produced by one inference call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub text: String,
    /// False when the model stopped early (length cap, interrupted stream).
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LlmError {
    #[error("LLM call timed out")]
    Timeout,
    #[error("LLM unavailable: {0}")]
    Unavailable(String),
    #[error("LLM is disabled")]
    Disabled,
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            LlmError::Timeout
        } else {
            LlmError::Unavailable(e.to_string())
        }
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    fn model_name(&self) -> &str;

    async fn generate(&self, prompt: &str, system: &str) -> Result<Generation, LlmError>;
}

// ============ Disabled ============

pub struct DisabledLlm;

#[async_trait]
impl LlmClient for DisabledLlm {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn generate(&self, _prompt: &str, _system: &str) -> Result<Generation, LlmError> {
        Err(LlmError::Disabled)
    }
}

// ============ Ollama ============

pub struct OllamaClient {
    client: reqwest::Client,
    url: String,
    model: String,
    temperature: f32,
}

impl OllamaClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string())
                .trim_end_matches('/')
                .to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
        })
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str, system: &str) -> Result<Generation, LlmError> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "system": system,
            "stream": false,
            "options": {
                "temperature": self.temperature,
                "num_predict": 2048,
            },
        });

        let response = self
            .client
            .post(format!("{}/api/generate", self.url))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(LlmError::Unavailable(format!(
                "Ollama API error {}: {}",
                status, body_text
            )));
        }

        let json: serde_json::Value = response.json().await?;
        parse_ollama_generation(&json)
    }
}

fn parse_ollama_generation(json: &serde_json::Value) -> Result<Generation, LlmError> {
    let text = json
        .get("response")
        .and_then(|r| r.as_str())
        .ok_or_else(|| LlmError::Unavailable("Invalid Ollama response: missing response".into()))?;
    Ok(Generation {
        text: text.trim().to_string(),
        done: json.get("done").and_then(|d| d.as_bool()).unwrap_or(true),
    })
}

// ============ OpenAI chat ============

pub struct OpenAIChatClient {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: String,
    temperature: f32,
}

impl OpenAIChatClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = match std::env::var("OPENAI_API_KEY") {
            Ok(k) if !k.trim().is_empty() => k,
            _ => bail!("OPENAI_API_KEY environment variable not set"),
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".to_string())
                .trim_end_matches('/')
                .to_string(),
            model: config.model.clone(),
            api_key,
            temperature: config.temperature,
        })
    }
}

#[async_trait]
impl LlmClient for OpenAIChatClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str, system: &str) -> Result<Generation, LlmError> {
        let body = serde_json::json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": prompt},
            ],
        });

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(LlmError::Unavailable(format!(
                "OpenAI API error {}: {}",
                status, body_text
            )));
        }

        let json: serde_json::Value = response.json().await?;
        parse_openai_generation(&json)
    }
}

fn parse_openai_generation(json: &serde_json::Value) -> Result<Generation, LlmError> {
    let choice = json
        .get("choices")
        .and_then(|c| c.get(0))
        .ok_or_else(|| LlmError::Unavailable("Invalid OpenAI response: missing choices".into()))?;
    let text = choice
        .pointer("/message/content")
        .and_then(|c| c.as_str())
        .unwrap_or_default();
    let done = choice
        .get("finish_reason")
        .and_then(|f| f.as_str())
        .map(|f| f == "stop")
        .unwrap_or(true);
    Ok(Generation {
        text: text.trim().to_string(),
        done,
    })
}

/// Create the configured [`LlmClient`].
pub fn create_llm(config: &LlmConfig) -> Result<Arc<dyn LlmClient>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledLlm)),
        "ollama" => Ok(Arc::new(OllamaClient::new(config)?)),
        "openai" => Ok(Arc::new(OpenAIChatClient::new(config)?)),
        other => bail!("Unknown llm provider: {}", other),
    }
}
