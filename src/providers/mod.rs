use crate::config::{AiConfig, AiProviderType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub mod google;
pub mod openai;
pub mod retry;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Sampling parameters forwarded to the text endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationParams {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AiError {
    /// Network failure, timeout or a non-2xx response.
    #[error("AI endpoint unavailable: {0}")]
    Unavailable(String),

    #[error("AI endpoint rate limited: {0}")]
    RateLimited(String),

    /// Missing credentials or similar; retrying cannot help.
    #[error("AI gateway misconfigured: {0}")]
    Misconfigured(String),

    #[error("AI request cancelled")]
    Cancelled,
}

impl AiError {
    pub fn from_status(provider: &str, status: u16, body: &str) -> Self {
        let snippet: String = body.chars().take(200).collect();
        if status == 429 {
            AiError::RateLimited(format!("{} returned 429: {}", provider, snippet))
        } else {
            AiError::Unavailable(format!("{} returned {}: {}", provider, status, snippet))
        }
    }
}

impl From<reqwest::Error> for AiError {
    fn from(err: reqwest::Error) -> Self {
        // The URL may carry credentials; keep it out of logs.
        AiError::Unavailable(err.without_url().to_string())
    }
}

/// Opaque text-in/text-out oracle.
#[async_trait]
pub trait AiGateway: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(
        &self,
        prompt: &[Message],
        params: &GenerationParams,
    ) -> std::result::Result<String, AiError>;
}

pub fn default_model(provider: AiProviderType) -> &'static str {
    match provider {
        AiProviderType::Openai => openai::DEFAULT_MODEL,
        AiProviderType::Google => google::DEFAULT_MODEL,
    }
}

pub fn generation_params(config: &AiConfig) -> GenerationParams {
    GenerationParams {
        model: config
            .model
            .clone()
            .unwrap_or_else(|| default_model(config.provider).to_string()),
        temperature: config.temperature,
        max_tokens: config.max_tokens,
    }
}

pub fn create_gateway(
    config: &AiConfig,
    timeout: Duration,
) -> crate::error::Result<Box<dyn AiGateway>> {
    match config.provider {
        AiProviderType::Openai => Ok(Box::new(openai::OpenAiGateway::new(config, timeout)?)),
        AiProviderType::Google => Ok(Box::new(google::GoogleGateway::new(config, timeout)?)),
    }
}
