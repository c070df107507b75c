use crate::config::AiConfig;
use crate::error::{HealError, Result};
use crate::providers::{AiError, AiGateway, GenerationParams, Message};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Any OpenAI-compatible `chat/completions` endpoint (OpenAI, OpenRouter, local proxies).
pub struct OpenAiGateway {
    api_key: Option<String>,
    base_url: String,
    client: Client,
}

impl OpenAiGateway {
    pub fn new(config: &AiConfig, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HealError::Configuration(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            api_key: config.api_key.clone(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            client,
        })
    }
}

#[async_trait]
impl AiGateway for OpenAiGateway {
    fn name(&self) -> &str {
        "openai"
    }

    async fn generate(
        &self,
        prompt: &[Message],
        params: &GenerationParams,
    ) -> std::result::Result<String, AiError> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| AiError::Misconfigured("OpenAI API key not configured".to_string()))?;

        let body = serde_json::json!({
            "model": params.model,
            "messages": prompt,
            "temperature": params.temperature,
            "max_tokens": params.max_tokens,
            "stream": false,
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(AiError::from_status("OpenAI", status.as_u16(), &error_text));
        }

        let data: serde_json::Value = response.json().await?;

        match data["choices"][0]["message"]["content"].as_str() {
            Some(content) if !content.trim().is_empty() => Ok(content.to_string()),
            _ => Err(AiError::Unavailable(
                "OpenAI returned a response without message content".to_string(),
            )),
        }
    }
}
