use crate::config::AiConfig;
use crate::error::{HealError, Result};
use crate::providers::{AiError, AiGateway, GenerationParams, Message, Role};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

pub const DEFAULT_MODEL: &str = "gemini-1.5-flash";
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GoogleGateway {
    api_key: Option<String>,
    base_url: String,
    client: Client,
}

impl GoogleGateway {
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

    /// Gemini has no system role on `contents`; system text goes to
    /// `systemInstruction` and the rest map to user/model turns.
    fn build_body(prompt: &[Message], params: &GenerationParams) -> serde_json::Value {
        let system: Vec<&str> = prompt
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();

        let contents: Vec<serde_json::Value> = prompt
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|msg| {
                serde_json::json!({
                    "role": match msg.role {
                        Role::Assistant => "model",
                        _ => "user",
                    },
                    "parts": [{"text": msg.content}]
                })
            })
            .collect();

        let mut body = serde_json::json!({
            "contents": contents,
            "generationConfig": {
                "temperature": params.temperature,
                "maxOutputTokens": params.max_tokens,
            }
        });

        if !system.is_empty() {
            body["systemInstruction"] = serde_json::json!({
                "parts": [{"text": system.join("\n\n")}]
            });
        }

        body
    }

    fn model_path(model: &str) -> String {
        if model.starts_with("models/") {
            model.to_string()
        } else {
            format!("models/{}", model)
        }
    }
}

#[async_trait]
impl AiGateway for GoogleGateway {
    fn name(&self) -> &str {
        "google"
    }

    async fn generate(
        &self,
        prompt: &[Message],
        params: &GenerationParams,
    ) -> std::result::Result<String, AiError> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| AiError::Misconfigured("Google API key not configured".to_string()))?;

        let url = format!(
            "{}/{}:generateContent",
            self.base_url,
            Self::model_path(&params.model)
        );

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", api_key)
            .header("Content-Type", "application/json")
            .json(&Self::build_body(prompt, params))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(AiError::from_status("Google", status.as_u16(), &error_text));
        }

        let data: serde_json::Value = response.json().await?;

        let text = data["candidates"][0]["content"]["parts"]
            .as_array()
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(AiError::Unavailable(
                "Google returned a response without candidate text".to_string(),
            ));
        }
        Ok(text)
    }
}
