use super::{DeployError, DeployGateway, Deployment};
use crate::config::DeployConfig;
use crate::error::{HealError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};

/// Deploys by POSTing to a platform deploy hook (Vercel, Netlify, Render and
/// anything else that takes `{ref, branch}` JSON).
pub struct WebhookDeployer {
    hook_url: Option<String>,
    token: Option<String>,
    client: Client,
}

impl WebhookDeployer {
    pub fn new(config: &DeployConfig, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HealError::Configuration(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            hook_url: config.hook_url.clone(),
            token: config.token.clone(),
            client,
        })
    }
}

/// Pull a deployment id and URL out of whatever the hook answered with.
fn parse_deployment(body: &Value) -> Deployment {
    let id = ["id", "deploymentId", "uid"]
        .iter()
        .find_map(|key| body[*key].as_str())
        .or_else(|| body["job"]["id"].as_str())
        .unwrap_or("unknown")
        .to_string();

    let url = body["url"].as_str().filter(|u| !u.is_empty()).map(|u| {
        if u.starts_with("http://") || u.starts_with("https://") {
            u.to_string()
        } else {
            format!("https://{}", u)
        }
    });

    Deployment { id, url }
}

/// The platform's own error code when it sent one, the HTTP status otherwise.
fn failure_reason(status: u16, body: &str) -> String {
    let parsed: Value = serde_json::from_str(body).unwrap_or(Value::Null);
    parsed["error"]["code"]
        .as_str()
        .or_else(|| parsed["code"].as_str())
        .or_else(|| parsed["error"].as_str())
        .map(str::to_string)
        .unwrap_or_else(|| format!("HTTP {}", status))
}

#[async_trait]
impl DeployGateway for WebhookDeployer {
    async fn deploy(&self, git_ref: &str, branch: &str) -> std::result::Result<Deployment, DeployError> {
        let hook_url = self
            .hook_url
            .as_ref()
            .ok_or_else(|| DeployError::Misconfigured("deploy.hook_url not configured".to_string()))?;

        let mut request = self
            .client
            .post(hook_url)
            .header("Content-Type", "application/json")
            .json(&serde_json::json!({ "ref": git_ref, "branch": branch }));
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        info!(git_ref, branch, "Triggering deployment");
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(DeployError::Rejected(failure_reason(status.as_u16(), &text)));
        }

        let body: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
        let deployment = parse_deployment(&body);
        debug!(id = %deployment.id, url = ?deployment.url, "Deployment accepted");
        Ok(deployment)
    }

    async fn health_check(&self, url: &str) -> std::result::Result<u16, DeployError> {
        let response = self.client.get(url).send().await?;
        Ok(response.status().as_u16())
    }
}
