pub mod webhook;

pub use webhook::WebhookDeployer;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeployError {
    /// The platform accepted the request and reported a failure.
    #[error("deployment failed: {0}")]
    Rejected(String),

    #[error("deploy endpoint unavailable: {0}")]
    Unavailable(String),

    #[error("deploy gateway misconfigured: {0}")]
    Misconfigured(String),
}

impl DeployError {
    /// The bare reason, as reported by the platform when it gave one.
    pub fn reason(&self) -> String {
        match self {
            DeployError::Rejected(reason) => reason.clone(),
            other => other.to_string(),
        }
    }
}

impl From<reqwest::Error> for DeployError {
    fn from(err: reqwest::Error) -> Self {
        DeployError::Unavailable(err.without_url().to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Deployment {
    pub id: String,
    /// Where the deployment is served, when the platform reports it.
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeployResult {
    Succeeded { id: String, url: Option<String> },
    Failed { reason: String },
}

impl From<&std::result::Result<Deployment, DeployError>> for DeployResult {
    fn from(result: &std::result::Result<Deployment, DeployError>) -> Self {
        match result {
            Ok(d) => DeployResult::Succeeded {
                id: d.id.clone(),
                url: d.url.clone(),
            },
            Err(e) => DeployResult::Failed { reason: e.reason() },
        }
    }
}

#[async_trait]
pub trait DeployGateway: Send + Sync {
    /// Deploy `git_ref` (a commit id or a branch name) of `branch`.
    async fn deploy(&self, git_ref: &str, branch: &str) -> Result<Deployment, DeployError>;

    /// HTTP status served at `url`.
    async fn health_check(&self, url: &str) -> Result<u16, DeployError>;
}
