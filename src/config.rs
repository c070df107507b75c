use crate::error::{HealError, Result};
use config::{Config, Environment, File};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Everything a heal run needs to know, resolved once and handed to the
/// orchestrator. Nothing below reads the environment on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealConfig {
    /// Run the heal subchain even when the build succeeded.
    #[serde(default)]
    pub heal_on_success: bool,

    /// Total attempts made against the AI gateway before giving up.
    #[serde(default = "default_ai_retry_count")]
    pub ai_retry_count: u32,

    #[serde(default = "default_ai_retry_delay_ms")]
    pub ai_retry_delay_ms: u64,

    /// When false only the fallback marker is ever written, even for a valid patch.
    #[serde(default = "default_true")]
    pub apply_real_fix: bool,

    #[serde(default = "default_branch")]
    pub branch: String,

    #[serde(default = "default_fallback_file")]
    pub fallback_file: PathBuf,

    /// Tag written into heal commits and fallback markers.
    #[serde(default = "default_marker")]
    pub marker: String,

    #[serde(default = "default_settle_delay")]
    pub settle_delay_secs: u64,

    #[serde(default = "default_gateway_timeout")]
    pub gateway_timeout_secs: u64,

    #[serde(default = "default_repo_path")]
    pub repo_path: PathBuf,

    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: PathBuf,

    #[serde(default)]
    pub ai: AiConfig,

    #[serde(default)]
    pub deploy: DeployConfig,

    #[serde(default)]
    pub git: GitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    #[serde(default)]
    pub provider: AiProviderType,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Files (relative to the checkout) whose content is included in the prompt.
    #[serde(default)]
    pub context_files: Vec<PathBuf>,
    #[serde(default = "default_max_log_chars")]
    pub max_log_chars: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AiProviderType {
    #[default]
    Openai,
    Google,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    pub hook_url: Option<String>,
    pub health_url: Option<String>,
    pub token: Option<String>,
    #[serde(default = "default_expected_status")]
    pub expected_status: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    /// Remote to clone from when the checkout does not exist yet.
    pub clone_url: Option<String>,
    #[serde(default = "default_remote")]
    pub remote: String,
    #[serde(default = "default_author_name")]
    pub author_name: String,
    #[serde(default = "default_author_email")]
    pub author_email: String,
}

fn default_true() -> bool {
    true
}

fn default_ai_retry_count() -> u32 {
    3
}

fn default_ai_retry_delay_ms() -> u64 {
    1000
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_fallback_file() -> PathBuf {
    PathBuf::from("AUTOHEAL.md")
}

fn default_marker() -> String {
    "[auto-heal]".to_string()
}

fn default_settle_delay() -> u64 {
    10
}

fn default_gateway_timeout() -> u64 {
    120
}

fn default_repo_path() -> PathBuf {
    PathBuf::from(".")
}

fn default_artifacts_dir() -> PathBuf {
    PathBuf::from("autoheal-artifacts")
}

fn default_temperature() -> f32 {
    0.2
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_max_log_chars() -> usize {
    8000
}

fn default_expected_status() -> u16 {
    200
}

fn default_remote() -> String {
    "origin".to_string()
}

fn default_author_name() -> String {
    "autoheal-bot".to_string()
}

fn default_author_email() -> String {
    "autoheal-bot@users.noreply.github.com".to_string()
}

impl Default for HealConfig {
    fn default() -> Self {
        Self {
            heal_on_success: false,
            ai_retry_count: default_ai_retry_count(),
            ai_retry_delay_ms: default_ai_retry_delay_ms(),
            apply_real_fix: true,
            branch: default_branch(),
            fallback_file: default_fallback_file(),
            marker: default_marker(),
            settle_delay_secs: default_settle_delay(),
            gateway_timeout_secs: default_gateway_timeout(),
            repo_path: default_repo_path(),
            artifacts_dir: default_artifacts_dir(),
            ai: AiConfig::default(),
            deploy: DeployConfig::default(),
            git: GitConfig::default(),
        }
    }
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            provider: AiProviderType::default(),
            api_key: None,
            base_url: None,
            model: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            context_files: Vec::new(),
            max_log_chars: default_max_log_chars(),
        }
    }
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            hook_url: None,
            health_url: None,
            token: None,
            expected_status: default_expected_status(),
        }
    }
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            clone_url: None,
            remote: default_remote(),
            author_name: default_author_name(),
            author_email: default_author_email(),
        }
    }
}

impl HealConfig {
    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway_timeout_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }

    pub fn ai_retry_delay(&self) -> Duration {
        Duration::from_millis(self.ai_retry_delay_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ai_retry_count == 0 {
            return Err(HealError::Configuration(
                "ai_retry_count must be at least 1".to_string(),
            ));
        }
        if self.branch.trim().is_empty() {
            return Err(HealError::Configuration("branch must not be empty".to_string()));
        }
        if self.fallback_file.is_absolute() {
            return Err(HealError::Configuration(
                "fallback_file must be relative to the checkout".to_string(),
            ));
        }
        if self.marker.trim().is_empty() {
            return Err(HealError::Configuration("marker must not be empty".to_string()));
        }
        Ok(())
    }

    /// Copy with credentials blanked out, for display.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.ai.api_key.is_some() {
            copy.ai.api_key = Some("***".to_string());
        }
        if copy.deploy.token.is_some() {
            copy.deploy.token = Some("***".to_string());
        }
        copy
    }
}

pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration: file (explicit path or the platform default),
    /// then `AUTOHEAL_*` environment variables on top.
    pub fn load(explicit_path: Option<&Path>) -> Result<HealConfig> {
        let path = match explicit_path {
            Some(p) => {
                if !p.exists() {
                    return Err(HealError::Configuration(format!(
                        "Config file not found: {}",
                        p.display()
                    )));
                }
                Some(p.to_path_buf())
            }
            None => Self::default_config_path().ok().filter(|p| p.exists()),
        };

        Self::load_from(path.as_deref(), Self::environment())
    }

    fn environment() -> Environment {
        Environment::with_prefix("AUTOHEAL")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }

    fn load_from(path: Option<&Path>, env: Environment) -> Result<HealConfig> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path.to_path_buf()));
        }

        let s = builder
            .add_source(env)
            .build()
            .map_err(|e| HealError::Configuration(format!("Failed to build config: {}", e)))?;

        let config: HealConfig = s.try_deserialize().map_err(|e| {
            HealError::Configuration(format!("Failed to deserialize config: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    pub fn default_config_path() -> Result<PathBuf> {
        let project_dirs = ProjectDirs::from("com", "autoheal", "autoheal").ok_or_else(|| {
            HealError::Configuration("Could not determine config directory".to_string())
        })?;

        Ok(project_dirs.config_dir().join("config.toml"))
    }

    pub fn render(config: &HealConfig) -> Result<String> {
        toml::to_string_pretty(&config.redacted())
            .map_err(|e| HealError::Configuration(format!("Failed to serialize config: {}", e)))
    }

    /// Write a config file, creating its directory.
    pub fn save(config: &HealConfig, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let toml = toml::to_string_pretty(config)
            .map_err(|e| HealError::Configuration(format!("Failed to serialize config: {}", e)))?;
        fs::write(path, toml)?;
        Ok(())
    }
}
