//! Prikolist configuration loader.
//!
//! Precedence: built-in defaults, then the TOML file, then environment variables.

use crate::dispatch::DEFAULT_THRESHOLD;
use pk_llm::GradioConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BotConfig {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InferenceConfig {
    /// Root URL of the Gradio Space serving the model.
    #[serde(default = "default_space_url")]
    pub space_url: String,
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Hugging Face read token; anonymous calls are allowed for public Spaces.
    #[serde(default)]
    pub hf_token: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            space_url: default_space_url(),
            api_prefix: default_api_prefix(),
            endpoint: default_endpoint(),
            hf_token: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_space_url() -> String {
    "https://vladdjuga-prikolistroastbot.hf.space".to_string()
}

fn default_api_prefix() -> String {
    pk_llm::DEFAULT_API_PREFIX.to_string()
}

fn default_endpoint() -> String {
    pk_llm::DEFAULT_ENDPOINT.to_string()
}

fn default_request_timeout_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// The model is called once more than this many messages are buffered.
    #[serde(default = "default_threshold")]
    pub threshold: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
        }
    }
}

fn default_threshold() -> usize {
    DEFAULT_THRESHOLD
}

impl BotConfig {
    /// An explicit `path` must exist; the default path is optional.
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let (mut cfg, source) = match path {
            Some(path) => (Self::read(&path).await?, Some(path)),
            None => {
                let path = default_config_path();
                if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    (Self::read(&path).await?, Some(path))
                } else {
                    (Self::default(), None)
                }
            }
        };

        cfg.apply_env_overrides();
        cfg.validate()?;
        tracing::debug!(
            config_path = ?source.as_deref().map(Path::display).map(|p| p.to_string()),
            "config loaded"
        );
        Ok(cfg)
    }

    async fn read(path: &Path) -> anyhow::Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;
        Self::from_toml_str(&contents)
            .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))
    }

    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = lookup("TELEGRAM_API_KEY") {
            self.telegram.bot_token = v;
        }
        if let Some(v) = lookup("HF_READ_TOKEN") {
            self.inference.hf_token = Some(v);
        }
        if let Some(v) = lookup("PRIKOLIST_SPACE_URL") {
            self.inference.space_url = v;
        }
        if let Some(v) = lookup("PRIKOLIST_THRESHOLD") {
            match v.trim().parse() {
                Ok(threshold) => self.dispatch.threshold = threshold,
                Err(e) => {
                    tracing::warn!(%e, value = %v, "ignoring invalid PRIKOLIST_THRESHOLD");
                }
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.telegram.bot_token.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "telegram.bot_token is required (or set TELEGRAM_API_KEY)"
            ));
        }
        if self.inference.space_url.trim().is_empty() {
            return Err(anyhow::anyhow!("inference.space_url is required"));
        }
        if self.inference.request_timeout_secs == 0 {
            return Err(anyhow::anyhow!(
                "inference.request_timeout_secs must be > 0"
            ));
        }
        if self.dispatch.threshold == 0 {
            return Err(anyhow::anyhow!("dispatch.threshold must be > 0"));
        }
        Ok(())
    }

    pub fn gradio_config(&self) -> GradioConfig {
        GradioConfig {
            base_url: self.inference.space_url.clone(),
            api_prefix: self.inference.api_prefix.clone(),
            endpoint: self.inference.endpoint.clone(),
            token: self.inference.hf_token.clone(),
            timeout: Duration::from_secs(self.inference.request_timeout_secs),
        }
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".prikolist").join("config.toml")
}
