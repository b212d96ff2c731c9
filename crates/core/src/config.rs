use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::paths::Paths;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_base: None,
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl ModelConfig {
    /// API key from config, falling back to `TASKFLOW_API_KEY` then `OPENAI_API_KEY`.
    pub fn resolved_api_key(&self) -> Option<String> {
        if !self.api_key.trim().is_empty() {
            return Some(self.api_key.trim().to_string());
        }
        ["TASKFLOW_API_KEY", "OPENAI_API_KEY"]
            .iter()
            .filter_map(|var| std::env::var(var).ok())
            .find(|v| !v.trim().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Profile a conversation starts in on first contact.
    #[serde(default = "default_profile")]
    pub default_profile: String,
    /// Profiles that switch the extended (developer) capability set on.
    #[serde(default = "default_dev_profiles")]
    pub dev_profiles: Vec<String>,
    /// Upper bound on nodes visited by one flow run.
    #[serde(default = "default_max_flow_steps")]
    pub max_flow_steps: usize,
    /// Turn a flow's non-text final output into an assistant message.
    #[serde(default = "default_summarize_results")]
    pub summarize_results: bool,
    #[serde(default = "default_watch_interval_ms")]
    pub watch_interval_ms: u64,
    #[serde(default = "default_intent_capability")]
    pub intent_capability: String,
}

fn default_profile() -> String {
    "general".to_string()
}

fn default_dev_profiles() -> Vec<String> {
    vec!["capability_dev".to_string(), "code_dev".to_string()]
}

fn default_max_flow_steps() -> usize {
    64
}

fn default_summarize_results() -> bool {
    true
}

fn default_watch_interval_ms() -> u64 {
    1000
}

fn default_intent_capability() -> String {
    "intent_classifier".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_profile: default_profile(),
            dev_profiles: default_dev_profiles(),
            max_flow_steps: default_max_flow_steps(),
            summarize_results: default_summarize_results(),
            watch_interval_ms: default_watch_interval_ms(),
            intent_capability: default_intent_capability(),
        }
    }
}

impl EngineConfig {
    pub fn is_dev_profile(&self, name: &str) -> bool {
        self.dev_profiles.iter().any(|p| p == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    /// Overrides `<base>/capabilities`.
    #[serde(default)]
    pub capabilities_dir: Option<String>,
    /// Overrides `<base>/profiles`.
    #[serde(default)]
    pub profiles_dir: Option<String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn capabilities_dir(&self, paths: &Paths) -> PathBuf {
        self.capabilities_dir
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(|| paths.capabilities_dir())
    }

    pub fn profiles_dir(&self, paths: &Paths) -> PathBuf {
        self.profiles_dir
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(|| paths.profiles_dir())
    }
}

fn expand_home(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(raw)
}
