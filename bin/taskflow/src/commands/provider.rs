use async_trait::async_trait;
use std::sync::Arc;
use taskflow_core::{Config, Error, Paths, Result};
use taskflow_engine::Engine;
use taskflow_providers::{CompletionRequest, LanguageModel, OpenAiModel};
use tracing::warn;

/// Stand-in used when no API key is configured. Commands that never reach
/// the model (listing, profile switching) keep working.
struct UnconfiguredModel {
    reason: String,
}

#[async_trait]
impl LanguageModel for UnconfiguredModel {
    async fn generate_text(&self, _request: &CompletionRequest) -> Result<String> {
        Err(Error::Config(self.reason.clone()))
    }

    async fn generate_json(&self, _request: &CompletionRequest) -> Result<String> {
        Err(Error::Config(self.reason.clone()))
    }
}

pub fn create_model(config: &Config) -> Arc<dyn LanguageModel> {
    match OpenAiModel::from_config(&config.model) {
        Ok(model) => Arc::new(model),
        Err(e) => {
            warn!(error = %e, "Language model unavailable");
            Arc::new(UnconfiguredModel {
                reason: e.to_string(),
            })
        }
    }
}

/// Loads config from the default base directory and starts an engine on it.
pub async fn start_engine() -> anyhow::Result<Engine> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;
    let model = create_model(&config);
    Ok(Engine::start(config, paths, model).await?)
}
