pub mod openai;

use async_trait::async_trait;
use serde_json::{json, Value};
use taskflow_core::{Error, Result};
use tracing::warn;

pub use openai::OpenAiModel;

/// Question returned by [`plan`] when the model's answer cannot be parsed.
pub const PLAN_FALLBACK_QUESTION: &str = "Sorry – I produced invalid JSON. Could you rephrase?";

/// One prompt for the language model. `model` and `temperature` override the
/// client's defaults (capability descriptors may carry their own).
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub prompt: String,
    pub system: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        let system = system.into();
        if !system.trim().is_empty() {
            self.system = Some(system);
        }
        self
    }

    pub fn with_model(mut self, model: Option<String>, temperature: Option<f32>) -> Self {
        self.model = model;
        self.temperature = temperature;
        self
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate_text(&self, request: &CompletionRequest) -> Result<String>;

    /// Same as `generate_text` but asks the backend for a JSON object. The
    /// caller parses the returned string.
    async fn generate_json(&self, request: &CompletionRequest) -> Result<String>;
}

/// Asks the model for a JSON plan. A reply that does not parse turns into a
/// clarification request rather than an error.
pub async fn plan(model: &dyn LanguageModel, query: &str, system: &str) -> Result<Value> {
    let request = CompletionRequest::new(query).with_system(system);
    let raw = model.generate_json(&request).await?;
    match parse_json_reply(&raw) {
        Ok(value) => Ok(value),
        Err(e) => {
            warn!(error = %e, "Planner returned unparsable JSON");
            Ok(fallback_plan())
        }
    }
}

pub fn fallback_plan() -> Value {
    json!({
        "ok": false,
        "flow": null,
        "missing": [],
        "question": PLAN_FALLBACK_QUESTION,
    })
}

/// Parses a model reply as JSON, tolerating a surrounding ```json fence.
pub fn parse_json_reply(raw: &str) -> Result<Value> {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .unwrap_or(trimmed);
    serde_json::from_str(body.trim()).map_err(|e| Error::PlanParse(e.to_string()))
}
