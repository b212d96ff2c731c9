use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use taskflow_core::{Error, ModelConfig, Result};
use tracing::{debug, error, info, warn};

use crate::{CompletionRequest, LanguageModel};

/// Find the largest byte index <= `max_bytes` that is a valid char boundary.
fn truncate_at_char_boundary(s: &str, max_bytes: usize) -> usize {
    if max_bytes >= s.len() {
        return s.len();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    end
}

/// Client for any OpenAI-compatible `chat/completions` endpoint.
pub struct OpenAiModel {
    client: Client,
    api_key: String,
    api_base: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl OpenAiModel {
    pub fn new(
        api_key: &str,
        api_base: Option<&str>,
        model: &str,
        max_tokens: u32,
        temperature: f32,
        timeout: Duration,
    ) -> Self {
        let api_base = api_base
            .unwrap_or("https://api.openai.com/v1")
            .trim_end_matches('/')
            .to_string();
        let client = Client::builder().timeout(timeout).build().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to build HTTP client, using default");
            Client::new()
        });
        Self {
            client,
            api_key: api_key.to_string(),
            api_base,
            model: model.to_string(),
            max_tokens,
            temperature,
        }
    }

    pub fn from_config(config: &ModelConfig) -> Result<Self> {
        let api_key = config.resolved_api_key().ok_or_else(|| {
            Error::Config(
                "No API key configured. Set model.apiKey in config.json or TASKFLOW_API_KEY."
                    .to_string(),
            )
        })?;
        Ok(Self::new(
            &api_key,
            config.api_base.as_deref(),
            &config.model,
            config.max_tokens,
            config.temperature,
            Duration::from_secs(config.request_timeout_secs),
        ))
    }

    fn build_messages(request: &CompletionRequest, json_mode: bool) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &request.system {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: system.clone(),
            });
        }
        // json_object mode requires the word "JSON" somewhere in the messages.
        let content = if json_mode {
            format!("Respond only with a JSON object.\n\n{}", request.prompt)
        } else {
            request.prompt.clone()
        };
        messages.push(ChatMessage {
            role: "user".to_string(),
            content,
        });
        messages
    }

    async fn send_request(&self, request: &CompletionRequest, json_mode: bool) -> Result<String> {
        let url = format!("{}/chat/completions", self.api_base);
        let model = request.model.clone().unwrap_or_else(|| self.model.clone());

        let body = ChatRequest {
            model: model.clone(),
            messages: Self::build_messages(request, json_mode),
            max_tokens: self.max_tokens,
            temperature: request.temperature.unwrap_or(self.temperature),
            response_format: json_mode.then(|| json!({"type": "json_object"})),
        };

        info!(model = %model, json_mode, prompt_len = request.prompt.len(), "Requesting completion");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("request to {} failed: {}", url, e)))?;

        let status = response.status();
        let raw = response.text().await.unwrap_or_default();
        let preview = &raw[..truncate_at_char_boundary(&raw, 500)];

        if !status.is_success() {
            error!(status = %status, body = %preview, "Completion endpoint returned an error");
            return Err(Error::Provider(format!("{} from {}: {}", status, url, preview)));
        }
        debug!(body_len = raw.len(), preview = %preview, "Completion received");

        let parsed: ChatResponse = serde_json::from_str(&raw).map_err(|e| {
            Error::Provider(format!("unreadable completion ({}): {}", e, preview))
        })?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content.unwrap_or_default())
            .ok_or_else(|| Error::Provider("completion carried no choices".to_string()))
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[async_trait]
impl LanguageModel for OpenAiModel {
    async fn generate_text(&self, request: &CompletionRequest) -> Result<String> {
        self.send_request(request, false).await
    }

    async fn generate_json(&self, request: &CompletionRequest) -> Result<String> {
        self.send_request(request, true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_respects_char_boundary() {
        let s = "ab€cd";
        assert_eq!(truncate_at_char_boundary(s, 3), 2);
        assert_eq!(truncate_at_char_boundary(s, 100), s.len());
    }

    #[test]
    fn test_build_messages_with_system() {
        let req = CompletionRequest::new("hello").with_system("be brief");
        let messages = OpenAiModel::build_messages(&req, false);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[1].content, "hello");

        let json_messages = OpenAiModel::build_messages(&req, true);
        assert!(json_messages[1].content.starts_with("Respond only with a JSON object."));
    }

    #[test]
    fn test_request_serialization_json_mode() {
        let body = ChatRequest {
            model: "m".to_string(),
            messages: vec![],
            max_tokens: 10,
            temperature: 0.0,
            response_format: Some(json!({"type": "json_object"})),
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["response_format"]["type"], "json_object");
    }

    #[test]
    fn test_from_config_requires_key() {
        let cfg = ModelConfig {
            api_key: "sk-test".to_string(),
            api_base: Some("http://localhost:8080/v1/".to_string()),
            ..Default::default()
        };
        let model = OpenAiModel::from_config(&cfg).unwrap();
        assert_eq!(model.api_base, "http://localhost:8080/v1");
    }
}
