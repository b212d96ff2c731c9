use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use taskflow_core::{Result, SessionState, ValueMap};
use taskflow_providers::{CompletionRequest, LanguageModel};

use crate::registry::CapabilityRegistry;

/// Descriptor of a capability, read from `capability.json` / `capability.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilityMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Documentation only; nothing validates params against it.
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

impl CapabilityMeta {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CapabilitySource {
    BuiltIn,
    Bundle(PathBuf),
}

/// Everything a handler may touch while it runs.
pub struct CapabilityContext<'a> {
    pub state: &'a mut SessionState,
    pub registry: &'a CapabilityRegistry,
    pub model: Arc<dyn LanguageModel>,
    pub meta: &'a CapabilityMeta,
    pub prompt: Option<&'a str>,
    logs: Vec<String>,
}

impl<'a> CapabilityContext<'a> {
    pub fn new(
        state: &'a mut SessionState,
        registry: &'a CapabilityRegistry,
        model: Arc<dyn LanguageModel>,
        meta: &'a CapabilityMeta,
        prompt: Option<&'a str>,
    ) -> Self {
        Self {
            state,
            registry,
            model,
            meta,
            prompt,
            logs: Vec::new(),
        }
    }

    /// Records a line for the `node.log` event of the current node.
    pub fn log(&mut self, line: impl Into<String>) {
        self.logs.push(line.into());
    }

    pub fn take_logs(&mut self) -> Vec<String> {
        std::mem::take(&mut self.logs)
    }

    pub fn system_prompt(&self) -> &str {
        self.prompt.unwrap_or("")
    }

    /// A completion request using the capability's prompt as the system
    /// message and its model overrides.
    pub fn request(&self, prompt: impl Into<String>) -> CompletionRequest {
        CompletionRequest::new(prompt)
            .with_system(self.system_prompt())
            .with_model(self.meta.model.clone(), self.meta.temperature)
    }
}

#[async_trait]
pub trait CapabilityHandler: Send + Sync {
    async fn run(&self, ctx: &mut CapabilityContext<'_>, params: ValueMap) -> Result<ValueMap>;
}

/// Adapter for plain synchronous closures.
struct FnHandler<F>(F);

#[async_trait]
impl<F> CapabilityHandler for FnHandler<F>
where
    F: Fn(&SessionState, ValueMap) -> Result<ValueMap> + Send + Sync,
{
    async fn run(&self, ctx: &mut CapabilityContext<'_>, params: ValueMap) -> Result<ValueMap> {
        (self.0)(&*ctx.state, params)
    }
}

pub struct Capability {
    pub meta: CapabilityMeta,
    pub source: CapabilitySource,
    pub prompt: Option<String>,
    pub handler: Arc<dyn CapabilityHandler>,
}

impl Capability {
    pub fn builtin(meta: CapabilityMeta, handler: Arc<dyn CapabilityHandler>) -> Self {
        Self {
            meta,
            source: CapabilitySource::BuiltIn,
            prompt: None,
            handler,
        }
    }

    pub fn from_fn<F>(name: &str, description: &str, f: F) -> Self
    where
        F: Fn(&SessionState, ValueMap) -> Result<ValueMap> + Send + Sync + 'static,
    {
        Self::builtin(CapabilityMeta::new(name, description), Arc::new(FnHandler(f)))
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn is_builtin(&self) -> bool {
        self.source == CapabilitySource::BuiltIn
    }
}

impl std::fmt::Debug for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capability")
            .field("name", &self.meta.name)
            .field("source", &self.source)
            .finish()
    }
}
