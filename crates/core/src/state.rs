use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};

pub type ValueMap = serde_json::Map<String, Value>;

/// Per-conversation scratch space that survives across turns (draft buffers etc).
pub type DevContext = Arc<Mutex<ValueMap>>;

/// Output key carrying text shown to the user.
pub const REPLY_KEY: &str = "reply";
/// Output key carrying captured capability output; never merged into state.
pub const LOGS_KEY: &str = "__logs";
pub const DEV_KEY: &str = "__dev";
pub const CONVERSATION_ID_KEY: &str = "__cid";
pub const HISTORY_KEY: &str = "__history";
pub const CAPABILITIES_MD_KEY: &str = "__capabilities_md";

pub fn is_private_key(key: &str) -> bool {
    key.starts_with("__")
}

pub fn new_dev_context() -> DevContext {
    Arc::new(Mutex::new(ValueMap::new()))
}

/// Shared state for one flow run. Capability outputs are merged into `values`
/// so later nodes see what earlier nodes produced.
#[derive(Debug, Clone)]
pub struct SessionState {
    conversation_id: String,
    history: String,
    capabilities_md: String,
    dev: DevContext,
    values: ValueMap,
}

impl SessionState {
    pub fn new(conversation_id: &str) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            history: String::new(),
            capabilities_md: String::new(),
            dev: new_dev_context(),
            values: ValueMap::new(),
        }
    }

    pub fn with_history(mut self, history: String) -> Self {
        self.history = history;
        self
    }

    pub fn with_dev(mut self, dev: DevContext) -> Self {
        self.dev = dev;
        self
    }

    pub fn with_capabilities_md(mut self, md: String) -> Self {
        self.capabilities_md = md;
        self
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn history(&self) -> &str {
        &self.history
    }

    pub fn set_history(&mut self, history: String) {
        self.history = history;
    }

    pub fn capabilities_md(&self) -> &str {
        &self.capabilities_md
    }

    pub fn dev_snapshot(&self) -> ValueMap {
        self.dev.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn replace_dev(&self, map: ValueMap) {
        *self.dev.lock().unwrap_or_else(PoisonError::into_inner) = map;
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(|v| v.as_str())
    }

    pub fn insert(&mut self, key: &str, value: Value) {
        self.values.insert(key.to_string(), value);
    }

    /// Merges a capability output into state. Private keys are bookkeeping
    /// owned by the engine and are skipped.
    pub fn merge(&mut self, output: &ValueMap) {
        for (key, value) in output {
            if is_private_key(key) {
                continue;
            }
            self.values.insert(key.clone(), value.clone());
        }
    }

    pub fn values(&self) -> &ValueMap {
        &self.values
    }

    /// Full view including bookkeeping keys, as handed to script bodies and
    /// published with `task.done`.
    pub fn to_value(&self) -> Value {
        let mut map = self.values.clone();
        map.insert(
            CONVERSATION_ID_KEY.to_string(),
            Value::String(self.conversation_id.clone()),
        );
        map.insert(HISTORY_KEY.to_string(), Value::String(self.history.clone()));
        map.insert(
            CAPABILITIES_MD_KEY.to_string(),
            Value::String(self.capabilities_md.clone()),
        );
        map.insert(DEV_KEY.to_string(), Value::Object(self.dev_snapshot()));
        Value::Object(map)
    }
}
