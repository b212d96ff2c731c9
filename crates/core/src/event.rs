use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Topics published on the event hub.
pub mod topic {
    pub const USER: &str = "user";
    pub const ASSISTANT: &str = "assistant";
    pub const DEBUG: &str = "debug";
    pub const NODE_START: &str = "node.start";
    pub const NODE_LOG: &str = "node.log";
    pub const NODE_DONE: &str = "node.done";
    pub const TASK_DONE: &str = "task.done";
}

/// One entry on a conversation's event queue, forwarded verbatim by transports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub topic: String,
    pub payload: Value,
}

impl Event {
    pub fn new(topic: &str, payload: Value) -> Self {
        Self {
            topic: topic.to_string(),
            payload,
        }
    }

    pub fn is_node_event(&self) -> bool {
        self.topic.starts_with("node.")
    }

    /// Text of a `user`/`assistant` event.
    pub fn text(&self) -> Option<&str> {
        self.payload.get("text").and_then(|v| v.as_str())
    }
}
