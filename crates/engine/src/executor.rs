use serde_json::{json, Value};
use std::sync::Arc;
use taskflow_capabilities::builtin::RESULT_TO_REPLY;
use taskflow_capabilities::CapabilityRegistry;
use taskflow_core::state::{LOGS_KEY, REPLY_KEY};
use taskflow_core::{topic, EngineConfig, Error, FlowGraph, Result, SessionState, ValueMap};
use taskflow_storage::SharedConversation;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::hub::EventHub;

/// Walks a flow graph node by node, merging every output into the session
/// state and reporting progress on the hub.
pub struct FlowExecutor {
    registry: Arc<CapabilityRegistry>,
    hub: Arc<EventHub>,
    max_steps: usize,
    summarize_results: bool,
}

impl FlowExecutor {
    pub fn new(registry: Arc<CapabilityRegistry>, hub: Arc<EventHub>, config: &EngineConfig) -> Self {
        Self {
            registry,
            hub,
            max_steps: config.max_flow_steps.max(1),
            summarize_results: config.summarize_results,
        }
    }

    /// Runs `graph` to completion. Every failure is returned to the caller;
    /// `task.done` is only published for a run that reached its terminal node.
    pub async fn execute(
        &self,
        graph: &FlowGraph,
        state: &mut SessionState,
        conversation: Option<&SharedConversation>,
        cancel: Option<&CancellationToken>,
    ) -> Result<()> {
        graph.validate()?;
        let never = CancellationToken::new();
        let cancel = cancel.unwrap_or(&never);
        let cid = state.conversation_id().to_string();

        let mut current = Some(graph.start.clone());
        let mut steps = 0usize;
        let mut replied = false;
        let mut last_output = ValueMap::new();

        while let Some(id) = current {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled(format!("flow stopped before node '{}'", id)));
            }
            steps += 1;
            if steps > self.max_steps {
                return Err(Error::MalformedFlow(format!(
                    "flow exceeded {} steps (cycle?)",
                    self.max_steps
                )));
            }
            let node = graph
                .node(&id)
                .ok_or_else(|| Error::MalformedFlow(format!("node '{}' is not defined", id)))?;
            let capability = node.capability.as_str();

            self.hub.publish(
                &cid,
                topic::NODE_START,
                json!({ "id": id, "capability": capability }),
            );
            debug!(conversation = %cid, node = %id, capability, "Running node");

            let mut output = tokio::select! {
                result = self.registry.run(capability, state, node.params.clone()) => result?,
                _ = cancel.cancelled() => {
                    return Err(Error::Cancelled(format!("flow stopped during node '{}'", id)));
                }
            };

            if let Some(logs) = output.remove(LOGS_KEY) {
                self.hub.publish(
                    &cid,
                    topic::NODE_LOG,
                    json!({ "id": id, "capability": capability, "logs": logs }),
                );
            }

            state.merge(&output);

            if let Some(reply) = output.get(REPLY_KEY).and_then(|r| r.as_str()) {
                self.emit_reply(state, conversation, reply).await;
                replied = true;
            }

            self.hub.publish(
                &cid,
                topic::NODE_DONE,
                json!({ "id": id, "output": Value::Object(output.clone()) }),
            );

            last_output = output;
            current = node.next.clone();
        }

        if self.summarize_results && !replied && !last_output.is_empty() {
            let text = self.summarize(state, last_output).await;
            state.insert(REPLY_KEY, Value::String(text.clone()));
            self.emit_reply(state, conversation, &text).await;
        }

        info!(conversation = %cid, steps, "Flow finished");
        self.hub.publish(
            &cid,
            topic::TASK_DONE,
            json!({ "finalState": Value::Object(state.values().clone()) }),
        );
        Ok(())
    }

    /// Records the reply, refreshes the history snapshot, tells subscribers.
    async fn emit_reply(
        &self,
        state: &mut SessionState,
        conversation: Option<&SharedConversation>,
        text: &str,
    ) {
        if let Some(conversation) = conversation {
            let mut conversation = conversation.lock().await;
            if let Err(e) = conversation.add("assistant", text) {
                error!(conversation = %state.conversation_id(), error = %e, "Failed to persist reply");
            }
            state.set_history(conversation.render_history());
        }
        self.hub.publish(
            state.conversation_id(),
            topic::ASSISTANT,
            json!({ "text": text }),
        );
    }

    /// Friendly text for a flow that ended on data instead of a reply.
    async fn summarize(&self, state: &mut SessionState, data: ValueMap) -> String {
        let data = Value::Object(data);
        if self.registry.contains(RESULT_TO_REPLY) {
            let mut params = ValueMap::new();
            params.insert("data".to_string(), data.clone());
            params.insert(
                "goal".to_string(),
                state.get("goal").cloned().unwrap_or(Value::String(String::new())),
            );
            match self.registry.run(RESULT_TO_REPLY, state, params).await {
                Ok(out) => {
                    if let Some(reply) = out.get(REPLY_KEY).and_then(|r| r.as_str()) {
                        return reply.to_string();
                    }
                    warn!("result_to_reply returned no reply");
                }
                Err(e) => warn!(error = %e, "result_to_reply failed, dumping raw result"),
            }
        }
        raw_result(&data)
    }
}

fn raw_result(data: &Value) -> String {
    let pretty = serde_json::to_string_pretty(data).unwrap_or_else(|_| data.to_string());
    format!("Raw result:\n```json\n{}\n```", pretty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedModel;
    use taskflow_capabilities::{Capability, CapabilityContext, CapabilityHandler, CapabilityMeta};
    use taskflow_core::Event;
    use taskflow_storage::ConversationStore;

    fn registry() -> Arc<CapabilityRegistry> {
        Arc::new(CapabilityRegistry::new(ScriptedModel::new(vec![])))
    }

    fn executor(registry: Arc<CapabilityRegistry>, hub: Arc<EventHub>) -> FlowExecutor {
        FlowExecutor::new(registry, hub, &EngineConfig::default())
    }

    fn topics(events: &[Event]) -> Vec<&str> {
        events.iter().map(|e| e.topic.as_str()).collect()
    }

    fn emit(name: &str, key: &'static str, value: Value) -> Capability {
        Capability::from_fn(name, "test", move |_state, _params| {
            let mut out = ValueMap::new();
            out.insert(key.to_string(), value.clone());
            Ok(out)
        })
    }

    #[tokio::test]
    async fn test_state_flows_between_nodes() {
        let registry = registry();
        registry.register(emit("find", "path", json!("src/main.rs")));
        registry.register(Capability::from_fn("open", "test", |state, _params| {
            let mut out = ValueMap::new();
            let path = state.get_str("path").unwrap_or("none").to_string();
            out.insert("reply".to_string(), json!(format!("opened {}", path)));
            Ok(out)
        }));
        let hub = Arc::new(EventHub::new());
        let exec = executor(registry, hub.clone());

        let graph = FlowGraph::chain(vec![
            ("find".to_string(), ValueMap::new()),
            ("open".to_string(), ValueMap::new()),
        ])
        .unwrap();
        let mut state = SessionState::new("c1");
        exec.execute(&graph, &mut state, None, None).await.unwrap();

        assert_eq!(state.get_str("reply"), Some("opened src/main.rs"));
        let events = hub.queue("c1").drain();
        assert_eq!(
            topics(&events),
            vec![
                "node.start",
                "node.done",
                "node.start",
                "assistant",
                "node.done",
                "task.done"
            ]
        );
        assert_eq!(events[3].text(), Some("opened src/main.rs"));
        assert_eq!(events[5].payload["finalState"]["path"], "src/main.rs");
    }

    #[tokio::test]
    async fn test_logs_are_stripped_and_published() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("noisy");
        std::fs::create_dir_all(&bundle).unwrap();
        std::fs::write(bundle.join("capability.json"), r#"{"name": "noisy"}"#).unwrap();
        std::fs::write(
            bundle.join("run.rhai"),
            r#"fn run(state, params) { print("working"); #{ reply: "done" } }"#,
        )
        .unwrap();

        let registry = registry();
        registry.load(dir.path());
        let hub = Arc::new(EventHub::new());
        let exec = executor(registry, hub.clone());

        let mut state = SessionState::new("c1");
        exec.execute(&FlowGraph::single("noisy", ValueMap::new()), &mut state, None, None)
            .await
            .unwrap();

        let events = hub.queue("c1").drain();
        let log = events.iter().find(|e| e.topic == topic::NODE_LOG).unwrap();
        assert_eq!(log.payload["logs"], "working");
        let done = events.iter().find(|e| e.topic == topic::NODE_DONE).unwrap();
        assert!(done.payload["output"].get(LOGS_KEY).is_none());
        assert!(state.get(LOGS_KEY).is_none());
    }

    #[tokio::test]
    async fn test_replies_are_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(taskflow_core::Paths::with_base(dir.path().to_path_buf()));
        let conversation = store.open("c1").unwrap();

        let registry = registry();
        registry.register(emit("say", "reply", json!("hello there")));
        let exec = executor(registry, Arc::new(EventHub::new()));

        let mut state = SessionState::new("c1");
        exec.execute(
            &FlowGraph::single("say", ValueMap::new()),
            &mut state,
            Some(&conversation),
            None,
        )
        .await
        .unwrap();

        let conversation = conversation.lock().await;
        assert_eq!(conversation.history().len(), 1);
        assert_eq!(conversation.history()[0].sender, "assistant");
        assert_eq!(state.history(), "assistant: hello there");
    }

    #[tokio::test]
    async fn test_missing_capability_stops_flow() {
        let hub = Arc::new(EventHub::new());
        let exec = executor(registry(), hub.clone());
        let mut state = SessionState::new("c1");
        let err = exec
            .execute(&FlowGraph::single("ghost", ValueMap::new()), &mut state, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CapabilityNotFound(_)));
        let events = hub.queue("c1").drain();
        assert_eq!(topics(&events), vec!["node.start"]);
    }

    #[tokio::test]
    async fn test_cycles_hit_step_limit() {
        let registry = registry();
        registry.register(emit("tick", "n", json!(1)));
        let config = EngineConfig {
            max_flow_steps: 5,
            ..Default::default()
        };
        let exec = FlowExecutor::new(registry, Arc::new(EventHub::new()), &config);

        let mut graph = FlowGraph::single("tick", ValueMap::new());
        graph.nodes.get_mut("n0").unwrap().next = Some("n0".to_string());
        let mut state = SessionState::new("c1");
        let err = exec.execute(&graph, &mut state, None, None).await.unwrap_err();
        assert!(matches!(err, Error::MalformedFlow(_)));
    }

    #[tokio::test]
    async fn test_data_only_flow_is_summarized_once() {
        let registry = registry();
        registry.register(emit("count", "files", json!(3)));
        registry.register(Capability::from_fn(RESULT_TO_REPLY, "test", |_state, params| {
            let mut out = ValueMap::new();
            out.insert(
                "reply".to_string(),
                json!(format!("There are {} files.", params["data"]["files"])),
            );
            Ok(out)
        }));
        let hub = Arc::new(EventHub::new());
        let exec = executor(registry, hub.clone());

        let mut state = SessionState::new("c1");
        exec.execute(&FlowGraph::single("count", ValueMap::new()), &mut state, None, None)
            .await
            .unwrap();

        let events = hub.queue("c1").drain();
        assert_eq!(
            topics(&events),
            vec!["node.start", "node.done", "assistant", "task.done"]
        );
        assert_eq!(events[2].text(), Some("There are 3 files."));
    }

    #[tokio::test]
    async fn test_summary_falls_back_to_raw_dump() {
        let registry = registry();
        registry.register(emit("count", "files", json!(3)));
        let hub = Arc::new(EventHub::new());
        let exec = executor(registry, hub.clone());

        let mut state = SessionState::new("c1");
        exec.execute(&FlowGraph::single("count", ValueMap::new()), &mut state, None, None)
            .await
            .unwrap();

        let events = hub.queue("c1").drain();
        let text = events[2].text().unwrap();
        assert!(text.starts_with("Raw result:\n```json\n"));
        assert!(text.contains("\"files\": 3"));
    }

    struct Stuck;

    #[async_trait::async_trait]
    impl CapabilityHandler for Stuck {
        async fn run(&self, _ctx: &mut CapabilityContext<'_>, _params: ValueMap) -> Result<ValueMap> {
            std::future::pending::<()>().await;
            Ok(ValueMap::new())
        }
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_running_node() {
        let registry = registry();
        registry.register(Capability::builtin(
            CapabilityMeta::new("stuck", "never returns"),
            Arc::new(Stuck),
        ));
        let hub = Arc::new(EventHub::new());
        let exec = executor(registry, hub.clone());
        let token = CancellationToken::new();

        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                token.cancel();
            })
        };

        let mut state = SessionState::new("c1");
        let err = exec
            .execute(&FlowGraph::single("stuck", ValueMap::new()), &mut state, None, Some(&token))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
        canceller.await.unwrap();
        assert!(!topics(&hub.queue("c1").drain()).contains(&"task.done"));
    }
}
