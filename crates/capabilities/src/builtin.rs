//! Capabilities compiled into the binary. Bundles with the same name
//! override them; deleting such a bundle brings the built-in back.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use taskflow_core::{Result, ValueMap};
use taskflow_providers::CompletionRequest;
use tracing::debug;

use crate::capability::{Capability, CapabilityContext, CapabilityHandler, CapabilityMeta};
use crate::intent::{Intent, IntentClassifier};
use crate::registry::{CapabilityRegistry, CapabilitySummary};

pub const INTENT_CLASSIFIER: &str = "intent_classifier";
pub const PLANNER: &str = "planner";
pub const REPLY: &str = "reply";
pub const RESULT_TO_REPLY: &str = "result_to_reply";
pub const CAPABILITY_LIST: &str = "capability_list";
pub const WAIT: &str = "wait";

const DEFAULT_WAIT_SECS: u64 = 10;

pub const PLANNER_PROMPT: &str = r#"You turn a user's goal into a plan made of the capabilities listed under "capabilities".
Answer with one JSON object and nothing else:
{"ok": true, "flow": [{"name": "<capability>", "params": {...}}, ...], "missing": [], "question": null}
Rules:
- Use only capability names from the list. Steps run in order and share state.
- If the user is just chatting, answer {"ok": true, "flow": "reply"}.
- If something is needed that no capability offers, set "ok": false and list the names in "missing".
- If the goal is ambiguous, set "ok": false and ask one short question in "question"."#;

pub const REPLY_PROMPT: &str =
    "You are a concise, friendly assistant. Answer the user's last message using the conversation so far.";

pub const RESULT_PROMPT: &str = "You receive JSON with the user's goal and the data produced for it. \
Explain the result to the user in a few short sentences. Do not mention JSON.";

static CLASSIFIER: Lazy<IntentClassifier> = Lazy::new(IntentClassifier::new);

fn str_param<'p>(params: &'p ValueMap, key: &str) -> Option<&'p str> {
    params.get(key).and_then(|v| v.as_str())
}

fn single(key: &str, value: Value) -> ValueMap {
    let mut out = ValueMap::new();
    out.insert(key.to_string(), value);
    out
}

/// `{history, text}` -> `{intent}`.
struct IntentClassifierHandler;

#[async_trait]
impl CapabilityHandler for IntentClassifierHandler {
    async fn run(&self, _ctx: &mut CapabilityContext<'_>, params: ValueMap) -> Result<ValueMap> {
        let text = str_param(&params, "text").unwrap_or("");
        let history = str_param(&params, "history").unwrap_or("");
        let intent = CLASSIFIER.classify_in_context(history, text);
        debug!(intent = intent.as_str(), "Classified message");
        Ok(single("intent", json!(intent.as_str())))
    }
}

/// `{goal, catalogue, intent?}` -> `{plan}`.
struct PlannerHandler;

#[async_trait]
impl CapabilityHandler for PlannerHandler {
    async fn run(&self, ctx: &mut CapabilityContext<'_>, params: ValueMap) -> Result<ValueMap> {
        let intent = str_param(&params, "intent").map(Intent::parse);
        if intent == Some(Intent::Greeting) {
            return Ok(single("plan", json!({ "type": "reply" })));
        }

        let goal = str_param(&params, "goal").unwrap_or("");
        let catalogue = params.get("catalogue").cloned().unwrap_or(Value::Array(vec![]));
        let intent_label = intent.map(|i| i.as_str());
        let payload = json!({
            "goal": goal,
            "capabilities": catalogue,
            "history": ctx.state.history(),
            "intent": intent_label,
        });
        let plan = taskflow_providers::plan(
            ctx.model.as_ref(),
            &serde_json::to_string(&payload)?,
            ctx.system_prompt(),
        )
        .await?;
        Ok(single("plan", plan))
    }
}

/// `{text}` -> `{reply}`, answered from the conversation so far.
struct ReplyHandler;

#[async_trait]
impl CapabilityHandler for ReplyHandler {
    async fn run(&self, ctx: &mut CapabilityContext<'_>, params: ValueMap) -> Result<ValueMap> {
        let text = str_param(&params, "text")
            .or_else(|| ctx.state.get_str("goal"))
            .unwrap_or("")
            .to_string();

        let prompt = [
            ctx.system_prompt().to_string(),
            format!(
                "Here are the capabilities available to me:\n{}",
                ctx.state.capabilities_md()
            ),
            format!("Conversation so far:\n{}", ctx.state.history()),
            format!("user: {}", text),
            "assistant:".to_string(),
        ]
        .join("\n\n");

        // The system prompt is already inlined above.
        let request = CompletionRequest::new(prompt.trim())
            .with_model(ctx.meta.model.clone(), ctx.meta.temperature);
        let answer = ctx.model.generate_text(&request).await?;
        Ok(single("reply", json!(answer.trim())))
    }
}

/// `{data, goal?}` -> `{reply}`.
struct ResultToReplyHandler;

#[async_trait]
impl CapabilityHandler for ResultToReplyHandler {
    async fn run(&self, ctx: &mut CapabilityContext<'_>, params: ValueMap) -> Result<ValueMap> {
        let goal = str_param(&params, "goal")
            .or_else(|| ctx.state.get_str("goal"))
            .unwrap_or("");
        let payload = json!({
            "goal": goal,
            "data": params.get("data").cloned().unwrap_or(Value::Null),
        });
        let request = ctx.request(serde_json::to_string(&payload)?);
        let answer = ctx.model.generate_text(&request).await?;
        Ok(single("reply", json!(answer.trim())))
    }
}

/// `{}` -> `{capabilities: [{name, description}]}` for the current conversation.
struct CapabilityListHandler;

#[async_trait]
impl CapabilityHandler for CapabilityListHandler {
    async fn run(&self, ctx: &mut CapabilityContext<'_>, params: ValueMap) -> Result<ValueMap> {
        let group = str_param(&params, "group");
        let cid = ctx.state.conversation_id().to_string();
        let described: Vec<CapabilitySummary> = ctx.registry.describe(Some(&cid), group);
        Ok(single("capabilities", serde_json::to_value(described)?))
    }
}

/// `{seconds}` -> `{reply}` after sleeping. Unparsable input waits the default.
struct WaitHandler;

fn wait_seconds(params: &ValueMap) -> u64 {
    match params.get("seconds") {
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .unwrap_or(DEFAULT_WAIT_SECS),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(DEFAULT_WAIT_SECS),
        _ => DEFAULT_WAIT_SECS,
    }
}

#[async_trait]
impl CapabilityHandler for WaitHandler {
    async fn run(&self, _ctx: &mut CapabilityContext<'_>, params: ValueMap) -> Result<ValueMap> {
        let secs = wait_seconds(&params);
        tokio::time::sleep(Duration::from_secs(secs)).await;
        Ok(single("reply", json!(format!("Waited for {} seconds.", secs))))
    }
}

fn meta(name: &str, description: &str, inputs: &[&str], outputs: &[&str]) -> CapabilityMeta {
    CapabilityMeta {
        inputs: inputs.iter().map(|s| s.to_string()).collect(),
        outputs: outputs.iter().map(|s| s.to_string()).collect(),
        ..CapabilityMeta::new(name, description)
    }
}

/// Every built-in, ready to register.
pub fn builtin_capabilities() -> Vec<Capability> {
    vec![
        Capability::builtin(
            meta(
                INTENT_CLASSIFIER,
                "Labels a message as greeting, profile switch or generic request; \
                 short acknowledgements answering an assistant question count as generic",
                &["history", "text"],
                &["intent"],
            ),
            Arc::new(IntentClassifierHandler),
        ),
        Capability::builtin(
            meta(
                PLANNER,
                "Turns a goal into a flow over the visible capabilities",
                &["goal", "catalogue", "intent"],
                &["plan"],
            ),
            Arc::new(PlannerHandler),
        )
        .with_prompt(PLANNER_PROMPT),
        Capability::builtin(
            meta(REPLY, "Answers the user directly", &["text"], &["reply"]),
            Arc::new(ReplyHandler),
        )
        .with_prompt(REPLY_PROMPT),
        Capability::builtin(
            meta(
                RESULT_TO_REPLY,
                "Explains the data produced by a flow in plain words",
                &["data", "goal"],
                &["reply"],
            ),
            Arc::new(ResultToReplyHandler),
        )
        .with_prompt(RESULT_PROMPT),
        Capability::builtin(
            meta(
                CAPABILITY_LIST,
                "Lists the capabilities available in this conversation",
                &["group"],
                &["capabilities"],
            ),
            Arc::new(CapabilityListHandler),
        ),
        Capability::builtin(
            meta(WAIT, "Waits for a number of seconds", &["seconds"], &["reply"]),
            Arc::new(WaitHandler),
        ),
    ]
}

pub fn register_builtins(registry: &CapabilityRegistry) {
    for capability in builtin_capabilities() {
        registry.register(capability);
    }
}
