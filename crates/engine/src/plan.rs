//! Coerces the shapes planners produce into one canonical plan.
//!
//! Accepted `flow` forms: `"reply"`, any other capability name, `{type: "reply"}`,
//! `{name, params?}`, an array of such steps, or a full `{start, nodes}` graph.
//! A value without `ok`/`flow` keys is taken to be the flow itself.

use serde_json::{json, Map, Value};
use taskflow_core::{FlowGraph, ValueMap};

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedPlan {
    pub ok: bool,
    /// Canonical `{start, nodes}` when the flow could be recognized; otherwise
    /// the raw value the planner sent.
    pub flow: Option<Value>,
    pub missing: Vec<String>,
    pub question: Option<String>,
}

impl NormalizedPlan {
    /// The flow as a validated graph, if it is one.
    pub fn graph(&self) -> Option<FlowGraph> {
        self.flow
            .as_ref()
            .and_then(|f| FlowGraph::from_value(f).ok())
    }

    pub fn to_value(&self) -> Value {
        json!({
            "ok": self.ok,
            "flow": self.flow,
            "missing": self.missing,
            "question": self.question,
        })
    }
}

fn params_of(step: &Map<String, Value>) -> ValueMap {
    match step.get("params") {
        Some(Value::Object(params)) => params.clone(),
        _ => ValueMap::new(),
    }
}

fn reply_node(replier: &str, user_text: &str) -> Value {
    let mut params = ValueMap::new();
    params.insert("text".to_string(), Value::String(user_text.to_string()));
    FlowGraph::single(replier, params).to_value()
}

fn normalize_flow(flow: Value, replier: &str, user_text: &str) -> Value {
    if FlowGraph::is_canonical(&flow) {
        return flow;
    }
    match flow {
        Value::String(name) if name == "reply" => reply_node(replier, user_text),
        Value::String(name) if !name.trim().is_empty() => {
            FlowGraph::single(name.trim(), ValueMap::new()).to_value()
        }
        Value::Object(obj) => {
            if obj.get("type").and_then(|t| t.as_str()) == Some("reply") {
                return reply_node(replier, user_text);
            }
            match obj.get("name").and_then(|n| n.as_str()).map(str::to_string) {
                Some(name) => FlowGraph::single(&name, params_of(&obj)).to_value(),
                None => Value::Object(obj),
            }
        }
        Value::Array(steps) => {
            let chain: Option<Vec<(String, ValueMap)>> = steps
                .iter()
                .map(|step| {
                    let step = step.as_object()?;
                    let name = step.get("name").and_then(|n| n.as_str())?;
                    Some((name.to_string(), params_of(step)))
                })
                .collect();
            match chain.and_then(FlowGraph::chain) {
                Some(graph) => graph.to_value(),
                None => Value::Array(steps),
            }
        }
        other => other,
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(str::to_string)
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    }
}

/// Applies the normalization rules to a raw planner output.
pub fn normalize(raw: Value, replier: &str, user_text: &str) -> NormalizedPlan {
    let (ok, flow, missing, question) = match raw {
        Value::Object(mut obj) if obj.contains_key("ok") || obj.contains_key("flow") => {
            let ok = match obj.get("ok") {
                Some(v) => v.as_bool().unwrap_or(false),
                None => true,
            };
            let flow = obj.remove("flow").filter(|f| !f.is_null());
            let missing = string_list(obj.get("missing"));
            let question = obj
                .get("question")
                .and_then(|q| q.as_str())
                .map(str::trim)
                .filter(|q| !q.is_empty())
                .map(str::to_string);
            (ok, flow, missing, question)
        }
        Value::Null => (true, None, Vec::new(), None),
        other => (true, Some(other), Vec::new(), None),
    };

    NormalizedPlan {
        ok,
        flow: flow.map(|f| normalize_flow(f, replier, user_text)),
        missing,
        question,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskflow_core::NodeSpec;

    fn graph_of(plan: &NormalizedPlan) -> FlowGraph {
        plan.graph().expect("canonical flow")
    }

    /// The only node of a one-step flow, checked to be terminal.
    fn sole_node(plan: &NormalizedPlan) -> NodeSpec {
        let graph = graph_of(plan);
        assert_eq!(graph.nodes.len(), 1, "expected one node: {:?}", graph.nodes);
        assert_eq!(graph.start, "n0");
        let node = graph.node("n0").cloned().unwrap();
        assert!(node.next.is_none());
        node
    }

    #[test]
    fn test_reply_string_uses_replier() {
        let plan = normalize(json!({"ok": true, "flow": "reply"}), "code_reply", "hi");
        let node = sole_node(&plan);
        assert_eq!(node.capability, "code_reply");
        assert_eq!(node.params["text"], "hi");
        assert!(plan.ok);
        assert!(plan.missing.is_empty());
        assert!(plan.question.is_none());
    }

    #[test]
    fn test_type_reply_object_without_envelope() {
        let plan = normalize(json!({"type": "reply"}), "reply", "hello");
        assert!(plan.ok);
        let node = sole_node(&plan);
        assert_eq!(node.capability, "reply");
        assert_eq!(node.params["text"], "hello");
    }

    #[test]
    fn test_named_step_and_bare_name() {
        let plan = normalize(
            json!({"flow": {"name": "code_file_read", "params": {"path": "a.rs"}}}),
            "reply",
            "",
        );
        assert!(plan.ok);
        let node = sole_node(&plan);
        assert_eq!(node.capability, "code_file_read");
        assert_eq!(node.params["path"], "a.rs");

        let plan = normalize(json!({"ok": true, "flow": "wait"}), "reply", "");
        let node = sole_node(&plan);
        assert_eq!(node.capability, "wait");
        assert!(node.params.is_empty());
    }

    #[test]
    fn test_step_array_becomes_chain() {
        let plan = normalize(
            json!({"ok": true, "flow": [
                {"name": "code_file_list", "params": {"dir": "."}},
                {"name": "code_file_read"},
                {"name": "result_to_reply"}
            ]}),
            "reply",
            "",
        );
        let graph = graph_of(&plan);
        assert_eq!(graph.start, "n0");
        assert_eq!(graph.node("n0").unwrap().next.as_deref(), Some("n1"));
        assert_eq!(graph.node("n1").unwrap().next.as_deref(), Some("n2"));
        assert!(graph.node("n2").unwrap().next.is_none());
        assert_eq!(graph.node("n2").unwrap().capability, "result_to_reply");
    }

    #[test]
    fn test_canonical_graph_is_untouched_and_idempotent() {
        let canonical = json!({
            "start": "read",
            "nodes": {
                "read": {"capability": "code_file_read", "params": {}, "next": "say"},
                "say": {"capability": "reply", "params": {}, "next": null}
            }
        });
        let once = normalize(canonical.clone(), "reply", "x");
        assert_eq!(once.flow.as_ref(), Some(&canonical));

        let twice = normalize(once.to_value(), "reply", "x");
        assert_eq!(twice, once);

        // Short forms are stable after one pass too.
        let short = normalize(json!({"ok": true, "flow": "reply"}), "reply", "hey");
        assert_eq!(normalize(short.to_value(), "reply", "hey"), short);
    }

    #[test]
    fn test_clarification_and_missing() {
        let plan = normalize(json!({"ok": false, "question": "Which file?"}), "reply", "");
        assert!(!plan.ok);
        assert!(plan.flow.is_none());
        assert_eq!(plan.question.as_deref(), Some("Which file?"));

        let plan = normalize(
            json!({"ok": false, "flow": null, "missing": ["tts", "camera"], "question": ""}),
            "reply",
            "",
        );
        assert_eq!(plan.missing, vec!["tts", "camera"]);
        assert!(plan.question.is_none());
    }

    #[test]
    fn test_unrecognized_flow_is_kept_raw() {
        let plan = normalize(json!({"ok": true, "flow": [1, 2]}), "reply", "");
        assert!(plan.ok);
        assert_eq!(plan.flow, Some(json!([1, 2])));
        assert!(plan.graph().is_none());
    }
}
