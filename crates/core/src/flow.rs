use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::state::ValueMap;

/// One step of a flow: which capability to invoke, with what, and what follows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    #[serde(alias = "thought")]
    pub capability: String,
    #[serde(default)]
    pub params: ValueMap,
    #[serde(default)]
    pub next: Option<String>,
}

/// A task plan: a chain of nodes starting at `start`.
///
/// Nothing here prevents `next` pointers from forming a cycle; the executor
/// bounds every run with a step limit instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowGraph {
    pub start: String,
    pub nodes: BTreeMap<String, NodeSpec>,
}

impl FlowGraph {
    /// A graph with one terminal node `n0`.
    pub fn single(capability: &str, params: ValueMap) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "n0".to_string(),
            NodeSpec {
                capability: capability.to_string(),
                params,
                next: None,
            },
        );
        Self {
            start: "n0".to_string(),
            nodes,
        }
    }

    /// A linear chain `n0 -> n1 -> ...`. Returns `None` for an empty step list.
    pub fn chain(steps: Vec<(String, ValueMap)>) -> Option<Self> {
        if steps.is_empty() {
            return None;
        }
        let last = steps.len() - 1;
        let nodes = steps
            .into_iter()
            .enumerate()
            .map(|(i, (capability, params))| {
                let next = (i < last).then(|| format!("n{}", i + 1));
                (format!("n{}", i), NodeSpec { capability, params, next })
            })
            .collect();
        Some(Self {
            start: "n0".to_string(),
            nodes,
        })
    }

    /// True if `value` has the `{start, nodes}` shape.
    pub fn is_canonical(value: &Value) -> bool {
        value
            .as_object()
            .map(|o| o.contains_key("start") && o.contains_key("nodes"))
            .unwrap_or(false)
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        if !Self::is_canonical(value) {
            return Err(Error::MalformedFlow(
                "flow lacks a start/nodes pair".to_string(),
            ));
        }
        let graph: FlowGraph = serde_json::from_value(value.clone())
            .map_err(|e| Error::MalformedFlow(e.to_string()))?;
        graph.validate()?;
        Ok(graph)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Checks that `start` and every `next` pointer resolve to a node.
    pub fn validate(&self) -> Result<()> {
        if !self.nodes.contains_key(&self.start) {
            return Err(Error::MalformedFlow(format!(
                "start node '{}' is not defined",
                self.start
            )));
        }
        for (id, node) in &self.nodes {
            if let Some(next) = &node.next {
                if !self.nodes.contains_key(next) {
                    return Err(Error::MalformedFlow(format!(
                        "node '{}' points to undefined node '{}'",
                        id, next
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.get(id)
    }

    /// Distinct capability names referenced by the graph, sorted.
    pub fn capabilities(&self) -> Vec<String> {
        let mut names: Vec<String> = self.nodes.values().map(|n| n.capability.clone()).collect();
        names.sort();
        names.dedup();
        names
    }
}
