use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::profile::ProfileName;
use crate::state::NodeRegion;

use super::template::{value_references, Template};
use super::transition::ConditionalNext;

/// Node region key written by `generate`, `invoke_tool`, and `invoke`
/// when no `output_key` is given.
pub const DEFAULT_OUTPUT_KEY: &str = "last";

/// Node region key that receives the message of a rejected operation or a
/// tolerated sub-workflow failure.
pub const ERROR_KEY: &str = "error";

fn default_output_key() -> String {
    DEFAULT_OUTPUT_KEY.to_string()
}

fn default_true() -> bool {
    true
}

/// One vertex of a playbook graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(flatten)]
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditional_next: Vec<ConditionalNext>,
}

/// The closed set of node types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    Generate(GenerateNode),
    InvokeTool(InvokeToolNode),
    Emit(EmitNode),
    Reflect(ReflectNode),
    Record(RecordNode),
    Pass,
    Invoke(InvokeNode),
    EnterSession(EnterSessionNode),
    LeaveSession(LeaveSessionNode),
}

/// Type tags accepted in playbook documents.
pub const NODE_TYPES: &[&str] = &[
    "generate",
    "invoke_tool",
    "emit",
    "reflect",
    "record",
    "pass",
    "invoke",
    "enter_session",
    "leave_session",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateNode {
    pub profile: ProfileName,
    pub prompt: Template,
    /// JSON Schema the model output must satisfy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_schema: Option<serde_json::Value>,
    #[serde(default = "default_output_key")]
    pub output_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeToolNode {
    pub tool: String,
    #[serde(default)]
    pub args: BTreeMap<String, serde_json::Value>,
    #[serde(default = "default_output_key")]
    pub output_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmitNode {
    pub content: Template,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReflectNode {
    pub content: Template,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordNode {
    pub content: Template,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Defaults to the acting agent's id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

/// How a sub-workflow shares the caller's session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationMode {
    /// Same thread as the caller.
    #[default]
    Inline,
    /// Fresh child thread, left (or aborted) when the callee finishes.
    Isolated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeNode {
    pub playbook: String,
    #[serde(default)]
    pub args: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub mode: InvocationMode,
    /// Append the callee's outputs to this run's outputs.
    #[serde(default)]
    pub propagate: bool,
    /// Receives the callee's `last` value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_key: Option<String>,
    /// Branch target taken when the callee fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<String>,
    /// Child thread ratio for `isolated` mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_ratio: Option<f64>,
    /// Generate a chronicle when the isolated thread is left.
    #[serde(default = "default_true")]
    pub summarize: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnterSessionNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_ratio: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaveSessionNode {
    #[serde(default = "default_true")]
    pub summarize: bool,
}

impl Default for LeaveSessionNode {
    fn default() -> Self {
        Self { summarize: true }
    }
}

impl NodeKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Generate(_) => "generate",
            Self::InvokeTool(_) => "invoke_tool",
            Self::Emit(_) => "emit",
            Self::Reflect(_) => "reflect",
            Self::Record(_) => "record",
            Self::Pass => "pass",
            Self::Invoke(_) => "invoke",
            Self::EnterSession(_) => "enter_session",
            Self::LeaveSession(_) => "leave_session",
        }
    }
}

impl Node {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            next: None,
            conditional_next: Vec::new(),
        }
    }

    pub fn with_next(mut self, next: impl Into<String>) -> Self {
        self.next = Some(next.into());
        self
    }

    pub fn with_branch(mut self, when: super::Predicate, to: impl Into<String>) -> Self {
        self.conditional_next.push(ConditionalNext {
            when,
            to: to.into(),
        });
        self
    }

    /// Every node id this node can transition to.
    pub fn targets(&self) -> Vec<&str> {
        let mut targets: Vec<&str> = self.conditional_next.iter().map(|c| c.to.as_str()).collect();
        targets.extend(self.next.as_deref());
        if let NodeKind::Invoke(invoke) = &self.kind {
            targets.extend(invoke.on_failure.as_deref());
        }
        targets
    }

    /// First matching conditional edge, else `next`. `None` ends the run.
    pub fn select_next(&self, region: &NodeRegion) -> Option<&str> {
        self.conditional_next
            .iter()
            .find(|edge| edge.when.evaluate(region))
            .map(|edge| edge.to.as_str())
            .or(self.next.as_deref())
    }

    /// Root node-region keys this node reads.
    pub fn reads(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = match &self.kind {
            NodeKind::Generate(n) => n.prompt.references(),
            NodeKind::InvokeTool(n) => n.args.values().flat_map(value_references).collect(),
            NodeKind::Emit(n) => n.content.references(),
            NodeKind::Reflect(n) => n.content.references(),
            NodeKind::Record(n) => n.content.references(),
            NodeKind::Invoke(n) => n.args.values().flat_map(value_references).collect(),
            NodeKind::Pass | NodeKind::EnterSession(_) | NodeKind::LeaveSession(_) => Vec::new(),
        };
        keys.extend(self.conditional_next.iter().map(|c| c.when.root_key()));
        keys
    }

    /// Node-region keys this node writes.
    pub fn writes(&self) -> Vec<&str> {
        match &self.kind {
            NodeKind::Generate(n) => vec![n.output_key.as_str()],
            NodeKind::InvokeTool(n) => vec![n.output_key.as_str()],
            NodeKind::Invoke(n) => {
                let mut keys: Vec<&str> = n.output_key.as_deref().into_iter().collect();
                if n.on_failure.is_some() {
                    keys.push(ERROR_KEY);
                }
                keys
            }
            NodeKind::EnterSession(_) => vec![ERROR_KEY],
            _ => Vec::new(),
        }
    }

    /// Window ratio this node declares, if any.
    pub fn window_ratio(&self) -> Option<f64> {
        match &self.kind {
            NodeKind::EnterSession(n) => n.window_ratio,
            NodeKind::Invoke(n) => n.window_ratio,
            _ => None,
        }
    }

    /// Profile declared by a `generate` node.
    pub fn profile(&self) -> Option<ProfileName> {
        match &self.kind {
            NodeKind::Generate(n) => Some(n.profile),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playbook::Predicate;
    use serde_json::json;

    #[test]
    fn test_deserialize_tagged_nodes() {
        let node: Node = serde_json::from_value(json!({
            "id": "ask",
            "type": "generate",
            "profile": "router",
            "prompt": "Pick one for {topic}",
            "next": "done",
            "conditional_next": [{"when": "last == \"search\"", "to": "search"}]
        }))
        .unwrap();
        let NodeKind::Generate(generate) = &node.kind else {
            panic!("expected generate");
        };
        assert_eq!(generate.profile, ProfileName::Router);
        assert_eq!(generate.output_key, "last");
        assert_eq!(node.targets(), vec!["search", "done"]);
        assert_eq!(node.reads(), vec!["topic", "last"]);

        let pass: Node = serde_json::from_value(json!({"id": "p", "type": "pass"})).unwrap();
        assert_eq!(pass.kind, NodeKind::Pass);
        assert!(pass.next.is_none());
    }

    #[test]
    fn test_invoke_defaults() {
        let node: Node = serde_json::from_value(json!({
            "id": "call",
            "type": "invoke",
            "playbook": "summarize",
            "args": {"topic": "{subject}"},
            "on_failure": "recover"
        }))
        .unwrap();
        let NodeKind::Invoke(invoke) = &node.kind else {
            panic!("expected invoke");
        };
        assert_eq!(invoke.mode, InvocationMode::Inline);
        assert!(!invoke.propagate);
        assert!(invoke.summarize);
        assert_eq!(node.targets(), vec!["recover"]);
        assert_eq!(node.reads(), vec!["subject"]);
        assert_eq!(node.writes(), vec!["error"]);
    }

    #[test]
    fn test_select_next_prefers_first_matching_branch() {
        let node = Node::new("route", NodeKind::Pass)
            .with_branch(Predicate::parse("a").unwrap(), "first")
            .with_branch(Predicate::parse("b").unwrap(), "second")
            .with_next("fallback");

        let mut region = NodeRegion::new();
        assert_eq!(node.select_next(&region), Some("fallback"));
        region.insert("b", json!(true)).unwrap();
        assert_eq!(node.select_next(&region), Some("second"));
        region.insert("a", json!("yes")).unwrap();
        assert_eq!(node.select_next(&region), Some("first"));
    }

    #[test]
    fn test_type_names_cover_tags() {
        for name in NODE_TYPES {
            let raw = match *name {
                "generate" => json!({"id": "n", "type": name, "profile": "worker", "prompt": "x"}),
                "invoke_tool" => json!({"id": "n", "type": name, "tool": "now"}),
                "invoke" => json!({"id": "n", "type": name, "playbook": "p"}),
                "emit" | "reflect" | "record" => json!({"id": "n", "type": name, "content": "x"}),
                _ => json!({"id": "n", "type": name}),
            };
            let node: Node = serde_json::from_value(raw).unwrap();
            assert_eq!(node.kind.type_name(), *name);
        }
    }
}
