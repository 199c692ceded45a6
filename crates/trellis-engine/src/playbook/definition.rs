use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use trellis_core::error::DefinitionError;

use crate::state::is_reserved;

use super::node::{Node, NodeKind, NODE_TYPES};
use super::transition::Predicate;

/// One declared input parameter. Only a name and a description: where the
/// value comes from is the caller's business.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputParam {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

impl InputParam {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

/// A validated, immutable playbook graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybookDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub start_node: String,
    #[serde(default)]
    pub input_schema: Vec<InputParam>,
    pub nodes: Vec<Node>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl PlaybookDefinition {
    /// Build and validate a definition in code.
    pub fn new(
        name: impl Into<String>,
        start_node: impl Into<String>,
        input_schema: Vec<InputParam>,
        nodes: Vec<Node>,
    ) -> Result<Self, DefinitionError> {
        let mut def = Self {
            name: name.into(),
            description: None,
            start_node: start_node.into(),
            input_schema,
            nodes,
            index: HashMap::new(),
        };
        def.validate()?;
        Ok(def)
    }

    pub fn from_json(source: &str) -> Result<Self, DefinitionError> {
        let raw: serde_json::Value =
            serde_json::from_str(source).map_err(|e| DefinitionError::Malformed(e.to_string()))?;
        Self::from_value(raw)
    }

    pub fn from_toml(source: &str) -> Result<Self, DefinitionError> {
        let raw: toml::Value =
            toml::from_str(source).map_err(|e| DefinitionError::Malformed(e.to_string()))?;
        let raw = serde_json::to_value(raw).map_err(|e| DefinitionError::Malformed(e.to_string()))?;
        Self::from_value(raw)
    }

    /// Load a `.json` or `.toml` document.
    pub fn from_path(path: &Path) -> Result<Self, DefinitionError> {
        let source = std::fs::read_to_string(path)
            .map_err(|e| DefinitionError::Malformed(format!("{}: {}", path.display(), e)))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml(&source),
            Some("json") => Self::from_json(&source),
            other => Err(DefinitionError::Malformed(format!(
                "{}: unsupported extension {:?}",
                path.display(),
                other
            ))),
        }
    }

    fn from_value(raw: serde_json::Value) -> Result<Self, DefinitionError> {
        prescan(&raw)?;
        let mut def: Self =
            serde_json::from_value(raw).map_err(|e| DefinitionError::Malformed(e.to_string()))?;
        def.validate()?;
        debug!(playbook = %def.name, nodes = def.nodes.len(), "Loaded playbook");
        Ok(def)
    }

    /// Check graph structure and rebuild the node index.
    pub fn validate(&mut self) -> Result<(), DefinitionError> {
        let playbook = self.name.clone();
        if self.nodes.is_empty() {
            return Err(DefinitionError::Empty { playbook });
        }

        let mut index = HashMap::with_capacity(self.nodes.len());
        for (i, node) in self.nodes.iter().enumerate() {
            if index.insert(node.id.clone(), i).is_some() {
                return Err(DefinitionError::DuplicateNode {
                    playbook,
                    node: node.id.clone(),
                });
            }
        }

        if !index.contains_key(&self.start_node) {
            return Err(DefinitionError::MissingStart {
                playbook,
                node: self.start_node.clone(),
            });
        }

        let mut params = HashSet::new();
        for param in &self.input_schema {
            if is_reserved(&param.name) {
                return Err(DefinitionError::ReservedKey {
                    playbook,
                    node: "input_schema".into(),
                    key: param.name.clone(),
                });
            }
            if !params.insert(param.name.as_str()) {
                return Err(DefinitionError::DuplicateParam {
                    playbook,
                    param: param.name.clone(),
                });
            }
        }

        for node in &self.nodes {
            for target in node.targets() {
                if !index.contains_key(target) {
                    return Err(DefinitionError::MissingTarget {
                        playbook,
                        from: node.id.clone(),
                        to: target.to_string(),
                    });
                }
            }

            if let Some(key) = node
                .reads()
                .into_iter()
                .chain(node.writes())
                .find(|k| is_reserved(k))
            {
                return Err(DefinitionError::ReservedKey {
                    playbook,
                    node: node.id.clone(),
                    key: key.to_string(),
                });
            }

            if let Some(ratio) = node.window_ratio() {
                if !(ratio > 0.0 && ratio <= 1.0) {
                    return Err(DefinitionError::InvalidWindowRatio {
                        playbook,
                        node: node.id.clone(),
                        ratio,
                    });
                }
            }

            if let NodeKind::Generate(generate) = &node.kind {
                if let Some(schema) = &generate.response_schema {
                    jsonschema::Validator::new(schema).map_err(|e| {
                        DefinitionError::InvalidSchema {
                            playbook: playbook.clone(),
                            node: node.id.clone(),
                            reason: e.to_string(),
                        }
                    })?;
                }
            }
        }

        self.index = index;
        Ok(())
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.index.get(id).and_then(|&i| self.nodes.get(i))
    }

    pub fn start(&self) -> Option<&Node> {
        self.node(&self.start_node)
    }

    pub fn param_names(&self) -> impl Iterator<Item = &str> {
        self.input_schema.iter().map(|p| p.name.as_str())
    }

    /// Invoke nodes, for cross-playbook link checks.
    pub fn invocations(&self) -> impl Iterator<Item = (&Node, &super::InvokeNode)> {
        self.nodes.iter().filter_map(|n| match &n.kind {
            NodeKind::Invoke(invoke) => Some((n, invoke)),
            _ => None,
        })
    }
}

/// Reject unknown node types and bad predicates with the node id attached,
/// before serde reports them as anonymous parse errors.
fn prescan(raw: &serde_json::Value) -> Result<(), DefinitionError> {
    let playbook = raw
        .get("name")
        .and_then(|v| v.as_str())
        .unwrap_or("<unnamed>")
        .to_string();
    let Some(nodes) = raw.get("nodes").and_then(|v| v.as_array()) else {
        return Ok(());
    };
    for (i, node) in nodes.iter().enumerate() {
        let id = node
            .get("id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| format!("#{}", i));
        match node.get("type").and_then(|v| v.as_str()) {
            Some(t) if NODE_TYPES.contains(&t) => {}
            Some(t) => {
                return Err(DefinitionError::UnknownNodeType {
                    playbook,
                    node: id,
                    node_type: t.to_string(),
                })
            }
            None => {
                return Err(DefinitionError::Malformed(format!(
                    "playbook '{}': node '{}' has no type",
                    playbook, id
                )))
            }
        }
        let edges = node.get("conditional_next").and_then(|v| v.as_array());
        for when in edges.into_iter().flatten().filter_map(|e| e.get("when")) {
            let expr = when.as_str().unwrap_or_default();
            if let Err(reason) = Predicate::parse(expr) {
                return Err(DefinitionError::InvalidPredicate {
                    playbook,
                    node: id,
                    expr: expr.to_string(),
                    reason,
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const GREET: &str = r#"{
        "name": "greet",
        "start_node": "compose",
        "input_schema": [{"name": "name", "description": "Who to greet"}],
        "nodes": [
            {"id": "compose", "type": "generate", "profile": "conversation",
             "prompt": "Say hello to {name}", "next": "say"},
            {"id": "say", "type": "emit", "content": "{last}"}
        ]
    }"#;

    #[test]
    fn test_load_json() {
        let def = PlaybookDefinition::from_json(GREET).unwrap();
        assert_eq!(def.name, "greet");
        assert_eq!(def.start().unwrap().id, "compose");
        assert_eq!(def.node("say").unwrap().kind.type_name(), "emit");
        assert_eq!(def.param_names().collect::<Vec<_>>(), vec!["name"]);
    }

    #[test]
    fn test_load_toml() {
        let source = r#"
name = "tick"
start_node = "a"

[[nodes]]
id = "a"
type = "pass"
next = "b"

[[nodes]]
id = "b"
type = "reflect"
content = "tick"
"#;
        let def = PlaybookDefinition::from_toml(source).unwrap();
        assert_eq!(def.nodes.len(), 2);
        assert!(def.input_schema.is_empty());
    }

    #[test]
    fn test_dangling_transition_rejected_at_load() {
        let source = GREET.replace(r#""next": "say""#, r#""next": "nowhere""#);
        let err = PlaybookDefinition::from_json(&source).unwrap_err();
        assert_eq!(
            err,
            DefinitionError::MissingTarget {
                playbook: "greet".into(),
                from: "compose".into(),
                to: "nowhere".into(),
            }
        );
    }

    #[test]
    fn test_unknown_node_type() {
        let source = GREET.replace(r#""type": "emit""#, r#""type": "teleport""#);
        let err = PlaybookDefinition::from_json(&source).unwrap_err();
        assert!(matches!(err, DefinitionError::UnknownNodeType { node_type, .. } if node_type == "teleport"));
    }

    #[test]
    fn test_reserved_key_rejected() {
        let source = GREET.replace("{last}", "{history}");
        let err = PlaybookDefinition::from_json(&source).unwrap_err();
        assert!(matches!(err, DefinitionError::ReservedKey { key, .. } if key == "history"));

        let source = GREET.replace(r#""prompt""#, r#""output_key": "agent", "prompt""#);
        let err = PlaybookDefinition::from_json(&source).unwrap_err();
        assert!(matches!(err, DefinitionError::ReservedKey { key, .. } if key == "agent"));
    }

    #[test]
    fn test_structural_errors() {
        let err = PlaybookDefinition::from_json(&GREET.replace(r#""start_node": "compose""#, r#""start_node": "x""#))
            .unwrap_err();
        assert!(matches!(err, DefinitionError::MissingStart { .. }));

        let err = PlaybookDefinition::from_json(&GREET.replace(r#""id": "say""#, r#""id": "compose""#))
            .unwrap_err();
        assert!(matches!(err, DefinitionError::DuplicateNode { .. }));

        let err = PlaybookDefinition::from_json(r#"{"name": "e", "start_node": "a", "nodes": []}"#)
            .unwrap_err();
        assert!(matches!(err, DefinitionError::Empty { .. }));

        let err = PlaybookDefinition::from_json("{ not json").unwrap_err();
        assert!(matches!(err, DefinitionError::Malformed(_)));
    }

    #[test]
    fn test_bad_predicate_and_ratio() {
        let source = r#"{
            "name": "p", "start_node": "a",
            "nodes": [{"id": "a", "type": "pass", "conditional_next": [{"when": "x ==", "to": "a"}]}]
        }"#;
        let err = PlaybookDefinition::from_json(source).unwrap_err();
        assert!(matches!(err, DefinitionError::InvalidPredicate { node, .. } if node == "a"));

        let source = r#"{
            "name": "r", "start_node": "a",
            "nodes": [{"id": "a", "type": "enter_session", "window_ratio": 1.5}]
        }"#;
        let err = PlaybookDefinition::from_json(source).unwrap_err();
        assert!(matches!(err, DefinitionError::InvalidWindowRatio { ratio, .. } if ratio == 1.5));
    }

    #[test]
    fn test_invalid_response_schema() {
        let source = r#"{
            "name": "s", "start_node": "a",
            "nodes": [{"id": "a", "type": "generate", "profile": "worker", "prompt": "x",
                       "response_schema": {"type": 12}}]
        }"#;
        let err = PlaybookDefinition::from_json(source).unwrap_err();
        assert!(matches!(err, DefinitionError::InvalidSchema { .. }));
    }

    #[test]
    fn test_duplicate_param() {
        let source = r#"{
            "name": "d", "start_node": "a",
            "input_schema": [{"name": "x"}, {"name": "x"}],
            "nodes": [{"id": "a", "type": "pass"}]
        }"#;
        let err = PlaybookDefinition::from_json(source).unwrap_err();
        assert!(matches!(err, DefinitionError::DuplicateParam { param, .. } if param == "x"));
    }
}
