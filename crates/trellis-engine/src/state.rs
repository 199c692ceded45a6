//! Per-run execution state.
//!
//! [`ExecutionState`] has two disjoint regions. The system region is owned by
//! the interpreter and the thread manager, and flows into sub-workflows
//! without being named. The node region is the only space playbook nodes can
//! see, and the only place caller arguments land.

use std::collections::BTreeMap;

use futures::channel::mpsc::UnboundedSender;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use trellis_core::error::{Result, TrellisError};
use trellis_core::types::{AgentIdentity, PromptMessage, ThreadId, Usage};

/// Names owned by the system region. Playbooks that read or write any of
/// them are rejected at load time.
pub const RESERVED_KEYS: &[&str] = &[
    "agent",
    "history",
    "environment",
    "cancel",
    "usage",
    "trace",
    "orchestration",
    "sessions",
    "thread",
    "call_depth",
];

/// Whether the root segment of `key` is a system-region name.
pub fn is_reserved(key: &str) -> bool {
    let root = key.split('.').next().unwrap_or(key);
    RESERVED_KEYS.contains(&root)
}

/// Strings render raw; everything else as compact JSON.
pub fn display_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Free-form key/value space visible to playbook nodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeRegion(BTreeMap<String, serde_json::Value>);

impl NodeRegion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a fresh region from resolved call arguments.
    pub fn from_args(args: BTreeMap<String, serde_json::Value>) -> Result<Self> {
        let mut region = Self::new();
        for (key, value) in args {
            region.insert(key, value)?;
        }
        Ok(region)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: serde_json::Value) -> Result<()> {
        let key = key.into();
        if is_reserved(&key) {
            return Err(TrellisError::ReservedKey(key));
        }
        self.0.insert(key, value);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    /// Resolve a dotted path: object fields by name, array items by index.
    pub fn lookup(&self, path: &str) -> Option<&serde_json::Value> {
        let mut segments = path.split('.');
        let mut current = self.0.get(segments.next()?)?;
        for segment in segments {
            current = match current {
                serde_json::Value::Object(map) => map.get(segment)?,
                serde_json::Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One dispatched node, in run order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub playbook: String,
    pub node_id: String,
    pub node_type: String,
    pub step: usize,
    pub call_depth: usize,
    pub elapsed_ms: u64,
}

/// What a caller supplies when starting a top-level run.
#[derive(Debug, Clone)]
pub struct SystemContext {
    pub agent: AgentIdentity,
    /// Running conversation history, oldest first.
    pub history: Vec<PromptMessage>,
    /// Live environment facts shown to the `conversation` profile.
    pub environment: BTreeMap<String, String>,
    pub cancel: CancellationToken,
    /// True when the run is a top-level orchestration run rather than a
    /// reply to a user exchange.
    pub orchestration: bool,
}

impl SystemContext {
    pub fn new(agent: AgentIdentity) -> Self {
        Self {
            agent,
            history: Vec::new(),
            environment: BTreeMap::new(),
            cancel: CancellationToken::new(),
            orchestration: false,
        }
    }

    pub fn with_history(mut self, history: Vec<PromptMessage>) -> Self {
        self.history = history;
        self
    }

    pub fn with_environment(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn orchestration(mut self, orchestration: bool) -> Self {
        self.orchestration = orchestration;
        self
    }
}

/// Interpreter-owned state, propagated into every sub-workflow.
#[derive(Debug, Clone)]
pub struct SystemRegion {
    pub agent: AgentIdentity,
    pub history: Vec<PromptMessage>,
    pub environment: BTreeMap<String, String>,
    pub cancel: CancellationToken,
    pub usage: Usage,
    pub trace: Vec<TraceEntry>,
    pub orchestration: bool,
    /// Sessions opened by `enter_session` in this run, innermost last.
    /// `None` marks a rejected enter so the paired leave becomes a no-op.
    pub sessions: Vec<Option<ThreadId>>,
    /// 0 for a top-level run, +1 per sub-workflow.
    pub call_depth: usize,
    /// Live channel for streaming emissions.
    pub emitter: Option<UnboundedSender<OutputFragment>>,
}

impl SystemRegion {
    pub fn new(ctx: SystemContext) -> Self {
        Self {
            agent: ctx.agent,
            history: ctx.history,
            environment: ctx.environment,
            cancel: ctx.cancel,
            usage: Usage::default(),
            trace: Vec::new(),
            orchestration: ctx.orchestration,
            sessions: Vec::new(),
            call_depth: 0,
            emitter: None,
        }
    }

    pub fn is_top_level(&self) -> bool {
        self.call_depth == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Emission,
    Record,
}

/// One entry of a run's accumulated output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Output {
    pub node_id: String,
    pub kind: OutputKind,
    pub content: String,
}

/// One item of the streaming invocation surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputFragment {
    /// User-visible text, sent as soon as it is delivered.
    Emission { node_id: String, content: String },
    Completed { outputs: Vec<Output>, usage: Usage },
    Cancelled { outputs: Vec<Output> },
    Failed { error: String },
}

impl OutputFragment {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Emission { .. })
    }
}

/// The mutable record threaded through one playbook run.
#[derive(Debug, Clone)]
pub struct ExecutionState {
    pub system: SystemRegion,
    pub node: NodeRegion,
    pub outputs: Vec<Output>,
    /// The thread this run's nodes act in.
    pub thread: ThreadId,
}

impl ExecutionState {
    pub fn new(system: SystemRegion, node: NodeRegion, thread: ThreadId) -> Self {
        Self {
            system,
            node,
            outputs: Vec::new(),
            thread,
        }
    }

    /// State for a sub-workflow: the system region carries over, the node
    /// region is exactly the resolved arguments.
    pub fn for_callee(&self, args: NodeRegion, thread: ThreadId) -> Self {
        let mut system = self.system.clone();
        system.call_depth += 1;
        system.sessions = Vec::new();
        Self::new(system, args, thread)
    }

    /// Take back system-region changes from a finished callee. Sessions the
    /// callee left open become the caller's to close.
    pub fn absorb_system(&mut self, mut callee: SystemRegion) {
        let sessions = std::mem::take(&mut callee.sessions);
        self.absorb_failed(callee);
        self.system.sessions.extend(sessions);
    }

    /// Take back usage and trace from a callee that failed. Its sessions were
    /// aborted with it and are not handed over.
    pub fn absorb_failed(&mut self, callee: SystemRegion) {
        self.system.usage = callee.usage;
        self.system.trace = callee.trace;
    }

    /// Emissions and records count as output; a record only outside a
    /// top-level orchestration run.
    pub fn contributes_record(&self) -> bool {
        !(self.system.is_top_level() && self.system.orchestration)
    }

    pub fn push_output(&mut self, node_id: &str, kind: OutputKind, content: String) {
        self.outputs.push(Output {
            node_id: node_id.to_string(),
            kind,
            content,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state() -> ExecutionState {
        let ctx = SystemContext::new(AgentIdentity::new("ada", "Ada")).orchestration(true);
        ExecutionState::new(SystemRegion::new(ctx), NodeRegion::new(), ThreadId::from_str("root"))
    }

    #[test]
    fn test_reserved_keys_rejected() {
        let mut region = NodeRegion::new();
        assert!(matches!(
            region.insert("history", json!([])),
            Err(TrellisError::ReservedKey(k)) if k == "history"
        ));
        assert!(is_reserved("usage.input_tokens"));
        assert!(!is_reserved("usage_note"));
        region.insert("topic", json!("oceans")).unwrap();
        assert_eq!(region.len(), 1);
    }

    #[test]
    fn test_lookup_paths() {
        let mut region = NodeRegion::new();
        region
            .insert("result", json!({"items": [{"name": "a"}, {"name": "b"}]}))
            .unwrap();
        assert_eq!(region.lookup("result.items.1.name"), Some(&json!("b")));
        assert_eq!(region.lookup("result.items.9"), None);
        assert_eq!(region.lookup("result.missing"), None);
        assert_eq!(region.lookup("nothing"), None);
    }

    #[test]
    fn test_callee_state_is_isolated() {
        let mut caller = state();
        caller.node.insert("subject", json!("oceans")).unwrap();
        caller.node.insert("secret", json!("hidden")).unwrap();
        caller.system.sessions.push(Some(ThreadId::from_str("open")));

        let args = NodeRegion::from_args([("topic".to_string(), json!("oceans"))].into()).unwrap();
        let callee = caller.for_callee(args, caller.thread.clone());
        assert_eq!(callee.node.keys().collect::<Vec<_>>(), vec!["topic"]);
        assert_eq!(callee.system.call_depth, 1);
        assert!(callee.system.sessions.is_empty());
        assert!(callee.outputs.is_empty());
        assert_eq!(callee.system.agent.id, "ada");
    }

    #[test]
    fn test_absorb_system() {
        let mut caller = state();
        let mut callee = caller.for_callee(NodeRegion::new(), caller.thread.clone());
        callee.system.usage.add(Usage::new(5, 7));
        callee.system.sessions.push(Some(ThreadId::from_str("left-open")));
        caller.absorb_system(callee.system);
        assert_eq!(caller.system.usage.total(), 12);
        assert_eq!(caller.system.sessions.len(), 1);
    }

    #[test]
    fn test_record_contribution_rules() {
        let top = state();
        assert!(!top.contributes_record());
        let nested = top.for_callee(NodeRegion::new(), top.thread.clone());
        assert!(nested.contributes_record());

        let mut reply = state();
        reply.system.orchestration = false;
        assert!(reply.contributes_record());
    }
}
