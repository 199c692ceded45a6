//! Mocks and fixtures shared by the Trellis test suites.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use trellis_core::error::{Result, TrellisError};
use trellis_core::traits::{MemoryStore, ModelClient, Surface, Tool};
use trellis_core::types::*;

/// Scripted model. Responses are consumed in order; once the script runs
/// out, the model echoes the last user message back as text.
#[derive(Default)]
pub struct MockModel {
    script: Mutex<VecDeque<Result<Generation>>>,
    requests: Mutex<Vec<GenerateRequest>>,
}

impl MockModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_text(self, text: impl Into<String>) -> Self {
        self.push(Ok(Generation::text(text, Usage::new(10, 5))));
        self
    }

    pub fn with_structured(self, value: serde_json::Value) -> Self {
        self.push(Ok(Generation::structured(value, Usage::new(10, 5))));
        self
    }

    pub fn with_error(self, message: impl Into<String>) -> Self {
        self.push(Err(TrellisError::ModelRequest(message.into())));
        self
    }

    fn push(&self, response: Result<Generation>) {
        self.script.lock().unwrap().push_back(response);
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<GenerateRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl ModelClient for MockModel {
    fn generate(&self, request: GenerateRequest) -> BoxFuture<'_, Result<Generation>> {
        let echo = request
            .context
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        self.requests.lock().unwrap().push(request);
        let next = self.script.lock().unwrap().pop_front();
        Box::pin(async move { next.unwrap_or_else(|| Ok(Generation::text(echo, Usage::new(1, 1)))) })
    }
}

/// In-memory store that can be switched into a failing mode.
#[derive(Default)]
pub struct MockMemory {
    entries: Mutex<Vec<MemoryEntry>>,
    failing: AtomicBool,
}

impl MockMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent append fail.
    pub fn fail_appends(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn entries(&self) -> Vec<MemoryEntry> {
        self.entries.lock().unwrap().clone()
    }

    pub fn tagged(&self, tag: &str) -> Vec<MemoryEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.has_tag(tag))
            .collect()
    }
}

impl MemoryStore for MockMemory {
    fn append(&self, entry: MemoryEntry) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.failing.load(Ordering::SeqCst) {
                return Err(TrellisError::Memory("store unavailable".into()));
            }
            self.entries.lock().unwrap().push(entry);
            Ok(())
        })
    }

    fn recall(&self, agent_id: &str, limit: usize) -> BoxFuture<'_, Result<Vec<MemoryEntry>>> {
        let agent_id = agent_id.to_string();
        Box::pin(async move {
            let matching: Vec<MemoryEntry> = self
                .entries
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.agent_id == agent_id && e.has_tag(TAG_LONG_TERM))
                .cloned()
                .collect();
            let skip = matching.len().saturating_sub(limit);
            Ok(matching.into_iter().skip(skip).collect())
        })
    }
}

/// Surface that keeps every delivery as `(agent_id, content)`.
#[derive(Default)]
pub struct RecordingSurface {
    deliveries: Mutex<Vec<(String, String)>>,
}

impl RecordingSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deliveries(&self) -> Vec<(String, String)> {
        self.deliveries.lock().unwrap().clone()
    }
}

impl Surface for RecordingSurface {
    fn deliver(&self, agent_id: &str, content: &str) -> BoxFuture<'_, Result<()>> {
        let delivery = (agent_id.to_string(), content.to_string());
        Box::pin(async move {
            self.deliveries.lock().unwrap().push(delivery);
            Ok(())
        })
    }
}

/// Returns its input unchanged.
pub struct EchoTool;

impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the input back"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object"})
    }

    fn execute(&self, input: serde_json::Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move { Ok(ToolResult::success(input.to_string())) })
    }
}

/// Cancels a token when called, standing in for a user interrupting a run
/// while a tool call is in flight.
pub struct CancelTool {
    token: CancellationToken,
}

impl CancelTool {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }
}

impl Tool for CancelTool {
    fn name(&self) -> &str {
        "interrupt"
    }

    fn description(&self) -> &str {
        "Cancel the current run"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object"})
    }

    fn execute(&self, _input: serde_json::Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            self.token.cancel();
            Ok(ToolResult::success("interrupted"))
        })
    }
}

/// The acting agent used across tests.
pub fn test_agent() -> AgentIdentity {
    AgentIdentity::new("ada", "Ada")
}

pub mod fixtures {
    //! Playbook documents used by more than one test suite.

    /// Compose a greeting, then emit it.
    pub const GREET: &str = r#"{
        "name": "greet",
        "description": "Say hello",
        "start_node": "compose",
        "input_schema": [{"name": "name", "description": "Who to greet"}],
        "nodes": [
            {"id": "compose", "type": "generate", "profile": "conversation",
             "prompt": "Greet {name} warmly.", "next": "say"},
            {"id": "say", "type": "emit", "content": "{last}"}
        ]
    }"#;

    /// Writes its only argument back as the result.
    pub const SUMMARIZE: &str = r#"{
        "name": "summarize",
        "start_node": "work",
        "input_schema": [{"name": "topic", "description": "What to summarize"}],
        "nodes": [
            {"id": "work", "type": "generate", "profile": "worker",
             "prompt": "Summarize {topic}.", "next": "note"},
            {"id": "note", "type": "record", "content": "summary: {last}", "tags": ["notes"]}
        ]
    }"#;

    /// Calls `summarize` with an explicit argument mapping.
    pub const RESEARCH: &str = r#"{
        "name": "research",
        "start_node": "call",
        "input_schema": [{"name": "subject", "description": "Research subject"}],
        "nodes": [
            {"id": "call", "type": "invoke", "playbook": "summarize",
             "args": {"topic": "{subject}"}, "output_key": "summary", "propagate": true,
             "next": "tell"},
            {"id": "tell", "type": "emit", "content": "{summary}"}
        ]
    }"#;

    /// Never reaches a terminal node.
    pub const SPIN: &str = r#"{
        "name": "spin",
        "start_node": "a",
        "nodes": [
            {"id": "a", "type": "pass", "next": "b"},
            {"id": "b", "type": "pass", "next": "a"}
        ]
    }"#;
}
