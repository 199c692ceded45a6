use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Memory tag for user-facing exchanges.
pub const TAG_CONVERSATION: &str = "conversation";
/// Memory tag for private agent thoughts.
pub const TAG_INTERNAL: &str = "internal";
/// Memory tag read back by the `conversation` profile as long-term memory.
pub const TAG_LONG_TERM: &str = "memory";

/// Unique thread (nested session) identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ThreadId(pub String);

impl ThreadId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }

    /// First eight characters, used in one-line renderings.
    pub fn short(&self) -> &str {
        let end = self.0.char_indices().nth(8).map_or(self.0.len(), |(i, _)| i);
        &self.0[..end]
    }
}

impl Default for ThreadId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The agent a run acts on behalf of.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
}

impl AgentIdentity {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            persona: None,
        }
    }

    pub fn with_persona(mut self, persona: impl Into<String>) -> Self {
        self.persona = Some(persona.into());
        self
    }
}

/// Role in a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }

    /// Parse a stored role, defaulting unknown values to `User`.
    pub fn parse(s: &str) -> Self {
        match s {
            "system" => Self::System,
            "assistant" => Self::Assistant,
            "tool" => Self::Tool,
            _ => Self::User,
        }
    }
}

/// One message of an assembled prompt. Carries no timestamp so that the
/// same session state always produces the same bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

impl PromptMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }
}

/// Model tier requested from the model layer.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    #[default]
    Standard,
    Light,
}

/// The exact context handed to the model layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptContext {
    pub system: String,
    pub messages: Vec<PromptMessage>,
}

impl PromptContext {
    /// Canonical byte encoding. Field order is fixed by the struct layout,
    /// so equal contexts always encode to equal bytes.
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// A request to the model layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub context: PromptContext,
    pub tier: ModelTier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_schema: Option<serde_json::Value>,
}

/// What the model produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum GenerationOutput {
    Text(String),
    Structured(serde_json::Value),
}

impl GenerationOutput {
    pub fn into_value(self) -> serde_json::Value {
        match self {
            Self::Text(text) => serde_json::Value::String(text),
            Self::Structured(value) => value,
        }
    }
}

/// Token usage reported by the model layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn add(&mut self, other: Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Result of one model call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    pub output: GenerationOutput,
    #[serde(default)]
    pub usage: Usage,
}

impl Generation {
    pub fn text(text: impl Into<String>, usage: Usage) -> Self {
        Self {
            output: GenerationOutput::Text(text.into()),
            usage,
        }
    }

    pub fn structured(value: serde_json::Value, usage: Usage) -> Self {
        Self {
            output: GenerationOutput::Structured(value),
            usage,
        }
    }
}

/// Result of a tool execution.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }

    /// JSON content is stored structurally, anything else as a string.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::from_str(&self.content)
            .unwrap_or_else(|_| serde_json::Value::String(self.content.clone()))
    }
}

/// Tool definition, as listed by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Context passed to tools during execution.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub agent_id: String,
    pub thread_id: ThreadId,
    pub working_dir: PathBuf,
}

/// A record appended to the memory store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub agent_id: String,
    pub role: String,
    pub content: String,
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_scope: Option<ThreadId>,
    pub timestamp: DateTime<Utc>,
}

impl MemoryEntry {
    pub fn new(
        agent_id: impl Into<String>,
        role: impl Into<String>,
        content: impl Into<String>,
        tags: Vec<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            role: role.into(),
            content: content.into(),
            tags,
            thread_scope: None,
            timestamp: Utc::now(),
        }
    }

    pub fn in_thread(mut self, thread: ThreadId) -> Self {
        self.thread_scope = Some(thread);
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// Full-text search hit from the memory store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub agent_id: String,
    pub role: String,
    pub content: String,
    pub tags: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub rank: f64,
}

/// Engine event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A playbook run started.
    RunStarted { agent_id: String, playbook: String },
    /// A node is about to be dispatched.
    NodeStarted {
        agent_id: String,
        playbook: String,
        node_id: String,
        step: usize,
    },
    /// A node finished.
    NodeCompleted {
        agent_id: String,
        node_id: String,
        elapsed_ms: u64,
    },
    /// Text delivered to the user-facing surface.
    Emitted { agent_id: String, content: String },
    /// A nested session was entered.
    ThreadEntered {
        agent_id: String,
        thread_id: ThreadId,
        depth: usize,
        budget: u64,
    },
    /// A nested session was left normally.
    ThreadCompleted {
        agent_id: String,
        thread_id: ThreadId,
        chronicle: bool,
    },
    /// A nested session ended on error or cancellation.
    ThreadAborted { agent_id: String, thread_id: ThreadId },
    /// An operation was rejected (depth exceeded, nothing to leave).
    OperationRejected {
        agent_id: String,
        node_id: String,
        reason: String,
    },
    /// Model usage update.
    UsageUpdate {
        agent_id: String,
        input_tokens: u64,
        output_tokens: u64,
    },
    /// A run finished normally.
    RunCompleted {
        agent_id: String,
        playbook: String,
        steps: usize,
        outputs: usize,
    },
    /// A run stopped at a cancellation point.
    RunCancelled { agent_id: String, playbook: String },
    /// A run failed.
    RunFailed {
        agent_id: String,
        playbook: String,
        error: String,
    },
}

impl EngineEvent {
    pub fn agent_id(&self) -> &str {
        match self {
            Self::RunStarted { agent_id, .. }
            | Self::NodeStarted { agent_id, .. }
            | Self::NodeCompleted { agent_id, .. }
            | Self::Emitted { agent_id, .. }
            | Self::ThreadEntered { agent_id, .. }
            | Self::ThreadCompleted { agent_id, .. }
            | Self::ThreadAborted { agent_id, .. }
            | Self::OperationRejected { agent_id, .. }
            | Self::UsageUpdate { agent_id, .. }
            | Self::RunCompleted { agent_id, .. }
            | Self::RunCancelled { agent_id, .. }
            | Self::RunFailed { agent_id, .. } => agent_id,
        }
    }

    /// Whether this event ends a top-level run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::RunCompleted { .. } | Self::RunCancelled { .. } | Self::RunFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_accumulates() {
        let mut usage = Usage::default();
        usage.add(Usage::new(10, 5));
        usage.add(Usage::new(3, 2));
        assert_eq!(usage, Usage::new(13, 7));
        assert_eq!(usage.total(), 20);
    }

    #[test]
    fn test_tool_result_value() {
        let json = ToolResult::success(r#"{"temp": 21}"#);
        assert_eq!(json.to_value(), serde_json::json!({"temp": 21}));

        let text = ToolResult::success("sunny");
        assert_eq!(text.to_value(), serde_json::json!("sunny"));
    }

    #[test]
    fn test_prompt_context_bytes_are_stable() {
        let ctx = PromptContext {
            system: "You are Ada.".into(),
            messages: vec![PromptMessage::user("hi"), PromptMessage::assistant("hello")],
        };
        let a = ctx.to_bytes().unwrap();
        let b = ctx.clone().to_bytes().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_thread_id_short() {
        let id = ThreadId::from_str("0123456789abcdef");
        assert_eq!(id.short(), "01234567");
        assert_eq!(ThreadId::from_str("abc").short(), "abc");
    }

    #[test]
    fn test_role_parse() {
        assert_eq!(Role::parse("assistant"), Role::Assistant);
        assert_eq!(Role::parse("whatever"), Role::User);
        assert_eq!(Role::System.as_str(), "system");
    }
}
