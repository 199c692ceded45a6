use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::*;

/// Model layer: free-text or schema-constrained generation.
pub trait ModelClient: Send + Sync + 'static {
    /// Generate a completion for the given context.
    ///
    /// When `request.response_schema` is set the implementation should return
    /// `GenerationOutput::Structured`; the engine validates it either way.
    fn generate(&self, request: GenerateRequest) -> BoxFuture<'_, Result<Generation>>;
}

/// Tool: a named callable exposed through the registry.
pub trait Tool: Send + Sync + 'static {
    /// Tool name, as referenced by `invoke_tool` nodes.
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema for tool input.
    fn input_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given argument mapping.
    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>>;

    /// Timeout in seconds for this tool.
    fn timeout_secs(&self) -> u64 {
        30
    }
}

/// Memory store: persistent agent memory owned by the host.
pub trait MemoryStore: Send + Sync + 'static {
    /// Append one entry.
    fn append(&self, entry: MemoryEntry) -> BoxFuture<'_, Result<()>>;

    /// Most recent long-term entries for an agent, oldest first.
    ///
    /// Only the `conversation` profile reads through this path.
    fn recall(&self, agent_id: &str, limit: usize) -> BoxFuture<'_, Result<Vec<MemoryEntry>>>;
}

/// User-facing surface, where `emit` nodes deliver text.
pub trait Surface: Send + Sync + 'static {
    fn deliver(&self, agent_id: &str, content: &str) -> BoxFuture<'_, Result<()>>;
}
