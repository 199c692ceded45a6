use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use trellis_core::error::{Result, TrellisError};
use trellis_core::traits::Tool;
use trellis_core::types::{ToolContext, ToolDefinition, ToolResult};

/// Registry of tools addressable from `invoke_tool` nodes.
///
/// Built once at startup and shared read-only between runs.
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: BTreeMap::new(),
        }
    }

    /// Register a tool.
    pub fn register(&mut self, tool: impl Tool) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    /// Unregister a tool by name.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// List all registered tool names, sorted.
    pub fn list(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    /// Tool definitions, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect()
    }

    /// Execute a tool by name.
    ///
    /// Unknown names and tool-reported failures are returned as errors so the
    /// calling node fails instead of storing an error string as a result.
    pub async fn execute(
        &self,
        name: &str,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<ToolResult> {
        let tool = self
            .get(name)
            .ok_or_else(|| TrellisError::ToolNotFound(name.to_string()))?;

        let timeout = std::time::Duration::from_secs(tool.timeout_secs());
        debug!(tool = name, timeout_secs = tool.timeout_secs(), "Executing tool");

        let result = match tokio::time::timeout(timeout, tool.execute(input, ctx)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(TrellisError::ToolTimeout {
                    tool: name.to_string(),
                    timeout_secs: tool.timeout_secs(),
                })
            }
        };

        if result.is_error {
            return Err(TrellisError::ToolExecution {
                tool: name.to_string(),
                message: result.content,
            });
        }
        Ok(result)
    }

    /// Create a registry with all built-in tools registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(crate::builtin::data::JsonQueryTool);
        registry.register(crate::builtin::time::NowTool);
        registry
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use trellis_core::types::ThreadId;
    use trellis_test_utils::EchoTool;

    struct FailingTool;

    impl Tool for FailingTool {
        fn name(&self) -> &str {
            "fail"
        }
        fn description(&self) -> &str {
            "Always reports an error."
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        fn execute(
            &self,
            _input: serde_json::Value,
            _ctx: ToolContext,
        ) -> BoxFuture<'_, Result<ToolResult>> {
            Box::pin(async { Ok(ToolResult::error("disk on fire")) })
        }
    }

    struct SlowTool;

    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "Sleeps past its timeout."
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        fn execute(
            &self,
            _input: serde_json::Value,
            _ctx: ToolContext,
        ) -> BoxFuture<'_, Result<ToolResult>> {
            Box::pin(async {
                tokio::time::sleep(std::time::Duration::from_secs(10)).await;
                Ok(ToolResult::success("late"))
            })
        }
        fn timeout_secs(&self) -> u64 {
            1
        }
    }

    fn ctx() -> ToolContext {
        ToolContext {
            agent_id: "ada".into(),
            thread_id: ThreadId::from_str("root"),
            working_dir: std::env::temp_dir(),
        }
    }

    #[tokio::test]
    async fn test_execute_registered_tool() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        let result = registry
            .execute("echo", serde_json::json!({"text": "hi"}), ctx())
            .await
            .unwrap();
        assert_eq!(result.to_value(), serde_json::json!({"text": "hi"}));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_an_error() {
        let registry = ToolRegistry::new();
        let err = registry
            .execute("missing", serde_json::json!({}), ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, TrellisError::ToolNotFound(name) if name == "missing"));
    }

    #[tokio::test]
    async fn test_tool_error_result_becomes_error() {
        let mut registry = ToolRegistry::new();
        registry.register(FailingTool);
        let err = registry
            .execute("fail", serde_json::json!({}), ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, TrellisError::ToolExecution { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let mut registry = ToolRegistry::new();
        registry.register(SlowTool);
        let err = registry
            .execute("slow", serde_json::json!({}), ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, TrellisError::ToolTimeout { timeout_secs: 1, .. }));
    }

    #[test]
    fn test_builtins_are_sorted() {
        let registry = ToolRegistry::with_builtins();
        assert_eq!(registry.list(), vec!["json_query", "now"]);
        assert_eq!(registry.definitions().len(), 2);
    }
}
