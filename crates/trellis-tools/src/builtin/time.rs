use futures::future::BoxFuture;

use trellis_core::error::Result;
use trellis_core::traits::Tool;
use trellis_core::types::{ToolContext, ToolResult};

/// Current UTC time, for playbooks that stamp or schedule things.
pub struct NowTool;

impl Tool for NowTool {
    fn name(&self) -> &str {
        "now"
    }
    fn description(&self) -> &str {
        "Return the current UTC time as RFC 3339 plus a unix timestamp."
    }
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object", "properties": {} })
    }
    fn execute(
        &self,
        _input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let now = chrono::Utc::now();
            let body = serde_json::json!({
                "rfc3339": now.to_rfc3339(),
                "unix": now.timestamp(),
            });
            Ok(ToolResult::success(body.to_string()))
        })
    }
}
