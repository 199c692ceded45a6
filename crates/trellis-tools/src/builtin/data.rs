use futures::future::BoxFuture;
use serde::Deserialize;

use trellis_core::error::{Result, TrellisError};
use trellis_core::traits::Tool;
use trellis_core::types::{ToolContext, ToolResult};

// ── JsonQueryTool ───────────────────────────────────────────────

pub struct JsonQueryTool;

#[derive(Deserialize)]
struct JsonQueryInput {
    /// Either a JSON value or a string containing JSON.
    json: serde_json::Value,
    path: String,
}

impl Tool for JsonQueryTool {
    fn name(&self) -> &str {
        "json_query"
    }
    fn description(&self) -> &str {
        "Query a JSON value by dot-notation path (e.g. 'foo.bar[0].baz')."
    }
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "json": { "description": "JSON value (or JSON string) to query" },
                "path": { "type": "string", "description": "Dot-notation path (e.g. 'items[0].name')" }
            },
            "required": ["json", "path"]
        })
    }
    fn execute(
        &self,
        input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let p: JsonQueryInput = serde_json::from_value(input)
                .map_err(|e| TrellisError::ToolValidation(e.to_string()))?;
            let value = match p.json {
                serde_json::Value::String(raw) => serde_json::from_str(&raw)
                    .map_err(|e| TrellisError::ToolValidation(format!("Invalid JSON: {}", e)))?,
                other => other,
            };
            let result = json_path_query(&value, &p.path);
            Ok(ToolResult::success(serde_json::to_string(&result)?))
        })
    }
}

fn json_path_query(value: &serde_json::Value, path: &str) -> serde_json::Value {
    let mut current = value;
    for segment in path.split('.') {
        if segment.is_empty() {
            continue;
        }
        // key[0]
        let (key, index) = match segment.find('[') {
            Some(pos) => (
                &segment[..pos],
                segment[pos + 1..].trim_end_matches(']').parse::<usize>().ok(),
            ),
            None => (segment, None),
        };
        if !key.is_empty() {
            current = match current.get(key) {
                Some(v) => v,
                None => return serde_json::Value::Null,
            };
        }
        if let Some(idx) = index {
            current = match current.get(idx) {
                Some(v) => v,
                None => return serde_json::Value::Null,
            };
        }
    }
    current.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::types::ThreadId;

    fn ctx() -> ToolContext {
        ToolContext {
            agent_id: "ada".into(),
            thread_id: ThreadId::from_str("root"),
            working_dir: std::env::temp_dir(),
        }
    }

    #[test]
    fn test_path_query() {
        let value = serde_json::json!({"items": [{"name": "first"}, {"name": "second"}]});
        assert_eq!(json_path_query(&value, "items[1].name"), serde_json::json!("second"));
        assert_eq!(json_path_query(&value, "items[5].name"), serde_json::Value::Null);
        assert_eq!(json_path_query(&value, "missing"), serde_json::Value::Null);
    }

    #[tokio::test]
    async fn test_accepts_json_string_input() {
        let result = JsonQueryTool
            .execute(
                serde_json::json!({"json": r#"{"a": {"b": 7}}"#, "path": "a.b"}),
                ctx(),
            )
            .await
            .unwrap();
        assert_eq!(result.to_value(), serde_json::json!(7));
    }

    #[tokio::test]
    async fn test_rejects_missing_path() {
        let err = JsonQueryTool
            .execute(serde_json::json!({"json": {}}), ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, TrellisError::ToolValidation(_)));
    }
}
