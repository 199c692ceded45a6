use tracing::debug;

use trellis_core::error::{Result, TrellisError};
use trellis_core::types::{EngineEvent, GenerateRequest, GenerationOutput, PromptMessage};

use crate::interpreter::Engine;
use crate::playbook::GenerateNode;
use crate::profile::ProfileName;
use crate::state::ExecutionState;
use crate::thread::ThreadHierarchy;

use super::Step;

pub(super) async fn run(
    engine: &Engine,
    node: &GenerateNode,
    state: &mut ExecutionState,
    hierarchy: &mut ThreadHierarchy,
) -> Result<Step> {
    let prompt = node.prompt.render(&state.node)?;
    let value = call_model(
        engine,
        node.profile,
        prompt,
        node.response_schema.as_ref(),
        state,
        hierarchy,
    )
    .await?;
    state.node.insert(node.output_key.clone(), value)?;
    Ok(Step::Continue)
}

/// Resolve `profile`, append `prompt` as the final user message, and call
/// the model. With a schema the result must be JSON that validates against
/// it; a text reply is parsed before validation.
pub(crate) async fn call_model(
    engine: &Engine,
    profile: ProfileName,
    prompt: String,
    schema: Option<&serde_json::Value>,
    state: &mut ExecutionState,
    hierarchy: &ThreadHierarchy,
) -> Result<serde_json::Value> {
    let resolved = engine.resolver.resolve(profile, state, hierarchy).await?;
    let mut context = resolved.context;
    context.messages.push(PromptMessage::user(prompt));
    debug!(
        profile = %profile,
        tier = ?resolved.tier,
        messages = context.messages.len(),
        "Calling model"
    );

    let generation = engine
        .model
        .generate(GenerateRequest {
            context,
            tier: resolved.tier,
            response_schema: schema.cloned(),
        })
        .await?;

    state.system.usage.add(generation.usage);
    engine.events.publish(EngineEvent::UsageUpdate {
        agent_id: state.system.agent.id.clone(),
        input_tokens: generation.usage.input_tokens,
        output_tokens: generation.usage.output_tokens,
    });

    let Some(schema) = schema else {
        return Ok(generation.output.into_value());
    };
    let value = match generation.output {
        GenerationOutput::Structured(value) => value,
        GenerationOutput::Text(text) => serde_json::from_str(&text).map_err(|e| {
            TrellisError::SchemaViolation(format!("model output is not JSON: {}", e))
        })?,
    };
    validate_output(schema, &value)?;
    Ok(value)
}

fn validate_output(schema: &serde_json::Value, value: &serde_json::Value) -> Result<()> {
    let validator = jsonschema::Validator::new(schema)
        .map_err(|e| TrellisError::SchemaViolation(format!("invalid response schema: {}", e)))?;
    if validator.is_valid(value) {
        return Ok(());
    }
    let errors: Vec<String> = validator.iter_errors(value).map(|e| e.to_string()).collect();
    Err(TrellisError::SchemaViolation(errors.join("; ")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validate_output() {
        let schema = json!({
            "type": "object",
            "properties": {"choice": {"enum": ["search", "reply"]}},
            "required": ["choice"]
        });
        assert!(validate_output(&schema, &json!({"choice": "reply"})).is_ok());
        let err = validate_output(&schema, &json!({"choice": "dance"})).unwrap_err();
        assert!(matches!(err, TrellisError::SchemaViolation(_)));
        assert!(validate_output(&schema, &json!({})).is_err());
    }
}
