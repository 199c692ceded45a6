use tracing::info;

use trellis_core::error::Result;
use trellis_core::types::ToolContext;

use crate::interpreter::Engine;
use crate::playbook::template::resolve_value;
use crate::playbook::InvokeToolNode;
use crate::state::ExecutionState;

use super::Step;

pub(super) async fn run(
    engine: &Engine,
    node: &InvokeToolNode,
    state: &mut ExecutionState,
) -> Result<Step> {
    let mut input = serde_json::Map::with_capacity(node.args.len());
    for (name, value) in &node.args {
        input.insert(name.clone(), resolve_value(value, &state.node)?);
    }

    let ctx = ToolContext {
        agent_id: state.system.agent.id.clone(),
        thread_id: state.thread.clone(),
        working_dir: engine.working_dir.clone(),
    };
    info!(tool = %node.tool, "Invoking tool");
    let result = engine
        .tools
        .execute(&node.tool, serde_json::Value::Object(input), ctx)
        .await?;

    state.node.insert(node.output_key.clone(), result.to_value())?;
    Ok(Step::Continue)
}
