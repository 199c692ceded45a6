use tracing::debug;

use trellis_core::error::Result;
use trellis_core::types::{EngineEvent, MemoryEntry, Role, TAG_CONVERSATION, TAG_INTERNAL};

use crate::interpreter::Engine;
use crate::playbook::{EmitNode, Node, RecordNode, ReflectNode};
use crate::state::{ExecutionState, OutputFragment, OutputKind};
use crate::thread::ThreadHierarchy;

use super::Step;

/// Store under `conversation`, add to the thread, deliver to the surface.
/// Always contributes output.
pub(super) async fn emit(
    engine: &Engine,
    node: &Node,
    emit: &EmitNode,
    state: &mut ExecutionState,
    hierarchy: &mut ThreadHierarchy,
) -> Result<Step> {
    let content = emit.content.render(&state.node)?;
    let agent_id = state.system.agent.id.clone();

    engine
        .memory
        .append(
            MemoryEntry::new(
                &agent_id,
                Role::Assistant.as_str(),
                &content,
                vec![TAG_CONVERSATION.to_string()],
            )
            .in_thread(state.thread.clone()),
        )
        .await?;
    hierarchy.record_in(
        &state.thread,
        Role::Assistant,
        content.clone(),
        vec![TAG_CONVERSATION.to_string()],
    )?;
    engine.surface.deliver(&agent_id, &content).await?;

    if let Some(emitter) = &state.system.emitter {
        // A dropped receiver only means nobody is streaming this run.
        let _ = emitter.unbounded_send(OutputFragment::Emission {
            node_id: node.id.clone(),
            content: content.clone(),
        });
    }
    engine.events.publish(EngineEvent::Emitted {
        agent_id,
        content: content.clone(),
    });
    state.push_output(&node.id, OutputKind::Emission, content);
    Ok(Step::Continue)
}

/// Private thought: stored under `internal` and nothing else. Never part of
/// the run's output, whoever invoked the run.
pub(super) async fn reflect(
    engine: &Engine,
    reflect: &ReflectNode,
    state: &mut ExecutionState,
) -> Result<Step> {
    let content = reflect.content.render(&state.node)?;
    let agent = &state.system.agent;
    engine
        .memory
        .append(
            MemoryEntry::new(&agent.id, &agent.id, content, vec![TAG_INTERNAL.to_string()])
                .in_thread(state.thread.clone()),
        )
        .await?;
    Ok(Step::Continue)
}

pub(super) async fn record(
    engine: &Engine,
    node: &Node,
    record: &RecordNode,
    state: &mut ExecutionState,
) -> Result<Step> {
    let content = record.content.render(&state.node)?;
    let role = record
        .role
        .clone()
        .unwrap_or_else(|| state.system.agent.id.clone());
    engine
        .memory
        .append(
            MemoryEntry::new(&state.system.agent.id, role, &content, record.tags.clone())
                .in_thread(state.thread.clone()),
        )
        .await?;

    if state.contributes_record() {
        state.push_output(&node.id, OutputKind::Record, content);
    } else {
        debug!(node_id = %node.id, "Record kept out of orchestration output");
    }
    Ok(Step::Continue)
}
