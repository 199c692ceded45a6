use tracing::{debug, warn};

use trellis_core::error::{Result, TrellisError};
use trellis_core::types::{EngineEvent, ThreadId};

use crate::interpreter::Engine;
use crate::playbook::{EnterSessionNode, LeaveSessionNode, Node};
use crate::profile::ProfileName;
use crate::state::{display_value, ExecutionState};
use crate::thread::ThreadHierarchy;

use super::{call_model, reject, Step};

const EMPTY_CHRONICLE: &str = "No exchanges were recorded in this session.";

pub(super) fn enter(
    engine: &Engine,
    node: &Node,
    enter: &EnterSessionNode,
    state: &mut ExecutionState,
    hierarchy: &mut ThreadHierarchy,
) -> Result<Step> {
    match hierarchy.enter(enter.window_ratio, enter.label.clone()) {
        Ok(child) => {
            publish_entered(engine, state, hierarchy, &child);
            state.system.sessions.push(Some(child.clone()));
            state.thread = child;
            Ok(Step::Continue)
        }
        Err(e) if e.is_rejection() => {
            // The paired leave pops this marker and does nothing.
            state.system.sessions.push(None);
            reject(engine, node, state, &e)
        }
        Err(e) => Err(e),
    }
}

pub(super) async fn leave(
    engine: &Engine,
    node: &Node,
    leave: &LeaveSessionNode,
    state: &mut ExecutionState,
    hierarchy: &mut ThreadHierarchy,
) -> Result<Step> {
    let target = match state.system.sessions.pop() {
        Some(Some(id)) => id,
        Some(None) => {
            debug!(node_id = %node.id, "Paired enter was rejected, nothing to leave");
            return Ok(Step::Continue);
        }
        // Nothing opened in this run: a top-level run may close a session
        // left open by an earlier one.
        None if state.system.is_top_level() => {
            let active = hierarchy.active()?;
            if active.is_root() {
                return reject(engine, node, state, &TrellisError::NoOpenSession);
            }
            active.id.clone()
        }
        None => return reject(engine, node, state, &TrellisError::NoOpenSession),
    };
    close_session(engine, &target, leave.summarize, state, hierarchy).await?;
    Ok(Step::Continue)
}

/// Leave `id` normally. The chronicle is generated before the parent becomes
/// active again; if generating it fails, the session is aborted instead.
pub(crate) async fn close_session(
    engine: &Engine,
    id: &ThreadId,
    summarize: bool,
    state: &mut ExecutionState,
    hierarchy: &mut ThreadHierarchy,
) -> Result<()> {
    let chronicle = if summarize {
        match chronicle(engine, id, state, hierarchy).await {
            Ok(text) => Some(text),
            Err(e) => {
                warn!(thread_id = %id, error = %e, "Chronicle failed, aborting session");
                let aborted = hierarchy.abort(id)?;
                publish_aborted(engine, &state.system.agent.id, &aborted);
                state.thread = hierarchy.active_id().clone();
                return Err(e);
            }
        }
    } else {
        None
    };

    let has_chronicle = chronicle.is_some();
    hierarchy.leave(id, chronicle)?;
    state.thread = hierarchy.active_id().clone();
    engine.events.publish(EngineEvent::ThreadCompleted {
        agent_id: state.system.agent.id.clone(),
        thread_id: id.clone(),
        chronicle: has_chronicle,
    });
    Ok(())
}

async fn chronicle(
    engine: &Engine,
    id: &ThreadId,
    state: &mut ExecutionState,
    hierarchy: &ThreadHierarchy,
) -> Result<String> {
    let transcript = hierarchy.transcript(id)?;
    if transcript.is_empty() {
        return Ok(EMPTY_CHRONICLE.to_string());
    }
    let mut prompt = String::from(
        "Summarize this session in a few sentences. Keep decisions and open items.\n",
    );
    for message in &transcript {
        prompt.push_str(&format!("\n{}: {}", message.role.as_str(), message.content));
    }
    let value = call_model(engine, ProfileName::WorkerLight, prompt, None, state, hierarchy).await?;
    Ok(display_value(&value))
}

pub(crate) fn publish_entered(
    engine: &Engine,
    state: &ExecutionState,
    hierarchy: &ThreadHierarchy,
    child: &ThreadId,
) {
    if let Some(thread) = hierarchy.get(child) {
        engine.events.publish(EngineEvent::ThreadEntered {
            agent_id: state.system.agent.id.clone(),
            thread_id: child.clone(),
            depth: thread.depth,
            budget: thread.budget,
        });
    }
}

pub(crate) fn publish_aborted(engine: &Engine, agent_id: &str, aborted: &[ThreadId]) {
    for id in aborted {
        engine.events.publish(EngineEvent::ThreadAborted {
            agent_id: agent_id.to_string(),
            thread_id: id.clone(),
        });
    }
}
