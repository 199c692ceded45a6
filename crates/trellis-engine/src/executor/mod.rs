//! One handler per node type.
//!
//! Each handler consumes the current [`ExecutionState`], performs its node's
//! declared side effect, and reports how the interpreter should continue.

mod generate;
mod invoke;
mod memory;
mod session;
mod tool;

use trellis_core::error::Result;
use trellis_core::types::EngineEvent;

use crate::interpreter::Engine;
use crate::playbook::{Node, NodeKind};
use crate::state::ExecutionState;
use crate::thread::ThreadHierarchy;

pub(crate) use generate::call_model;
pub(crate) use session::{close_session, publish_aborted, publish_entered};

/// What the interpreter does after a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Follow `conditional_next`, then `next`.
    Continue,
    /// Jump to this node, skipping the normal transitions.
    Branch(String),
    /// Stop the run; a sub-workflow was cancelled.
    Halt,
}

pub(crate) async fn dispatch(
    engine: &Engine,
    node: &Node,
    state: &mut ExecutionState,
    hierarchy: &mut ThreadHierarchy,
) -> Result<Step> {
    match &node.kind {
        NodeKind::Generate(n) => generate::run(engine, n, state, hierarchy).await,
        NodeKind::InvokeTool(n) => tool::run(engine, n, state).await,
        NodeKind::Emit(n) => memory::emit(engine, node, n, state, hierarchy).await,
        NodeKind::Reflect(n) => memory::reflect(engine, n, state).await,
        NodeKind::Record(n) => memory::record(engine, node, n, state).await,
        NodeKind::Pass => Ok(Step::Continue),
        NodeKind::Invoke(n) => invoke::run(engine, node, n, state, hierarchy).await,
        NodeKind::EnterSession(n) => session::enter(engine, node, n, state, hierarchy),
        NodeKind::LeaveSession(n) => session::leave(engine, node, n, state, hierarchy).await,
    }
}

/// Record a rejected operation in the node region and carry on.
pub(crate) fn reject(
    engine: &Engine,
    node: &Node,
    state: &mut ExecutionState,
    error: &trellis_core::error::TrellisError,
) -> Result<Step> {
    tracing::warn!(node_id = %node.id, error = %error, "Operation rejected");
    state.node.insert(
        crate::playbook::node::ERROR_KEY,
        serde_json::Value::String(error.to_string()),
    )?;
    engine.events.publish(EngineEvent::OperationRejected {
        agent_id: state.system.agent.id.clone(),
        node_id: node.id.clone(),
        reason: error.to_string(),
    });
    Ok(Step::Continue)
}
