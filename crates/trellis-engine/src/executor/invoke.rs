use std::collections::BTreeMap;

use tracing::{info, warn};

use trellis_core::error::{Result, TrellisError};
use trellis_core::types::ThreadId;

use crate::interpreter::{Engine, Walk, WalkFailure, WalkResult};
use crate::playbook::node::{DEFAULT_OUTPUT_KEY, ERROR_KEY};
use crate::playbook::registry::check_arguments;
use crate::playbook::template::resolve_value;
use crate::playbook::{InvocationMode, InvokeNode, Node};
use crate::state::{ExecutionState, NodeRegion};
use crate::thread::ThreadHierarchy;

use super::{close_session, publish_aborted, publish_entered, reject, Step};

pub(super) async fn run(
    engine: &Engine,
    node: &Node,
    invoke: &InvokeNode,
    state: &mut ExecutionState,
    hierarchy: &mut ThreadHierarchy,
) -> Result<Step> {
    match call(engine, node, invoke, state, hierarchy).await {
        Ok(step) => Ok(step),
        Err(e) => match &invoke.on_failure {
            Some(target) => {
                warn!(
                    node_id = %node.id,
                    callee = %invoke.playbook,
                    error = %e,
                    "Sub-workflow failed, branching to {}",
                    target
                );
                state
                    .node
                    .insert(ERROR_KEY, serde_json::Value::String(e.to_string()))?;
                Ok(Step::Branch(target.clone()))
            }
            None => Err(e),
        },
    }
}

async fn call(
    engine: &Engine,
    node: &Node,
    invoke: &InvokeNode,
    state: &mut ExecutionState,
    hierarchy: &mut ThreadHierarchy,
) -> Result<Step> {
    let callee = engine.playbooks.require(&invoke.playbook)?;
    if state.system.call_depth >= engine.config.engine.max_call_depth {
        return Err(TrellisError::CallDepthExceeded(engine.config.engine.max_call_depth));
    }

    // Only the declared mapping crosses into the callee.
    let mut args = BTreeMap::new();
    for (name, value) in &invoke.args {
        args.insert(name.clone(), resolve_value(value, &state.node)?);
    }
    check_arguments(&callee, args.keys().map(String::as_str)).map_err(|reason| {
        TrellisError::ArgumentMismatch {
            playbook: callee.name.clone(),
            reason,
        }
    })?;
    let region = NodeRegion::from_args(args)?;

    info!(
        node_id = %node.id,
        callee = %callee.name,
        mode = ?invoke.mode,
        call_depth = state.system.call_depth + 1,
        "Invoking sub-workflow"
    );

    let walk = match invoke.mode {
        InvocationMode::Inline => {
            let mark = state.thread.clone();
            let callee_state = state.for_callee(region, mark.clone());
            match engine.execute_playbook(callee, callee_state, hierarchy).await {
                Ok(walk) => walk,
                Err(failure) => {
                    state.absorb_failed(failure.system);
                    let aborted = hierarchy.abort_above(&mark)?;
                    publish_aborted(engine, &state.system.agent.id, &aborted);
                    return Err(failure.error);
                }
            }
        }
        InvocationMode::Isolated => {
            let child = match hierarchy.enter(invoke.window_ratio, Some(callee.name.clone())) {
                Ok(child) => child,
                Err(e) if e.is_rejection() => return reject(engine, node, state, &e),
                Err(e) => return Err(e),
            };
            publish_entered(engine, state, hierarchy, &child);
            let callee_state = state.for_callee(region, child.clone());
            let outcome = match engine.execute_playbook(callee, callee_state, hierarchy).await {
                Ok(walk) if !walk.cancelled => finish_isolated(engine, walk, &child, invoke.summarize, hierarchy).await,
                other => other,
            };
            match outcome {
                Ok(walk) if !walk.cancelled => walk,
                other => {
                    let aborted = hierarchy.abort(&child)?;
                    publish_aborted(engine, &state.system.agent.id, &aborted);
                    match other {
                        Ok(cancelled) => cancelled,
                        Err(failure) => {
                            state.absorb_failed(failure.system);
                            return Err(failure.error);
                        }
                    }
                }
            }
        }
    };

    let Walk {
        state: done,
        cancelled,
        ..
    } = walk;
    if invoke.mode == InvocationMode::Inline {
        state.thread = done.thread.clone();
    }
    state.absorb_system(done.system);
    if cancelled {
        return Ok(Step::Halt);
    }

    if let Some(key) = &invoke.output_key {
        let result = done
            .node
            .get(DEFAULT_OUTPUT_KEY)
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        state.node.insert(key.clone(), result)?;
    }
    if invoke.propagate {
        state.outputs.extend(done.outputs);
    }
    Ok(Step::Continue)
}

/// Close sessions the callee left open inside its thread, then leave the
/// thread itself.
async fn finish_isolated(
    engine: &Engine,
    mut walk: Walk,
    child: &ThreadId,
    summarize: bool,
    hierarchy: &mut ThreadHierarchy,
) -> WalkResult {
    match close_open(engine, &mut walk.state, child, summarize, hierarchy).await {
        Ok(()) => Ok(walk),
        Err(error) => Err(WalkFailure {
            error,
            system: walk.state.system,
        }),
    }
}

async fn close_open(
    engine: &Engine,
    state: &mut ExecutionState,
    child: &ThreadId,
    summarize: bool,
    hierarchy: &mut ThreadHierarchy,
) -> Result<()> {
    while let Some(entry) = state.system.sessions.pop() {
        if let Some(id) = entry {
            close_session(engine, &id, true, state, hierarchy).await?;
        }
    }
    close_session(engine, child, summarize, state, hierarchy).await
}
